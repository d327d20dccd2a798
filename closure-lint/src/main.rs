use std::path::PathBuf;
use std::process;

use closure_lint::Validator;
use closure_lint::error::LintError;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (file, allowed) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: closure-lint <handler.js> [--allow <name>]...");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <handler.js>     File containing a single handler function");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --allow <name>   Treat <name> as a global available inside the unit");
            process::exit(2);
        }
    };

    match run(&file, &allowed) {
        Ok(()) => {}
        Err(e @ LintError::ClosureViolation { .. }) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    }
}

fn parse_args(args: &[String]) -> Result<(PathBuf, Vec<String>), String> {
    let mut file: Option<PathBuf> = None;
    let mut allowed = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--allow" => {
                i += 1;
                allowed.push(args.get(i).ok_or("--allow requires a value")?.clone());
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if file.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                file = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let file = file.ok_or("missing required argument: <handler.js>")?;
    Ok((file, allowed))
}

fn run(file: &std::path::Path, allowed: &[String]) -> Result<(), LintError> {
    let source = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to read {}: {e}", file.display());
            process::exit(2);
        }
    };

    let validator = allowed
        .iter()
        .fold(Validator::new(), |v, name| v.allow_global(name.clone()));
    let scope = validator.validate(&source)?;

    println!(
        "ok: params [{}], locals [{}]",
        scope.params.iter().cloned().collect::<Vec<_>>().join(", "),
        scope.locals.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

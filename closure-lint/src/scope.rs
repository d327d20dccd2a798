//! Lexical scope extraction for handler functions.
//!
//! Works on the flat token stream from [`crate::lexer`]:
//! - Parameters of the outermost function (destructuring and defaults included)
//! - Locals: `var`/`let`/`const` declarators, nested function and class names,
//!   nested function, arrow and method parameters, `catch` binders
//! - References: every identifier not used as a property name, object key,
//!   method name or label
//!
//! Scopes are flattened: a name bound anywhere in the handler counts as bound
//! everywhere in it. That under-reports shadowing mistakes but never flags a
//! correctly bound name.

use indexmap::IndexSet;

use crate::error::{LintError, Result};
use crate::globals::is_keyword;
use crate::lexer::{Token, tokenize};

/// Identifier sets extracted from one handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerScope {
    pub params: IndexSet<String>,
    pub locals: IndexSet<String>,
    pub references: IndexSet<String>,
}

impl HandlerScope {
    pub fn is_bound(&self, name: &str) -> bool {
        self.params.contains(name) || self.locals.contains(name)
    }
}

/// Statement keywords that end a declarator's initializer.
const INITIALIZER_STOP: &[&str] = &[
    "let", "const", "var", "return", "if", "for", "while", "do", "switch", "try", "throw",
    "break", "continue",
];

/// Identifiers that may precede a method name in a class or object body.
const METHOD_PREFIX: &[&str] = &["get", "set", "static", "async"];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn analyze(source: &str) -> Result<HandlerScope> {
    if source.trim().is_empty() {
        return Err(LintError::EmptySource);
    }

    let tokens = tokenize(source)?;
    check_balance(&tokens)?;

    let mut scope = HandlerScope::default();
    let body_start = parse_header(&tokens, &mut scope)?;

    let method_names = collect_locals(&tokens[body_start..], &mut scope.locals);
    let skip: IndexSet<usize> = method_names.into_iter().map(|i| i + body_start).collect();

    scope.references = collect_references(&tokens, &skip);
    Ok(scope)
}

// ---------------------------------------------------------------------------
// Handler header
// ---------------------------------------------------------------------------

/// Parse the outer function's parameters; returns the index where its body starts.
fn parse_header(tokens: &[Token], scope: &mut HandlerScope) -> Result<usize> {
    let mut i = 0;
    if tokens.first().is_some_and(|t| t.is_ident("async"))
        && !tokens.get(1).is_some_and(|t| t.is_punct("=>"))
    {
        i += 1;
    }

    let Some(first) = tokens.get(i) else {
        return Err(LintError::NotAFunction);
    };

    if first.is_ident("function") {
        i += 1;
        if tokens.get(i).is_some_and(|t| t.is_punct("*")) {
            i += 1;
        }
        if let Some(name) = tokens.get(i).and_then(Token::ident) {
            scope.locals.insert(name.to_string());
            i += 1;
        }
        if !tokens.get(i).is_some_and(|t| t.is_punct("(")) {
            return Err(LintError::NotAFunction);
        }
        let close = matching(tokens, i);
        bind_list(&tokens[i + 1..close], &mut scope.params);
        return Ok(close + 1);
    }

    if first.is_punct("(") {
        let close = matching(tokens, i);
        if !tokens.get(close + 1).is_some_and(|t| t.is_punct("=>")) {
            return Err(LintError::NotAFunction);
        }
        bind_list(&tokens[i + 1..close], &mut scope.params);
        return Ok(close + 2);
    }

    if let Some(name) = first.ident() {
        if tokens.get(i + 1).is_some_and(|t| t.is_punct("=>")) {
            scope.params.insert(name.to_string());
            return Ok(i + 2);
        }
        // Method shorthand: `name(a, b) { ... }`
        if !is_keyword(name) && tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
            let close = matching(tokens, i + 1);
            if tokens.get(close + 1).is_some_and(|t| t.is_punct("{")) {
                bind_list(&tokens[i + 2..close], &mut scope.params);
                return Ok(close + 1);
            }
        }
    }

    Err(LintError::NotAFunction)
}

// ---------------------------------------------------------------------------
// Binding patterns
// ---------------------------------------------------------------------------

/// Bind a comma-separated pattern list such as a parameter list.
fn bind_list(tokens: &[Token], names: &mut IndexSet<String>) {
    for element in split_top_level(tokens) {
        let start = usize::from(element.first().is_some_and(|t| t.is_punct("...")));
        bind_pattern(element, start, names);
    }
}

/// Bind one pattern starting at `i`; returns the index just past it.
fn bind_pattern(tokens: &[Token], i: usize, names: &mut IndexSet<String>) -> usize {
    match tokens.get(i) {
        Some(Token::Ident(name)) if !is_keyword(name) => {
            names.insert(name.clone());
            i + 1
        }
        Some(t) if t.is_punct("{") => {
            let close = matching(tokens, i);
            bind_object_pattern(&tokens[i + 1..close], names);
            close + 1
        }
        Some(t) if t.is_punct("[") => {
            let close = matching(tokens, i);
            bind_list(&tokens[i + 1..close], names);
            close + 1
        }
        _ => i,
    }
}

fn bind_object_pattern(tokens: &[Token], names: &mut IndexSet<String>) {
    for element in split_top_level(tokens) {
        if element.first().is_some_and(|t| t.is_punct("...")) {
            bind_pattern(element, 1, names);
            continue;
        }
        // `key: pattern` when a top-level `:` precedes any default `=`.
        let mut depth = 0usize;
        let mut target = 0;
        for (j, token) in element.iter().enumerate() {
            match token {
                Token::Punct(p) if matches!(p.as_str(), "(" | "[" | "{") => depth += 1,
                Token::Punct(p) if matches!(p.as_str(), ")" | "]" | "}") => {
                    depth = depth.saturating_sub(1)
                }
                Token::Punct(p) if depth == 0 && p == ":" => {
                    target = j + 1;
                    break;
                }
                Token::Punct(p) if depth == 0 && p == "=" => break,
                _ => {}
            }
        }
        bind_pattern(element, target, names);
    }
}

// ---------------------------------------------------------------------------
// Locals
// ---------------------------------------------------------------------------

/// Collect locally bound names in a function body. Returns token indices of
/// method names, which are property keys rather than references.
fn collect_locals(tokens: &[Token], locals: &mut IndexSet<String>) -> Vec<usize> {
    let mut method_names = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
        let after_dot = prev.is_some_and(|p| p.is_punct(".") || p.is_punct("?."));
        if after_dot {
            continue;
        }

        match token {
            Token::Ident(kw) if matches!(kw.as_str(), "var" | "let" | "const") => {
                bind_declarators(tokens, i + 1, locals);
            }
            Token::Ident(kw) if kw == "function" => {
                let mut j = i + 1;
                if tokens.get(j).is_some_and(|t| t.is_punct("*")) {
                    j += 1;
                }
                if let Some(name) = tokens.get(j).and_then(Token::ident) {
                    locals.insert(name.to_string());
                    j += 1;
                }
                if tokens.get(j).is_some_and(|t| t.is_punct("(")) {
                    let close = matching(tokens, j);
                    bind_list(&tokens[j + 1..close], locals);
                }
            }
            Token::Ident(kw) if kw == "class" => {
                if let Some(name) = tokens.get(i + 1).and_then(Token::ident)
                    && name != "extends"
                {
                    locals.insert(name.to_string());
                }
            }
            Token::Ident(kw) if kw == "catch" => {
                if tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
                    let close = matching(tokens, i + 1);
                    bind_list(&tokens[i + 2..close], locals);
                }
            }
            Token::Punct(p) if p == "=>" => match prev {
                Some(Token::Ident(name)) if !is_keyword(name) => {
                    locals.insert(name.clone());
                }
                Some(t) if t.is_punct(")") => {
                    if let Some(open) = matching_back(tokens, i - 1) {
                        bind_list(&tokens[open + 1..i - 1], locals);
                    }
                }
                _ => {}
            },
            Token::Ident(name) if !is_keyword(name) || METHOD_PREFIX.contains(&name.as_str()) => {
                if is_method_definition(tokens, i) {
                    let close = matching(tokens, i + 1);
                    bind_list(&tokens[i + 2..close], locals);
                    method_names.push(i);
                }
            }
            _ => {}
        }
    }

    method_names
}

/// `let a = 1, { b } = obj, [c] = arr` → a, b, c.
fn bind_declarators(tokens: &[Token], mut j: usize, locals: &mut IndexSet<String>) {
    loop {
        let after = bind_pattern(tokens, j, locals);
        if after == j {
            return;
        }
        j = after;
        if tokens.get(j).is_some_and(|t| t.is_punct("=")) {
            j = skip_initializer(tokens, j + 1);
        }
        if tokens.get(j).is_some_and(|t| t.is_punct(",")) {
            j += 1;
            continue;
        }
        return;
    }
}

fn skip_initializer(tokens: &[Token], mut j: usize) -> usize {
    let mut depth = 0usize;
    while let Some(token) = tokens.get(j) {
        match token {
            Token::Punct(p) if matches!(p.as_str(), "(" | "[" | "{") => depth += 1,
            Token::Punct(p) if matches!(p.as_str(), ")" | "]" | "}") => {
                if depth == 0 {
                    return j;
                }
                depth -= 1;
            }
            Token::Punct(p) if depth == 0 && (p == "," || p == ";") => return j,
            Token::Ident(kw) if depth == 0 && INITIALIZER_STOP.contains(&kw.as_str()) => {
                return j;
            }
            _ => {}
        }
        j += 1;
    }
    j
}

/// `name(...) { ... }` inside a class or object body.
fn is_method_definition(tokens: &[Token], i: usize) -> bool {
    if !tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
        return false;
    }
    let prev_ok = match i.checked_sub(1).and_then(|p| tokens.get(p)) {
        None => true,
        Some(Token::Punct(p)) => matches!(p.as_str(), "{" | "," | ";" | "}" | "*"),
        Some(Token::Ident(p)) => METHOD_PREFIX.contains(&p.as_str()),
        Some(Token::Literal) => false,
    };
    if !prev_ok {
        return false;
    }
    let close = matching(tokens, i + 1);
    tokens.get(close + 1).is_some_and(|t| t.is_punct("{"))
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

fn collect_references(tokens: &[Token], skip: &IndexSet<usize>) -> IndexSet<String> {
    let mut references = IndexSet::new();

    for (i, token) in tokens.iter().enumerate() {
        let Token::Ident(name) = token else {
            continue;
        };
        if is_keyword(name) || skip.contains(&i) {
            continue;
        }

        let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
        let next = tokens.get(i + 1);

        // Property access: `a.b`, `a?.b`
        if prev.is_some_and(|p| p.is_punct(".") || p.is_punct("?.")) {
            continue;
        }
        // Labels after `break` / `continue`
        if prev.is_some_and(|p| p.is_ident("break") || p.is_ident("continue")) {
            continue;
        }
        // Object keys and statement labels: `{ key: value }`, `outer: for (...)`
        if next.is_some_and(|n| n.is_punct(":"))
            && prev.is_none_or(|p| {
                p.is_punct("{") || p.is_punct(",") || p.is_punct("}") || p.is_punct(";")
            })
        {
            continue;
        }

        references.insert(name.clone());
    }

    references
}

// ---------------------------------------------------------------------------
// Bracket helpers
// ---------------------------------------------------------------------------

fn check_balance(tokens: &[Token]) -> Result<()> {
    let mut stack = Vec::new();
    for token in tokens {
        let Token::Punct(p) = token else { continue };
        match p.as_str() {
            "(" | "[" | "{" => stack.push(p.as_str()),
            ")" | "]" | "}" => {
                let expected = match p.as_str() {
                    ")" => "(",
                    "]" => "[",
                    _ => "{",
                };
                if stack.pop() != Some(expected) {
                    return Err(LintError::Unbalanced(p.clone()));
                }
            }
            _ => {}
        }
    }
    match stack.pop() {
        Some(open) => Err(LintError::Unbalanced(open.to_string())),
        None => Ok(()),
    }
}

/// Index of the bracket closing the one at `open` (token stream is balanced).
fn matching(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (j, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Punct(p) if matches!(p.as_str(), "(" | "[" | "{") => depth += 1,
            Token::Punct(p) if matches!(p.as_str(), ")" | "]" | "}") => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return j;
                }
            }
            _ => {}
        }
    }
    tokens.len().saturating_sub(1).max(open)
}

fn matching_back(tokens: &[Token], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for j in (0..=close).rev() {
        match &tokens[j] {
            Token::Punct(p) if matches!(p.as_str(), ")" | "]" | "}") => depth += 1,
            Token::Punct(p) if matches!(p.as_str(), "(" | "[" | "{") => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas at bracket depth zero, dropping empty elements (array holes).
fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (j, token) in tokens.iter().enumerate() {
        match token {
            Token::Punct(p) if matches!(p.as_str(), "(" | "[" | "{") => depth += 1,
            Token::Punct(p) if matches!(p.as_str(), ")" | "]" | "}") => {
                depth = depth.saturating_sub(1)
            }
            Token::Punct(p) if depth == 0 && p == "," => {
                if j > start {
                    parts.push(&tokens[start..j]);
                }
                start = j + 1;
            }
            _ => {}
        }
    }
    if tokens.len() > start {
        parts.push(&tokens[start..]);
    }
    parts
}

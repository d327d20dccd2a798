//! Token stream for JavaScript-family handler source.
//!
//! This is deliberately shallow: it knows enough to skip strings, comments,
//! regular expression literals and template text, and to surface identifiers
//! and punctuation. Template substitutions (`${ ... }`) are lexed in place and
//! wrapped in synthetic parentheses so the scope pass sees them as plain
//! expressions.

use crate::error::{LintError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Punct(String),
    /// String, template text, number, regex or private name: opaque to the scope pass.
    Literal,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Token::Punct(s) if s == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Token::Ident(s) if s == name)
    }

    pub fn ident(&self) -> Option<&str> {
        match self {
            Token::Ident(s) => Some(s),
            _ => None,
        }
    }
}

/// Keywords after which a `/` starts a regular expression rather than a division.
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

/// Operator characters that greedily combine into one punctuation token.
const OPERATOR_CHARS: &[char] = &['=', '!', '<', '>', '+', '-', '*', '%', '&', '|', '^', '~'];

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        tokens: Vec::new(),
    };
    lexer.run(false)?;
    Ok(lexer.tokens)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push_punct(&mut self, p: impl Into<String>) {
        self.tokens.push(Token::Punct(p.into()));
    }

    /// Lex until end of input, or until the `}` closing a template substitution
    /// when `in_template` is set.
    fn run(&mut self, in_template: bool) -> Result<()> {
        let mut depth = 0usize;

        while let Some(c) = self.peek(0) {
            match c {
                c if c.is_whitespace() => self.pos += 1,
                '/' if self.peek(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek(1) == Some('*') => self.skip_block_comment()?,
                '/' if self.regex_allowed() => self.skip_regex()?,
                '\'' | '"' => self.skip_string(c)?,
                '`' => self.lex_template()?,
                '#' => {
                    self.pos += 1;
                    self.take_ident();
                    self.tokens.push(Token::Literal);
                }
                c if c.is_ascii_digit() => self.skip_number(),
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.skip_number(),
                c if is_ident_start(c) => {
                    let ident = self.take_ident();
                    self.tokens.push(Token::Ident(ident));
                }
                '.' => {
                    if self.peek(1) == Some('.') && self.peek(2) == Some('.') {
                        self.pos += 3;
                        self.push_punct("...");
                    } else {
                        self.pos += 1;
                        self.push_punct(".");
                    }
                }
                '?' => {
                    let next = self.peek(1);
                    if next == Some('.') && !self.peek(2).is_some_and(|d| d.is_ascii_digit()) {
                        self.pos += 2;
                        self.push_punct("?.");
                    } else if next == Some('?') {
                        self.pos += 2;
                        if self.peek(0) == Some('=') {
                            self.pos += 1;
                        }
                        self.push_punct("??");
                    } else {
                        self.pos += 1;
                        self.push_punct("?");
                    }
                }
                '{' => {
                    depth += 1;
                    self.pos += 1;
                    self.push_punct("{");
                }
                '}' => {
                    self.pos += 1;
                    if in_template && depth == 0 {
                        return Ok(());
                    }
                    depth = depth.saturating_sub(1);
                    self.push_punct("}");
                }
                '(' | ')' | '[' | ']' | ',' | ';' | ':' | '@' => {
                    self.pos += 1;
                    self.push_punct(c.to_string());
                }
                '/' => {
                    self.pos += 1;
                    if self.peek(0) == Some('=') {
                        self.pos += 1;
                    }
                    self.push_punct("/");
                }
                c if OPERATOR_CHARS.contains(&c) => {
                    let start = self.pos;
                    while self.peek(0).is_some_and(|o| OPERATOR_CHARS.contains(&o)) {
                        // `=>` always ends an operator run so `x=>y` and `a=>{}` split cleanly.
                        if self.peek(0) == Some('=') && self.peek(1) == Some('>') {
                            if self.pos == start {
                                self.pos += 2;
                            }
                            break;
                        }
                        self.pos += 1;
                    }
                    let op: String = self.chars[start..self.pos].iter().collect();
                    self.push_punct(op);
                }
                _ => self.pos += 1,
            }
        }

        if in_template {
            return Err(LintError::Unterminated("template substitution"));
        }
        Ok(())
    }

    fn take_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        self.pos += 2;
        loop {
            match self.peek(0) {
                None => return Err(LintError::Unterminated("block comment")),
                Some('*') if self.peek(1) == Some('/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn skip_string(&mut self, quote: char) -> Result<()> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                None | Some('\n') => return Err(LintError::Unterminated("string literal")),
                Some('\\') => self.pos += 2,
                Some(c) if c == quote => {
                    self.pos += 1;
                    self.tokens.push(Token::Literal);
                    return Ok(());
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn skip_number(&mut self) {
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
        {
            // Exponent sign: `1e-5`, `2E+3`.
            if matches!(self.peek(0), Some('e') | Some('E'))
                && matches!(self.peek(1), Some('+') | Some('-'))
            {
                self.pos += 1;
            }
            self.pos += 1;
        }
        self.tokens.push(Token::Literal);
    }

    fn skip_regex(&mut self) -> Result<()> {
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek(0) {
                None | Some('\n') => return Err(LintError::Unterminated("regular expression")),
                Some('\\') => self.pos += 2,
                Some('[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some('/') if !in_class => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        while self.peek(0).is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        self.tokens.push(Token::Literal);
        Ok(())
    }

    fn lex_template(&mut self) -> Result<()> {
        self.pos += 1;
        self.tokens.push(Token::Literal);
        loop {
            match self.peek(0) {
                None => return Err(LintError::Unterminated("template literal")),
                Some('\\') => self.pos += 2,
                Some('`') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some('$') if self.peek(1) == Some('{') => {
                    self.pos += 2;
                    self.push_punct("(");
                    self.run(true)?;
                    self.push_punct(")");
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// A `/` begins a regex when it cannot be a division: at the start, after
    /// an operator or opening bracket, or after a keyword like `return`.
    fn regex_allowed(&self) -> bool {
        match self.tokens.last() {
            None => true,
            Some(Token::Literal) => false,
            Some(Token::Ident(name)) => REGEX_PREFIX_KEYWORDS.contains(&name.as_str()),
            Some(Token::Punct(p)) => !matches!(p.as_str(), ")" | "]" | "}"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

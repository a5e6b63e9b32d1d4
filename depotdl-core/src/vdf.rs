/*!
A reader for Valve's text KeyValues format.

Only the subset `config.vdf` actually uses is supported: quoted and bare
tokens, `{}` nesting, backslash escapes inside quoted strings, and `//`
line comments. The parser produces a plain string keyed table.
*/

use thiserror::Error;

use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;

/// Error describing malformed KeyValues text
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VdfError {
    #[error("unexpected end of key values text")]
    UnexpectedEof,
    #[error("expected a value after key {0:?}")]
    MissingValue(String),
    #[error("unbalanced braces in key values text")]
    UnbalancedBrace,
}

type Result<T> = std::result::Result<T, VdfError>;

/// A parsed KeyValues node: either a leaf string or a nested table
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Table(HashMap<String, Value>),
}

impl Value {
    /// Looks up a child of a table node
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Table(table) => table.get(key),
            Value::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Table(table) => Some(table),
            Value::String(_) => None,
        }
    }
}

/// Parses a KeyValues document into its top level table
pub fn parse(input: &str) -> Result<HashMap<String, Value>> {
    let mut tokens = Tokenizer {
        chars: input.chars().peekable(),
    };
    parse_table(&mut tokens, true)
}

enum Token {
    Open,
    Close,
    Str(String),
}

struct Tokenizer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            match self.chars.peek() {
                None => return Ok(None),
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('/') => {
                    // Only // line comments exist in this format
                    while let Some(c) = self.chars.next() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('{') => {
                    self.chars.next();
                    return Ok(Some(Token::Open));
                }
                Some('}') => {
                    self.chars.next();
                    return Ok(Some(Token::Close));
                }
                Some('"') => {
                    self.chars.next();
                    return Ok(Some(Token::Str(self.quoted_string()?)));
                }
                Some(_) => return Ok(Some(Token::Str(self.bare_string()))),
            }
        }
    }

    fn quoted_string(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(VdfError::UnexpectedEof),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    None => return Err(VdfError::UnexpectedEof),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn bare_string(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == '{' || c == '}' || c == '"' {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }
}

fn parse_table(tokens: &mut Tokenizer<'_>, top_level: bool) -> Result<HashMap<String, Value>> {
    let mut table = HashMap::new();
    loop {
        match tokens.next_token()? {
            None => {
                return if top_level {
                    Ok(table)
                } else {
                    Err(VdfError::UnexpectedEof)
                };
            }
            Some(Token::Close) => {
                return if top_level {
                    Err(VdfError::UnbalancedBrace)
                } else {
                    Ok(table)
                };
            }
            Some(Token::Open) => return Err(VdfError::UnbalancedBrace),
            Some(Token::Str(key)) => {
                let value = match tokens.next_token()? {
                    Some(Token::Open) => Value::Table(parse_table(tokens, false)?),
                    Some(Token::Str(value)) => Value::String(value),
                    Some(Token::Close) | None => return Err(VdfError::MissingValue(key)),
                };
                table.insert(key, value);
            }
        }
    }
}

//! The indented key/value text format used by content-server responses.
//!
//! ```text
//! "response"
//! {
//!     "sessionid"     "2756818007967047057"
//!     "req-counter"   "0"
//! }
//! ```

use crate::error::VdfError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdfValue {
    Str(String),
    Object(VdfObject),
}

/// Key/value pairs in document order. Keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VdfObject {
    entries: Vec<(String, VdfValue)>,
}

impl VdfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&VdfObject> {
        match self {
            Self::Object(object) => Some(object),
            Self::Str(_) => None,
        }
    }
}

impl VdfObject {
    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&VdfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(VdfValue::as_str)
    }

    pub fn get_object(&self, key: &str) -> Option<&VdfObject> {
        self.get(key).and_then(VdfValue::as_object)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, VdfError> {
        self.get_str(key).ok_or_else(|| VdfError::MissingKey(key.to_string()))
    }

    pub fn require_object(&self, key: &str) -> Result<&VdfObject, VdfError> {
        self.get_object(key).ok_or_else(|| VdfError::MissingKey(key.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VdfValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn parse(input: &str) -> Result<VdfObject, VdfError> {
    let mut lexer = Lexer { chars: input.chars().peekable(), line: 1 };
    let object = parse_object(&mut lexer, false)?;
    Ok(object)
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Str(String),
    Open,
    Close,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Option<Token>, VdfError> {
        self.skip_trivia();
        let Some(c) = self.chars.next() else {
            return Ok(None);
        };
        match c {
            '{' => Ok(Some(Token::Open)),
            '}' => Ok(Some(Token::Close)),
            '"' => self.quoted().map(|s| Some(Token::Str(s))),
            c => Ok(Some(Token::Str(self.bare(c)))),
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                self.line += 1;
                self.chars.next();
            } else if c.is_whitespace() {
                self.chars.next();
            } else if c == '/' {
                let mut ahead = self.chars.clone();
                ahead.next();
                if ahead.peek() != Some(&'/') {
                    return;
                }
                while let Some(&c) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.chars.next();
                }
            } else {
                return;
            }
        }
    }

    fn quoted(&mut self) -> Result<String, VdfError> {
        let start = self.line;
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(VdfError::UnterminatedString { line: start }),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('"' | '\\')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err(VdfError::UnterminatedString { line: start }),
                },
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    out.push(c);
                }
            }
        }
    }

    fn bare(&mut self, first: char) -> String {
        let mut out = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '"' | '{' | '}') {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }
}

fn parse_object(lexer: &mut Lexer<'_>, nested: bool) -> Result<VdfObject, VdfError> {
    let mut object = VdfObject::default();
    loop {
        let key = match lexer.next_token()? {
            None if nested => return Err(VdfError::UnbalancedBraces { line: lexer.line }),
            None => return Ok(object),
            Some(Token::Close) if nested => return Ok(object),
            Some(Token::Close) => return Err(VdfError::UnbalancedBraces { line: lexer.line }),
            Some(Token::Open) => {
                return Err(VdfError::Unexpected { expected: "a key", line: lexer.line })
            }
            Some(Token::Str(key)) => key,
        };

        let value = match lexer.next_token()? {
            Some(Token::Str(value)) => VdfValue::Str(value),
            Some(Token::Open) => VdfValue::Object(parse_object(lexer, true)?),
            Some(Token::Close) | None => {
                return Err(VdfError::Unexpected { expected: "a value", line: lexer.line })
            }
        };
        object.entries.push((key, value));
    }
}

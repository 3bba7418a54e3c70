use std::io::BufRead;

use crate::span::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Integer(i64),
    /// Raw string lexeme, surrounding quotes included.
    String(String),
    /// Bare word or operator, exactly as written.
    Word(String),
}

impl Token {
    pub fn word(text: &str) -> Token {
        Token::Word(text.to_string())
    }

    pub fn is_word(&self, text: &str) -> bool {
        matches!(self, Token::Word(w) if w == text)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::String(s) | Token::Word(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LexError {
    #[error("Unknown token '{text}' at {location}")]
    UnexpectedInput { text: String, location: Location },
    #[error("Unterminated string '{text}' at {location}")]
    UnterminatedString { text: String, location: Location },
    #[error("Integer literal '{text}' out of range at {location}")]
    IntegerOutOfRange { text: String, location: Location },
    #[error("Non-integer number '{text}' at {location}")]
    NonIntegerNumber { text: String, location: Location },
    #[error("Failed to read source: {0}")]
    Io(#[from] std::io::Error),
}

/// Tokenizes a complete in-memory source.
pub fn tokens(source: &str) -> Result<Vec<Token>, LexError> {
    Tokenizer::new(source.as_bytes()).collect()
}

/// Lazily yields tokens from any line-buffered reader, pulling one physical
/// line at a time. The first error ends the stream.
pub struct Tokenizer<R> {
    reader: R,
    line: String,
    cursor: usize,
    line_number: usize,
    finished: bool,
}

impl<R: BufRead> Tokenizer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            cursor: 0,
            line_number: 0,
            finished: false,
        }
    }

    fn location(&self, offset: usize) -> Location {
        Location {
            line: self.line_number,
            column: self.line[..offset].chars().count() + 1,
        }
    }

    fn next_line(&mut self) -> Result<bool, LexError> {
        self.line.clear();
        self.cursor = 0;
        let read = self.reader.read_line(&mut self.line)?;
        self.line_number += 1;
        Ok(read > 0)
    }

    fn token(&mut self) -> Result<Option<Token>, LexError> {
        loop {
            let remaining = skip_blanks(&self.line[self.cursor..]);
            let start = self.line.len() - remaining.len();

            if remaining.is_empty() {
                if !self.next_line()? {
                    return Ok(None);
                }
                continue;
            }

            let location = self.location(start);
            let Some((lexeme, rest)) = maximal(&[integer, string, word, operator], remaining)
            else {
                return Err(unexpected(remaining, location));
            };
            let text = &remaining[..remaining.len() - rest.len()];

            let token = match lexeme {
                Lexeme::Integer => match text.parse() {
                    Ok(n) => Token::Integer(n),
                    Err(_) => {
                        return Err(LexError::IntegerOutOfRange {
                            text: text.to_string(),
                            location,
                        })
                    }
                },
                Lexeme::Fraction => {
                    return Err(LexError::NonIntegerNumber {
                        text: text.to_string(),
                        location,
                    })
                }
                Lexeme::String => Token::String(text.to_string()),
                Lexeme::Word => Token::Word(text.to_string()),
                Lexeme::Unterminated => {
                    return Err(LexError::UnterminatedString {
                        text: escape_whitespace(text.trim_end_matches(&['\n', '\r'][..])),
                        location,
                    })
                }
            };

            self.cursor = self.line.len() - rest.len();
            return Ok(Some(token));
        }
    }
}

impl<R: BufRead> Iterator for Tokenizer<R> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Integer,
    /// Digits, a dot, then more digits. Only integers are numbers here.
    Fraction,
    String,
    Word,
    Unterminated,
}

fn skip_blanks(mut source: &str) -> &str {
    while let Some((_, rest)) = maximal(&[whitespace, comment], source) {
        source = rest;
    }
    source
}

fn unexpected(source: &str, location: Location) -> LexError {
    let text = source
        .chars()
        .next()
        .map(|c| escape_whitespace(&c.to_string()))
        .unwrap_or_default();
    LexError::UnexpectedInput { text, location }
}

/// Replaces every whitespace character with its `\xNN` escape.
pub fn escape_whitespace(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_whitespace() {
            escaped.push_str(&format!("\\x{:x}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn maximal<'a, T: std::fmt::Debug>(
    parsers: &[fn(&str) -> Option<(T, &str)>],
    source: &'a str,
) -> Option<(T, &'a str)> {
    let mut min_left = source.len() + 1;
    let mut max_match = None;

    let matching_parsers = parsers.iter().filter_map(|parser| parser(source));
    for (m, rest) in matching_parsers {
        let left = rest.len();
        if left < min_left {
            min_left = left;
            max_match = Some((m, rest));
        }
    }

    max_match
}

fn whitespace(source: &str) -> Option<((), &str)> {
    let len = source
        .chars()
        .take_while(|c| c.is_whitespace())
        .map(char::len_utf8)
        .sum();
    if len > 0 {
        Some(((), &source[len..]))
    } else {
        None
    }
}

fn comment(source: &str) -> Option<((), &str)> {
    if source.starts_with('#') {
        let len = source
            .chars()
            .take_while(|c| *c != '\n')
            .map(char::len_utf8)
            .sum();
        Some(((), &source[len..]))
    } else {
        None
    }
}

fn digits(source: &str) -> usize {
    source.chars().take_while(|c| c.is_ascii_digit()).count()
}

fn integer(source: &str) -> Option<(Lexeme, &str)> {
    let len = digits(source);
    if len == 0 {
        return None;
    }

    let rest = &source[len..];
    match rest.strip_prefix('.') {
        Some(fraction) if digits(fraction) > 0 => {
            Some((Lexeme::Fraction, &fraction[digits(fraction)..]))
        }
        _ => Some((Lexeme::Integer, rest)),
    }
}

fn string(source: &str) -> Option<(Lexeme, &str)> {
    if !source.starts_with('"') {
        return None;
    }

    let mut chars = source.chars().skip(1);
    let mut len = 1;
    while let Some(c) = chars.next() {
        len += c.len_utf8();
        match c {
            '"' => return Some((Lexeme::String, &source[len..])),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    len += escaped.len_utf8();
                }
            }
            '\n' => break,
            _ => {}
        }
    }
    Some((Lexeme::Unterminated, &source[source.len()..]))
}

fn word(source: &str) -> Option<(Lexeme, &str)> {
    let mut chars = source.chars();

    let first = chars.next()?;
    if !first.is_alphabetic() && first != '_' {
        return None;
    }

    let len = first.len_utf8()
        + chars
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .map(char::len_utf8)
            .sum::<usize>();

    Some((Lexeme::Word, &source[len..]))
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "<<", ">>", "**", "//", "+", "-", "*", "/", "%", ".", "@", ":", ";",
    "<", ">", "=", ",", "(", ")", "[", "]", "{", "}", "&", "|", "^", "~",
];

fn operator(source: &str) -> Option<(Lexeme, &str)> {
    OPERATORS
        .iter()
        .filter(|op| source.starts_with(**op))
        .max_by_key(|op| op.len())
        .map(|op| (Lexeme::Word, &source[op.len()..]))
}

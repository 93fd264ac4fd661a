//! Tokenizer for the flow expression language.
//!
//! The language is line-oriented: newlines separate statements, except
//! inside parentheses or braces, where they are insignificant. `#` starts a
//! comment running to the end of the line.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// `>>`
    Seq,
    /// `|`
    Par,
    /// `<<`
    Attach,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Equals,
    Dot,
    /// Statement separator (outside any grouping).
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut depth = 0usize;

    let push = |tokens: &mut Vec<Spanned>, token: Token, position: usize| {
        tokens.push(Spanned { token, position });
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' => {
                if depth == 0 {
                    // Collapse consecutive separators.
                    if !matches!(tokens.last().map(|s: &Spanned| &s.token), Some(Token::Newline) | None) {
                        push(&mut tokens, Token::Newline, i);
                    }
                }
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'>') {
                    push(&mut tokens, Token::Seq, i);
                    i += 2;
                } else {
                    return Err(ParseError::syntax(i, "expected `>>`"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'<') {
                    push(&mut tokens, Token::Attach, i);
                    i += 2;
                } else {
                    return Err(ParseError::syntax(i, "expected `<<`"));
                }
            }
            '|' => {
                push(&mut tokens, Token::Par, i);
                i += 1;
            }
            '(' => {
                depth += 1;
                push(&mut tokens, Token::LParen, i);
                i += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                push(&mut tokens, Token::RParen, i);
                i += 1;
            }
            '{' => {
                depth += 1;
                push(&mut tokens, Token::LBrace, i);
                i += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                push(&mut tokens, Token::RBrace, i);
                i += 1;
            }
            ',' => {
                push(&mut tokens, Token::Comma, i);
                i += 1;
            }
            ':' => {
                push(&mut tokens, Token::Colon, i);
                i += 1;
            }
            '=' => {
                push(&mut tokens, Token::Equals, i);
                i += 1;
            }
            '.' => {
                push(&mut tokens, Token::Dot, i);
                i += 1;
            }
            '"' | '\'' => {
                let (value, next) = read_string(&chars, i)?;
                push(&mut tokens, Token::Str(value), i);
                i = next;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let (token, next) = read_number(&chars, i)?;
                push(&mut tokens, token, i);
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(word),
                };
                push(&mut tokens, token, start);
            }
            other => {
                return Err(ParseError::syntax(i, format!("unexpected character `{other}`")));
            }
        }
    }

    // Trim a trailing separator so EOF follows the last statement.
    if matches!(tokens.last().map(|s| &s.token), Some(Token::Newline)) {
        tokens.pop();
    }
    push(&mut tokens, Token::Eof, chars.len());
    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let escaped = chars[i + 1];
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((value, i + 1)),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err(ParseError::syntax(start, "unterminated string literal"))
}

fn read_number(chars: &[char], start: usize) -> Result<(Token, usize), ParseError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    let mut is_float = false;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        if chars[i] == '.' {
            // A second dot ends the number (supports nothing like ranges,
            // but keeps errors local).
            if is_float {
                break;
            }
            is_float = true;
        }
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    if is_float {
        text.parse::<f64>()
            .map(|f| (Token::Float(f), i))
            .map_err(|_| ParseError::syntax(start, format!("invalid number `{text}`")))
    } else {
        text.parse::<i64>()
            .map(|n| (Token::Int(n), i))
            .map_err(|_| ParseError::syntax(start, format!("invalid number `{text}`")))
    }
}

//! Tokenizer for Poke source
//!
//! Hand-written, like the parser. Produces a flat token vector with
//! line/column positions for diagnostics. The only context-sensitive
//! wrinkle is the single quote, which opens either a character
//! literal (`'a'`) or an attribute (`v'mapped`); the tokenizer
//! resolves it by looking for the closing quote.

use crate::ast::Loc;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    /// Integer literal with the type its suffix selects.
    Int {
        value: i64,
        size: u32,
        signed: bool,
    },
    /// Raw string body, escapes not yet decoded.
    Str(String),
    /// Character literal, already a byte.
    Char(u8),
    /// Attribute name following a tick.
    Attr(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub loc: Loc,
}

/// Multi-character operators, longest first.
const PUNCTS: &[&str] = &[
    ":::", "**", "/^", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "++", "--", "...", "(",
    ")", "{", "}", "[", "]", ",", ";", ":", "?", "+", "-", "*", "/", "%", "&", "|", "^", "~", "!",
    "<", ">", "=", "@", "#", ".",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0usize;
    let mut line = 1u32;
    let mut col = 1u32;

    macro_rules! loc {
        () => {
            Loc { line, column: col }
        };
    }

    while i < bytes.len() {
        let c = bytes[i] as char;

        // Whitespace.
        if c == '\n' {
            i += 1;
            line += 1;
            col = 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            col += 1;
            continue;
        }

        // Comments.
        if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            let start = loc!();
            i += 2;
            col += 2;
            loop {
                if i + 1 >= bytes.len() {
                    return Err(format!("{}: unterminated comment", start));
                }
                if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    i += 2;
                    col += 2;
                    break;
                }
                if bytes[i] == b'\n' {
                    line += 1;
                    col = 1;
                } else {
                    col += 1;
                }
                i += 1;
            }
            continue;
        }

        // String literals, escape sequences decoded.
        if c == '"' {
            let start = loc!();
            let mut body = String::new();
            i += 1;
            col += 1;
            loop {
                if i >= bytes.len() {
                    return Err(format!("{}: unterminated string literal", start));
                }
                let ch = bytes[i] as char;
                if ch == '"' {
                    i += 1;
                    col += 1;
                    break;
                }
                if ch == '\\' {
                    let escaped = match bytes.get(i + 1).copied() {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'r') => '\r',
                        Some(b'0') => '\0',
                        Some(b'\\') => '\\',
                        Some(b'"') => '"',
                        Some(other) => {
                            return Err(format!(
                                "{}: invalid escape sequence '\\{}'",
                                start, other as char
                            ))
                        }
                        None => {
                            return Err(format!("{}: dangling backslash", start))
                        }
                    };
                    body.push(escaped);
                    i += 2;
                    col += 2;
                    continue;
                }
                if ch == '\n' {
                    line += 1;
                    col = 1;
                } else {
                    col += 1;
                }
                body.push(ch);
                i += 1;
            }
            toks.push(Token {
                tok: Tok::Str(body),
                loc: start,
            });
            continue;
        }

        // Single quote: character literal or attribute.
        if c == '\'' {
            let start = loc!();
            // 'x' or '\x'
            if i + 2 < bytes.len() && bytes[i + 1] == b'\\' && i + 3 < bytes.len() && bytes[i + 3] == b'\'' {
                let value = match bytes[i + 2] {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    b'0' => 0,
                    b'\\' => b'\\',
                    b'\'' => b'\'',
                    other => other,
                };
                toks.push(Token {
                    tok: Tok::Char(value),
                    loc: start,
                });
                i += 4;
                col += 4;
                continue;
            }
            if i + 2 < bytes.len() && bytes[i + 2] == b'\'' {
                toks.push(Token {
                    tok: Tok::Char(bytes[i + 1]),
                    loc: start,
                });
                i += 3;
                col += 3;
                continue;
            }
            // Attribute: tick followed by an identifier.
            let mut j = i + 1;
            while j < bytes.len()
                && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_')
            {
                j += 1;
            }
            if j == i + 1 {
                return Err(format!("{}: stray quote", start));
            }
            let name = src[i + 1..j].to_string();
            col += (j - i) as u32;
            i = j;
            toks.push(Token {
                tok: Tok::Attr(name),
                loc: start,
            });
            continue;
        }

        // Numbers.
        if c.is_ascii_digit() {
            let start = loc!();
            let (value, len) = lex_number(&src[i..]).map_err(|e| format!("{}: {}", start, e))?;
            let mut j = i + len;
            // Suffixes: U/u selects unsigned, L/l selects 64 bits.
            let mut signed = true;
            let mut size = 32u32;
            while j < bytes.len() {
                match bytes[j] {
                    b'U' | b'u' => signed = false,
                    b'L' | b'l' => size = 64,
                    _ => break,
                }
                j += 1;
            }
            // Values that do not fit 32 bits widen.
            if size == 32 {
                let fits = if signed {
                    i32::try_from(value).is_ok()
                } else {
                    u32::try_from(value as u64).is_ok()
                };
                if !fits {
                    size = 64;
                }
            }
            col += (j - i) as u32;
            i = j;
            toks.push(Token {
                tok: Tok::Int {
                    value,
                    size,
                    signed,
                },
                loc: start,
            });
            continue;
        }

        // Identifiers and keywords.
        if c.is_ascii_alphabetic() || c == '_' {
            let start = loc!();
            let mut j = i;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            let name = src[i..j].to_string();
            col += (j - i) as u32;
            i = j;
            toks.push(Token {
                tok: Tok::Ident(name),
                loc: start,
            });
            continue;
        }

        // Operators and punctuation, longest match first.
        let mut matched = false;
        for p in PUNCTS {
            if src[i..].starts_with(p) {
                toks.push(Token {
                    tok: Tok::Punct(p),
                    loc: loc!(),
                });
                i += p.len();
                col += p.len() as u32;
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(format!("{}: unexpected character '{}'", loc!(), c));
        }
    }

    toks.push(Token {
        tok: Tok::Eof,
        loc: loc!(),
    });
    Ok(toks)
}

/// Parse the digits of a number, returning the value and the number
/// of characters consumed (suffixes excluded).
fn lex_number(s: &str) -> Result<(i64, usize), String> {
    let bytes = s.as_bytes();
    let (radix, skip) = if s.starts_with("0x") || s.starts_with("0X") {
        (16, 2)
    } else if s.starts_with("0b") || s.starts_with("0B") {
        (2, 2)
    } else if s.starts_with("0o") || s.starts_with("0O") {
        (8, 2)
    } else {
        (10, 0)
    };
    let mut j = skip;
    let mut value: u64 = 0;
    let mut any = false;
    while j < bytes.len() {
        let c = bytes[j] as char;
        if c == '_' {
            j += 1;
            continue;
        }
        match c.to_digit(radix) {
            Some(d) => {
                value = value
                    .checked_mul(radix as u64)
                    .and_then(|v| v.checked_add(d as u64))
                    .ok_or("integer literal does not fit in 64 bits")?;
                any = true;
                j += 1;
            }
            None => break,
        }
    }
    if !any {
        return Err("malformed integer literal".to_string());
    }
    Ok((value as i64, j))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn numbers_and_suffixes() {
        assert_eq!(
            toks("1 0xff 2U 3L 0b101"),
            vec![
                Tok::Int {
                    value: 1,
                    size: 32,
                    signed: true
                },
                Tok::Int {
                    value: 255,
                    size: 32,
                    signed: true
                },
                Tok::Int {
                    value: 2,
                    size: 32,
                    signed: false
                },
                Tok::Int {
                    value: 3,
                    size: 64,
                    signed: true
                },
                Tok::Int {
                    value: 5,
                    size: 32,
                    signed: true
                },
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn wide_literals_widen() {
        assert_eq!(
            toks("0xdeadbeefcafe")[0],
            Tok::Int {
                value: 0xdead_beef_cafe,
                size: 64,
                signed: true
            }
        );
    }

    #[test]
    fn ticks_split_into_chars_and_attrs() {
        assert_eq!(
            toks("'a' x'mapped '\\n'"),
            vec![
                Tok::Char(b'a'),
                Tok::Ident("x".to_string()),
                Tok::Attr("mapped".to_string()),
                Tok::Char(b'\n'),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn longest_punct_wins() {
        assert_eq!(
            toks("a ::: b :: c"),
            vec![
                Tok::Ident("a".to_string()),
                Tok::Punct(":::"),
                Tok::Ident("b".to_string()),
                Tok::Punct(":"),
                Tok::Punct(":"),
                Tok::Ident("c".to_string()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes_decode() {
        assert_eq!(
            toks("\"a\\nb\\\\\""),
            vec![Tok::Str("a\nb\\".to_string()), Tok::Eof]
        );
        assert!(tokenize("\"bad \\q\"").is_err());
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            toks("1 // two\n/* three\nfour */ 5"),
            vec![
                Tok::Int {
                    value: 1,
                    size: 32,
                    signed: true
                },
                Tok::Int {
                    value: 5,
                    size: 32,
                    signed: true
                },
                Tok::Eof,
            ]
        );
    }
}

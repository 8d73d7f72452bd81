//! Directive-format configuration parser.
//!
//! ```text
//! server {
//!     server_name example.com www.example.com;
//!     listen 127.0.0.1:8080;
//!     root www;                     # comments run to end of line
//!     client_max_body_size 10M;
//!     error_page 404 500 errors/oops.html;
//!
//!     location /cgi-bin {
//!         allow_methods GET POST;
//!         cgi_path /usr/bin/python3;
//!         cgi_extension .py;
//!     }
//! }
//! ```
//!
//! The tokenizer splits on whitespace and the three operators `{`, `}` and `;`.
//! The parser only checks structure and directive values; defaults are applied
//! later by [`ServerConfig::finalize`].

use std::iter::Peekable;
use std::path::PathBuf;
use std::vec::IntoIter;

use thiserror::Error;

use super::{Listen, LocationConfig, ServerConfig};
use crate::http::Method;

/// Structural or value errors in a directive file, with the offending line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("configuration is empty")]
    Empty,

    #[error("line {line}: unexpected `{found}`, expected {expected}")]
    Unexpected {
        line: usize,
        found: String,
        expected: &'static str,
    },

    #[error("unexpected end of file, expected {expected}")]
    UnexpectedEof { expected: &'static str },

    #[error("line {line}: unknown directive `{name}` in {scope} block")]
    UnknownDirective {
        line: usize,
        name: String,
        scope: &'static str,
    },

    #[error("line {line}: invalid value for `{directive}`: {reason}")]
    InvalidValue {
        line: usize,
        directive: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Open,
    Close,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    kind: TokenKind,
    text: String,
    line: usize,
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut line = 1;
    let mut in_comment = false;

    let flush = |word: &mut String, tokens: &mut Vec<Token>, line: usize| {
        if !word.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Word,
                text: std::mem::take(word),
                line,
            });
        }
    };

    for c in input.chars() {
        if c == '\n' {
            flush(&mut word, &mut tokens, line);
            in_comment = false;
            line += 1;
            continue;
        }
        if in_comment {
            continue;
        }

        match c {
            '#' => {
                flush(&mut word, &mut tokens, line);
                in_comment = true;
            }
            '{' | '}' | ';' => {
                flush(&mut word, &mut tokens, line);
                let kind = match c {
                    '{' => TokenKind::Open,
                    '}' => TokenKind::Close,
                    _ => TokenKind::Semicolon,
                };
                tokens.push(Token {
                    kind,
                    text: c.to_string(),
                    line,
                });
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens, line),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens, line);

    tokens
}

/// Parses a directive file into server records (defaults not yet applied).
///
/// # Errors
///
/// Returns [`ParseError::Empty`] for an input without tokens, and a
/// line-numbered variant for any structural or value error.
pub fn parse(input: &str) -> Result<Vec<ServerConfig>, ParseError> {
    let tokens = tokenize(input);
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser {
        tokens: tokens.into_iter().peekable(),
    };

    let mut servers = Vec::new();
    while let Some(token) = parser.tokens.next() {
        if token.kind != TokenKind::Word {
            return Err(unexpected(token, "`server`"));
        }
        if token.text != "server" {
            return Err(ParseError::UnknownDirective {
                line: token.line,
                name: token.text,
                scope: "global",
            });
        }
        servers.push(parser.server_block()?);
    }

    Ok(servers)
}

fn unexpected(token: Token, expected: &'static str) -> ParseError {
    ParseError::Unexpected {
        line: token.line,
        found: token.text,
        expected,
    }
}

fn invalid(directive: &Token, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidValue {
        line: directive.line,
        directive: directive.text.clone(),
        reason: reason.into(),
    }
}

struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    fn next(&mut self, expected: &'static str) -> Result<Token, ParseError> {
        self.tokens
            .next()
            .ok_or(ParseError::UnexpectedEof { expected })
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        let token = self.next(expected)?;
        if token.kind != kind {
            return Err(unexpected(token, expected));
        }
        Ok(token)
    }

    // Words up to the terminating `;`.
    fn values(&mut self) -> Result<Vec<String>, ParseError> {
        let mut values = Vec::new();
        loop {
            let token = self.next("`;`")?;
            match token.kind {
                TokenKind::Word => values.push(token.text),
                TokenKind::Semicolon => return Ok(values),
                _ => return Err(unexpected(token, "a value or `;`")),
            }
        }
    }

    fn server_block(&mut self) -> Result<ServerConfig, ParseError> {
        self.expect(TokenKind::Open, "`{`")?;
        let mut server = ServerConfig::default();
        let mut seen_max_body = false;

        loop {
            let directive = self.next("a directive or `}`")?;
            match directive.kind {
                TokenKind::Close => return Ok(server),
                TokenKind::Word => {}
                _ => return Err(unexpected(directive, "a directive or `}`")),
            }

            if directive.text == "location" {
                for location in self.location_block()? {
                    let path = location.location.clone();
                    if !server.add_location(location) {
                        return Err(invalid(&directive, format!("duplicate location `{path}`")));
                    }
                }
                continue;
            }

            let values = self.values()?;
            if values.is_empty() {
                return Err(invalid(&directive, "expected at least one value"));
            }

            match directive.text.as_str() {
                "server_name" => {
                    for name in values {
                        if !server.server_names.insert(name.clone()) {
                            return Err(invalid(&directive, format!("duplicate name `{name}`")));
                        }
                    }
                }
                "listen" => {
                    for value in values {
                        let listen: Listen =
                            value.parse().map_err(|e| invalid(&directive, format!("{e}")))?;
                        if !server.listens.insert(listen) {
                            return Err(invalid(&directive, format!("duplicate listen `{value}`")));
                        }
                    }
                }
                "root" => set_once(&mut server.root, &directive, values)?,
                "index" => set_once(&mut server.index, &directive, values)?,
                "allow_methods" => add_methods(&mut server.allow_methods, &directive, values)?,
                "client_max_body_size" => {
                    if seen_max_body {
                        return Err(invalid(&directive, "already set"));
                    }
                    seen_max_body = true;
                    let value = single(&directive, values)?;
                    server.client_max_body_size = parse_size(&value)
                        .ok_or_else(|| invalid(&directive, format!("bad size `{value}`")))?;
                }
                "error_page" => {
                    let mut values = values;
                    let page = values.pop().map(PathBuf::from);
                    let (Some(page), false) = (page, values.is_empty()) else {
                        return Err(invalid(&directive, "expected `error_page <code>... <path>`"));
                    };
                    for code in values {
                        let code: u16 = code
                            .parse()
                            .map_err(|_| invalid(&directive, format!("bad status code `{code}`")))?;
                        server.error_pages.insert(code, page.clone());
                    }
                }
                _ => {
                    return Err(ParseError::UnknownDirective {
                        line: directive.line,
                        name: directive.text,
                        scope: "server",
                    });
                }
            }
        }
    }

    /// Parses one location block. Nested blocks are flattened: the result
    /// holds this location first, then every nested one, each of which must
    /// extend the outer path and inherits its unset `root`, `index` and
    /// `allow_methods`.
    fn location_block(&mut self) -> Result<Vec<LocationConfig>, ParseError> {
        let path = self.expect(TokenKind::Word, "a location path")?;
        self.expect(TokenKind::Open, "`{`")?;
        let mut location = LocationConfig::new(path.text);
        let mut nested = Vec::new();
        let mut seen_autoindex = false;

        loop {
            let directive = self.next("a directive or `}`")?;
            match directive.kind {
                TokenKind::Close => {
                    for inner in &mut nested {
                        inherit(inner, &location);
                    }
                    let mut all = Vec::with_capacity(nested.len() + 1);
                    all.push(location);
                    all.append(&mut nested);
                    return Ok(all);
                }
                TokenKind::Word => {}
                _ => return Err(unexpected(directive, "a directive or `}`")),
            }

            if directive.text == "location" {
                let inner = self.location_block()?;
                let outer = location.location.trim_end_matches('/');
                let extends = |path: &str| {
                    path.strip_prefix(outer)
                        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
                };
                if let Some(bad) = inner.iter().find(|l| !extends(&l.location)) {
                    return Err(invalid(
                        &directive,
                        format!("`{}` is not inside `{}`", bad.location, location.location),
                    ));
                }
                nested.extend(inner);
                continue;
            }

            let values = self.values()?;
            if values.is_empty() {
                return Err(invalid(&directive, "expected at least one value"));
            }

            match directive.text.as_str() {
                "root" => set_optional(&mut location.root, &directive, values)?,
                "index" => set_optional(&mut location.index, &directive, values)?,
                "redirect" => set_optional(&mut location.redirect, &directive, values)?,
                "cgi_extension" => set_optional(&mut location.cgi_extension, &directive, values)?,
                "cgi_path" => {
                    if location.cgi_path.is_some() {
                        return Err(invalid(&directive, "already set"));
                    }
                    location.cgi_path = Some(PathBuf::from(single(&directive, values)?));
                }
                "allow_methods" => add_methods(&mut location.allow_methods, &directive, values)?,
                "autoindex" => {
                    if seen_autoindex {
                        return Err(invalid(&directive, "already set"));
                    }
                    seen_autoindex = true;
                    location.autoindex = match single(&directive, values)?.as_str() {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(invalid(&directive, format!("expected on|off, got `{other}`")));
                        }
                    };
                }
                _ => {
                    return Err(ParseError::UnknownDirective {
                        line: directive.line,
                        name: directive.text,
                        scope: "location",
                    });
                }
            }
        }
    }
}

fn inherit(inner: &mut LocationConfig, outer: &LocationConfig) {
    if inner.root.is_none() {
        inner.root.clone_from(&outer.root);
    }
    if inner.index.is_none() {
        inner.index.clone_from(&outer.index);
    }
    if inner.allow_methods.is_empty() {
        inner.allow_methods.clone_from(&outer.allow_methods);
    }
}

fn single(directive: &Token, mut values: Vec<String>) -> Result<String, ParseError> {
    match (values.pop(), values.is_empty()) {
        (Some(value), true) => Ok(value),
        _ => Err(invalid(directive, "expected exactly one value")),
    }
}

fn set_once(slot: &mut String, directive: &Token, values: Vec<String>) -> Result<(), ParseError> {
    if !slot.is_empty() {
        return Err(invalid(directive, "already set"));
    }
    *slot = single(directive, values)?;
    Ok(())
}

fn set_optional(
    slot: &mut Option<String>,
    directive: &Token,
    values: Vec<String>,
) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(invalid(directive, "already set"));
    }
    *slot = Some(single(directive, values)?);
    Ok(())
}

fn add_methods(
    methods: &mut std::collections::BTreeSet<Method>,
    directive: &Token,
    values: Vec<String>,
) -> Result<(), ParseError> {
    for value in values {
        let method: Method = value.parse().map_err(|e| invalid(directive, format!("{e}")))?;
        if !methods.insert(method) {
            return Err(invalid(directive, format!("duplicate method `{value}`")));
        }
    }
    Ok(())
}

/// Parses a byte count with an optional `K`, `M` or `G` suffix.
fn parse_size(value: &str) -> Option<usize> {
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 1024),
        (i, 'm' | 'M') => (&value[..i], 1024 * 1024),
        (i, 'g' | 'G') => (&value[..i], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

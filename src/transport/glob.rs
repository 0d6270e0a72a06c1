//! Remote wildcard patterns and their mapping onto local destinations.

use std::borrow::Cow;

use camino::Utf8PathBuf;
use regex::Regex;
use shell_escape::unix::escape;

use super::TransportError;

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Literal(String),
    AnySequence,
    AnyChar,
    Class(String),
}

impl Token {
    const fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }
}

/// Returns `true` when `pattern` contains shell glob wildcards.
#[must_use]
pub fn has_wildcards(pattern: &str) -> bool {
    tokenize(pattern).iter().any(Token::is_wildcard)
}

/// Returns the final path segment of a remote path.
pub(crate) fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Quotes `pattern` for a remote shell, leaving `*`, `?` and `[...]` live
/// so the remote shell still expands them.
#[must_use]
pub fn shell_pattern(pattern: &str) -> String {
    quote_tokens(&tokenize(pattern))
}

fn quote_tokens(tokens: &[Token]) -> String {
    let mut quoted = String::new();
    for token in tokens {
        match token {
            Token::Literal(text) => quoted.push_str(&escape(Cow::Borrowed(text.as_str()))),
            Token::AnySequence => quoted.push('*'),
            Token::AnyChar => quoted.push('?'),
            Token::Class(body) => {
                quoted.push('[');
                quoted.push_str(body);
                quoted.push(']');
            }
        }
    }
    quoted
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(ch) = chars.next() {
        let wildcard = match ch {
            '*' => Some(Token::AnySequence),
            '?' => Some(Token::AnyChar),
            '[' => {
                let closing = chars.clone().position(|next| next == ']');
                closing.filter(|end| *end > 0).map(|end| {
                    let body: String = chars.by_ref().take(end).collect();
                    chars.next();
                    Token::Class(body)
                })
            }
            _ => None,
        };
        match wildcard {
            Some(token) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(token);
            }
            None => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn class_to_regex(body: &str) -> String {
    let mut out = String::from("[");
    for (index, ch) in body.chars().enumerate() {
        match ch {
            '!' if index == 0 => out.push('^'),
            '\\' | '[' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out.push(']');
    out
}

/// A remote glob paired with the local pattern its matches are written to.
#[derive(Clone, Debug)]
pub struct RemoteGlob {
    remote: Vec<Token>,
    local: Vec<Token>,
    matcher: Regex,
}

impl RemoteGlob {
    /// Compiles a remote glob and validates the local destination pattern.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPattern`] when the remote pattern
    /// cannot be compiled or the local pattern uses more wildcards than the
    /// remote one captures.
    pub fn new(remote: &str, local: &str) -> Result<Self, TransportError> {
        let remote_tokens = tokenize(remote);
        let local_tokens = tokenize(local);

        let mut expression = String::from("^");
        for token in &remote_tokens {
            match token {
                Token::Literal(text) => expression.push_str(&regex::escape(text)),
                Token::AnySequence => expression.push_str("([^/]*)"),
                Token::AnyChar => expression.push_str("([^/])"),
                Token::Class(body) => {
                    expression.push('(');
                    expression.push_str(&class_to_regex(body));
                    expression.push(')');
                }
            }
        }
        expression.push('$');

        let matcher = Regex::new(&expression).map_err(|err| TransportError::InvalidPattern {
            pattern: remote.to_owned(),
            message: err.to_string(),
        })?;

        let captured = remote_tokens.iter().filter(|token| token.is_wildcard()).count();
        let wanted = local_tokens.iter().filter(|token| token.is_wildcard()).count();
        if wanted > captured {
            return Err(TransportError::InvalidPattern {
                pattern: local.to_owned(),
                message: format!(
                    "local pattern has {wanted} wildcards but the remote pattern captures {captured}"
                ),
            });
        }

        Ok(Self {
            remote: remote_tokens,
            local: local_tokens,
            matcher,
        })
    }

    /// Builds the remote shell command listing every path the glob matches,
    /// one per line. Literal segments are quoted; wildcards stay live.
    #[must_use]
    pub fn listing_command(&self) -> String {
        format!("ls -1d {} 2>/dev/null", quote_tokens(&self.remote))
    }

    /// Returns the local path a matched remote path should be written to, or
    /// `None` when `matched` does not satisfy the remote glob.
    #[must_use]
    pub fn destination_for(&self, matched: &str) -> Option<Utf8PathBuf> {
        let captures = self.matcher.captures(matched)?;

        if !self.local.iter().any(Token::is_wildcard) {
            let directory: String = self
                .local
                .iter()
                .filter_map(|token| match token {
                    Token::Literal(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            return Some(Utf8PathBuf::from(directory).join(file_name(matched)));
        }

        let mut groups = captures.iter().skip(1).flatten();
        let mut destination = String::new();
        for token in &self.local {
            match token {
                Token::Literal(text) => destination.push_str(text),
                _ => destination.push_str(groups.next().map_or("", |group| group.as_str())),
            }
        }
        Some(Utf8PathBuf::from(destination))
    }
}

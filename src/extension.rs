//! `Sec-WebSocket-Extensions` header parsing and formatting (RFC 6455 §9.1)
//!
//! The header is a comma-separated list of extension offers, each a
//! semicolon-separated list starting with the extension name followed by
//! `param` or `param=value` tokens. Values may be quoted strings, which must
//! still be valid tokens once unescaped.
//!
//! Parsing keeps every extension, not just permessage-deflate, so callers can
//! negotiate other extensions from the same [`Extensions`] value.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};

/// Value of a single extension parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamValue {
    /// Parameter present without `=value`
    Flag,
    /// Parameter with an explicit value (unquoted)
    Value(String),
}

/// Parameters of one offer, keyed by name, keeping repeated occurrences
pub type ParamSet = BTreeMap<String, Vec<ParamValue>>;

/// Parsed header: offers grouped by extension name, in header order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: Vec<(String, Vec<ParamSet>)>,
}

impl Extensions {
    /// Offers made for `name`, in the order the client listed them
    pub fn get(&self, name: &str) -> Option<&[ParamSet]> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, offers)| offers.as_slice())
    }

    /// Extension names in first-appearance order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// True if no extension was offered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, name: &str, params: ParamSet) {
        match self.entries.iter_mut().find(|(entry, _)| entry == name) {
            Some((_, offers)) => offers.push(params),
            None => self.entries.push((name.to_string(), vec![params])),
        }
    }
}

/// Parse a `Sec-WebSocket-Extensions` header value
///
/// A malformed element is skipped on its own, so a broken offer for one
/// extension does not hide valid offers for another. Fails only when no
/// element could be parsed.
pub fn parse(header: &str) -> Result<Extensions> {
    let mut extensions = Extensions::default();
    let mut last_error = None;

    for element in split_unquoted(header, ',')? {
        let element = element.trim();
        // empty list elements are allowed by the HTTP list syntax
        if element.is_empty() {
            continue;
        }

        match parse_element(element) {
            Ok((name, params)) => extensions.push(name, params),
            Err(e) => {
                debug!(element, error = %e, "skipping malformed extension offer");
                last_error = Some(e);
            }
        }
    }

    if extensions.is_empty() {
        return Err(last_error.unwrap_or_else(|| Error::Extension("empty extension list".into())));
    }

    Ok(extensions)
}

fn parse_element(element: &str) -> Result<(&str, ParamSet)> {
    let mut parts = split_unquoted(element, ';')?.into_iter();
    let name = parts.next().map(str::trim).unwrap_or_default();
    if !is_token(name) {
        return Err(Error::Extension(format!("invalid extension name {name:?}")));
    }

    let mut params = ParamSet::new();
    for part in parts {
        let part = part.trim();
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (key.trim(), ParamValue::Value(parse_value(value.trim())?)),
            None => (part, ParamValue::Flag),
        };
        if !is_token(key) {
            return Err(Error::Extension(format!(
                "invalid parameter name {key:?} in {name}"
            )));
        }
        params.entry(key.to_string()).or_default().push(value);
    }

    Ok((name, params))
}

/// Format one extension with its parameters for a response header
pub fn format<'a, I>(name: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<String>)>,
{
    let mut out = String::from(name);
    for (key, value) in params {
        out.push_str("; ");
        out.push_str(key);
        if let Some(value) = value {
            out.push('=');
            out.push_str(&value);
        }
    }
    out
}

/// RFC 7230 token
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

fn parse_value(raw: &str) -> Result<String> {
    let value = match raw.strip_prefix('"') {
        Some(rest) => {
            let inner = rest
                .strip_suffix('"')
                .ok_or_else(|| Error::Extension(format!("unterminated quoted value {raw:?}")))?;
            let mut unescaped = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some(escaped) => unescaped.push(escaped),
                        None => {
                            return Err(Error::Extension(format!("dangling escape in {raw:?}")));
                        }
                    }
                } else {
                    unescaped.push(c);
                }
            }
            unescaped
        }
        None => raw.to_string(),
    };

    if !is_token(&value) {
        return Err(Error::Extension(format!("invalid parameter value {raw:?}")));
    }
    Ok(value)
}

/// Split on `sep` outside quoted strings
fn split_unquoted(s: &str, sep: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }

    if in_quotes {
        return Err(Error::Extension("unterminated quoted string".into()));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The match-expression language.
//!
//! An expression is a whitespace-separated list of terms; a port matches
//! when every term matches. Term shapes:
//!
//! | shape | meaning |
//! |-------|---------|
//! | `VALUE` | whole-word, case-insensitive match against any attribute |
//! | `ATTR=VALUE` | whole-value, case-insensitive match against one attribute |
//! | `~/REGEX/` | case-sensitive substring regex against any attribute |
//! | `ATTR~/REGEX/` | case-sensitive substring regex against one attribute |
//!
//! `VALUE` literals support `*` and `?` wildcards. Characters may be
//! backslash-escaped (`\n \t \xHH \uHHHH`, or any character to strip its
//! special meaning) or enclosed in double quotes; a quoted `/` does not
//! terminate a regex, and a literal backslash inside a regex is written
//! `\\`. An unscoped literal that parses as a decimal or `0x` hex integer
//! also matches any attribute carrying the same number in either base.
//! `ATTR` may abbreviate an attribute name to any unambiguous prefix.

use regex::{Regex, RegexBuilder};

use crate::ports::{PortAttributes, WELL_KNOWN_KEYS};
use crate::{Error, Result};

/// One character of a term, with a flag telling whether quoting stripped
/// its structural meaning.
#[derive(Debug, Clone, Copy)]
struct QChar {
    ch: char,
    quoted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    /// Unscoped; any attribute value may satisfy the term.
    Any,
    /// Resolved at compile time against the well-known key set.
    Key(String),
    /// Unknown prefix, resolved per attribute map at evaluation time.
    Prefix(String),
}

#[derive(Debug)]
struct TermMatcher {
    scope: Scope,
    regex: Regex,
    /// Set for unscoped integer literals; enables decimal/hex equivalence.
    numeric: Option<u64>,
}

/// A compiled match expression, ready to evaluate against attribute maps.
///
/// Compilation is pure: the same expression always yields a matcher with
/// the same behavior, independent of which ports are present.
#[derive(Debug)]
pub struct CompiledMatcher {
    source: String,
    terms: Vec<TermMatcher>,
}

impl CompiledMatcher {
    pub fn compile(expr: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for raw in lex(expr)? {
            terms.push(parse_term(&raw)?);
        }
        Ok(CompiledMatcher {
            source: expr.to_string(),
            terms,
        })
    }

    /// The expression this matcher was compiled from.
    pub fn expression(&self) -> &str {
        &self.source
    }

    /// True iff every term matches. An expression with no terms matches
    /// every port.
    pub fn matches(&self, attrs: &PortAttributes) -> bool {
        self.terms.iter().all(|t| term_matches(t, attrs))
    }

    /// Keeps the matching ports, ordered by their `device` attribute so
    /// that single-port selection is deterministic.
    pub fn filter(&self, ports: Vec<PortAttributes>) -> Vec<PortAttributes> {
        let mut hits: Vec<PortAttributes> =
            ports.into_iter().filter(|p| self.matches(p)).collect();
        hits.sort_by(|a, b| a.device().unwrap_or("").cmp(b.device().unwrap_or("")));
        hits
    }
}

fn term_matches(term: &TermMatcher, attrs: &PortAttributes) -> bool {
    match &term.scope {
        Scope::Any => attrs.iter().any(|(_, v)| value_matches(term, v)),
        Scope::Key(key) => attrs.get(key).is_some_and(|v| value_matches(term, v)),
        Scope::Prefix(prefix) => {
            resolve_prefix(attrs, prefix).is_some_and(|v| value_matches(term, v))
        }
    }
}

fn value_matches(term: &TermMatcher, value: &str) -> bool {
    if term.regex.is_match(value) {
        return true;
    }
    match term.numeric {
        Some(n) => parse_integer(value) == Some(n),
        None => false,
    }
}

/// Evaluation-time scope resolution: exact key first, then a unique
/// prefix. Two or more prefixed keys leave the term unresolved.
fn resolve_prefix<'a>(attrs: &'a PortAttributes, prefix: &str) -> Option<&'a str> {
    if let Some(v) = attrs.get(prefix) {
        return Some(v);
    }
    let mut hit = None;
    for key in attrs.keys() {
        if key.starts_with(prefix) {
            if hit.is_some() {
                return None;
            }
            hit = Some(key);
        }
    }
    attrs.get(hit?)
}

/// Accepts `1234` and `0x4d2` styles; anything else is not a number.
fn parse_integer(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().ok();
    }
    None
}

// ---- lexing ----------------------------------------------------------------

/// Splits an expression into terms, decoding escapes and double-quoted
/// runs. Decoded characters carry a `quoted` flag so later stages can tell
/// a wildcard `*` from a literal one and a regex delimiter from an escaped
/// slash.
fn lex(expr: &str) -> Result<Vec<Vec<QChar>>> {
    let mut terms = Vec::new();
    let mut term: Vec<QChar> = Vec::new();
    let mut explicit = false;
    let mut in_quotes = false;
    let mut chars = expr.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                term.push(decode_escape(&mut chars)?);
            }
            '"' => {
                in_quotes = !in_quotes;
                explicit = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !term.is_empty() {
                    terms.push(std::mem::take(&mut term));
                } else if explicit {
                    return Err(Error::Parse("empty term".into()));
                }
                explicit = false;
            }
            c => term.push(QChar {
                ch: c,
                quoted: in_quotes,
            }),
        }
    }
    if in_quotes {
        return Err(Error::Parse("unterminated quoted string".into()));
    }
    if !term.is_empty() {
        terms.push(term);
    } else if explicit {
        return Err(Error::Parse("empty term".into()));
    }
    Ok(terms)
}

fn decode_escape(chars: &mut std::str::Chars<'_>) -> Result<QChar> {
    let Some(ch) = chars.next() else {
        return Err(Error::Parse("dangling backslash".into()));
    };
    let decoded = match ch {
        'n' => '\n',
        't' => '\t',
        'x' => hex_escape(chars, 2)?,
        'u' => hex_escape(chars, 4)?,
        other => other,
    };
    Ok(QChar {
        ch: decoded,
        quoted: true,
    })
}

fn hex_escape(chars: &mut std::str::Chars<'_>, digits: u32) -> Result<char> {
    let mut value: u32 = 0;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| Error::Parse("bad escape: expected hex digits".into()))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| Error::Parse("bad escape: not a character".into()))
}

// ---- term compilation ------------------------------------------------------

fn decoded(chars: &[QChar]) -> String {
    chars.iter().map(|qc| qc.ch).collect()
}

fn parse_term(term: &[QChar]) -> Result<TermMatcher> {
    let eq = term.iter().position(|qc| qc.ch == '=' && !qc.quoted);
    let tilde = term.iter().position(|qc| qc.ch == '~' && !qc.quoted);
    match (eq, tilde) {
        (None, Some(t)) => compile_regex_term(&term[..t], &term[t + 1..]),
        (Some(e), Some(t)) if t < e => compile_regex_term(&term[..t], &term[t + 1..]),
        (Some(e), _) => compile_scoped_literal(&term[..e], &term[e + 1..]),
        (None, None) => compile_unscoped_literal(term),
    }
}

fn compile_regex_term(scope: &[QChar], rest: &[QChar]) -> Result<TermMatcher> {
    if rest.first().map(|qc| (qc.ch, qc.quoted)) != Some(('/', false)) {
        return Err(Error::Parse("expected /regex/ after '~'".into()));
    }
    let body = &rest[1..];
    let closed = body
        .last()
        .is_some_and(|qc| qc.ch == '/' && !qc.quoted);
    if !closed {
        return Err(Error::Parse("unterminated regex".into()));
    }
    let pattern = decoded(&body[..body.len() - 1]);
    let regex = Regex::new(&pattern)
        .map_err(|e| Error::Parse(format!("bad regex {pattern:?}: {e}")))?;
    Ok(TermMatcher {
        scope: compile_scope(scope)?,
        regex,
        numeric: None,
    })
}

fn compile_scoped_literal(scope: &[QChar], value: &[QChar]) -> Result<TermMatcher> {
    if scope.is_empty() {
        return Err(Error::Parse("missing attribute name before '='".into()));
    }
    let pattern = format!("^(?:{})$", wildcard_pattern(value));
    Ok(TermMatcher {
        scope: compile_scope(scope)?,
        regex: case_insensitive(&pattern)?,
        numeric: None,
    })
}

fn compile_unscoped_literal(term: &[QChar]) -> Result<TermMatcher> {
    let mut pattern = wildcard_pattern(term);
    // Word-boundary wrap, but only where the literal's edge is a word
    // character; `\b` before a `*` or a punctuation edge would never match.
    let first = term.first().map(|qc| (qc.ch, qc.quoted));
    let last = term.last().map(|qc| (qc.ch, qc.quoted));
    if first.is_some_and(edge_is_word) {
        pattern.insert_str(0, r"\b");
    }
    if last.is_some_and(edge_is_word) {
        pattern.push_str(r"\b");
    }
    let text = decoded(term);
    let wildcarded = term.iter().any(|qc| !qc.quoted && (qc.ch == '*' || qc.ch == '?'));
    Ok(TermMatcher {
        scope: Scope::Any,
        regex: case_insensitive(&pattern)?,
        numeric: if wildcarded { None } else { parse_integer(&text) },
    })
}

fn edge_is_word((ch, quoted): (char, bool)) -> bool {
    if !quoted && (ch == '*' || ch == '?') {
        return false;
    }
    ch.is_alphanumeric() || ch == '_'
}

/// Escapes a literal into a regex, mapping unquoted `*` and `?` to their
/// any-run / any-one equivalents.
fn wildcard_pattern(chars: &[QChar]) -> String {
    let mut pattern = String::new();
    for qc in chars {
        match qc.ch {
            '*' if !qc.quoted => pattern.push_str(".*"),
            '?' if !qc.quoted => pattern.push('.'),
            ch => pattern.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern
}

fn case_insensitive(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Parse(format!("bad pattern {pattern:?}: {e}")))
}

/// Compile-time scope resolution against the well-known key set. An exact
/// well-known key binds; a prefix of exactly one well-known key binds; a
/// prefix of several is ambiguous; a prefix of none stays symbolic for
/// evaluation-time resolution.
fn compile_scope(scope: &[QChar]) -> Result<Scope> {
    if scope.is_empty() {
        return Ok(Scope::Any);
    }
    let prefix = decoded(scope).to_ascii_lowercase();
    if WELL_KNOWN_KEYS.contains(&prefix.as_str()) {
        return Ok(Scope::Key(prefix));
    }
    let hits: Vec<&str> = WELL_KNOWN_KEYS
        .iter()
        .copied()
        .filter(|k| k.starts_with(&prefix))
        .collect();
    match hits.as_slice() {
        [] => Ok(Scope::Prefix(prefix)),
        [only] => Ok(Scope::Key((*only).to_string())),
        many => Err(Error::Parse(format!(
            "ambiguous attribute prefix {prefix:?}: could be {}",
            many.join(", ")
        ))),
    }
}

//! Shell-style word splitting.
//!
//! Turns a command line into argument words using the quoting rules shared
//! by POSIX shells:
//!
//! - unquoted whitespace separates words
//! - `'...'` is literal, no escapes at all
//! - `"..."` is literal except `\"`, `\\`, `\$` and `` \` ``
//! - outside quotes `\` escapes the next character, whitespace included
//! - adjacent fragments concatenate: `a'b c'"d"` is the single word `ab cd`
//!
//! The only failure is an unterminated quote. Nothing is expanded; the
//! secondary entry point [`var_refs`] merely locates `$NAME` / `${NAME}`
//! spans so callers can diagnose or substitute them.

use std::ops::Range;

use pipewright_types::{Error, Result};

/// Byte span into the source text.
pub type Span = Range<usize>;

/// One argument word with its position in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    /// The word after quote removal.
    pub text: String,
    /// Source span, including any quotes.
    pub span: Span,
    /// Whether any part of the word was quoted or backslash-escaped.
    pub quoted: bool,
}

/// A variable reference found in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    /// Variable name without `$` or braces.
    pub name: String,
    /// Source span of the whole reference, `$` included.
    pub span: Span,
}

/// Characters a backslash may escape inside double quotes.
const DOUBLE_QUOTE_ESCAPES: [char; 4] = ['"', '\\', '$', '`'];

/// Split a command line into words.
///
/// ```
/// use pipewright_kernel::lexer::split;
///
/// assert_eq!(split("'foo bar' baz").unwrap(), vec!["foo bar", "baz"]);
/// ```
pub fn split(input: &str) -> Result<Vec<String>> {
    Ok(split_words(input)?.into_iter().map(|w| w.text).collect())
}

/// Split a command line into words, keeping source spans.
pub fn split_words(input: &str) -> Result<Vec<Word>> {
    let mut words = Vec::new();
    let mut text = String::new();
    // Start of the current word; None between words.
    let mut start: Option<usize> = None;
    let mut quoted = false;
    let mut chars = input.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if let Some(s) = start.take() {
                    words.push(Word {
                        text: std::mem::take(&mut text),
                        span: s..i,
                        quoted,
                    });
                    quoted = false;
                }
            }
            '\'' => {
                start.get_or_insert(i);
                quoted = true;
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, c)) => text.push(c),
                        None => return Err(Error::UnterminatedQuote { quote: '\'', offset: i }),
                    }
                }
            }
            '"' => {
                start.get_or_insert(i);
                quoted = true;
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.peek() {
                            Some(&(_, next)) if DOUBLE_QUOTE_ESCAPES.contains(&next) => {
                                text.push(next);
                                chars.next();
                            }
                            _ => text.push('\\'),
                        },
                        Some((_, c)) => text.push(c),
                        None => return Err(Error::UnterminatedQuote { quote: '"', offset: i }),
                    }
                }
            }
            '\\' => {
                start.get_or_insert(i);
                quoted = true;
                match chars.next() {
                    Some((_, next)) => text.push(next),
                    // A dangling backslash stands for itself.
                    None => text.push('\\'),
                }
            }
            c => {
                start.get_or_insert(i);
                text.push(c);
            }
        }
    }

    if let Some(s) = start {
        words.push(Word {
            text,
            span: s..input.len(),
            quoted,
        });
    }

    Ok(words)
}

/// Locate variable references outside single quotes.
///
/// Recognizes `$NAME` (letters, digits, underscore; not starting with a
/// digit) and `${NAME}`. Escaped dollars (`\$`) and unterminated `${` are
/// not references. Fails only where [`split_words`] would.
pub fn var_refs(input: &str) -> Result<Vec<VarRef>> {
    let mut refs = Vec::new();
    let bytes = input.as_bytes();
    let mut in_double: Option<usize> = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                // Inside double quotes only a few characters are escapable,
                // but `\$` is one of them, so skipping one char is right.
                i += 2;
                continue;
            }
            b'\'' if in_double.is_none() => {
                let open = i;
                match input[i + 1..].find('\'') {
                    Some(rel) => i += rel + 2,
                    None => return Err(Error::UnterminatedQuote { quote: '\'', offset: open }),
                }
                continue;
            }
            b'"' => {
                in_double = match in_double {
                    Some(_) => None,
                    None => Some(i),
                };
            }
            b'$' => {
                if let Some(found) = scan_var_ref(input, i) {
                    i = found.span.end;
                    refs.push(found);
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some(open) = in_double {
        return Err(Error::UnterminatedQuote { quote: '"', offset: open });
    }

    Ok(refs)
}

/// Try to read a variable reference whose `$` sits at byte `at`.
fn scan_var_ref(input: &str, at: usize) -> Option<VarRef> {
    let rest = &input[at + 1..];

    if let Some(braced) = rest.strip_prefix('{') {
        let close = braced.find('}')?;
        let name = &braced[..close];
        if !is_var_name(name) {
            return None;
        }
        return Some(VarRef {
            name: name.to_string(),
            // `$` + `{` + name + `}`
            span: at..at + close + 3,
        });
    }

    let len = rest
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    let name = &rest[..len];
    if !is_var_name(name) {
        return None;
    }
    Some(VarRef {
        name: name.to_string(),
        span: at..at + 1 + len,
    })
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

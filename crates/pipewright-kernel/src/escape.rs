//! Rendering argument vectors as shell-safe command lines.
//!
//! Two dialects are provided. [`escape`] produces the most readable form
//! for a modern POSIX shell, preferring quotes. [`escape_portable`] sticks
//! to backslash escapes over a conservative ASCII safe set, so the output
//! survives any Bourne-family shell.
//!
//! Both are inverses of [`crate::lexer::split`] for NUL-free input.

/// Punctuation that never needs quoting in the native dialect.
const NATIVE_SAFE: &[char] = &['_', '-', '+', '.', '/', '=', ',', ':', '@', '%', '^'];

/// Shell metacharacters that the native dialect escapes one at a time.
const METACHARS: &[char] = &[
    '`', '$', '&', '|', ';', '<', '>', '(', ')', '*', '?', '[', ']', '{', '}', '#', '~', '!',
];

/// Punctuation that never needs escaping in the portable dialect.
const PORTABLE_SAFE: &[char] = &['_', '/', '+', '-', '.'];

/// Escape arguments for a modern shell.
///
/// ```
/// use pipewright_kernel::escape::escape;
///
/// assert_eq!(escape(["foo bar", "a'b"]), r#"'foo bar' "a'b""#);
/// ```
pub fn escape<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join(args, |_, arg| escape_native_word(arg))
}

/// Escape arguments for any POSIX shell.
pub fn escape_portable<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join(args, |index, arg| escape_portable_word(arg, index == 0))
}

fn join<I, S, F>(args: I, mut render: F) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: FnMut(usize, &str) -> String,
{
    let mut out = String::new();
    for (index, arg) in args.into_iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&render(index, arg.as_ref()));
    }
    out
}

fn is_native_safe(c: char) -> bool {
    c.is_alphanumeric() || NATIVE_SAFE.contains(&c)
}

/// Escape one word in the native dialect.
pub fn escape_native_word(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    if arg.chars().all(is_native_safe) {
        return arg.to_string();
    }

    if arg.chars().all(|c| is_native_safe(c) || METACHARS.contains(&c)) {
        let mut out = String::with_capacity(arg.len() * 2);
        for c in arg.chars() {
            if METACHARS.contains(&c) {
                out.push('\\');
            }
            out.push(c);
        }
        return out;
    }

    if !arg.contains('\'') {
        return format!("'{}'", arg);
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Escape one word in the portable dialect.
///
/// `first` marks the command word, where a bare `=` would read as an
/// assignment.
pub fn escape_portable_word(arg: &str, first: bool) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // A backslash-newline is a line continuation, so newlines need quotes.
    if arg.contains('\n') {
        return format!("'{}'", arg.replace('\'', r"'\''"));
    }

    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        let safe = c.is_ascii_alphanumeric() || PORTABLE_SAFE.contains(&c) || (c == '=' && !first);
        if !safe {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare("ls", "ls")]
    #[case::path("/usr/bin/env", "/usr/bin/env")]
    #[case::assignment("KEY=value", "KEY=value")]
    #[case::unicode("héllo", "héllo")]
    #[case::empty("", "''")]
    #[case::glob("*.rs", r"\*.rs")]
    #[case::var("$HOME", r"\$HOME")]
    #[case::space("a b", "'a b'")]
    #[case::quote("it's", r#""it's""#)]
    #[case::quote_and_dollar("it's $5", r#""it's \$5""#)]
    fn test_native_word(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(escape_native_word(input), expected);
    }

    #[rstest]
    #[case::bare("ls", true, "ls")]
    #[case::eq_first("a=b", true, r"a\=b")]
    #[case::eq_later("a=b", false, "a=b")]
    #[case::space("a b", false, r"a\ b")]
    #[case::quote("it's", false, r"it\'s")]
    #[case::colon("a:b", false, r"a\:b")]
    #[case::newline("a\nb'c", false, "'a\nb'\\''c'")]
    #[case::empty("", false, "''")]
    fn test_portable_word(#[case] input: &str, #[case] first: bool, #[case] expected: &str) {
        assert_eq!(escape_portable_word(input, first), expected);
    }

    #[test]
    fn test_join_uses_single_spaces() {
        assert_eq!(escape(["echo", "", "x"]), "echo '' x");
        assert_eq!(escape_portable(["a=b", "a=b"]), r"a\=b a=b");
        assert_eq!(escape(Vec::<String>::new()), "");
    }
}

//! SQL canonicalization.
//!
//! The canonical form is what the validator inspects and what approval
//! tokens bind to; the original text is what executes. The transformation
//! is intentionally syntactic - no parsing - because its only job is to
//! neutralize commentary-based and case-based evasions:
//!
//! 1. line comments (`--` to end of line) removed
//! 2. block comments (`/*` to the next `*/`, non-nested) removed
//! 3. ASCII-only upper-casing; non-ASCII passes through unchanged so that
//!    homoglyph attempts on keywords do not become keywords
//! 4. whitespace runs collapsed to a single space, ends trimmed

/// Produce the canonical form of a statement.
#[must_use]
pub fn canonicalize(sql: &str) -> String {
    let stripped = strip_comments(sql);

    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            pending_space = true;
        } else {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch.to_ascii_uppercase());
        }
    }
    out
}

/// Remove line and block comments.
///
/// Block comment bodies are dropped without a replacement character so
/// that a keyword split by a comment (`SEL/**/ECT`) reassembles into the
/// keyword it was hiding. An unterminated block comment swallows the rest
/// of the input.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '-' && chars.peek() == Some(&'-') {
            chars.next();
            while let Some(&next) = chars.peek() {
                if next == '\n' {
                    break;
                }
                chars.next();
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = '\0';
            for next in chars.by_ref() {
                if prev == '*' && next == '/' {
                    break;
                }
                prev = next;
            }
        } else {
            out.push(c);
        }
    }
    out
}

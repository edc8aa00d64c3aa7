// SPDX-License-Identifier: Apache-2.0

//! Field splitter for access-log style lines.
//!
//! Whitespace-delimited with two bracket pairs, `"..."` and `[...]`, that
//! each capture a single token verbatim with the bracket characters
//! stripped. `\` escapes the byte that follows. Runs of separators yield no
//! empty tokens; a trailing unterminated token is captured.

/// Split `line` into fields.
pub fn split(line: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    let mut items = Vec::new();

    let mut esc = false;
    let mut want: u8 = 0;
    let mut pos = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if esc {
            esc = false;
        } else if b == b'\\' {
            esc = true;
        } else if want == b'"' {
            if b == b'"' {
                want = 0;
                items.push(line[pos..i].to_string());
                pos = i + 1;
            }
        } else if want == b']' {
            if b == b']' {
                want = 0;
                items.push(line[pos..i].to_string());
                pos = i + 1;
            }
        } else if b == b'"' {
            want = b'"';
            pos += 1;
        } else if b == b'[' {
            want = b']';
            pos += 1;
        } else if b == b' ' {
            if i != pos {
                items.push(line[pos..i].to_string());
            }
            pos = i + 1;
        }
    }

    if pos != bytes.len() {
        items.push(line[pos..].to_string());
    }

    items
}

/// Resolve a 1-based, negative-indexable field position against `total`
/// fields. Returns None when the position falls outside the line.
pub fn absidx(idx: i32, total: usize) -> Option<usize> {
    if total == 0 {
        return None;
    }
    let resolved = if idx > 0 {
        idx as i64 - 1
    } else {
        total as i64 + idx as i64
    };
    if resolved < 0 || resolved >= total as i64 {
        None
    } else {
        Some(resolved as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_quotes_and_runs() {
        let fields = split("hello \"1 [] 2\"[world] [] [\"\"]  bj");
        assert_eq!(
            fields,
            vec!["hello", "1 [] 2", "world", "", "\"\"", "bj"]
        );
    }

    #[test]
    fn plain_whitespace() {
        assert_eq!(split("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(split(""), Vec::<String>::new());
        assert_eq!(split("   "), Vec::<String>::new());
    }

    #[test]
    fn trailing_token_captured() {
        assert_eq!(split("one two"), vec!["one", "two"]);
        assert_eq!(split("one "), vec!["one"]);
    }

    #[test]
    fn escape_passes_through() {
        // The escaped quote does not open a quoted token.
        assert_eq!(split("a\\\"b c"), vec!["a\\\"b", "c"]);
    }

    #[test]
    fn absidx_resolution() {
        assert_eq!(absidx(1, 4), Some(0));
        assert_eq!(absidx(4, 4), Some(3));
        assert_eq!(absidx(-1, 4), Some(3));
        assert_eq!(absidx(-4, 4), Some(0));
        assert_eq!(absidx(5, 4), None);
        assert_eq!(absidx(-5, 4), None);
        assert_eq!(absidx(0, 4), None);
        assert_eq!(absidx(1, 0), None);
    }
}

use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const ELLIPSIS: char = '…';

/// Cut `s` to at most `max_width` terminal columns, ending with an ellipsis
/// when anything was dropped. Wide characters (CJK, emoji) count as two.
///
/// ```
/// use threadline::util::truncate_to_width;
///
/// assert_eq!(truncate_to_width("short", 10), "short");
/// assert_eq!(truncate_to_width("hello world", 6), "hello…");
/// assert_eq!(truncate_to_width("你好世界", 5), "你好…");
/// assert_eq!(truncate_to_width("abc", 0), "");
/// ```
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if UnicodeWidthStr::width(s) <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width == 0 {
        return Cow::Borrowed("");
    }

    let budget = max_width - 1;
    let mut used = 0;
    let mut out = String::with_capacity(s.len().min(max_width * 4));
    for c in s.chars() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push(ELLIPSIS);
    Cow::Owned(out)
}

/// Remove terminal escape sequences and control characters from
/// author-supplied text. Newlines and tabs survive.
///
/// ```
/// use threadline::util::strip_control_chars;
///
/// assert_eq!(strip_control_chars("plain"), "plain");
/// assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
/// assert_eq!(strip_control_chars("a\x07b"), "ab");
/// ```
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let dirty = s
        .chars()
        .any(|c| c.is_control() && c != '\n' && c != '\t');
    if !dirty {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                // CSI: parameters until a final byte in @..~
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Single-line preview of record content for listings: control characters
/// stripped, whitespace runs collapsed, cut to `max_width` columns.
pub fn preview_line(content: &str, max_width: usize) -> String {
    let clean = strip_control_chars(content);
    let collapsed = clean.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_to_width(&collapsed, max_width).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_fits_borrows() {
        assert!(matches!(truncate_to_width("fits", 4), Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncate_respects_wide_chars() {
        let out = truncate_to_width("日本語のテキスト", 7);
        assert!(UnicodeWidthStr::width(out.as_ref()) <= 7);
        assert!(out.ends_with(ELLIPSIS));
    }

    #[test]
    fn test_truncate_width_one() {
        assert_eq!(truncate_to_width("abc", 1), "…");
    }

    #[test]
    fn test_strip_osc_sequence() {
        assert_eq!(strip_control_chars("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_control_chars("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn test_strip_keeps_newlines_and_tabs() {
        assert_eq!(strip_control_chars("a\n\tb\r"), "a\n\tb");
    }

    #[test]
    fn test_preview_line_collapses_whitespace() {
        assert_eq!(preview_line("gm\n\n  everyone\x1b[1m!", 40), "gm everyone!");
        assert_eq!(preview_line("one two three", 8), "one two…");
    }
}

//! Boxed output frames for the supervisor console. Column math is done on
//! display width: ANSI escape sequences are stripped before measuring and
//! wide characters count for what the terminal actually renders.

use unicode_width::UnicodeWidthStr;

use crate::logger::{CYAN, RESET};

/// Inner width of every frame, in terminal columns.
const INNER_WIDTH: usize = 50;

/// Removes CSI/SGR escape sequences, leaving only printable content.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: consume until the final byte in @..~
            Some('[') => {
                chars.next();
                for esc in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&esc) {
                        break;
                    }
                }
            }
            // bare two-byte escape
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

pub fn display_width(input: &str) -> usize {
    UnicodeWidthStr::width(strip_ansi(input).as_str())
}

/// Truncates to `max` columns of display width. When a colored line is
/// cut, the dangling escape state is closed with a reset instead of
/// leaking into the frame border.
pub fn truncate_display(input: &str, max: usize) -> String {
    if display_width(input) <= max {
        return input.to_string();
    }

    let mut out = String::new();
    let mut width = 0;
    let limit = max.saturating_sub(3);
    let mut chars = input.chars().peekable();
    let mut saw_escape = false;
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            saw_escape = true;
            if chars.peek() == Some(&'[') {
                chars.next();
                for esc in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&esc) {
                        break;
                    }
                }
            } else {
                chars.next();
            }
            // color codes on the truncated suffix are dropped entirely
            continue;
        }
        let cw = UnicodeWidthStr::width(c.to_string().as_str());
        if width + cw > limit {
            break;
        }
        width += cw;
        out.push(c);
    }
    if saw_escape {
        out.push_str(RESET);
    }
    out.push_str("...");
    out
}

fn pad_to(input: &str, columns: usize) -> String {
    let width = display_width(input);
    let mut out = input.to_string();
    for _ in width..columns {
        out.push(' ');
    }
    out
}

/// Renders a titled box to the supervisor terminal. Lines wider than the
/// frame are truncated; empty input gets a placeholder row.
pub fn draw_box(title: &str, lines: &[String]) -> String {
    let mut out = String::new();
    let horizontal = "─".repeat(INNER_WIDTH + 2);

    out.push_str(&format!("\r{}┌{}┐{}\r\n", CYAN, horizontal, RESET));
    out.push_str(&format!(
        "\r{}│ {} │{}\r\n",
        CYAN,
        pad_to(&truncate_display(title, INNER_WIDTH), INNER_WIDTH),
        RESET
    ));
    out.push_str(&format!("\r{}├{}┤{}\r\n", CYAN, horizontal, RESET));

    let mut printed = false;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        printed = true;
        out.push_str(&format!(
            "\r{}│{} {} {}│{}\r\n",
            CYAN,
            RESET,
            pad_to(&truncate_display(line, INNER_WIDTH), INNER_WIDTH),
            CYAN,
            RESET
        ));
    }
    if !printed {
        out.push_str(&format!(
            "\r{}│ {} │{}\r\n",
            CYAN,
            pad_to("(no output)", INNER_WIDTH),
            RESET
        ));
    }

    out.push_str(&format!("\r{}└{}┘{}\r\n", CYAN, horizontal, RESET));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::GREEN;

    #[test]
    fn test_strip_ansi() {
        let colored = format!("{}ALIVE{}", GREEN, RESET);
        assert_eq!(strip_ansi(&colored), "ALIVE");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_display_width_ignores_color() {
        let colored = format!("{}ALIVE{}", GREEN, RESET);
        assert_eq!(display_width(&colored), 5);
    }

    #[test]
    fn test_display_width_counts_wide_runes() {
        // the prompt glyph is single width, CJK runes are double
        assert_eq!(display_width("❯"), 1);
        assert_eq!(display_width("你好"), 4);
    }

    #[test]
    fn test_truncate_keeps_short_lines() {
        assert_eq!(truncate_display("short", 50), "short");
    }

    #[test]
    fn test_truncate_balances_escape_state() {
        let long = format!("{}{}{}", GREEN, "x".repeat(80), RESET);
        let cut = truncate_display(&long, 10);
        assert!(cut.ends_with("..."));
        // the color was dropped from the suffix and the state closed
        assert!(cut.contains(RESET));
        assert!(display_width(&cut) <= 10);
    }

    #[test]
    fn test_draw_box_suppresses_blank_lines() {
        let rendered = draw_box(
            "EXEC: bctor-a1 (PID: 7)",
            &["one".to_string(), "   ".to_string(), String::new()],
        );
        assert!(rendered.contains("one"));
        assert!(!rendered.contains("(no output)"));

        let empty = draw_box("EXEC: bctor-a1 (PID: 7)", &[]);
        assert!(empty.contains("(no output)"));
    }

    #[test]
    fn test_draw_box_rows_align() {
        let rendered = draw_box("T", &["a".to_string(), "你好".to_string()]);
        let widths: Vec<usize> = rendered
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| display_width(l.trim_start_matches('\r')))
            .collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }
}

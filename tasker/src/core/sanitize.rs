//! Log cleanup for terminal-style progress output.
//!
//! Solvers that redraw progress counters emit backspace characters. The
//! persisted log applies them the way a terminal would, so the file reads as
//! plain text.

use std::borrow::Cow;

const BACKSPACE: u8 = 0x08;

/// Apply backspaces in `input`, erasing the preceding character on the same line.
///
/// Input without backspaces is returned borrowed and byte-identical. A
/// backspace at the start of a line is dropped; it never erases a newline.
/// Multi-byte UTF-8 characters are erased whole.
pub fn apply_backspaces(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.contains(&BACKSPACE) {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut line_start = 0usize;
    for &byte in input {
        match byte {
            BACKSPACE => erase_last_char(&mut out, line_start),
            b'\n' => {
                out.push(byte);
                line_start = out.len();
            }
            _ => out.push(byte),
        }
    }
    Cow::Owned(out)
}

fn erase_last_char(out: &mut Vec<u8>, line_start: usize) {
    while out.len() > line_start {
        let Some(byte) = out.pop() else {
            return;
        };
        // Keep popping UTF-8 continuation bytes until the lead byte is gone.
        if byte & 0b1100_0000 != 0b1000_0000 {
            return;
        }
    }
}

/// Return the last `count` lines of `text`.
pub fn tail_lines(text: &str, count: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_input_is_returned_unchanged() {
        let input = b"step 1\nstep 2\n";
        let out = apply_backspaces(input);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.as_ref(), input);
    }

    #[test]
    fn backspace_erases_previous_char() {
        assert_eq!(apply_backspaces(b"ab\x08c").as_ref(), b"ac");
    }

    #[test]
    fn progress_counter_redraw_collapses() {
        let input = b"progress: 10%\x08\x08\x0820%\x08\x08\x0830%\ndone\n";
        assert_eq!(
            apply_backspaces(input).as_ref(),
            b"progress: 30%\ndone\n".as_slice()
        );
    }

    #[test]
    fn backspace_never_crosses_line_boundary() {
        assert_eq!(apply_backspaces(b"a\n\x08\x08b").as_ref(), b"a\nb");
    }

    #[test]
    fn multibyte_char_is_erased_whole() {
        let input = "x\u{e9}\u{8}y".as_bytes();
        assert_eq!(apply_backspaces(input).as_ref(), b"xy");
    }

    #[test]
    fn sanitizing_twice_matches_once() {
        let once = apply_backspaces(b"abc\x08\x08d\n").into_owned();
        let twice = apply_backspaces(&once).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = "1\n2\n3\n4\n";
        assert_eq!(tail_lines(text, 2), vec!["3", "4"]);
        assert_eq!(tail_lines(text, 10).len(), 4);
        assert!(tail_lines("", 3).is_empty());
    }
}

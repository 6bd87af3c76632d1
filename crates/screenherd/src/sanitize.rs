//! Remote output is drawn straight into the panel, so anything a remote shell
//! prints (colour codes, title escapes, bidi overrides) is filtered here first.

const MAX_DISPLAY_CHARS: usize = 512;

#[derive(Clone, Copy)]
enum Escape {
    // Saw ESC, waiting for the introducer.
    Start,
    // CSI: ends at a byte in '@'..='~'.
    Control,
    // OSC: ends at BEL or ESC '\'.
    Command { after_esc: bool },
    // DCS/SOS/PM/APC: ends at ESC '\'.
    String { after_esc: bool },
}

fn step(state: Escape, c: char) -> Option<Escape> {
    match state {
        Escape::Start => match c {
            '[' => Some(Escape::Control),
            ']' => Some(Escape::Command { after_esc: false }),
            'P' | 'X' | '^' | '_' => Some(Escape::String { after_esc: false }),
            _ => None,
        },
        Escape::Control => {
            if ('@'..='~').contains(&c) {
                None
            } else {
                Some(state)
            }
        }
        Escape::Command { after_esc } => match c {
            '\x07' => None,
            '\\' if after_esc => None,
            '\x1b' => Some(Escape::Command { after_esc: true }),
            _ => Some(Escape::Command { after_esc: false }),
        },
        Escape::String { after_esc } => match c {
            '\\' if after_esc => None,
            '\x1b' => Some(Escape::String { after_esc: true }),
            _ => Some(Escape::String { after_esc: false }),
        },
    }
}

/// Single display line: escape sequences and control characters removed,
/// tabs and line breaks collapsed to spaces, long text truncated.
pub fn display_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_DISPLAY_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = step(state, c);
            continue;
        }
        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\t' | '\n' | '\r' => {
                if !out.ends_with(' ') && !out.is_empty() {
                    out.push(' ');
                    kept += 1;
                }
            }
            c if c.is_control() || is_bidi_control(c) => continue,
            c => {
                out.push(c);
                kept += 1;
            }
        }
        if kept >= MAX_DISPLAY_CHARS {
            out.push_str(" ...");
            break;
        }
    }

    out.trim_end().to_string()
}

/// First non-empty line of remote output, sanitized; used for error messages.
pub fn first_line(input: &str) -> String {
    input
        .lines()
        .map(display_line)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::{display_line, first_line};

    #[test]
    fn strips_colour_and_title_sequences() {
        let input = "load \u{1b}[1;31mhigh\u{1b}[0m\u{1b}]0;host\u{7}!";
        assert_eq!(display_line(input), "load high!");
    }

    #[test]
    fn collapses_whitespace_controls() {
        assert_eq!(display_line("a\t\tb\r\nc\u{202e}d"), "a b cd");
    }

    #[test]
    fn first_line_skips_blank_lines() {
        assert_eq!(
            first_line("\n  \nPermission denied (publickey).\nmore"),
            "Permission denied (publickey)."
        );
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn truncates_runaway_output() {
        let long = "x".repeat(2000);
        let got = display_line(&long);
        assert!(got.ends_with(" ..."));
        assert!(got.len() < 600);
    }
}

//! ANSI escape code to HTML conversion
//!
//! Converts SGR color and style sequences into `<span class="ansiN">`
//! markup, one line at a time. Spans never cross a line boundary; style
//! still active at the end of a line is closed there and not carried over.

use std::collections::BTreeSet;
use std::fmt::Write;

const ESC: char = '\x1b';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Code as written, e.g. 36 or 91
    Basic(u16),
    /// Entry of the 256-color palette
    Indexed(u8),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Style {
    attributes: BTreeSet<u16>,
    foreground: Option<Color>,
    background: Option<Color>,
}

impl Style {
    fn is_plain(&self) -> bool {
        self.attributes.is_empty() && self.foreground.is_none() && self.background.is_none()
    }

    fn classes(&self) -> String {
        let mut classes: Vec<String> = self
            .attributes
            .iter()
            .map(|a| format!("ansi{}", a))
            .collect();

        match self.foreground {
            Some(Color::Basic(code)) => classes.push(format!("ansi{}", code)),
            Some(Color::Indexed(n)) => classes.push(format!("ansi38-{}", n)),
            None => {}
        }
        match self.background {
            Some(Color::Basic(code)) => classes.push(format!("ansi{}", code)),
            Some(Color::Indexed(n)) => classes.push(format!("ansi48-{}", n)),
            None => {}
        }

        classes.join(" ")
    }

    /// Applies the parameters of one SGR sequence
    fn apply(&mut self, params: &[u16]) {
        if params.is_empty() {
            *self = Style::default();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            let code = params[i];
            match code {
                0 => *self = Style::default(),
                1..=5 | 7..=9 => {
                    self.attributes.insert(code);
                }
                22 => {
                    self.attributes.remove(&1);
                    self.attributes.remove(&2);
                }
                23..=25 | 27..=29 => {
                    self.attributes.remove(&(code - 20));
                }
                30..=37 | 90..=97 => self.foreground = Some(Color::Basic(code)),
                39 => self.foreground = None,
                40..=47 | 100..=107 => self.background = Some(Color::Basic(code)),
                49 => self.background = None,
                38 | 48 => {
                    let (color, used) = extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        if code == 38 {
                            self.foreground = Some(color);
                        } else {
                            self.background = Some(color);
                        }
                    }
                    i += used;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Parses the tail of a `38;…`/`48;…` sequence
///
/// # Returns
/// The palette color, if one was given, and how many parameters were consumed
fn extended_color(rest: &[u16]) -> (Option<Color>, usize) {
    match rest {
        [5, n, ..] => (u8::try_from(*n).ok().map(Color::Indexed), 2),
        // Truecolor has no class; skip its components
        [2, _, _, _, ..] => (None, 4),
        _ => (None, rest.len()),
    }
}

/// Result of scanning an escape sequence
enum Sequence {
    /// A complete SGR sequence and its parameters
    Sgr(Vec<u16>),
    /// Anything else: emitted as literal text
    Other,
}

/// Scans an escape sequence starting at `start` (which holds ESC)
///
/// # Returns
/// The sequence kind and the index just past it. Unterminated or malformed
/// sequences end at the first character that does not belong to them.
fn scan_sequence(chars: &[char], start: usize) -> (Sequence, usize) {
    if chars.get(start + 1) != Some(&'[') {
        return (Sequence::Other, start + 1);
    }

    let mut i = start + 2;
    while let Some(&c) = chars.get(i) {
        match c {
            '0'..='9' | ';' => i += 1,
            // Private parameter and intermediate bytes never form SGR
            '\u{20}'..='\u{2f}' | '<'..='?' | ':' => i += 1,
            'm' => {
                let params: String = chars[start + 2..i].iter().collect();
                return match parse_params(&params) {
                    Some(params) => (Sequence::Sgr(params), i + 1),
                    None => (Sequence::Other, i + 1),
                };
            }
            '\u{40}'..='\u{7e}' => return (Sequence::Other, i + 1),
            _ => return (Sequence::Other, i),
        }
    }

    (Sequence::Other, i)
}

fn parse_params(params: &str) -> Option<Vec<u16>> {
    if params.is_empty() {
        return Some(Vec::new());
    }

    params
        .split(';')
        .map(|p| if p.is_empty() { Some(0) } else { p.parse::<u16>().ok() })
        .collect()
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        _ => out.push(c),
    }
}

/// Converts one line of terminal output to HTML
///
/// The line should not contain its newline.
pub fn to_html(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut style = Style::default();
    let mut span_open = false;
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == ESC {
            let (sequence, end) = scan_sequence(&chars, i);
            match sequence {
                Sequence::Sgr(params) => {
                    let mut next = style.clone();
                    next.apply(&params);
                    if next != style && span_open {
                        out.push_str("</span>");
                        span_open = false;
                    }
                    style = next;
                }
                Sequence::Other => {
                    for &c in &chars[i..end] {
                        write_text(&mut out, &style, &mut span_open, c);
                    }
                }
            }
            i = end;
            continue;
        }

        write_text(&mut out, &style, &mut span_open, chars[i]);
        i += 1;
    }

    if span_open {
        out.push_str("</span>");
    }

    out
}

fn write_text(out: &mut String, style: &Style, span_open: &mut bool, c: char) {
    if !*span_open && !style.is_plain() {
        let _ = write!(out, "<span class=\"{}\">", style.classes());
        *span_open = true;
    }
    push_escaped(out, c);
}

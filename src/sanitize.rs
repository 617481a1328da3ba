//! Text sanitization for thermal printer output
//!
//! Printers only render printable ASCII plus a few line-control characters,
//! so everything else is stripped before a message is logged or delivered.

/// Control characters that thermal printers handle
const SAFE_CONTROL_CHARS: [char; 3] = ['\n', '\r', '\t'];

/// Strip characters a printer cannot render from message text
///
/// Keeps printable ASCII (0x20–0x7E) plus line feed, carriage return, and
/// tab; everything else is removed. Idempotent.
pub fn sanitize_message(text: &str) -> String {
    text.chars().filter(|c| is_printable(*c)).collect()
}

/// Sanitize a name/identifier field
///
/// Stricter than message sanitization: dropped characters become spaces and
/// runs of whitespace are collapsed, so mangled names stay single-line.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_printable(c) { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_printable(c: char) -> bool {
    if SAFE_CONTROL_CHARS.contains(&c) {
        return true;
    }
    ('\x20'..='\x7e').contains(&c)
}

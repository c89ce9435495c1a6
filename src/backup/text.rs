//! Helpers that keep the emailed report readable.

use itertools::Itertools;

/// Line count above which output is shortened in the report and attached in full.
pub const LOG_LEN: usize = 20;
/// Width of section banners in the report.
pub const HEADER_WIDTH: usize = 80;
/// Upper bound for a single attachment.
pub const MAX_ATTACHMENT_BYTES: usize = 1024 * 1024;

pub const ELISION_MARKER: &str = "...";

pub fn line_count(text: &str) -> usize {
    text.lines().count()
}

/// Whether `text` is long enough that the report only shows a shortened copy.
pub fn exceeds(text: &str, max_lines: usize) -> bool {
    line_count(text) > max_lines
}

/// Keep the first and last `max_lines / 2` lines of `text`, joined by [`ELISION_MARKER`].
///
/// Text with at most `max_lines` lines is returned unchanged.
pub fn shorten(text: &str, max_lines: usize) -> String {
    let lines = text.lines().collect_vec();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    let half = max_lines / 2;
    lines[..half]
        .iter()
        .chain(std::iter::once(&ELISION_MARKER))
        .chain(lines[lines.len() - half..].iter())
        .join("\n")
}

/// Center `title` in a `#` banner of `width` characters.
pub fn header(title: &str, width: usize) -> String {
    let padding = width.saturating_sub(title.chars().count() + 2) / 2;
    let mut header = format!("{0} {1} {0}", "#".repeat(padding), title);
    if header.chars().count() < width {
        header.push('#');
    }
    header
}

/// Cap `text` at `max_bytes` by keeping its head and tail halves.
pub fn cap_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let half = max_bytes / 2;
    let head_end = floor_char_boundary(text, half);
    let tail_start = ceil_char_boundary(text, text.len() - half);
    format!(
        "{}\n{}\n{}",
        &text[..head_end],
        ELISION_MARKER,
        &text[tail_start..]
    )
}

/// Quote `value` for `sh` unless it only holds characters that need no quoting.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

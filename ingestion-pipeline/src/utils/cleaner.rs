//! Text normalization applied between extraction and splitting.
//!
//! Every stored byte passes through here, so NUL removal is not optional:
//! both the metadata store and the vector rows reject embedded NULs.

/// Normalize extracted text.
///
/// Strips HTML tags, drops NUL bytes, collapses whitespace runs inside
/// lines, trims line edges, and caps blank-line runs at one empty line
/// (two consecutive newlines).
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let without_nul: String = text.chars().filter(|c| *c != '\0').collect();
    let without_tags = strip_html_tags(&without_nul);
    let unified = without_tags.replace("\r\n", "\n").replace('\r', "\n").replace('\t', " ");

    let mut lines: Vec<String> = Vec::new();
    for line in unified.split('\n') {
        lines.push(collapse_spaces(line.trim()));
    }

    let mut cleaned = String::with_capacity(unified.len());
    let mut pending_blank = false;
    let mut wrote_any = false;
    for line in &lines {
        if line.is_empty() {
            if wrote_any {
                pending_blank = true;
            }
            continue;
        }
        if wrote_any {
            if pending_blank {
                cleaned.push_str("\n\n");
            } else {
                cleaned.push('\n');
            }
        }
        cleaned.push_str(line);
        wrote_any = true;
        pending_blank = false;
    }

    cleaned
}

/// Remove `<...>` spans the way a `<[^>]+>` pattern would: a tag needs at
/// least one character between the brackets, otherwise the `<` is literal.
fn strip_html_tags(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '<' {
            if let Some(close) = chars[i.saturating_add(1)..]
                .iter()
                .position(|c| *c == '>')
            {
                if close > 0 {
                    i = i.saturating_add(close).saturating_add(2);
                    continue;
                }
            }
        }
        if let Some(c) = chars.get(i) {
            output.push(*c);
        }
        i = i.saturating_add(1);
    }

    output
}

fn collapse_spaces(line: &str) -> String {
    let mut output = String::with_capacity(line.len());
    let mut last_was_space = false;
    for c in line.chars() {
        if c == ' ' {
            if !last_was_space {
                output.push(' ');
            }
            last_was_space = true;
        } else {
            output.push(c);
            last_was_space = false;
        }
    }
    output
}

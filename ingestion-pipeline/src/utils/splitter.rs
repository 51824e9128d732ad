//! Parent/child document splitting.
//!
//! A recursive character splitter drives both levels: parents are large
//! context units handed to the LLM, children are the small units that get
//! embedded. Separator lists are priority-ordered; the first separator
//! that occurs in the text wins and the remainder handle oversized pieces.

use uuid::Uuid;

/// Separators for the parent splitter, coarse to fine.
pub const PARENT_SEPARATORS: [&str; 5] = ["\n\n\n", "\n\n", "\n", "。", "."];

/// Separators for the child splitter, including CJK sentence punctuation.
pub const CHILD_SEPARATORS: [&str; 13] = [
    "\n\n", "\n", "。", ".", "！", "!", "？", "?", "；", ";", "，", ",", " ",
];

/// Parents shorter than this are noise (isolated headers, page furniture).
const MIN_PARENT_CHARS: usize = 200;

/// Children shorter than this embed poorly and are dropped.
const MIN_CHILD_CHARS: usize = 50;

/// A line is header-like when it is short and ends with `#`.
const HEADER_LINE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct ParentSplit {
    pub parent_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChildSplit {
    pub parent_id: String,
    pub chunk_id: u32,
    pub content: String,
}

/// Split cleaned text into parent blocks and their child chunks.
///
/// `chunk_id` increases across the whole document in emission order. When
/// the filters would discard everything (very short documents), the whole
/// text is kept as a single parent with a single child so small uploads
/// stay retrievable.
pub fn split_to_parent_child(
    text: &str,
    parent_chunk_size: usize,
    child_chunk_size: usize,
) -> (Vec<ParentSplit>, Vec<ChildSplit>) {
    let parent_overlap = parent_chunk_size / 5;
    let child_overlap = child_chunk_size / 4;

    let raw_parents = split_text(text, &PARENT_SEPARATORS, parent_chunk_size, parent_overlap);

    let mut parents = Vec::new();
    let mut children = Vec::new();
    let mut chunk_id: u32 = 0;

    for candidate in raw_parents {
        let content = candidate.trim();
        if content.chars().count() < MIN_PARENT_CHARS {
            continue;
        }
        if is_header_only(content) {
            continue;
        }

        let parent_id = Uuid::new_v4().to_string();

        for child in split_text(content, &CHILD_SEPARATORS, child_chunk_size, child_overlap) {
            let child_content = child.trim();
            if child_content.chars().count() < MIN_CHILD_CHARS {
                continue;
            }
            children.push(ChildSplit {
                parent_id: parent_id.clone(),
                chunk_id,
                content: child_content.to_string(),
            });
            chunk_id = chunk_id.saturating_add(1);
        }

        parents.push(ParentSplit {
            parent_id,
            content: content.to_string(),
        });
    }

    // Keep short documents retrievable: a single sentence must still reach
    // the index even though it is below both minimum lengths.
    let trimmed = text.trim();
    if children.is_empty() && !trimmed.is_empty() {
        let parent_id = Uuid::new_v4().to_string();
        parents = vec![ParentSplit {
            parent_id: parent_id.clone(),
            content: trimmed.to_string(),
        }];
        children = vec![ChildSplit {
            parent_id,
            chunk_id: 0,
            content: trimmed.to_string(),
        }];
    }

    (parents, children)
}

fn is_header_only(content: &str) -> bool {
    let lines: Vec<&str> = content
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    !lines.is_empty()
        && lines
            .iter()
            .all(|line| line.chars().count() < HEADER_LINE_MAX_CHARS && line.ends_with('#'))
}

/// Recursive character split: choose the first separator present in the
/// text, split on it (dropping the separator from the pieces), merge small
/// pieces back up to `chunk_size` with `chunk_overlap` carried between
/// chunks, and recurse into oversized pieces with the remaining separators.
pub fn split_text(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let (separator, rest) = choose_separator(text, separators);

    let splits: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(separator)
            .filter(|piece| !piece.is_empty())
            .map(str::to_owned)
            .collect()
    };

    let mut final_chunks = Vec::new();
    let mut good_splits: Vec<String> = Vec::new();

    for piece in splits {
        if piece.chars().count() < chunk_size {
            good_splits.push(piece);
        } else {
            if !good_splits.is_empty() {
                final_chunks.extend(merge_splits(
                    &good_splits,
                    separator,
                    chunk_size,
                    chunk_overlap,
                ));
                good_splits.clear();
            }
            if rest.is_empty() {
                final_chunks.push(piece);
            } else {
                final_chunks.extend(split_text(&piece, rest, chunk_size, chunk_overlap));
            }
        }
    }

    if !good_splits.is_empty() {
        final_chunks.extend(merge_splits(
            &good_splits,
            separator,
            chunk_size,
            chunk_overlap,
        ));
    }

    final_chunks
}

/// Pick the first separator that occurs in the text; the remainder are the
/// fallbacks for oversized pieces. No separator matches → split by chars.
fn choose_separator<'a>(text: &str, separators: &'a [&'a str]) -> (&'a str, &'a [&'a str]) {
    for (index, candidate) in separators.iter().enumerate() {
        if candidate.is_empty() {
            return ("", &[]);
        }
        if text.contains(candidate) {
            return (candidate, separators.get(index.saturating_add(1)..).unwrap_or(&[]));
        }
    }
    ("", &[])
}

fn merge_splits(
    splits: &[String],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let separator_len = separator.chars().count();
    let mut docs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut total = 0_usize;

    for piece in splits {
        let piece_len = piece.chars().count();
        let joiner = if current.is_empty() { 0 } else { separator_len };

        if total.saturating_add(piece_len).saturating_add(joiner) > chunk_size
            && !current.is_empty()
        {
            if let Some(doc) = join_pieces(&current, separator) {
                docs.push(doc);
            }
            // Slide the window: keep at most `chunk_overlap` characters of
            // trailing context for the next chunk.
            while total > chunk_overlap
                || (total
                    .saturating_add(piece_len)
                    .saturating_add(if current.is_empty() { 0 } else { separator_len })
                    > chunk_size
                    && total > 0)
            {
                let Some(first) = current.first() else {
                    break;
                };
                let first_len = first.chars().count();
                let sep = if current.len() > 1 { separator_len } else { 0 };
                total = total.saturating_sub(first_len.saturating_add(sep));
                current.remove(0);
            }
        }

        current.push(piece);
        let joiner = if current.len() > 1 { separator_len } else { 0 };
        total = total.saturating_add(piece_len).saturating_add(joiner);
    }

    if let Some(doc) = join_pieces(&current, separator) {
        docs.push(doc);
    }

    docs
}

fn join_pieces(pieces: &[&str], separator: &str) -> Option<String> {
    let joined = pieces.join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

//! Structure-preserving markdown chunker.
//!
//! Splits normalized markdown into chunks bounded by a character budget
//! while keeping each chunk understandable in isolation: every chunk after
//! the first is prefixed with the heading path that is still open at the
//! split point, and with the header + separator rows of any table the
//! split lands inside.
//!
//! The scan is line-by-line. Overlong lines are hard-split to a third of
//! the budget up front, which bounds the size of any constructed chunk and
//! rules out an infinite flush loop. Exceeding the budget at flush time is
//! a construction error, never a silently oversized chunk.

use thiserror::Error;

/// Default chunk budget in characters, context lines included.
pub const DEFAULT_MAX_CHARS: usize = 7680;

#[derive(Debug, Error)]
pub enum ChunkError {
    /// The carried context plus buffered lines exceeded the budget.
    #[error("chunk size exceeded: {size} > {limit}")]
    SizeExceeded { size: usize, limit: usize },
}

/// Options for [`split_markdown`].
#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub max_chars: usize,
    /// Item context prepended to every chunk (group-level disambiguator).
    pub context: Option<String>,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            context: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Heading {
    level: usize,
    text: String,
}

#[derive(Debug, Default, Clone)]
struct TableLines {
    header: String,
    separator: String,
}

fn is_table_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.contains('|')
}

fn make_context_lines(
    base: &Option<String>,
    headings: &[Heading],
    table: &TableLines,
) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(context) = base {
        lines.push(context.clone());
    }

    for heading in headings {
        lines.push(format!("{} {}", "#".repeat(heading.level), heading.text));
    }

    if !table.header.is_empty() && !table.separator.is_empty() {
        lines.push(table.header.clone());
        lines.push(table.separator.clone());
    }

    lines
}

/// Chunk size: line lengths plus one newline per line.
fn chunk_size(lines: &[String]) -> usize {
    lines.iter().map(|l| l.len()).sum::<usize>() + lines.len()
}

/// Split a single line into fixed-size pieces of at most `piece_size`
/// characters. Empty lines produce no pieces.
fn plain_chunk(line: &str, piece_size: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    chars
        .chunks(piece_size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Split markdown into bounded-size chunks, preserving heading and table
/// context across split points.
pub fn split_markdown(markdown: &str, opts: &SplitOptions) -> Result<Vec<String>, ChunkError> {
    let max_chars = opts.max_chars;

    // Hard-split overlong lines first so a single line can never exceed a
    // third of the budget.
    let mut lines: Vec<String> = Vec::new();
    for original in markdown.split('\n') {
        lines.extend(plain_chunk(original, max_chars / 3));
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    let mut headings: Vec<Heading> = Vec::new();
    // Heading stack as snapshotted at the last split point. `None` until
    // the first split; the first chunk carries no reconstructed context.
    let mut headings_at_split: Option<Vec<Heading>> = None;
    let mut table = TableLines::default();

    let future_chunk = |current: &[String],
                        candidate: Option<&String>,
                        headings_at_split: &Option<Vec<Heading>>,
                        table: &TableLines|
     -> Vec<String> {
        let mut out = Vec::new();
        if headings_at_split.is_some() || opts.context.is_some() {
            let empty = Vec::new();
            let snapshot = headings_at_split.as_deref().unwrap_or(&empty);
            out.extend(make_context_lines(&opts.context, snapshot, table));
        }
        out.extend_from_slice(current);
        if let Some(line) = candidate {
            out.push(line.clone());
        }
        out
    };

    let mut flush = |current: &mut Vec<String>,
                     headings_at_split: &Option<Vec<Heading>>,
                     table: &TableLines|
     -> Result<(), ChunkError> {
        let to_push = future_chunk(current, None, headings_at_split, table);
        let size = chunk_size(&to_push);
        if size > max_chars {
            return Err(ChunkError::SizeExceeded {
                size,
                limit: max_chars,
            });
        }
        chunks.push(to_push.join("\n"));
        current.clear();
        Ok(())
    };

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].clone();

        if let Some(rest) = line.strip_prefix('#') {
            let level = 1 + rest.chars().take_while(|c| *c == '#').count();
            let text = line[level..].trim().to_string();

            while let Some(top) = headings.last() {
                if top.level >= level {
                    headings.pop();
                } else {
                    break;
                }
            }
            headings.push(Heading { level, text });
        }

        if is_table_line(&line) {
            if table.header.is_empty() {
                table.header = line.clone();
                table.separator = lines.get(i + 1).cloned().unwrap_or_default();
                i += 1;
            }
        } else {
            table.header.clear();
            table.separator.clear();
        }

        let future = future_chunk(&current, Some(&line), &headings_at_split, &table);
        if chunk_size(&future) > max_chars && !current.is_empty() {
            flush(&mut current, &headings_at_split, &table)?;
            headings_at_split = Some(headings.clone());
        }

        current.push(line);
        i += 1;
    }

    if !current.is_empty() {
        flush(&mut current, &headings_at_split, &table)?;
    }

    Ok(chunks)
}

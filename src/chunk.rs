//! Section-boundary document chunker.
//!
//! Splits a rendered object document into [`Chunk`]s that respect a
//! configurable `max_tokens` limit. Splitting prefers `##` section
//! boundaries, falls back to paragraph boundaries (`\n\n`) within an
//! oversized section, then sentence boundaries, and only hard-splits as a
//! last resort. This keeps each chunk semantically coherent for embedding.
//!
//! Chunk ids are deterministic: `{prefix}_{object}` for an object that fits
//! a single chunk, `{prefix}_{object}_part_{n}` (1-indexed) otherwise. Every
//! chunk of an object carries the object's content hash and the full
//! sibling id list, which is what makes incremental change detection and
//! prefix deletion work downstream.

use crate::models::{Chunk, ChunkMetadata, ObjectRecord};

/// Approximate chars-per-token ratio used for budgeting.
const CHARS_PER_TOKEN: usize = 4;

/// Document type tag carried in chunk metadata.
pub const DOC_TYPE: &str = "salesforce_object";

/// Split `text` into pieces of at most `max_tokens` (approximate).
/// Guarantees at least one piece, even for empty text.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut buf = String::new();
    for section in split_sections(text) {
        let section = section.trim_end();
        if section.is_empty() {
            continue;
        }
        if section.len() > max_chars {
            flush(&mut pieces, &mut buf);
            for para in split_oversize(section, max_chars) {
                pack(&mut pieces, &mut buf, &para, max_chars);
            }
            continue;
        }
        pack(&mut pieces, &mut buf, section, max_chars);
    }
    flush(&mut pieces, &mut buf);

    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }
    pieces
}

/// Split on `##` headings, keeping each heading with its body. The preamble
/// before the first heading is its own section.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Break an oversized section into paragraphs; paragraphs still over budget
/// are split at sentence boundaries, then hard-split.
fn split_oversize(section: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    for para in section.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if para.len() <= max_chars {
            out.push(para.to_string());
            continue;
        }
        let mut sentence_buf = String::new();
        for sentence in split_sentences(para) {
            if !sentence_buf.is_empty() && sentence_buf.len() + sentence.len() + 1 > max_chars {
                out.push(std::mem::take(&mut sentence_buf));
            }
            if sentence.len() > max_chars {
                // Last resort: hard split on char boundaries.
                let mut rest = sentence;
                while rest.len() > max_chars {
                    let mut cut = max_chars;
                    while !rest.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    out.push(rest[..cut].to_string());
                    rest = &rest[cut..];
                }
                if !rest.is_empty() {
                    out.push(rest.to_string());
                }
                continue;
            }
            if !sentence_buf.is_empty() {
                sentence_buf.push(' ');
            }
            sentence_buf.push_str(sentence);
        }
        if !sentence_buf.is_empty() {
            out.push(sentence_buf);
        }
    }
    out
}

/// Sentence boundaries: `. ` and newlines. Keeps the terminator with the
/// sentence.
fn split_sentences(para: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = para.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let at_period = bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1] == b' ';
        let at_newline = bytes[i] == b'\n';
        if at_period || at_newline {
            let end = if at_period { i + 1 } else { i };
            let piece = para[start..end].trim();
            if !piece.is_empty() {
                sentences.push(piece);
            }
            start = i + 1;
        }
        i += 1;
    }
    let tail = para[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn pack(pieces: &mut Vec<String>, buf: &mut String, piece: &str, max_chars: usize) {
    if !buf.is_empty() && buf.len() + piece.len() + 2 > max_chars {
        flush(pieces, buf);
    }
    if !buf.is_empty() {
        buf.push_str("\n\n");
    }
    buf.push_str(piece);
}

fn flush(pieces: &mut Vec<String>, buf: &mut String) {
    if !buf.is_empty() {
        pieces.push(std::mem::take(buf));
    }
}

/// Chunk a sealed record's rendered document, assembling ids and metadata.
pub fn chunk_record(
    prefix: &str,
    record: &ObjectRecord,
    document: &str,
    max_tokens: usize,
) -> Vec<Chunk> {
    let pieces = split_text(document, max_tokens);
    let total_parts = pieces.len() as u32;

    let ids: Vec<String> = if total_parts == 1 {
        vec![format!("{}_{}", prefix, record.name)]
    } else {
        (1..=total_parts)
            .map(|n| format!("{}_{}_part_{}", prefix, record.name, n))
            .collect()
    };

    let record_count = record.stats.as_ref().map(|s| s.record_count).unwrap_or(0);
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            id: ids[i].clone(),
            text,
            metadata: ChunkMetadata {
                object_name: record.name.clone(),
                doc_type: DOC_TYPE.to_string(),
                content_hash: record.content_hash.clone(),
                part_index: i as u32 + 1,
                total_parts,
                sibling_ids: ids.clone(),
                fields_count: record.fields.len() as u64,
                record_count,
            },
        })
        .collect()
}

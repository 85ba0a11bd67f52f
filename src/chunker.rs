//! Token-budget aware text splitting.
//!
//! Text is normalized (whitespace runs collapse to one space), cut at
//! sentence terminators, and any piece that is still over budget is cut again
//! at commas and finally at whitespace. Pieces are then packed greedily into
//! chunks. Every piece keeps the delimiter it was cut at, so gluing the chunks
//! back together gives the normalized input (modulo whitespace at chunk
//! edges).

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::tokens::token_len;

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\s|。").expect("sentence pattern"));
static CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",|，").expect("clause pattern"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub text: String,
    pub token_count: usize,
    pub char_length: usize,
}

impl Chunk {
    fn new(text: String) -> Self {
        Self {
            token_count: token_len(&text),
            char_length: text.chars().count(),
            text,
        }
    }
}

/// A cut piece of text plus the delimiter that followed it.
#[derive(Debug)]
struct Piece {
    text: String,
    tail: String,
}

impl Piece {
    fn rendered(&self) -> String {
        format!("{}{}", self.text, self.tail)
    }
}

pub fn normalize(text: &str) -> String {
    SPACE.replace_all(text, " ").trim().to_string()
}

/// Split `text` into chunks of at most `token_budget` tokens.
///
/// A run with no sentence, comma or whitespace boundary that is longer than
/// the budget cannot be cut and comes back as its own oversized chunk.
pub fn split(text: &str, token_budget: usize) -> Vec<Chunk> {
    let content = normalize(text);
    if content.is_empty() {
        return Vec::new();
    }
    if token_len(&content) <= token_budget {
        return vec![Chunk::new(content)];
    }

    let mut pieces = Vec::new();
    for sentence in cut(
        Piece {
            text: content,
            tail: String::new(),
        },
        &SENTENCE,
    ) {
        refine(sentence, token_budget, 0, &mut pieces);
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        let rendered = piece.rendered();
        if rendered.trim().is_empty() {
            continue;
        }
        let candidate = format!("{current}{rendered}");
        if !current.trim().is_empty() && token_len(candidate.trim()) > token_budget {
            flush(&mut chunks, &current, token_budget);
            current = rendered;
        } else {
            current = candidate;
        }
    }
    flush(&mut chunks, &current, token_budget);
    chunks
}

fn flush(chunks: &mut Vec<Chunk>, current: &str, token_budget: usize) {
    let text = current.trim();
    if text.is_empty() {
        return;
    }
    let chunk = Chunk::new(text.to_string());
    if chunk.token_count > token_budget {
        tracing::warn!(
            tokens = chunk.token_count,
            budget = token_budget,
            "unsplittable run exceeds chunk budget"
        );
    }
    chunks.push(chunk);
}

/// Fallback delimiters, coarsest first.
fn fallback(level: usize) -> Option<&'static Regex> {
    match level {
        0 => Some(&*CLAUSE),
        1 => Some(&*SPACE),
        _ => None,
    }
}

fn refine(piece: Piece, token_budget: usize, level: usize, out: &mut Vec<Piece>) {
    if token_len(piece.rendered().trim()) <= token_budget {
        out.push(piece);
        return;
    }
    let Some(re) = fallback(level) else {
        out.push(piece);
        return;
    };
    for sub in cut(piece, re) {
        refine(sub, token_budget, level + 1, out);
    }
}

/// Cut at every match of `re`; each sub-piece keeps the matched delimiter as
/// its tail and the last one inherits the parent's tail.
fn cut(piece: Piece, re: &Regex) -> Vec<Piece> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in re.find_iter(&piece.text) {
        out.push(Piece {
            text: piece.text[last..m.start()].to_string(),
            tail: m.as_str().to_string(),
        });
        last = m.end();
    }
    out.push(Piece {
        text: piece.text[last..].to_string(),
        tail: piece.tail,
    });
    out
}

//! Splitting of embedding input.
//!
//! Normalized record text can be far longer than an embedding model
//! accepts. [`chunk_text`] cuts it into pieces of at most `max_chars`
//! characters, preferring sentence ends and then word boundaries. The
//! pieces are embedded separately and mean-pooled back into one vector per
//! record (see [`crate::embedding::embed_documents`]).

/// Split `text` into contiguous pieces of at most `max_chars` characters.
///
/// Always returns at least one piece. A text that already fits is returned
/// whole.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text.trim();

    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining);
                break;
            }
        };

        // Try to split at a sentence end, then at a space
        let window = &remaining[..limit];
        let split_at = window
            .rfind(". ")
            .map(|pos| pos + 1)
            .filter(|pos| *pos > limit / 2)
            .or_else(|| window.rfind(char::is_whitespace).filter(|pos| *pos > 0))
            .unwrap_or(limit);

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            chunks.push(piece);
        }
        remaining = remaining[split_at..].trim_start();
    }

    if chunks.is_empty() {
        chunks.push(text.trim());
    }
    chunks
}

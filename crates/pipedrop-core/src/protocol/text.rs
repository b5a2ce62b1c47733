//! Text messages split into indexed pieces.
//!
//! A text is announced with `stringMetadata { length }` and followed by
//! `string { chunk, index, total }` pieces. Pieces never split a UTF-8
//! character.

use std::collections::BTreeMap;

/// Split `text` into pieces of at most `max_bytes` bytes on character boundaries.
///
/// An empty text yields a single empty piece so the receiver still sees a
/// complete message.
#[must_use]
pub fn split_text(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut pieces = Vec::new();
    let mut rest = text;

    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);

    pieces
}

#[derive(Debug)]
struct PendingText {
    length: u64,
    total: Option<u32>,
    pieces: BTreeMap<u32, String>,
}

/// Reassembles text pieces for one peer.
#[derive(Debug, Default)]
pub struct TextAssembler {
    pending: Option<PendingText>,
}

impl TextAssembler {
    /// Create an idle assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new text of `length` bytes, discarding any unfinished one.
    pub fn begin(&mut self, length: u64) {
        if let Some(previous) = self.pending.take() {
            tracing::debug!(
                received = previous.pieces.len(),
                "Discarding unfinished text message"
            );
        }
        self.pending = Some(PendingText {
            length,
            total: None,
            pieces: BTreeMap::new(),
        });
    }

    /// Add a piece. Returns the full text once every piece has arrived.
    pub fn push(&mut self, chunk: String, index: u32, total: u32) -> Option<String> {
        let Some(pending) = self.pending.as_mut() else {
            tracing::warn!(index, "Text piece without preceding metadata, dropped");
            return None;
        };

        if total == 0 || index >= total {
            tracing::warn!(index, total, "Text piece index out of range, dropped");
            return None;
        }

        match pending.total {
            Some(known) if known != total => {
                tracing::warn!(known, total, "Text piece total changed mid-message, dropped");
                return None;
            }
            Some(_) => {}
            None => pending.total = Some(total),
        }

        pending.pieces.entry(index).or_insert(chunk);

        if pending.pieces.len() < total as usize {
            return None;
        }

        let pending = self.pending.take()?;
        let text: String = pending.pieces.into_values().collect();
        if text.len() as u64 == pending.length {
            Some(text)
        } else {
            tracing::warn!(
                expected = pending.length,
                actual = text.len(),
                "Reassembled text length mismatch, dropped"
            );
            None
        }
    }

    /// Whether a text is partially received.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "héllo wörld ✓✓✓";
        let pieces = split_text(text, 5);

        assert!(pieces.iter().all(|p| p.len() <= 5));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_split_empty_text() {
        assert_eq!(split_text("", 16), vec![""]);
    }

    #[test]
    fn test_assemble_out_of_order() {
        let text = "the quick brown fox jumps over the lazy dog";
        let pieces = split_text(text, 8);
        let total = pieces.len() as u32;

        let mut assembler = TextAssembler::new();
        assembler.begin(text.len() as u64);

        let mut result = None;
        for (index, piece) in pieces.iter().enumerate().rev() {
            result = assembler.push((*piece).to_string(), index as u32, total);
        }

        assert_eq!(result.as_deref(), Some(text));
        assert!(!assembler.is_pending());
    }

    #[test]
    fn test_duplicate_piece_does_not_complete_early() {
        let mut assembler = TextAssembler::new();
        assembler.begin(6);

        assert!(assembler.push("abc".into(), 0, 2).is_none());
        assert!(assembler.push("abc".into(), 0, 2).is_none());
        assert_eq!(assembler.push("def".into(), 1, 2).as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_piece_without_metadata_dropped() {
        let mut assembler = TextAssembler::new();
        assert!(assembler.push("abc".into(), 0, 1).is_none());
    }

    #[test]
    fn test_length_mismatch_dropped() {
        let mut assembler = TextAssembler::new();
        assembler.begin(10);
        assert!(assembler.push("abc".into(), 0, 1).is_none());
        assert!(!assembler.is_pending());
    }
}

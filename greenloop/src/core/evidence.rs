//! Bounded evidence payload for a repair request.

use serde::{Deserialize, Serialize};

/// Evidence from one check, capped at the configured byte budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub check: String,
    pub text: String,
    /// Bytes dropped from the end of the original text.
    pub truncated_bytes: usize,
}

/// Ordered `check -> truncated text` mapping built fresh for every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub entries: Vec<EvidenceEntry>,
}

impl EvidenceBundle {
    pub fn push(&mut self, check: &str, text: &str, limit_bytes: usize) {
        let (text, truncated_bytes) = truncate_to_budget(text, limit_bytes);
        self.entries.push(EvidenceEntry {
            check: check.to_string(),
            text,
            truncated_bytes,
        });
    }

    pub fn get(&self, check: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.check == check)
            .map(|e| e.text.as_str())
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.text.len()).sum()
    }
}

/// Keep at most `limit` bytes of `text`, cutting on a char boundary.
///
/// Returns the kept prefix and the number of bytes dropped.
pub fn truncate_to_budget(text: &str, limit: usize) -> (String, usize) {
    if text.len() <= limit {
        return (text.to_string(), 0);
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (text[..cut].to_string(), text.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_to_budget("abc", 10), ("abc".to_string(), 0));
    }

    #[test]
    fn long_text_is_cut_to_limit() {
        let text = "x".repeat(12_500);
        let (kept, dropped) = truncate_to_budget(&text, 12_000);
        assert_eq!(kept.len(), 12_000);
        assert_eq!(dropped, 500);
    }

    #[test]
    fn cut_respects_char_boundaries() {
        // 'é' is two bytes; a limit of 3 lands inside the second one.
        let (kept, dropped) = truncate_to_budget("éé", 3);
        assert_eq!(kept, "é");
        assert_eq!(dropped, 2);
    }

    #[test]
    fn bundle_entries_are_capped_and_ordered() {
        let mut bundle = EvidenceBundle::default();
        bundle.push("style", &"s".repeat(50), 10);
        bundle.push("syntax_lint", "short", 10);
        assert_eq!(bundle.entries[0].check, "style");
        assert_eq!(bundle.get("style").map(str::len), Some(10));
        assert_eq!(bundle.entries[0].truncated_bytes, 40);
        assert_eq!(bundle.get("syntax_lint"), Some("short"));
        assert_eq!(bundle.total_bytes(), 15);
    }
}

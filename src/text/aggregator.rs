use tracing::debug;

/// State of the running text after one delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUpdate {
    pub turn: u64,
    pub content: String,
    pub is_complete: bool,
}

/// Accumulates streamed text into one running string per open turn
///
/// Backends send either true deltas ("Hel", "lo") or growing snapshots
/// ("H", "He", "Hello"). A piece strictly longer than everything accumulated
/// so far and starting with it replaces it; anything else is appended.
///
/// The two cannot always be told apart: a true delta that happens to begin
/// with the whole running text and extend it ("ha" then "haha") is read as a
/// snapshot. A repeated piece of equal length ("ha" then "ha") is a delta.
#[derive(Debug, Default)]
pub struct TextStreamAggregator {
    turn: Option<u64>,
    content: String,
    deltas: usize,
}

impl TextStreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: u64, piece: &str) -> TextUpdate {
        if self.turn != Some(turn) {
            if self.turn.is_some() {
                debug!("Text for turn {} arrived, dropping stale turn {:?}", turn, self.turn);
            }
            self.reset();
            self.turn = Some(turn);
        }

        if !self.content.is_empty()
            && piece.len() > self.content.len()
            && piece.starts_with(self.content.as_str())
        {
            self.content.clear();
        }
        self.content.push_str(piece);
        self.deltas += 1;

        TextUpdate {
            turn,
            content: self.content.clone(),
            is_complete: false,
        }
    }

    /// Finish the open turn, returning its full text. `None` if no text arrived.
    pub fn complete(&mut self) -> Option<TextUpdate> {
        let turn = self.turn?;
        let content = std::mem::take(&mut self.content);
        self.reset();
        Some(TextUpdate {
            turn,
            content,
            is_complete: true,
        })
    }

    /// Drop the open turn's text. Returns how many deltas were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.deltas;
        self.reset();
        dropped
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.turn.is_none()
    }

    fn reset(&mut self) {
        self.turn = None;
        self.content = String::new();
        self.deltas = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_replace() {
        let mut agg = TextStreamAggregator::new();
        assert_eq!(agg.push(1, "H").content, "H");
        assert_eq!(agg.push(1, "He").content, "He");
        assert_eq!(agg.push(1, "Hello there!").content, "Hello there!");

        let done = agg.complete().unwrap();
        assert!(done.is_complete);
        assert_eq!(done.content, "Hello there!");
        assert!(agg.is_empty());
    }

    #[test]
    fn test_deltas_append() {
        let mut agg = TextStreamAggregator::new();
        agg.push(2, "¿Cómo ");
        agg.push(2, "estás");
        let update = agg.push(2, "?");
        assert_eq!(update.content, "¿Cómo estás?");
        assert!(!update.is_complete);
    }

    #[test]
    fn test_repeated_delta_is_appended() {
        let mut agg = TextStreamAggregator::new();
        agg.push(4, "ha");
        assert_eq!(agg.push(4, "ha").content, "haha");
        assert_eq!(agg.push(4, "!").content, "haha!");
        assert_eq!(agg.complete().unwrap().content, "haha!");
    }

    #[test]
    fn test_complete_without_text() {
        let mut agg = TextStreamAggregator::new();
        assert!(agg.complete().is_none());
    }

    #[test]
    fn test_discard_clears_turn() {
        let mut agg = TextStreamAggregator::new();
        agg.push(3, "half a sent");
        assert_eq!(agg.discard(), 1);
        assert!(agg.complete().is_none());
        assert_eq!(agg.content(), "");
    }

    #[test]
    fn test_new_turn_resets_running_text() {
        let mut agg = TextStreamAggregator::new();
        agg.push(1, "old");
        let update = agg.push(2, "new");
        assert_eq!(update.content, "new");
        assert_eq!(update.turn, 2);
    }
}

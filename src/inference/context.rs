//! Conversation context
//!
//! The turns sent to the engine with each prompt, bounded by the tier's
//! history limit.

use crate::types::{Role, Turn};

/// Ordered user/assistant turns of one chat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from previously saved turns
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Record the assistant's reply to the pending user turn
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// Drop a trailing user turn that never got a reply
    pub fn discard_pending(&mut self) -> Option<Turn> {
        match self.turns.last() {
            Some(turn) if turn.role == Role::User => self.turns.pop(),
            _ => None,
        }
    }

    /// Keep at most `pairs` completed user/assistant pairs, oldest dropped first
    ///
    /// A trailing user turn waiting for its reply is not counted and is
    /// always kept. Returns the number of turns removed.
    pub fn trim_history(&mut self, pairs: usize) -> usize {
        let pending = matches!(self.turns.last(), Some(t) if t.role == Role::User) as usize;
        let history = self.turns.len() - pending;
        let keep = pairs.saturating_mul(2);
        if history <= keep {
            return 0;
        }

        let mut evict = history - keep;
        // Never start the window with a reply whose question was evicted
        while evict < history && self.turns[evict].role == Role::Assistant {
            evict += 1;
        }
        self.turns.drain(..evict);
        evict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(n: usize) -> ConversationContext {
        let mut ctx = ConversationContext::new();
        for i in 1..=n {
            ctx.push(Turn::user(format!("q{i}")));
            ctx.push_assistant(format!("a{i}"));
        }
        ctx
    }

    fn contents(ctx: &ConversationContext) -> Vec<&str> {
        ctx.turns().iter().map(|t| t.content.as_str()).collect()
    }

    #[test]
    fn test_fifo_trim_keeps_newest_pairs_in_order() {
        let mut ctx = pairs(5);
        ctx.push(Turn::user("q6"));

        let removed = ctx.trim_history(3);

        assert_eq!(removed, 4);
        assert_eq!(contents(&ctx), ["q3", "a3", "q4", "a4", "q5", "a5", "q6"]);
    }

    #[test]
    fn test_trim_under_limit_is_noop() {
        let mut ctx = pairs(2);
        ctx.push(Turn::user("q3"));
        assert_eq!(ctx.trim_history(3), 0);
        assert_eq!(ctx.len(), 5);
    }

    #[test]
    fn test_trim_to_zero_keeps_pending_turn() {
        let mut ctx = pairs(2);
        ctx.push(Turn::user("q3"));
        ctx.trim_history(0);
        assert_eq!(contents(&ctx), ["q3"]);
    }

    #[test]
    fn test_trim_skips_orphaned_reply() {
        // q1 was answered twice after a regenerate: the window must not open on a reply
        let mut ctx = ConversationContext::from_turns(vec![
            Turn::user("q1"),
            Turn::assistant("a1"),
            Turn::assistant("a1-retry"),
            Turn::user("q2"),
            Turn::assistant("a2"),
        ]);
        ctx.trim_history(1);
        assert_eq!(contents(&ctx), ["q2", "a2"]);
    }

    #[test]
    fn test_discard_pending() {
        let mut ctx = pairs(1);
        assert!(ctx.discard_pending().is_none());
        ctx.push(Turn::user("q2"));
        assert_eq!(ctx.discard_pending().unwrap().content, "q2");
        assert_eq!(ctx.len(), 2);
    }
}

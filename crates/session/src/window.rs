//! Conversation window: the bounded, ordered history of one session.
//!
//! Turns strictly alternate user/assistant starting with a user turn.
//! Truncation drops whole user/assistant pairs from the front, so the
//! alternation invariant survives it; older context is discarded, not
//! summarized.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use switchboard_core::error::TurnOrderError;
use switchboard_core::message::{Role, Turn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationWindow {
    turns: VecDeque<Turn>,

    /// Sequence number for the next appended turn. Survives truncation.
    next_sequence: u64,
}

impl ConversationWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// The role the next appended turn must have.
    pub fn expected_role(&self) -> Role {
        match self.turns.back() {
            Some(last) => last.role.next(),
            None => Role::User,
        }
    }

    /// Append a turn, assigning its sequence number.
    ///
    /// Fails without modifying the window when `role` would break
    /// alternation.
    pub fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Turn, TurnOrderError> {
        let expected = self.expected_role();
        if role != expected {
            return Err(TurnOrderError {
                expected,
                found: role,
            });
        }

        let turn = Turn::new(role, content, self.next_sequence);
        self.next_sequence += 1;
        self.turns.push_back(turn.clone());
        Ok(turn)
    }

    /// All turns, oldest first.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// The snapshot without a trailing unanswered user turn.
    ///
    /// This is the history handed to inference: it is empty or ends with
    /// an assistant turn.
    pub fn settled(&self) -> Vec<Turn> {
        let end = match self.turns.back() {
            Some(last) if last.role == Role::User => self.turns.len() - 1,
            _ => self.turns.len(),
        };
        self.turns.iter().take(end).cloned().collect()
    }

    /// Remove a trailing user turn that never got an answer.
    pub fn discard_unanswered(&mut self) -> Option<Turn> {
        match self.turns.back() {
            Some(last) if last.role == Role::User => self.turns.pop_back(),
            _ => None,
        }
    }

    /// Drop the oldest complete user/assistant pairs until at most
    /// `max_turns` remain. Returns the number of turns removed.
    ///
    /// A lone trailing user turn (in-flight query) is never removed, so the
    /// window may stay one over budget when `max_turns` is smaller than
    /// that.
    pub fn truncate_to_budget(&mut self, max_turns: usize) -> usize {
        let mut removed = 0;
        while self.turns.len() > max_turns && self.front_is_complete_pair() {
            self.turns.pop_front();
            self.turns.pop_front();
            removed += 2;
        }
        removed
    }

    fn front_is_complete_pair(&self) -> bool {
        matches!(
            (self.turns.front(), self.turns.get(1)),
            (Some(first), Some(second))
                if first.role == Role::User && second.role == Role::Assistant
        )
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Rough token estimate for the whole window.
    pub fn estimated_tokens(&self) -> usize {
        self.turns.iter().map(Turn::estimated_tokens).sum()
    }
}

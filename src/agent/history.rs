//! Bounded conversation history.

use crate::llm::{ChatMessage, Role};

/// Conversation history for one conversation.
///
/// The cap is applied with [`enforce_cap`](Self::enforce_cap) after each
/// completed turn, so a single turn may briefly exceed it while tool results
/// are being collected.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(2),
        }
    }

    pub fn add(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Drop the oldest messages until the cap holds.
    ///
    /// The history must open on a user message, so the cut lands on the
    /// first user message inside the window. When the newest turn alone is
    /// over the cap, that turn is compacted instead of cut.
    pub fn enforce_cap(&mut self) -> usize {
        let before = self.messages.len();
        if before > self.max_messages {
            let window_start = before - self.max_messages;
            match self.messages[window_start..]
                .iter()
                .position(|m| m.role == Role::User)
            {
                Some(offset) => {
                    self.messages.drain(..window_start + offset);
                }
                None => self.compact_last_turn(),
            }
        }
        self.drop_leading_non_user();
        before - self.messages.len()
    }

    /// Keep only the newest turn, dropping its oldest tool rounds (an
    /// assistant call plus its results) until it fits.
    fn compact_last_turn(&mut self) {
        let Some(user) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            self.messages.clear();
            return;
        };
        let mut turn = self.messages.split_off(user).into_iter();
        self.messages.clear();
        let Some(request) = turn.next() else {
            return;
        };

        let mut rounds: Vec<Vec<ChatMessage>> = Vec::new();
        for message in turn {
            match rounds.last_mut() {
                Some(round) if message.role == Role::Tool => round.push(message),
                _ => rounds.push(vec![message]),
            }
        }

        let mut len = 1 + rounds.iter().map(Vec::len).sum::<usize>();
        let mut skip = 0;
        while len > self.max_messages && skip + 1 < rounds.len() {
            len -= rounds[skip].len();
            skip += 1;
        }

        self.messages.push(request);
        self.messages.extend(rounds.into_iter().skip(skip).flatten());

        if self.messages.len() > self.max_messages {
            // A single round is over the cap; keep the final answer if there is one.
            let reply = self
                .messages
                .pop()
                .filter(|m| m.role == Role::Assistant && m.tool_calls.is_empty());
            self.messages.truncate(1);
            self.messages.extend(reply);
        }
    }

    /// Keep roughly the last `n` messages, starting on a user message.
    ///
    /// If the window holds no user message the cut moves back to the most
    /// recent one, so the current request always survives.
    pub fn retain_recent(&mut self, n: usize) {
        let window_start = self.messages.len().saturating_sub(n);
        let start = self.messages[window_start..]
            .iter()
            .position(|m| m.role == Role::User)
            .map(|i| window_start + i)
            .or_else(|| {
                self.messages[..window_start]
                    .iter()
                    .rposition(|m| m.role == Role::User)
            })
            .unwrap_or(self.messages.len());
        self.messages.drain(..start);
    }

    /// Remove the most recent user message and everything after it.
    pub fn rollback_last_turn(&mut self) {
        match self.messages.iter().rposition(|m| m.role == Role::User) {
            Some(index) => self.messages.truncate(index),
            None => self.messages.clear(),
        }
    }

    /// Remove assistant turns left without content or tool calls.
    pub fn sanitize(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_empty_assistant());
        before - self.messages.len()
    }

    fn drop_leading_non_user(&mut self) {
        let first_user = self
            .messages
            .iter()
            .position(|m| m.role == Role::User)
            .unwrap_or(self.messages.len());
        self.messages.drain(..first_user);
    }
}

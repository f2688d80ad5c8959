//! The per-process message queue.
//!
//! Messages arrive through the signal queue and are linked here, already
//! copied onto the owning process's heap. The cursor implements selective
//! receive: a receive peeks at the cursor, advances past non-matching
//! messages, and removes the matched one, rewinding the cursor to the head.
//! The cursor survives garbage collection; the collector only rewrites the
//! message terms in place.

use std::collections::VecDeque;

use crate::process::ProcessId;
use crate::term::OpaqueTerm;

#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub sender: ProcessId,
    pub term: OpaqueTerm,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    messages: VecDeque<Message>,
    cursor: usize,
}

impl Mailbox {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// The next candidate for selective receive, if any.
    pub fn peek(&self) -> Option<&Message> {
        self.messages.get(self.cursor)
    }

    /// Skips the current candidate; the next `peek` sees its successor.
    pub fn advance(&mut self) {
        if self.cursor < self.messages.len() {
            self.cursor += 1;
        }
    }

    /// Removes and returns the current candidate, rewinding the cursor for
    /// the next receive.
    pub fn take(&mut self) -> Option<Message> {
        let taken = self.messages.remove(self.cursor);
        self.cursor = 0;
        taken
    }

    /// Rewinds the cursor without removing anything (a receive that gave up).
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: i64) -> Message {
        Message { sender: ProcessId::new(1, 0), term: OpaqueTerm::make_small(i) }
    }

    #[test]
    fn cursor_walks_and_rewinds() {
        let mut mb = Mailbox::default();
        mb.push(msg(1));
        mb.push(msg(2));
        mb.push(msg(3));

        assert_eq!(mb.peek().unwrap().term.small_value(), 1);
        mb.advance();
        assert_eq!(mb.peek().unwrap().term.small_value(), 2);
        mb.advance();

        // Take the third; earlier messages stay queued, cursor rewinds
        let taken = mb.take().unwrap();
        assert_eq!(taken.term.small_value(), 3);
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.peek().unwrap().term.small_value(), 1);
    }

    #[test]
    fn advancing_past_the_end_is_a_miss() {
        let mut mb = Mailbox::default();
        mb.push(msg(1));
        mb.advance();
        assert!(mb.peek().is_none());
        // A new arrival lands after the cursor and becomes visible
        mb.push(msg(2));
        assert_eq!(mb.peek().unwrap().term.small_value(), 2);
    }
}

//! Ordered polling set.
//!
//! Slot 0 always holds the listener; each live connection follows in the
//! order it was added. The event loop walks this list once per pass, so it
//! defines servicing order. Entries are only added or removed between
//! passes.

use mio::Token;

/// Token the listening socket is registered under.
pub const LISTENER: Token = Token(usize::MAX);

/// Token used to interrupt a wait from another thread.
pub const WAKER: Token = Token(usize::MAX - 1);

/// Error returned when a removal targets the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerRemoval;

#[derive(Debug)]
pub struct DescriptorSet {
    tokens: Vec<Token>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self {
            tokens: vec![LISTENER],
        }
    }

    pub fn push(&mut self, token: Token) {
        debug_assert!(token != LISTENER && token != WAKER, "reserved token");
        self.tokens.push(token);
    }

    /// Remove a connection entry, keeping the order of the rest.
    ///
    /// Returns `Ok(false)` if the token was not present.
    pub fn remove(&mut self, token: Token) -> Result<bool, ListenerRemoval> {
        if token == LISTENER {
            return Err(ListenerRemoval);
        }
        match self.tokens[1..].iter().position(|&t| t == token) {
            Some(pos) => {
                self.tokens.remove(pos + 1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of the current order, listener first.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Number of client entries.
    pub fn connections(&self) -> usize {
        self.tokens.len() - 1
    }
}

impl Default for DescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_stays_first() {
        let mut set = DescriptorSet::new();
        set.push(Token(3));
        set.push(Token(0));
        set.push(Token(7));

        assert_eq!(set.tokens(), &[LISTENER, Token(3), Token(0), Token(7)]);
        assert_eq!(set.connections(), 3);

        assert_eq!(set.remove(Token(0)), Ok(true));
        assert_eq!(set.tokens(), &[LISTENER, Token(3), Token(7)]);

        assert_eq!(set.remove(Token(0)), Ok(false));
        assert_eq!(set.connections(), 2);
    }

    #[test]
    fn test_listener_cannot_be_removed() {
        let mut set = DescriptorSet::new();
        set.push(Token(1));

        assert_eq!(set.remove(LISTENER), Err(ListenerRemoval));
        assert_eq!(set.tokens(), &[LISTENER, Token(1)]);
    }
}

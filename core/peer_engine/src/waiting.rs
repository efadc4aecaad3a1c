//! Outbound commands waiting for a link
//!
//! Commands addressed to an identity without a tagged connection are parked
//! here in submission order. The list for an identity is created by the
//! first parked command and consumed exactly once, either by the flush that
//! follows tagging or by abandoning the connection attempt.

use std::collections::HashMap;

use crate::package::Package;

/// A command parked until its destination is linked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingCommand {
    pub package: Package,
    pub raw_data: Option<Vec<u8>>,
    pub unreliable: bool,
}

/// Per-identity FIFO lists of waiting commands
#[derive(Debug, Default)]
pub struct WaitingCommands {
    lists: HashMap<String, Vec<WaitingCommand>>,
}

impl WaitingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a command
    ///
    /// Returns `true` when this call created the identity's list, i.e. no
    /// connection attempt is pending for it yet.
    pub fn push(&mut self, peer_id: &str, command: WaitingCommand) -> bool {
        match self.lists.get_mut(peer_id) {
            Some(list) => {
                list.push(command);
                false
            }
            None => {
                self.lists.insert(peer_id.to_string(), vec![command]);
                true
            }
        }
    }

    /// Remove and return an identity's list in submission order
    pub fn take(&mut self, peer_id: &str) -> Vec<WaitingCommand> {
        self.lists.remove(peer_id).unwrap_or_default()
    }

    /// Number of commands parked for an identity
    pub fn count(&self, peer_id: &str) -> usize {
        self.lists.get(peer_id).map_or(0, Vec::len)
    }

    pub fn is_pending(&self, peer_id: &str) -> bool {
        self.lists.contains_key(peer_id)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: u64) -> WaitingCommand {
        WaitingCommand {
            package: Package::empty(id),
            raw_data: None,
            unreliable: false,
        }
    }

    #[test]
    fn test_first_push_creates_list() {
        let mut waiting = WaitingCommands::new();

        assert!(waiting.push("bob", command(1)));
        assert!(!waiting.push("bob", command(2)));
        assert!(waiting.push("carol", command(3)));

        assert_eq!(waiting.count("bob"), 2);
        assert_eq!(waiting.count("carol"), 1);
    }

    #[test]
    fn test_take_preserves_order_and_removes() {
        let mut waiting = WaitingCommands::new();
        for id in 1..=5 {
            waiting.push("bob", command(id));
        }

        let ids: Vec<u64> = waiting.take("bob").iter().map(|c| c.package.id).collect();

        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(!waiting.is_pending("bob"));
        assert!(waiting.take("bob").is_empty());
    }

    #[test]
    fn test_push_after_take_starts_new_attempt() {
        let mut waiting = WaitingCommands::new();
        waiting.push("bob", command(1));
        waiting.take("bob");

        assert!(waiting.push("bob", command(2)));
    }
}

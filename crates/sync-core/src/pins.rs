use std::cmp::Reverse;

use crate::types::PinnedMessage;

/// Pinned messages, most recent pin first.
///
/// The set is never edited optimistically; it only changes through [`PinSet::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: Vec<PinnedMessage>,
}

impl PinSet {
    pub fn pins(&self) -> &[PinnedMessage] {
        &self.pins
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Whether the message with the given server ID is pinned.
    pub fn is_pinned(&self, message_ref: u64) -> bool {
        self.pins.iter().any(|pin| pin.message_ref == message_ref)
    }

    /// Pin ID for a pinned message, used to build unpin requests.
    pub fn pin_id_for(&self, message_ref: u64) -> Option<u64> {
        self.pins
            .iter()
            .find(|pin| pin.message_ref == message_ref)
            .map(|pin| pin.pin_id)
    }

    /// Replace the set with the server's list. Returns `true` when it changed.
    pub fn merge(&mut self, mut server_pins: Vec<PinnedMessage>) -> bool {
        server_pins.sort_by_key(|pin| (Reverse(pin.pinned_at_ms), Reverse(pin.pin_id)));
        server_pins.dedup_by_key(|pin| pin.pin_id);

        if server_pins == self.pins {
            return false;
        }
        self.pins = server_pins;
        true
    }
}

//! Local activity throttling and remote typing expiry.

use std::collections::BTreeMap;

use crate::types::{ActivityKind, RemoteActivity, TypingEntry};

/// Decides whether a local activity signal goes out on the wire.
#[derive(Debug, Clone)]
pub struct ActivityThrottle {
    window_ms: u64,
    last: Option<(ActivityKind, u64)>,
}

impl ActivityThrottle {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last: None,
        }
    }

    /// Returns `true` and records the publish when `kind` should be sent now.
    ///
    /// Same-kind calls inside the window collapse; a kind change always passes.
    pub fn should_publish(&mut self, kind: ActivityKind, now_ms: u64) -> bool {
        let allowed = match self.last {
            None => true,
            Some((last_kind, _)) if last_kind != kind => true,
            Some((_, at)) => now_ms.saturating_sub(at) >= self.window_ms,
        };
        if allowed {
            self.last = Some((kind, now_ms));
        }
        allowed
    }

    /// Last kind published, if any.
    pub fn last_kind(&self) -> Option<ActivityKind> {
        self.last.map(|(kind, _)| kind)
    }

    /// Forget the last publish so the next call always goes out.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Other participants' activity with locally computed expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTyping {
    ttl_ms: u64,
    entries: BTreeMap<String, TypingEntry>,
}

impl RemoteTyping {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: BTreeMap::new(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, TypingEntry> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the view with the server's latest report.
    ///
    /// The local user's own entry is skipped. Returns `true` when the view changed.
    pub fn apply_snapshot(&mut self, snapshot: Vec<RemoteActivity>, local_user_id: &str) -> bool {
        let next: BTreeMap<String, TypingEntry> = snapshot
            .into_iter()
            .filter(|activity| activity.user_id != local_user_id)
            .map(|activity| {
                let entry = TypingEntry {
                    display_name: activity.display_name,
                    kind: activity.kind,
                    expires_at_ms: activity.started_at_ms.saturating_add(self.ttl_ms),
                };
                (activity.user_id, entry)
            })
            .collect();

        let changed = next != self.entries;
        self.entries = next;
        changed
    }

    /// Drop every entry with `expires_at_ms <= now_ms`. Returns the number removed.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u64 = 1_731_000_000_000;

    fn activity(user_id: &str, started_at_ms: u64) -> RemoteActivity {
        RemoteActivity {
            user_id: user_id.into(),
            display_name: user_id.to_uppercase(),
            kind: ActivityKind::Typing,
            started_at_ms,
        }
    }

    #[test]
    fn collapses_same_kind_inside_window() {
        let mut throttle = ActivityThrottle::new(3_000);
        assert!(throttle.should_publish(ActivityKind::Typing, 0));
        assert!(!throttle.should_publish(ActivityKind::Typing, 1_000));
        assert!(!throttle.should_publish(ActivityKind::Typing, 2_999));
        assert!(throttle.should_publish(ActivityKind::Typing, 3_000));
    }

    #[test]
    fn kind_change_bypasses_window() {
        let mut throttle = ActivityThrottle::new(3_000);
        assert!(throttle.should_publish(ActivityKind::Typing, 0));
        assert!(throttle.should_publish(ActivityKind::UploadingImage, 10));
        assert_eq!(throttle.last_kind(), Some(ActivityKind::UploadingImage));
        assert!(throttle.should_publish(ActivityKind::Typing, 20));
    }

    #[test]
    fn reset_reopens_the_window() {
        let mut throttle = ActivityThrottle::new(3_000);
        assert!(throttle.should_publish(ActivityKind::Typing, 0));
        throttle.reset();
        assert_eq!(throttle.last_kind(), None);
        assert!(throttle.should_publish(ActivityKind::Typing, 1));
    }

    #[test]
    fn prunes_entry_after_ttl_without_new_snapshot() {
        let mut typing = RemoteTyping::new(5_000);
        typing.apply_snapshot(vec![activity("bob", T)], "alice");

        assert_eq!(typing.prune(T + 4_000), 0);
        assert!(typing.entries().contains_key("bob"));

        assert_eq!(typing.prune(T + 6_000), 1);
        assert!(typing.is_empty());
    }

    #[test]
    fn prune_boundary_is_inclusive_and_selective() {
        let mut typing = RemoteTyping::new(5_000);
        typing.apply_snapshot(
            vec![activity("bob", T), activity("carol", T + 1_000)],
            "alice",
        );

        assert_eq!(typing.prune(T + 5_000), 1);
        assert!(!typing.entries().contains_key("bob"));
        assert_eq!(
            typing.entries().get("carol").map(|e| e.expires_at_ms),
            Some(T + 6_000)
        );
    }

    #[test]
    fn snapshot_replaces_view_and_skips_local_user() {
        let mut typing = RemoteTyping::new(5_000);
        assert!(typing.apply_snapshot(
            vec![activity("bob", T), activity("alice", T)],
            "alice"
        ));
        assert_eq!(typing.entries().len(), 1);

        assert!(!typing.apply_snapshot(vec![activity("bob", T)], "alice"));
        assert!(typing.apply_snapshot(Vec::new(), "alice"));
        assert!(typing.is_empty());
    }
}

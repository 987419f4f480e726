//! Dedup for the legacy text-file demo path (`spec.md` §6 `data` message).
//!
//! Only the wire-and-dedup level is implemented here; no text-file loader is
//! wired up to originate these messages (`spec.md` §1 lists that loader as
//! an external collaborator). Tests exercise this by injecting synthetic
//! `data` datagrams directly.

use std::collections::HashSet;

#[derive(Default)]
pub struct TextDedup {
    seen: HashSet<(String, u64)>,
}

impl TextDedup {
    /// Returns `true` if `(origin, seq)` had not been seen before (i.e. the
    /// message should be processed), `false` if it's a duplicate.
    pub fn mark_and_check(&mut self, origin: &str, seq: u64) -> bool {
        self.seen.insert((origin.to_string(), seq))
    }
}

/// Handle one `data` text datagram: returns `Some(msg)` the first time
/// `(origin, seq)` is seen, `None` on a repeat.
pub fn handle_text_message(dedup: &mut TextDedup, origin: &str, seq: u64, msg: &str) -> Option<String> {
    if dedup.mark_and_check(origin, seq) {
        Some(msg.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_is_new_repeat_is_deduped() {
        let mut dedup = TextDedup::default();
        assert!(handle_text_message(&mut dedup, "a", 1, "hi").is_some());
        assert!(handle_text_message(&mut dedup, "a", 1, "hi").is_none());
        assert!(handle_text_message(&mut dedup, "a", 2, "hi").is_some());
        assert!(handle_text_message(&mut dedup, "b", 1, "hi").is_some());
    }
}

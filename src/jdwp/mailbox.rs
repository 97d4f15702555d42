//! The event-thread suspension mailbox (spec.md §4.10, §9 design note).
//!
//! Not a plain mutex: `set_wait_for_event_thread` is a claim that a
//! *specific* thread is mid-post, and a second poster blocks until the
//! first clears it — modeled as a single-slot mailbox guarded by a
//! condition variable rather than a recursive lock.

use crate::util::mutex::{LockLevel, NamedCondvar, NamedMutex};

pub struct EventThreadMailbox {
    slot: NamedMutex<Option<u64>>,
    cond: NamedCondvar,
}

impl Default for EventThreadMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl EventThreadMailbox {
    pub fn new() -> Self {
        EventThreadMailbox {
            slot: NamedMutex::new("eventThreadLock", LockLevel::JdwpState, None),
            cond: NamedCondvar::new(),
        }
    }

    /// Claims the mailbox for `thread_id`, waiting if another thread is
    /// already mid-post.
    pub fn set_wait_for_event_thread(&self, thread_id: u64) {
        let mut slot = self.slot.lock();
        while slot.is_some() {
            slot = self.cond.wait(slot);
        }
        *slot = Some(thread_id);
    }

    /// Releases the mailbox and wakes any waiter. Called by the posting
    /// thread after enqueuing its suspend obligation but before it actually
    /// suspends, so an in-flight debugger reply is not blocked behind it.
    pub fn clear_wait_for_event_thread(&self) {
        let mut slot = self.slot.lock();
        *slot = None;
        self.cond.notify_all();
    }

    /// Whether the mailbox is currently claimed by any thread.
    pub fn is_claimed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_claim_waits_for_first_clear() {
        let mailbox = Arc::new(EventThreadMailbox::new());
        mailbox.set_wait_for_event_thread(1);

        let mailbox2 = mailbox.clone();
        let handle = thread::spawn(move || {
            mailbox2.set_wait_for_event_thread(2);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(mailbox.is_claimed());
        mailbox.clear_wait_for_event_thread();
        handle.join().unwrap();
        mailbox.clear_wait_for_event_thread();
        assert!(!mailbox.is_claimed());
    }

    #[test]
    fn uncontended_claim_and_clear_round_trips() {
        let mailbox = EventThreadMailbox::new();
        assert!(!mailbox.is_claimed());
        mailbox.set_wait_for_event_thread(5);
        assert!(mailbox.is_claimed());
        mailbox.clear_wait_for_event_thread();
        assert!(!mailbox.is_claimed());
    }
}

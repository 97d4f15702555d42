//! Event registration and modifier evaluation (spec.md §4.10).
//!
//! Events live in a single `Vec` guarded by `eventLock`; request ids come
//! from a monotonically increasing serial. Posting walks the matching
//! events in registration order, evaluating each event's modifiers in
//! order, and groups the events that matched into one composite reply at
//! the strongest suspend policy among them.

use crate::util::mutex::{LockLevel, NamedMutex};
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EventKind {
    SingleStep,
    Breakpoint,
    FramePop,
    Exception,
    UserDefined,
    ThreadStart,
    ThreadDeath,
    ClassPrepare,
    ClassUnload,
    ClassLoad,
    FieldAccess,
    FieldModification,
    ExceptionCatch,
    MethodEntry,
    MethodExit,
    VmInit,
    VmDeath,
}

/// Ordered weakest-to-strongest so `max` over a composite reply picks the
/// strongest policy (spec.md §4.10: "the strongest of the matched events").
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

#[derive(Clone, Debug)]
pub enum Modifier {
    Count { remaining: u32 },
    ThreadOnly { thread_id: u64 },
    ClassOnly { ref_type_id: u64 },
    ClassMatch { pattern: String },
    ClassExclude { pattern: String },
    LocationOnly { type_tag: u8, class_id: u64, method_id: u64, index: u64 },
    ExceptionOnly { ref_type_id: u64, caught: bool, uncaught: bool },
    FieldOnly { ref_type_id: u64, field_id: u64 },
    Step { thread_id: u64 },
    InstanceOnly { object_id: u64 },
}

#[derive(Clone, Debug)]
pub struct Event {
    pub request_id: u32,
    pub kind: EventKind,
    pub suspend_policy: SuspendPolicy,
    pub modifiers: Vec<Modifier>,
}

/// Everything a posted occurrence needs to be matched against modifiers.
/// Optional fields are populated only for the kinds of event that carry
/// them; a modifier referencing a field the basket does not carry is
/// treated as non-matching.
#[derive(Default)]
pub struct EventBasket {
    pub thread_id: Option<u64>,
    pub class_ref_type_id: Option<u64>,
    pub class_name: Option<String>,
    pub location: Option<(u8, u64, u64, u64)>,
    pub exception_ref_type_id: Option<u64>,
    pub exception_caught: Option<bool>,
    pub field_ref_type_id: Option<u64>,
    pub field_id: Option<u64>,
    pub this_object_id: Option<u64>,
}

/// Class-hierarchy queries the store needs for `CLASS_ONLY`/`EXCEPTION_ONLY`
/// assignability checks; supplied by the embedding runtime.
pub trait ClassHierarchy {
    fn is_assignable(&self, candidate_ref_type: u64, target_ref_type: u64) -> bool;
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let anchored = format!("^{}$", escaped.join(".*"));
    Regex::new(&anchored).map(|re| re.is_match(candidate)).unwrap_or(false)
}

pub struct EventStore {
    events: NamedMutex<Vec<Event>>,
    next_request_serial: AtomicU32,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        EventStore {
            events: NamedMutex::new("eventLock", LockLevel::JdwpState, Vec::new()),
            next_request_serial: AtomicU32::new(1),
        }
    }

    /// Registers an event, returning the request id reported to the
    /// debugger.
    pub fn register(&self, kind: EventKind, suspend_policy: SuspendPolicy, modifiers: Vec<Modifier>) -> u32 {
        let request_id = self.next_request_serial.fetch_add(1, Ordering::AcqRel);
        let mut events = self.events.lock();
        events.push(Event { request_id, kind, suspend_policy, modifiers });
        request_id
    }

    pub fn unregister(&self, request_id: u32) {
        self.events.lock().retain(|e| e.request_id != request_id);
    }

    pub fn unregister_all(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluates every registered event of `basket`'s kind against
    /// `basket`, decrementing `COUNT` modifiers up to (and including) the
    /// first rejecting non-`COUNT` modifier, removing any event whose
    /// `COUNT` reached zero, and returning the matched request ids plus
    /// the strongest suspend policy among them.
    pub fn post(&self, kind: EventKind, basket: &EventBasket, hierarchy: &dyn ClassHierarchy) -> Option<(SuspendPolicy, Vec<u32>)> {
        let mut events = self.events.lock();
        let mut matched_ids = Vec::new();
        let mut strongest: Option<SuspendPolicy> = None;
        let mut expired = Vec::new();

        for event in events.iter_mut() {
            if event.kind != kind {
                continue;
            }
            if evaluate_modifiers(&mut event.modifiers, basket, hierarchy) {
                matched_ids.push(event.request_id);
                strongest = Some(strongest.map_or(event.suspend_policy, |s| s.max(event.suspend_policy)));
            }
            if event.modifiers.iter().any(|m| matches!(m, Modifier::Count { remaining: 0 })) {
                expired.push(event.request_id);
            }
        }

        events.retain(|e| !expired.contains(&e.request_id));
        drop(events);

        strongest.map(|policy| (policy, matched_ids))
    }
}

/// Returns whether `basket` matches `modifiers`, mutating `COUNT`
/// modifiers in place per the decrement-before-reject rule.
fn evaluate_modifiers(modifiers: &mut [Modifier], basket: &EventBasket, hierarchy: &dyn ClassHierarchy) -> bool {
    for modifier in modifiers.iter_mut() {
        let keep_going = match modifier {
            Modifier::Count { remaining } => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            Modifier::ThreadOnly { thread_id } => basket.thread_id == Some(*thread_id),
            Modifier::ClassOnly { ref_type_id } => basket
                .class_ref_type_id
                .is_some_and(|candidate| hierarchy.is_assignable(candidate, *ref_type_id)),
            Modifier::ClassMatch { pattern } => basket
                .class_name
                .as_deref()
                .is_some_and(|name| glob_matches(pattern, name)),
            Modifier::ClassExclude { pattern } => !basket
                .class_name
                .as_deref()
                .is_some_and(|name| glob_matches(pattern, name)),
            Modifier::LocationOnly { type_tag, class_id, method_id, index } => {
                basket.location == Some((*type_tag, *class_id, *method_id, *index))
            }
            Modifier::ExceptionOnly { ref_type_id, caught, uncaught } => {
                let assignable = basket
                    .exception_ref_type_id
                    .is_some_and(|candidate| hierarchy.is_assignable(candidate, *ref_type_id));
                let policy_matches = match basket.exception_caught {
                    Some(true) => *caught,
                    Some(false) => *uncaught,
                    None => false,
                };
                assignable && policy_matches
            }
            Modifier::FieldOnly { ref_type_id, field_id } => {
                basket.field_ref_type_id == Some(*ref_type_id) && basket.field_id == Some(*field_id)
            }
            Modifier::Step { thread_id } => basket.thread_id == Some(*thread_id),
            Modifier::InstanceOnly { object_id } => basket.this_object_id == Some(*object_id),
        };
        if !keep_going {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAssignable;
    impl ClassHierarchy for AlwaysAssignable {
        fn is_assignable(&self, _candidate: u64, _target: u64) -> bool {
            true
        }
    }

    struct NeverAssignable;
    impl ClassHierarchy for NeverAssignable {
        fn is_assignable(&self, _candidate: u64, _target: u64) -> bool {
            false
        }
    }

    #[test]
    fn class_match_glob_with_trailing_star() {
        let store = EventStore::new();
        store.register(
            EventKind::MethodEntry,
            SuspendPolicy::None,
            vec![Modifier::ClassMatch { pattern: "com.example.*".to_string() }],
        );
        let hierarchy = AlwaysAssignable;

        let basket = EventBasket { class_name: Some("com.example.Foo".to_string()), ..Default::default() };
        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_some());

        let basket = EventBasket { class_name: Some("org.other.Bar".to_string()), ..Default::default() };
        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_none());
    }

    #[test]
    fn count_modifier_expires_event_after_n_matches() {
        let store = EventStore::new();
        store.register(
            EventKind::MethodEntry,
            SuspendPolicy::None,
            vec![
                Modifier::ClassMatch { pattern: "com.example.*".to_string() },
                Modifier::Count { remaining: 2 },
            ],
        );
        let hierarchy = AlwaysAssignable;
        let basket = EventBasket { class_name: Some("com.example.Foo".to_string()), ..Default::default() };

        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_some());
        assert_eq!(store.len(), 0, "event should expire after its second match");
    }

    #[test]
    fn count_decrements_even_when_a_later_modifier_rejects() {
        let store = EventStore::new();
        store.register(
            EventKind::MethodEntry,
            SuspendPolicy::None,
            vec![Modifier::Count { remaining: 3 }, Modifier::ThreadOnly { thread_id: 42 }],
        );
        let hierarchy = AlwaysAssignable;
        let basket = EventBasket { thread_id: Some(99), ..Default::default() };

        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_none());
        assert_eq!(store.len(), 1, "a non-matching post must not remove the event");

        let events = store.events.lock();
        match events[0].modifiers[0] {
            Modifier::Count { remaining } => assert_eq!(remaining, 2),
            _ => panic!("expected count modifier"),
        }
    }

    #[test]
    fn count_after_a_rejecting_modifier_is_not_decremented() {
        let store = EventStore::new();
        store.register(
            EventKind::MethodEntry,
            SuspendPolicy::None,
            vec![Modifier::ThreadOnly { thread_id: 42 }, Modifier::Count { remaining: 3 }],
        );
        let hierarchy = AlwaysAssignable;
        let basket = EventBasket { thread_id: Some(99), ..Default::default() };

        assert!(store.post(EventKind::MethodEntry, &basket, &hierarchy).is_none());
        let events = store.events.lock();
        match events[0].modifiers[1] {
            Modifier::Count { remaining } => assert_eq!(remaining, 3),
            _ => panic!("expected count modifier"),
        }
    }

    #[test]
    fn composite_reply_uses_strongest_suspend_policy() {
        let store = EventStore::new();
        store.register(EventKind::ThreadStart, SuspendPolicy::None, vec![]);
        store.register(EventKind::ThreadStart, SuspendPolicy::All, vec![]);
        let hierarchy = AlwaysAssignable;
        let (policy, ids) = store.post(EventKind::ThreadStart, &EventBasket::default(), &hierarchy).unwrap();
        assert_eq!(policy, SuspendPolicy::All);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn class_only_respects_hierarchy_lookup() {
        let store = EventStore::new();
        store.register(EventKind::ClassPrepare, SuspendPolicy::None, vec![Modifier::ClassOnly { ref_type_id: 7 }]);
        let basket = EventBasket { class_ref_type_id: Some(1), ..Default::default() };
        assert!(store.post(EventKind::ClassPrepare, &basket, &NeverAssignable).is_none());
        assert!(store.post(EventKind::ClassPrepare, &basket, &AlwaysAssignable).is_some());
    }
}

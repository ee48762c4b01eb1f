//! Lifecycle event bus
//!
//! Every event has a dotted type such as `apply.started`,
//! `rollback.step.failed` or `safety.verdict`. Subscribers pick events by
//! exact type or by pattern, where `*` matches one segment and a pattern
//! matches any type it is a prefix of (`*.step` matches
//! `apply.step.started`). Each subscriber owns an unbounded
//! `crossbeam-channel` receiver, so delivery order equals emission order and
//! each event is delivered at most once per subscriber.

use crate::migration::Operation;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Closed set of lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    StepStarted,
    StepSucceeded,
    StepFailed,
    Done,
    Aborted,
    SafetyCheck,
    SafetyFinding,
    SafetyVerdict,
}

impl EventKind {
    fn suffix(self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::StepStarted => "step.started",
            EventKind::StepSucceeded => "step.succeeded",
            EventKind::StepFailed => "step.failed",
            EventKind::Done => "done",
            EventKind::Aborted => "aborted",
            EventKind::SafetyCheck => "check",
            EventKind::SafetyFinding => "finding",
            EventKind::SafetyVerdict => "verdict",
        }
    }

    fn is_safety(self) -> bool {
        matches!(
            self,
            EventKind::SafetyCheck | EventKind::SafetyFinding | EventKind::SafetyVerdict
        )
    }
}

/// Event record delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip)]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event; safety kinds ignore `operation` and live under `safety.`
    #[must_use]
    pub fn new(kind: EventKind, operation: Operation, data: Value) -> Self {
        let prefix = if kind.is_safety() { "safety" } else { operation.as_str() };
        Self {
            event_type: format!("{prefix}.{}", kind.suffix()),
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Which events a subscriber wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Pattern(Vec<String>),
}

impl EventFilter {
    /// Parse `apply.done`, `*.started`, `safety.*` and the like
    #[must_use]
    pub fn pattern(pattern: &str) -> Self {
        if pattern == "*" || pattern.is_empty() {
            return EventFilter::All;
        }
        EventFilter::Pattern(pattern.split('.').map(str::to_string).collect())
    }

    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Pattern(segments) => {
                let mut actual = event_type.split('.');
                segments.iter().all(|expected| match actual.next() {
                    Some(segment) => expected == "*" || expected == segment,
                    None => false,
                })
            }
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    sender: Sender<Event>,
}

/// Cloneable handle to a shared publish/subscribe channel
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event
    #[must_use]
    pub fn subscribe_all(&self) -> Receiver<Event> {
        self.subscribe(EventFilter::All)
    }

    /// Receive events whose type matches `pattern`
    #[must_use]
    pub fn subscribe_pattern(&self, pattern: &str) -> Receiver<Event> {
        self.subscribe(EventFilter::pattern(pattern))
    }

    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Receiver<Event> {
        let (sender, receiver) = unbounded();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Subscriber { filter, sender }),
            Err(poisoned) => poisoned.into_inner().push(Subscriber { filter, sender }),
        }
        receiver
    }

    /// Deliver `event` to every matching subscriber
    ///
    /// Subscribers whose receiver was dropped are removed.
    pub fn emit(&self, event: Event) {
        log::trace!("event {} {}", event.event_type, event.data);
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event.event_type) {
                return true;
            }
            subscriber.sender.send(event.clone()).is_ok()
        });
    }

    /// Shorthand for `emit(Event::new(..))`
    pub fn publish(&self, kind: EventKind, operation: Operation, data: Value) {
        self.emit(Event::new(kind, operation, data));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

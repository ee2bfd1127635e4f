use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::GobbleError;

/// Process-wide sequence for info events, so relays can tell a repeated
/// delivery of the same event from a new one.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfoCode {
    BuildStart,
    TransformStart,
    TransformComplete,
    TransformLog,
}

/// Progress notification emitted by nodes and builds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub seq: u64,
    pub code: InfoCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub progress_indicator: bool,
}

impl Info {
    pub fn new(code: InfoCode) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            code,
            id: None,
            duration: None,
            message: None,
            progress_indicator: false,
        }
    }

    pub fn for_node(code: InfoCode, id: &str) -> Self {
        Self {
            id: Some(id.to_owned()),
            ..Self::new(code)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self) -> Self {
        self.progress_indicator = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Info,
    Error,
    Complete,
}

#[derive(Debug, Clone)]
pub enum Event {
    Info(Info),
    Error(GobbleError),
    Complete,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Info(_) => EventKind::Info,
            Event::Error(_) => EventKind::Error,
            Event::Complete => EventKind::Complete,
        }
    }
}

/// Handle returned by [`Emitter::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous, in-process event fan-out.
///
/// Listeners run on the emitting task, in subscription order. The listener
/// list is snapshotted before delivery, so a listener may subscribe or
/// unsubscribe (itself included) without deadlocking.
#[derive(Default)]
pub struct Emitter {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, Arc::new(listener)));
        id
    }

    /// Removes a listener, returning whether it was still registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(other, _, _)| *other != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, other, _)| *other == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in matching {
            listener(&event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, other, _)| *other == kind)
            .count()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        f.debug_struct("Emitter").field("listeners", &count).finish()
    }
}

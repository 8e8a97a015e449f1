//! Sync lifecycle events
//!
//! Handlers registered with [`EventBus::on`] run synchronously on the task
//! that emits the event, so they should be quick.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::report::SyncReport;
use crate::subscription::Subscription;

/// Kinds of events a handler can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SyncStart,
    SyncComplete,
    SyncError,
    Online,
    Offline,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::SyncStart,
        EventKind::SyncComplete,
        EventKind::SyncError,
        EventKind::Online,
        EventKind::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SyncStart => "sync-start",
            EventKind::SyncComplete => "sync-complete",
            EventKind::SyncError => "sync-error",
            EventKind::Online => "online",
            EventKind::Offline => "offline",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event '{}'", s))
    }
}

/// An emitted event
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStart,
    SyncComplete(SyncReport),
    SyncError {
        /// `{collection}/{id}` or collection name the failure concerns
        target: Option<String>,
        message: String,
    },
    Online,
    Offline,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::SyncStart => EventKind::SyncStart,
            SyncEvent::SyncComplete(_) => EventKind::SyncComplete,
            SyncEvent::SyncError { .. } => EventKind::SyncError,
            SyncEvent::Online => EventKind::Online,
            SyncEvent::Offline => EventKind::Offline,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

type HandlerMap = HashMap<EventKind, Vec<(u64, EventHandler)>>;

/// Handler registry, cheap to clone
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<HandlerMap>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of `kind` until the subscription drops
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        let handlers = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                let mut handlers = handlers.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(list) = handlers.get_mut(&kind) {
                    list.retain(|(handler_id, _)| *handler_id != id);
                }
            }
        })
    }

    pub fn emit(&self, event: SyncEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers().get(&kind).map_or(0, Vec::len)
    }

    fn handlers(&self) -> MutexGuard<'_, HandlerMap> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_receive_their_kind_only() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _online = bus.on(EventKind::Online, move |event| {
            sink.lock().unwrap().push(event.kind());
        });
        let sink = seen.clone();
        let _complete = bus.on(EventKind::SyncComplete, move |event| {
            sink.lock().unwrap().push(event.kind());
        });

        bus.emit(SyncEvent::Online);
        bus.emit(SyncEvent::Offline);
        bus.emit(SyncEvent::SyncComplete(SyncReport::default()));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Online, EventKind::SyncComplete]
        );
    }

    #[test]
    fn test_dropping_subscription_removes_handler() {
        let bus = EventBus::new();
        let sub = bus.on(EventKind::SyncStart, |_| {});
        assert_eq!(bus.handler_count(EventKind::SyncStart), 1);

        drop(sub);
        assert_eq!(bus.handler_count(EventKind::SyncStart), 0);
    }

    #[test]
    fn test_kind_names() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(EventKind::SyncError.to_string(), "sync-error");
        assert!("sync-done".parse::<EventKind>().is_err());
    }
}

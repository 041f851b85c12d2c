//! Process-wide typed publish/subscribe hub.
//!
//! | Piece         | Behavior                                                        |
//! |---------------|-----------------------------------------------------------------|
//! | middleware    | runs in registration order; each calls `next.run()` to continue |
//! | handlers      | invoked synchronously, in registration order, per exact kind    |
//! | history       | bounded ring buffer of delivered events                         |
//! | pause/resume  | while paused, `publish` drops events without recording them     |
//!
//! The bus is a cheap cloneable handle; construct one at startup and pass it to
//! every service that publishes or listens.

pub mod event;

pub use event::{Event, EventKind, NotificationLevel, WorkspaceChange};

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};

use crate::errors::BusError;

/// Default number of events retained in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// A middleware receives each published event plus the rest of the chain.
/// Returning without calling [`Next::run`] stops delivery.
pub type Middleware = Arc<dyn Fn(&Event, Next<'_>) + Send + Sync>;

/// Continuation handed to a middleware.
pub struct Next<'a> {
    chain: &'a [(u64, Middleware)],
    deliver: &'a dyn Fn(&Event),
}

impl Next<'_> {
    /// Pass `event` to the next middleware, or to the handlers when the chain is done.
    pub fn run(self, event: &Event) {
        match self.chain.split_first() {
            Some(((_, middleware), rest)) => middleware(
                event,
                Next {
                    chain: rest,
                    deliver: self.deliver,
                },
            ),
            None => (self.deliver)(event),
        }
    }
}

/// An event as recorded in history.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: Event,
}

/// Selects entries from history. Empty `kinds` matches every kind; `limit`
/// keeps the most recent N matches.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kinds: Vec<EventKind>,
    pub since: Option<DateTime<Utc>>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn kind(kind: EventKind) -> Self {
        Self {
            kinds: vec![kind],
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, recorded: &RecordedEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&recorded.event.kind()))
            && self.since.is_none_or(|since| recorded.at >= since)
            && self
                .task_id
                .as_deref()
                .is_none_or(|id| recorded.event.task_id() == Some(id))
    }
}

struct HandlerEntry {
    id: u64,
    once: bool,
    handler: Handler,
}

struct BusInner {
    handlers: Mutex<HashMap<EventKind, Vec<HandlerEntry>>>,
    middleware: Mutex<Vec<(u64, Middleware)>>,
    history: Mutex<VecDeque<RecordedEvent>>,
    history_capacity: usize,
    paused: AtomicBool,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking handler is caught outside the locks, so poisoning only
    // happens if the bus itself panicked mid-update; the data is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(HashMap::new()),
                middleware: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                history_capacity,
                paused: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(kind, false, Arc::new(handler))
    }

    /// Register `handler` for the next event of `kind` only.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(kind, true, Arc::new(handler))
    }

    fn add_handler(&self, kind: EventKind, once: bool, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(kind)
            .or_default()
            .push(HandlerEntry { id, once, handler });
        Subscription {
            id,
            kind,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.inner.handlers).get(&kind).map_or(0, Vec::len)
    }

    /// Append a middleware to the chain.
    pub fn use_middleware(&self, middleware: Middleware) -> MiddlewareHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.middleware).push((id, middleware));
        MiddlewareHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Run `event` through the middleware chain and deliver it to its handlers.
    ///
    /// Delivery is synchronous: when this returns, every handler has run.
    pub fn publish(&self, event: Event) {
        if self.is_paused() {
            tracing::trace!(kind = %event.kind(), "bus paused, dropping event");
            return;
        }

        let chain = lock(&self.inner.middleware).clone();
        let deliver = |event: &Event| {
            self.record(event);
            self.dispatch(event);
        };
        Next {
            chain: &chain,
            deliver: &deliver,
        }
        .run(&event);
    }

    pub fn publish_many<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        for event in events {
            self.publish(event);
        }
    }

    /// Wait for the next event of `kind`, failing after `timeout`.
    ///
    /// The temporary subscription is removed on every path.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Result<Event, BusError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe_once(kind, move |event| {
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(event.clone());
            }
            Ok(())
        });

        let outcome = tokio::time::timeout(timeout, rx).await;
        subscription.unsubscribe();

        match outcome {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::Closed {
                kind: kind.to_string(),
            }),
            Err(_) => Err(BusError::Timeout {
                kind: kind.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Recorded events matching `filter`, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<RecordedEvent> {
        let history = lock(&self.inner.history);
        let mut matched: Vec<RecordedEvent> =
            history.iter().filter(|r| filter.matches(r)).cloned().collect();
        if let Some(limit) = filter.limit
            && matched.len() > limit
        {
            matched.drain(..matched.len() - limit);
        }
        matched
    }

    pub fn clear_history(&self) {
        lock(&self.inner.history).clear();
    }

    /// Re-deliver recorded events matching `filter` to the current handlers.
    ///
    /// Replayed events skip middleware and are not recorded again. Returns the
    /// number of events replayed.
    pub fn replay(&self, filter: &HistoryFilter) -> usize {
        if self.is_paused() {
            return 0;
        }
        let recorded = self.history(filter);
        for entry in &recorded {
            self.dispatch(&entry.event);
        }
        recorded.len()
    }

    fn record(&self, event: &Event) {
        if self.inner.history_capacity == 0 {
            return;
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut history = lock(&self.inner.history);
        while history.len() >= self.inner.history_capacity {
            history.pop_front();
        }
        history.push_back(RecordedEvent {
            seq,
            at: Utc::now(),
            event: event.clone(),
        });
    }

    fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let handlers: Vec<(u64, Handler)> = {
            let mut registry = lock(&self.inner.handlers);
            let Some(entries) = registry.get_mut(&kind) else {
                return;
            };
            let selected = entries.iter().map(|e| (e.id, e.handler.clone())).collect();
            entries.retain(|e| !e.once);
            selected
        };

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(%kind, handler = id, error = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::error!(%kind, handler = id, "event handler panicked");
                }
            }
        }
    }
}

/// Returned by [`EventBus::subscribe`]; call [`Subscription::unsubscribe`] to
/// stop receiving events. Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut registry = lock(&inner.handlers);
        let Some(entries) = registry.get_mut(&self.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != self.id);
        before != entries.len()
    }
}

/// Returned by [`EventBus::use_middleware`].
#[derive(Debug)]
pub struct MiddlewareHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl MiddlewareHandle {
    pub fn remove(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut chain = lock(&inner.middleware);
        let before = chain.len();
        chain.retain(|(id, _)| *id != self.id);
        before != chain.len()
    }
}

/// Middleware that serializes every event and forwards it to `tx` before
/// continuing the chain. Lets async observers follow the bus.
pub fn json_forwarder(tx: broadcast::Sender<String>) -> Middleware {
    Arc::new(move |event: &Event, next: Next<'_>| {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = tx.send(json); // Ignore error if no receivers
            }
            Err(e) => {
                tracing::warn!(kind = %event.kind(), error = %e, "failed to serialize event");
            }
        }
        next.run(event);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn saved(id: &str) -> Event {
        Event::WorkspaceSaved {
            workspace_id: id.to_string(),
        }
    }

    fn collector(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(kind, move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            bus.subscribe(EventKind::WorkspaceSaved, move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        bus.publish(saved("a"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_exact_kind_is_delivered() {
        let bus = EventBus::default();
        let seen = collector(&bus, EventKind::WorkspaceLoaded);
        bus.publish(saved("a"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_handler_does_not_stop_delivery() {
        let bus = EventBus::default();
        bus.subscribe(EventKind::WorkspaceSaved, |_| anyhow::bail!("handler error"));
        bus.subscribe(EventKind::WorkspaceSaved, |_| panic!("handler panic"));
        let seen = collector(&bus, EventKind::WorkspaceSaved);
        bus.publish(saved("a"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe(EventKind::WorkspaceSaved, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(saved("a"));
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        bus.publish(saved("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_once_fires_once() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_once(EventKind::WorkspaceSaved, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(saved("a"));
        bus.publish(saved("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventKind::WorkspaceSaved), 0);
    }

    #[test]
    fn test_middleware_order_and_short_circuit() {
        let bus = EventBus::default();
        let trail = Arc::new(Mutex::new(Vec::new()));

        let t1 = trail.clone();
        bus.use_middleware(Arc::new(move |e: &Event, next: Next<'_>| {
            t1.lock().unwrap().push("first");
            next.run(e);
        }));
        let t2 = trail.clone();
        let blocker = bus.use_middleware(Arc::new(move |e: &Event, next: Next<'_>| {
            t2.lock().unwrap().push("second");
            if let Event::WorkspaceSaved { workspace_id } = e
                && workspace_id == "blocked"
            {
                return;
            }
            next.run(e);
        }));
        let seen = collector(&bus, EventKind::WorkspaceSaved);

        bus.publish(saved("blocked"));
        assert!(seen.lock().unwrap().is_empty());
        assert!(bus.history(&HistoryFilter::default()).is_empty());

        bus.publish(saved("ok"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            *trail.lock().unwrap(),
            vec!["first", "second", "first", "second"]
        );

        assert!(blocker.remove());
        bus.publish(saved("blocked"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_middleware_can_rewrite_event() {
        let bus = EventBus::default();
        bus.use_middleware(Arc::new(|_e: &Event, next: Next<'_>| {
            next.run(&saved("rewritten"));
        }));
        let seen = collector(&bus, EventKind::WorkspaceSaved);
        bus.publish(saved("original"));
        assert_eq!(seen.lock().unwrap()[0], saved("rewritten"));
    }

    #[test]
    fn test_paused_publish_is_not_recorded() {
        let bus = EventBus::default();
        let seen = collector(&bus, EventKind::WorkspaceSaved);
        bus.pause();
        bus.publish(saved("a"));
        assert!(seen.lock().unwrap().is_empty());
        assert!(bus.history(&HistoryFilter::default()).is_empty());
        bus.resume();
        bus.publish(saved("b"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_history_ring_buffer_evicts_oldest() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish(saved(&n.to_string()));
        }
        let history = bus.history(&HistoryFilter::default());
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event, saved("2"));
        assert_eq!(history[2].event, saved("4"));
        assert!(history[0].seq < history[2].seq);
    }

    #[test]
    fn test_history_filter_by_kind_and_limit() {
        let bus = EventBus::default();
        bus.publish(saved("a"));
        bus.publish(Event::WorkspaceLoaded {
            workspace_id: "b".into(),
        });
        bus.publish(saved("c"));
        bus.publish(saved("d"));

        let saves = bus.history(&HistoryFilter::kind(EventKind::WorkspaceSaved));
        assert_eq!(saves.len(), 3);
        let last = bus.history(&HistoryFilter::kind(EventKind::WorkspaceSaved).with_limit(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].event, saved("d"));
    }

    #[test]
    fn test_replay_redelivers_without_recording() {
        let bus = EventBus::default();
        bus.publish(saved("a"));
        bus.publish(saved("b"));
        let seen = collector(&bus, EventKind::WorkspaceSaved);
        let replayed = bus.replay(&HistoryFilter::kind(EventKind::WorkspaceSaved));
        assert_eq!(replayed, 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.history(&HistoryFilter::default()).len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_event() {
        let bus = EventBus::default();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(saved("later"));
        });
        let event = bus
            .wait_for(EventKind::WorkspaceSaved, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(event, saved("later"));
        assert_eq!(bus.handler_count(EventKind::WorkspaceSaved), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_and_cleans_up() {
        let bus = EventBus::default();
        let err = bus
            .wait_for(EventKind::RunExited, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(bus.handler_count(EventKind::RunExited), 0);
    }

    #[tokio::test]
    async fn test_json_forwarder_broadcasts_serialized_events() {
        let bus = EventBus::default();
        let (tx, mut rx) = broadcast::channel(8);
        bus.use_middleware(json_forwarder(tx));
        let seen = collector(&bus, EventKind::WorkspaceSaved);

        bus.publish(saved("fwd"));

        let json = rx.recv().await.unwrap();
        assert!(json.contains("workspace:saved"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

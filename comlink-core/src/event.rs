//! Observer registry and the events a link delivers to it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::link::VirtualLink;
use crate::wait::{lock, wait_while};

/// What an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Degree,
    Light,
    File,
    /// Connection closed. Observers of any kind also get [`LinkObserver::on_closed`].
    Close,
    /// The peer refused our close request.
    CloseDeclined,
}

/// An event delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Degree(f32),
    Light(f32),
    /// A file arrived; holds the local path it was stored at. Empty if the peer had no file.
    File(String),
    /// The peer sent a value outside its valid range. The cached value is unchanged.
    Rejected { kind: EventKind, value: f32 },
    CloseDeclined,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Degree(_) => EventKind::Degree,
            Event::Light(_) => EventKind::Light,
            Event::File(_) => EventKind::File,
            Event::Rejected { kind, .. } => *kind,
            Event::CloseDeclined => EventKind::CloseDeclined,
        }
    }
}

/// Receives link events. Called on the link's reader thread; must not block for long.
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, link: &VirtualLink, event: &Event);

    /// The link closed. Delivered once per distinct observer.
    fn on_closed(&self, link: &VirtualLink) {
        let _ = link;
    }
}

fn same(a: &Arc<dyn LinkObserver>, b: &Arc<dyn LinkObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Event kind to observers. Registration order is kept; duplicates are allowed.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: Mutex<HashMap<EventKind, Vec<Arc<dyn LinkObserver>>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn LinkObserver>, kind: EventKind) {
        lock(&self.entries).entry(kind).or_default().push(observer);
    }

    /// Register unless `observer` already listens for `kind`.
    pub fn register_once(&self, observer: &Arc<dyn LinkObserver>, kind: EventKind) {
        let mut entries = lock(&self.entries);
        let list = entries.entry(kind).or_default();
        if !list.iter().any(|o| same(o, observer)) {
            list.push(observer.clone());
        }
    }

    /// Remove one registration of `observer` for `kind`.
    pub fn unregister(&self, observer: &Arc<dyn LinkObserver>, kind: EventKind) {
        let mut entries = lock(&self.entries);
        if let Some(list) = entries.get_mut(&kind) {
            if let Some(i) = list.iter().position(|o| same(o, observer)) {
                list.remove(i);
            }
        }
    }

    /// Remove every registration of `observer`.
    pub fn unregister_all(&self, observer: &Arc<dyn LinkObserver>) {
        for list in lock(&self.entries).values_mut() {
            list.retain(|o| !same(o, observer));
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.entries).get(&kind).map_or(0, Vec::len)
    }

    pub fn observers(&self, kind: EventKind) -> Vec<Arc<dyn LinkObserver>> {
        lock(&self.entries).get(&kind).cloned().unwrap_or_default()
    }

    /// Every registered observer, each once.
    pub fn distinct(&self) -> Vec<Arc<dyn LinkObserver>> {
        let entries = lock(&self.entries);
        let mut out: Vec<Arc<dyn LinkObserver>> = Vec::new();
        for o in entries.values().flatten() {
            if !out.iter().any(|seen| same(seen, o)) {
                out.push(o.clone());
            }
        }
        out
    }

    /// Deliver `event` to the observers of its kind. The registry lock is not held while
    /// observers run.
    pub fn notify(&self, link: &VirtualLink, event: &Event) {
        for o in self.observers(event.kind()) {
            o.on_event(link, event);
        }
    }

    pub fn notify_closed(&self, link: &VirtualLink) {
        for o in self.distinct() {
            o.on_closed(link);
        }
    }
}

#[derive(Default)]
struct WaiterState {
    generation: u64,
    last: Option<Event>,
    closed: bool,
}

/// Observer a thread can block on until the next event or close.
#[derive(Default)]
pub struct Waiter {
    state: Mutex<WaiterState>,
    cv: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counter bumped by every delivery. Read it before triggering the event you wait for.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Wait until something is delivered after `seen`. False on timeout.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let st = lock(&self.state);
        let (st, _) = wait_while(&self.cv, st, timeout, |s| s.generation <= seen);
        st.generation > seen
    }

    pub fn last_event(&self) -> Option<Event> {
        lock(&self.state).last.clone()
    }

    pub fn saw_close(&self) -> bool {
        lock(&self.state).closed
    }
}

impl LinkObserver for Waiter {
    fn on_event(&self, _link: &VirtualLink, event: &Event) {
        let mut st = lock(&self.state);
        st.generation += 1;
        st.last = Some(event.clone());
        self.cv.notify_all();
    }

    fn on_closed(&self, _link: &VirtualLink) {
        let mut st = lock(&self.state);
        st.generation += 1;
        st.closed = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl LinkObserver for Nop {
        fn on_event(&self, _: &VirtualLink, _: &Event) {}
    }

    #[test]
    fn rejected_event_keeps_its_kind() {
        let e = Event::Rejected {
            kind: EventKind::Light,
            value: 120.0,
        };
        assert_eq!(e.kind(), EventKind::Light);
        assert_eq!(Event::File(String::new()).kind(), EventKind::File);
    }

    #[test]
    fn registry_is_a_multiset() {
        let reg = ObserverRegistry::new();
        let a: Arc<dyn LinkObserver> = Arc::new(Nop);
        let b: Arc<dyn LinkObserver> = Arc::new(Nop);
        reg.register(a.clone(), EventKind::Degree);
        reg.register(a.clone(), EventKind::Degree);
        reg.register(b.clone(), EventKind::Light);
        assert_eq!(reg.count(EventKind::Degree), 2);
        reg.unregister(&a, EventKind::Degree);
        assert_eq!(reg.count(EventKind::Degree), 1);
        reg.register_once(&a, EventKind::Degree);
        assert_eq!(reg.count(EventKind::Degree), 1);
        assert_eq!(reg.distinct().len(), 2);
        reg.unregister_all(&a);
        assert_eq!(reg.count(EventKind::Degree), 0);
        assert_eq!(reg.count(EventKind::Light), 1);
    }

    #[test]
    fn distinct_lists_an_observer_once_across_kinds() {
        let reg = ObserverRegistry::new();
        let a: Arc<dyn LinkObserver> = Arc::new(Nop);
        reg.register(a.clone(), EventKind::Degree);
        reg.register(a.clone(), EventKind::Close);
        reg.register(a.clone(), EventKind::File);
        assert_eq!(reg.distinct().len(), 1);
    }

    #[test]
    fn waiter_times_out_without_delivery() {
        let w = Waiter::new();
        let seen = w.generation();
        assert!(!w.wait_past(seen, Duration::from_millis(10)));
        assert!(w.last_event().is_none());
        assert!(!w.saw_close());
    }
}

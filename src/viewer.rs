//! Current-page cursor and keyboard paging.
//!
//! Key events reach viewers through an [`InputHub`]. A viewer holds a
//! [`Subscription`] for as long as it is mounted; dropping it removes the
//! listener.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavKey {
    Left,
    Up,
    Right,
    Down,
    Home,
    End,
}

impl NavKey {
    /// Maps DOM-style key names (`ArrowLeft`, `Home`, ...).
    pub fn from_key_name(name: &str) -> Option<Self> {
        match name {
            "ArrowLeft" | "Left" => Some(NavKey::Left),
            "ArrowUp" | "Up" => Some(NavKey::Up),
            "ArrowRight" | "Right" => Some(NavKey::Right),
            "ArrowDown" | "Down" => Some(NavKey::Down),
            "Home" => Some(NavKey::Home),
            "End" => Some(NavKey::End),
            _ => None,
        }
    }
}

/// Index of the displayed page, kept inside `0..count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageCursor {
    current: usize,
    count: usize,
}

impl PageCursor {
    pub fn new(count: usize) -> Self {
        Self { current: 0, count }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
        self.current = self.current.min(count.saturating_sub(1));
    }

    /// Clamped jump; returns whether the page changed.
    pub fn go_to(&mut self, index: usize) -> bool {
        let target = index.min(self.count.saturating_sub(1));
        let changed = target != self.current;
        self.current = target;
        changed
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn handle(&mut self, key: NavKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let target = match key {
            NavKey::Left | NavKey::Up => self.current.saturating_sub(1),
            NavKey::Right | NavKey::Down => self.current + 1,
            NavKey::Home => 0,
            NavKey::End => self.count - 1,
        };
        self.go_to(target)
    }
}

type Listener = Box<dyn FnMut(NavKey) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
    /// Ids whose listener is checked out by a running dispatch. An id
    /// missing here when the dispatch returns was unsubscribed meanwhile.
    in_flight: BTreeSet<u64>,
}

/// Fan-out point for navigation keys.
///
/// Listeners run with the hub unlocked, so they may subscribe, drop
/// subscriptions (their own included) or dispatch again.
#[derive(Clone, Default)]
pub struct InputHub {
    inner: Arc<Mutex<Listeners>>,
}

impl std::fmt::Debug for InputHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl InputHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(NavKey) + Send + 'static,
    {
        let id = self.inner.lock().ok().map(|mut inner| {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.insert(id, Box::new(listener));
            id
        });
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Delivers `key` to every listener; returns how many received it.
    pub fn dispatch(&self, key: NavKey) -> usize {
        let mut taken = {
            let Ok(mut inner) = self.inner.lock() else {
                return 0;
            };
            let taken = std::mem::take(&mut inner.entries);
            inner.in_flight.extend(taken.keys().copied());
            taken
        };
        for listener in taken.values_mut() {
            listener(key);
        }
        let delivered = taken.len();

        let mut dropped = Vec::new();
        if let Ok(mut inner) = self.inner.lock() {
            for (id, listener) in taken {
                if inner.in_flight.remove(&id) {
                    inner.entries.insert(id, listener);
                } else {
                    dropped.push(listener);
                }
            }
        }
        // Released listeners may own subscriptions; drop them unlocked.
        drop(dropped);
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len() + inner.in_flight.len())
            .unwrap_or(0)
    }
}

/// Live registration on an [`InputHub`]; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    hub: Weak<Mutex<Listeners>>,
    /// `None` when the hub could not register the listener.
    id: Option<u64>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let removed = match hub.lock() {
            Ok(mut inner) => {
                let removed = inner.entries.remove(&id);
                if removed.is_none() {
                    inner.in_flight.remove(&id);
                }
                removed
            }
            Err(_) => None,
        };
        drop(removed);
    }
}

/// A mounted page viewer: a shared cursor driven by the hub's keys.
#[derive(Debug)]
pub struct Viewer {
    cursor: Arc<Mutex<PageCursor>>,
    _subscription: Subscription,
}

impl Viewer {
    pub fn mount(hub: &InputHub, page_count: usize) -> Self {
        let cursor = Arc::new(Mutex::new(PageCursor::new(page_count)));
        let shared = Arc::clone(&cursor);
        let subscription = hub.subscribe(move |key| {
            if let Ok(mut cursor) = shared.lock() {
                if cursor.handle(key) {
                    tracing::trace!(page = cursor.current(), "viewer paged");
                }
            }
        });
        Self {
            cursor,
            _subscription: subscription,
        }
    }

    pub fn current(&self) -> usize {
        self.cursor.lock().map(|c| c.current()).unwrap_or(0)
    }

    pub fn go_to(&self, index: usize) -> bool {
        self.cursor.lock().map(|mut c| c.go_to(index)).unwrap_or(false)
    }

    pub fn set_page_count(&self, count: usize) {
        if let Ok(mut cursor) = self.cursor.lock() {
            cursor.set_count(count);
        }
    }
}

// Cziczere Sync Engine: State Store
//
// Single owner of the application snapshot. Writers dispatch actions;
// the pure reducer builds the next snapshot; observers receive it through a
// latest-only `watch` channel. A slow observer only ever sees the newest
// value and never holds up dispatch or other observers.

mod actions;
mod reducer;
pub mod selectors;
mod snapshot;

pub use actions::Action;
pub use reducer::reduce;
pub use snapshot::{ApplicationSnapshot, ChatState, StoreLimits};

use log::debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

pub struct StateStore {
    tx: watch::Sender<Arc<ApplicationSnapshot>>,
    limits: StoreLimits,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl StateStore {
    pub fn new(limits: StoreLimits) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ApplicationSnapshot::default()));
        StateStore { tx, limits }
    }

    /// Apply `action`. Returns true when the snapshot changed; observers are
    /// notified only then.
    pub fn dispatch(&self, action: Action) -> bool {
        let name = action.name();
        let limits = self.limits;
        let changed = self.tx.send_if_modified(|current| match reduce(current, &action, &limits) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => false,
        });
        if changed {
            debug!("[store] {} → revision {}", name, self.tx.borrow().revision);
        } else {
            debug!("[store] {} (no change)", name);
        }
        changed
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ApplicationSnapshot> {
        self.tx.borrow().clone()
    }

    /// Current snapshot first, then every later change (latest-only).
    pub fn observe(&self) -> WatchStream<Arc<ApplicationSnapshot>> {
        WatchStream::new(self.tx.subscribe())
    }

    /// Raw receiver for callers that want `changed()` / `borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ApplicationSnapshot>> {
        self.tx.subscribe()
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }
}

// Cziczere Sync Engine: Push Feed Multiplexer
//
// Per-identity subscriptions to the `memories` and `insights` collections,
// merged into one event channel. Each forwarded envelope carries the scope
// generation it was produced under; consumers drop envelopes whose
// generation is no longer current, so nothing from a torn-down identity
// leaks into the next one.
//
// Subscriptions are lazy (nothing is opened until polled) and terminal on
// error: an `Err` item is the last item of its sequence. There is no
// automatic resubscription; `resubscribe` restarts one collection.

pub mod sse;

use crate::atoms::constants::FEED_EVENT_CAPACITY;
use crate::atoms::error::SyncResult;
use crate::atoms::traits::{ChangeStream, DocumentFeed};
use crate::atoms::types::{ChangeEvent, CollectionKind, UserId};
use futures::{future, stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use sse::SseDocumentFeed;

/// One item from one collection, tagged with its scope.
#[derive(Debug)]
pub struct FeedEnvelope {
    pub generation: u64,
    pub kind: CollectionKind,
    pub item: SyncResult<ChangeEvent>,
}

#[derive(Default)]
struct Scope {
    owner: Option<UserId>,
    generation: u64,
    tasks: HashMap<CollectionKind, JoinHandle<()>>,
}

pub struct PushFeedMultiplexer {
    feed: Arc<dyn DocumentFeed>,
    tx: mpsc::Sender<FeedEnvelope>,
    rx: Mutex<Option<mpsc::Receiver<FeedEnvelope>>>,
    scope: Mutex<Scope>,
}

impl PushFeedMultiplexer {
    pub fn new(feed: Arc<dyn DocumentFeed>) -> Self {
        let (tx, rx) = mpsc::channel(FEED_EVENT_CAPACITY);
        PushFeedMultiplexer { feed, tx, rx: Mutex::new(Some(rx)), scope: Mutex::new(Scope::default()) }
    }

    /// Lazy, terminal-on-error change sequence for one collection.
    /// Calling it again yields a fresh sequence.
    pub fn subscribe(&self, owner: &UserId, kind: CollectionKind) -> ChangeStream {
        lazy_subscription(Arc::clone(&self.feed), owner.clone(), kind)
    }

    /// The merged event channel. Handed out once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<FeedEnvelope>> {
        self.rx.lock().take()
    }

    pub fn generation(&self) -> u64 {
        self.scope.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.scope.lock().generation == generation
    }

    pub fn owner(&self) -> Option<UserId> {
        self.scope.lock().owner.clone()
    }

    /// Subscriptions whose forwarder is still running.
    pub fn active_subscriptions(&self) -> usize {
        self.scope.lock().tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Tear down every subscription of the current identity, then subscribe
    /// both collections for `owner`. Returns how many were torn down.
    pub async fn switch_identity(&self, owner: Option<UserId>) -> usize {
        let torn_down = self.teardown().await;

        let mut scope = self.scope.lock();
        scope.generation += 1;
        scope.owner = owner.clone();
        if let Some(owner) = owner {
            for kind in CollectionKind::ALL {
                let handle = self.spawn_forwarder(&owner, kind, scope.generation);
                scope.tasks.insert(kind, handle);
            }
            info!("[feed] Subscribed {} (generation {})", owner, scope.generation);
        }
        torn_down
    }

    /// Restart one collection for the current identity.
    pub async fn resubscribe(&self, kind: CollectionKind) -> bool {
        let previous = self.scope.lock().tasks.remove(&kind);
        if let Some(handle) = previous {
            handle.abort();
            let _ = handle.await;
        }

        let mut scope = self.scope.lock();
        let Some(owner) = scope.owner.clone() else {
            warn!("[feed] resubscribe {} with no identity", kind);
            return false;
        };
        let handle = self.spawn_forwarder(&owner, kind, scope.generation);
        scope.tasks.insert(kind, handle);
        debug!("[feed] Resubscribed {} for {}", kind, owner);
        true
    }

    /// Cancel every forwarder and wait for each to be dropped.
    pub async fn teardown(&self) -> usize {
        let tasks: Vec<JoinHandle<()>> = {
            let mut scope = self.scope.lock();
            scope.generation += 1;
            scope.tasks.drain().map(|(_, h)| h).collect()
        };
        let count = tasks.len();
        for handle in tasks {
            handle.abort();
            let _ = handle.await;
        }
        if count > 0 {
            info!("[feed] Tore down {} subscription(s)", count);
        }
        count
    }

    fn spawn_forwarder(&self, owner: &UserId, kind: CollectionKind, generation: u64) -> JoinHandle<()> {
        let mut changes = self.subscribe(owner, kind);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(item) = changes.next().await {
                let failed = item.is_err();
                if tx.send(FeedEnvelope { generation, kind, item }).await.is_err() {
                    break;
                }
                if failed {
                    break;
                }
            }
            debug!("[feed] {} forwarder (generation {}) finished", kind, generation);
        })
    }
}

impl Drop for PushFeedMultiplexer {
    fn drop(&mut self) {
        for (_, handle) in self.scope.get_mut().tasks.drain() {
            handle.abort();
        }
    }
}

fn lazy_subscription(feed: Arc<dyn DocumentFeed>, owner: UserId, kind: CollectionKind) -> ChangeStream {
    let opened = stream::once(async move { feed.open(&owner, kind).await }).flat_map(move |result| match result {
        Ok(changes) => changes,
        Err(e) => {
            warn!("[feed] {} subscription failed: {}", kind, e);
            let failed: ChangeStream = Box::pin(stream::once(future::ready(Err(e))));
            failed
        }
    });
    // Nothing follows an error.
    Box::pin(opened.scan(false, |failed, item| {
        if *failed {
            return future::ready(None);
        }
        *failed = item.is_err();
        future::ready(Some(item))
    }))
}

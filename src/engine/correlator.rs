// Cziczere Sync Engine: Message Correlator
//
// Tracks outbound wire messages that await an acknowledgment or reply.
// Each issued message gets a unique `messageId` and a deadline; inbound
// replies carrying the same id resolve it. A sweeper fails overdue entries
// with `Timeout`. Resolution happens at most once per id.

use crate::atoms::constants::MESSAGE_TIMEOUT_MS;
use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::types::WireMessage;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Reply handle returned by `issue`.
pub type Reply = oneshot::Receiver<SyncResult<WireMessage>>;

struct PendingCall {
    issued_at: Instant,
    timeout_at: Instant,
    awaiting_response: bool,
    reply: oneshot::Sender<SyncResult<WireMessage>>,
}

pub struct MessageCorrelator {
    pending: Mutex<HashMap<String, PendingCall>>,
    timeout: Duration,
}

impl Default for MessageCorrelator {
    fn default() -> Self {
        Self::new(Duration::from_millis(MESSAGE_TIMEOUT_MS))
    }
}

impl MessageCorrelator {
    pub fn new(timeout: Duration) -> Self {
        MessageCorrelator { pending: Mutex::new(HashMap::new()), timeout }
    }

    /// Stamp `message` with a fresh correlation id and start tracking it.
    pub fn issue(&self, message: &mut WireMessage, awaiting_response: bool) -> (String, Reply) {
        let id = new_correlation_id();
        message.message_id = Some(id.clone());
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.lock().insert(
            id.clone(),
            PendingCall {
                issued_at: now,
                timeout_at: now + self.timeout,
                awaiting_response,
                reply: tx,
            },
        );
        debug!("[correlator] issued {} (awaiting_response={})", id, awaiting_response);
        (id, rx)
    }

    /// Complete the entry for `correlation_id`. Returns false for unknown or
    /// already-resolved ids.
    pub fn resolve(&self, correlation_id: &str, response: WireMessage) -> bool {
        let Some(call) = self.pending.lock().remove(correlation_id) else {
            debug!("[correlator] ignoring reply for unknown id {}", correlation_id);
            return false;
        };
        debug!(
            "[correlator] resolved {} after {:?} (awaiting_response={})",
            correlation_id,
            call.issued_at.elapsed(),
            call.awaiting_response
        );
        let _ = call.reply.send(Ok(response));
        true
    }

    /// Drop an entry without resolving it, e.g. when its send failed.
    pub fn forget(&self, correlation_id: &str) {
        self.pending.lock().remove(correlation_id);
    }

    /// Fail every overdue entry with `Timeout`. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| call.timeout_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();
        for (id, call) in expired {
            warn!("[correlator] {} timed out", id);
            let _ = call.reply.send(Err(SyncError::Timeout { correlation_id: id }));
        }
        count
    }

    /// Fail every pending entry with `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.reply.send(Err(SyncError::Cancelled));
        }
        if count > 0 {
            debug!("[correlator] cancelled {} pending call(s)", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    /// Run `sweep` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }
}

/// `ws_<epoch-ms>_<9 random chars>`.
fn new_correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("ws_{}_{}", millis, &random[..9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::WireKind;
    use serde_json::json;

    fn msg() -> WireMessage {
        WireMessage::new(WireKind::Message, json!({"message": "hi"}), 1)
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let c = MessageCorrelator::default();
        let mut m = msg();
        let (id, rx) = c.issue(&mut m, true);
        assert_eq!(m.message_id.as_deref(), Some(id.as_str()));
        assert!(id.starts_with("ws_"));

        assert!(c.resolve(&id, msg()));
        assert!(!c.resolve(&id, msg()));
        assert!(!c.resolve("ws_unknown", msg()));
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_overdue() {
        let c = MessageCorrelator::new(Duration::from_secs(30));
        let (_, early) = c.issue(&mut msg(), true);
        tokio::time::advance(Duration::from_secs(20)).await;
        let (late_id, _late) = c.issue(&mut msg(), true);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.sweep(), 1);
        assert!(matches!(early.await.unwrap(), Err(SyncError::Timeout { .. })));
        assert!(c.is_pending(&late_id));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_periodically() {
        let c = Arc::new(MessageCorrelator::new(Duration::from_secs(1)));
        let handle = c.spawn_sweeper(Duration::from_millis(500));
        let (_, rx) = c.issue(&mut msg(), false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(c.pending_count(), 0);
        assert!(matches!(rx.await.unwrap(), Err(SyncError::Timeout { .. })));
        handle.abort();
    }

    #[tokio::test]
    async fn cancel_all_fails_everything() {
        let c = MessageCorrelator::default();
        let (_, a) = c.issue(&mut msg(), true);
        let (_, b) = c.issue(&mut msg(), false);
        assert_eq!(c.cancel_all(), 2);
        assert!(matches!(a.await.unwrap(), Err(SyncError::Cancelled)));
        assert!(matches!(b.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn ids_are_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
    }
}

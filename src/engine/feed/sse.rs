// Cziczere Sync Engine: SSE Document Feed
//
// `DocumentFeed` backed by a server-sent-events endpoint:
//
//   GET {feed_url}/{collection}?owner=<id>&order=desc[&limit=N]
//   Authorization: Bearer <token>
//
// Event names map to change kinds: `added`, `modified`, `removed` (data is
// `{"id": ...}`) and `snapshot` (initial result set delivered).

use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::traits::{ChangeStream, CredentialSource, DocumentFeed};
use crate::atoms::types::{ChangeEvent, CollectionKind, FeedDocument, InsightRecord, MemoryRecord, UserId};
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use log::{debug, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

pub struct SseDocumentFeed {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    limit: Option<usize>,
}

impl SseDocumentFeed {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        SseDocumentFeed {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl DocumentFeed for SseDocumentFeed {
    async fn open(&self, owner: &UserId, kind: CollectionKind) -> SyncResult<ChangeStream> {
        let token = self
            .credentials
            .current_token()
            .await?
            .ok_or_else(|| SyncError::Auth("no credential for feed".into()))?;

        let url = format!("{}/{}", self.base_url, kind.as_str());
        let mut query = vec![("owner", owner.as_str().to_string()), ("order", "desc".to_string())];
        if let Some(limit) = self.limit {
            query.push(("limit", limit.to_string()));
        }

        debug!("[feed] GET {} owner={}", url, owner);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .header("Accept", "text/event-stream")
            .header("Authorization", format!("Bearer {}", token.expose()))
            .send()
            .await
            .map_err(|e| SyncError::subscription(kind.as_str(), e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::subscription(kind.as_str(), format!("HTTP {}: {}", status, body)));
        }

        let bytes: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        Ok(Box::pin(change_stream(bytes, kind)))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

struct FeedState {
    bytes: ByteStream,
    parser: SseParser,
    ready: VecDeque<SyncResult<ChangeEvent>>,
    done: bool,
}

fn change_stream(bytes: ByteStream, kind: CollectionKind) -> impl Stream<Item = SyncResult<ChangeEvent>> + Send {
    let state = FeedState { bytes, parser: SseParser::new(kind), ready: VecDeque::new(), done: false };
    stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.parser.push(&chunk);
                    st.ready.extend(events.into_iter().map(Ok));
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.ready.push_back(Err(SyncError::subscription(kind.as_str(), e.to_string())));
                }
                None => {
                    st.done = true;
                    st.ready.push_back(Err(SyncError::subscription(kind.as_str(), "feed closed by server")));
                }
            }
        }
    })
}

// ── Parser ─────────────────────────────────────────────────────────────────

/// Incremental SSE parser. Feed it arbitrary byte chunks; it returns every
/// complete event. Lines are decoded only once complete, so a character split
/// across chunks survives. Undecodable events are logged and skipped.
pub(crate) struct SseParser {
    kind: CollectionKind,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn new(kind: CollectionKind) -> Self {
        SseParser { kind, buffer: Vec::new(), event: None, data: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<ChangeEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    out.push(event);
                }
            } else if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }
            // `id:`, `retry:` and `:` comments are ignored
        }
        out
    }

    fn flush(&mut self) -> Option<ChangeEvent> {
        let name = self.event.take();
        let data = std::mem::take(&mut self.data).join("\n");
        let name = name.as_deref().unwrap_or("message");

        match decode_event(self.kind, name, &data) {
            Ok(event) => event,
            Err(e) => {
                warn!("[feed] {} dropping undecodable '{}' event: {}", self.kind, name, e);
                None
            }
        }
    }
}

fn decode_event(kind: CollectionKind, name: &str, data: &str) -> SyncResult<Option<ChangeEvent>> {
    let event = match name {
        "added" => Some(ChangeEvent::Added(decode_document(kind, data)?)),
        "modified" => Some(ChangeEvent::Modified(decode_document(kind, data)?)),
        "removed" => {
            let value: serde_json::Value = serde_json::from_str(data)?;
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SyncError::Other("removed event without id".into()))?;
            Some(ChangeEvent::Removed(id.to_string()))
        }
        "snapshot" => Some(ChangeEvent::InitialSnapshotComplete),
        other => {
            debug!("[feed] ignoring '{}' event", other);
            None
        }
    };
    Ok(event)
}

fn decode_document(kind: CollectionKind, data: &str) -> SyncResult<FeedDocument> {
    Ok(match kind {
        CollectionKind::Memories => FeedDocument::Memory(serde_json::from_str::<MemoryRecord>(data)?),
        CollectionKind::Insights => FeedDocument::Insight(serde_json::from_str::<InsightRecord>(data)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_across_chunks() {
        let mut p = SseParser::new(CollectionKind::Memories);
        let mut events = p.push(b"event: added\ndata: {\"id\":\"m1\",\"userId\":\"u1\",");
        assert!(events.is_empty());
        events.extend(p.push(b"\"userText\":\"hi\",\"timestamp\":5}\n\nevent: snapshot\ndata: {}\n\n"));
        assert_eq!(events.len(), 2);
        match &events[0] {
            ChangeEvent::Added(FeedDocument::Memory(m)) => assert_eq!(m.id.as_deref(), Some("m1")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], ChangeEvent::InitialSnapshotComplete);
    }

    #[test]
    fn removed_and_garbage() {
        let mut p = SseParser::new(CollectionKind::Insights);
        let events = p.push(b": keepalive\r\nevent: modified\r\ndata: nope\r\n\r\nevent: removed\r\ndata: {\"id\":\"i9\"}\r\n\r\n");
        assert_eq!(events, vec![ChangeEvent::Removed("i9".into())]);
    }

    #[test]
    fn character_split_across_chunks_survives() {
        let frame = "event: added\ndata: {\"id\":\"m1\",\"userId\":\"u1\",\"userText\":\"őszi kert\",\"timestamp\":5}\n\n";
        let bytes = frame.as_bytes();
        // Cut between the two bytes of 'ő'.
        let cut = frame.find('ő').unwrap() + 1;

        let mut p = SseParser::new(CollectionKind::Memories);
        let mut events = p.push(&bytes[..cut]);
        assert!(events.is_empty());
        events.extend(p.push(&bytes[cut..]));
        match &events[..] {
            [ChangeEvent::Added(FeedDocument::Memory(m))] => assert_eq!(m.text, "őszi kert"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn byte_stream_end_is_terminal_error() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> =
            vec![Ok(b"event: removed\ndata: {\"id\":\"m1\"}\n\n".to_vec())];
        let bytes: ByteStream = Box::pin(stream::iter(chunks));
        let items: Vec<_> = change_stream(bytes, CollectionKind::Memories).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Ok(ChangeEvent::Removed(_))));
        assert!(matches!(items[1], Err(SyncError::Subscription { .. })));
    }
}

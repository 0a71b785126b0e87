// Cziczere Sync Engine: Pure Reducer
//
// `reduce(snapshot, action)` → `Some(next)` when the action changes state,
// `None` otherwise. Total: no action panics, unknown ids and `Unknown` are
// no-ops. All list invariants are enforced here:
//   - memories and insights are newest-first by timestamp
//   - at most one entry per backend id
//   - optimistic entries never carry an id
//   - caps evict the oldest entries

use super::snapshot::{ApplicationSnapshot, StoreLimits};
use super::Action;
use crate::atoms::types::{
    ChatMessage, ChatSender, Fingerprint, InsightRecord, MemoryRecord, SyncStatus,
};

pub fn reduce(
    state: &ApplicationSnapshot,
    action: &Action,
    limits: &StoreLimits,
) -> Option<ApplicationSnapshot> {
    let mut next = state.clone();

    match action {
        // ── Memories ───────────────────────────────────────────────────
        Action::LoadStart => {
            next.memories_loading = true;
            next.error = None;
        }
        Action::LoadSuccess(records) => {
            load_memories(&mut next.memories, records);
            next.memories_loading = false;
            next.error = None;
        }
        Action::LoadError(message) => {
            next.memories_loading = false;
            next.error = Some(message.clone());
        }
        Action::AddOptimistic(record) => {
            if record.id.is_some() {
                return None;
            }
            let duplicate = record.client_ref.is_some()
                && next
                    .memories
                    .iter()
                    .any(|m| m.is_optimistic() && m.client_ref == record.client_ref);
            if duplicate {
                return None;
            }
            let mut draft = record.clone();
            draft.status = SyncStatus::Pending;
            clamp_emotions(&mut draft);
            insert_memory_sorted(&mut next.memories, draft);
        }
        Action::Reconcile { fingerprint, record } => {
            if !reconcile_memory(&mut next.memories, fingerprint.as_ref(), record) {
                return None;
            }
        }
        Action::Update(record) => {
            let Some(id) = record.id.as_deref() else { return None };
            let Some(pos) = next.memories.iter().position(|m| m.id.as_deref() == Some(id)) else {
                return None;
            };
            let mut updated = record.clone();
            updated.status = SyncStatus::Confirmed;
            clamp_emotions(&mut updated);
            if next.memories[pos].timestamp == updated.timestamp {
                next.memories[pos] = updated;
            } else {
                next.memories.remove(pos);
                insert_memory_sorted(&mut next.memories, updated);
            }
        }
        Action::Delete(id) => {
            next.memories.retain(|m| m.id.as_deref() != Some(id.as_str()));
        }
        Action::OptimisticFailed(fingerprint) => {
            let Some(pos) = find_by_nonce(&next.memories, &fingerprint.nonce) else {
                return None;
            };
            if next.memories[pos].status != SyncStatus::Pending {
                return None;
            }
            next.memories[pos].status = SyncStatus::Failed;
        }

        // ── Insights ───────────────────────────────────────────────────
        Action::InsightsLoadStart => {
            next.insights_loading = true;
        }
        Action::InsightsLoaded(insights) => {
            next.insights.clear();
            for insight in insights {
                upsert_insight(&mut next.insights, insight.clone());
            }
            next.insights_loading = false;
        }
        Action::InsightAdded(insight) => {
            upsert_insight(&mut next.insights, insight.clone());
        }
        Action::InsightRemoved(id) => {
            next.insights.retain(|i| &i.id != id);
        }

        // ── Atmosphere ─────────────────────────────────────────────────
        Action::AtmosphereUpdated { data, at_ms } => {
            next.atmosphere = Some(data.clone());
            next.atmosphere_refreshed_at = Some(*at_ms);
        }

        // ── Session ────────────────────────────────────────────────────
        Action::ConnectionChanged(connection) => {
            next.connection = *connection;
        }
        Action::IdentityChanged(identity) => {
            if state.identity == *identity {
                return None;
            }
            next = ApplicationSnapshot {
                revision: state.revision,
                identity: identity.clone(),
                connection: state.connection,
                ..ApplicationSnapshot::default()
            };
        }

        // ── Chat ───────────────────────────────────────────────────────
        Action::ChatMessageReceived(message) => {
            push_chat_message(&mut next.chat.history, message.clone(), limits.max_history);
            if message.sender == ChatSender::Assistant {
                next.chat.typing = false;
            }
        }
        Action::TypingChanged(typing) => {
            next.chat.typing = *typing;
        }
        Action::SuggestionsReceived(suggestions) => {
            next.chat.suggestions = suggestions.clone();
        }
        Action::SystemNotice(text) => {
            next.chat.system_notice = Some(text.clone());
        }

        // ── Errors ─────────────────────────────────────────────────────
        Action::SetError(message) => {
            next.error = Some(message.clone());
            next.memories_loading = false;
            next.insights_loading = false;
        }
        Action::ClearError => {
            next.error = None;
        }

        Action::Unknown => return None,
    }

    next.memories.truncate(limits.max_memories);
    next.insights.truncate(limits.insight_ring);

    if next == *state {
        return None;
    }
    next.revision = state.revision + 1;
    Some(next)
}

// ── Memory helpers ─────────────────────────────────────────────────────────

fn clamp_emotions(record: &mut MemoryRecord) {
    for value in record.emotions.values_mut() {
        *value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    }
}

/// Insert keeping newest-first order; ties go ahead of existing equal timestamps.
fn insert_memory_sorted(memories: &mut Vec<MemoryRecord>, record: MemoryRecord) {
    let pos = memories
        .iter()
        .position(|m| m.timestamp <= record.timestamp)
        .unwrap_or(memories.len());
    memories.insert(pos, record);
}

fn find_by_nonce(memories: &[MemoryRecord], nonce: &str) -> Option<usize> {
    memories
        .iter()
        .position(|m| m.is_optimistic() && m.client_ref.as_deref() == Some(nonce))
}

/// Locate the optimistic draft an authoritative record answers.
///
/// Nonce first (explicit fingerprint, then the record's echoed `client_ref`).
/// The `(owner, timestamp)` fallback only runs for a record that names no
/// nonce and is not already in the list; it takes the oldest matching draft.
/// Drafts of the same key sit newest-first, so the oldest is the last one.
fn find_optimistic_match(
    memories: &[MemoryRecord],
    fingerprint: Option<&Fingerprint>,
    record: &MemoryRecord,
) -> Option<usize> {
    let nonces = fingerprint.map(|fp| fp.nonce.as_str()).into_iter().chain(record.client_ref.as_deref());
    let mut named = false;
    for nonce in nonces {
        named = true;
        if let Some(pos) = find_by_nonce(memories, nonce) {
            return Some(pos);
        }
    }
    if named || memories.iter().any(|m| m.id.is_some() && m.id == record.id) {
        return None;
    }
    memories.iter().rposition(|m| {
        m.is_optimistic() && m.owner_id == record.owner_id && m.timestamp == record.timestamp
    })
}

/// Returns false when nothing changed shape-wise (caller reports no-op).
fn reconcile_memory(
    memories: &mut Vec<MemoryRecord>,
    fingerprint: Option<&Fingerprint>,
    record: &MemoryRecord,
) -> bool {
    let Some(id) = record.id.as_deref() else { return false };

    let mut authoritative = record.clone();
    authoritative.status = SyncStatus::Confirmed;
    clamp_emotions(&mut authoritative);

    let draft = find_optimistic_match(memories, fingerprint, record);
    let existing = memories.iter().position(|m| m.id.as_deref() == Some(id));

    match (draft, existing) {
        (Some(d), Some(e)) => {
            memories[d] = authoritative;
            memories.remove(e);
        }
        (Some(d), None) => {
            memories[d] = authoritative;
        }
        (None, Some(e)) => {
            if memories[e].timestamp == authoritative.timestamp {
                memories[e] = authoritative;
            } else {
                memories.remove(e);
                insert_memory_sorted(memories, authoritative);
            }
        }
        (None, None) => insert_memory_sorted(memories, authoritative),
    }
    true
}

/// Replace the authoritative list, keeping drafts the load does not answer.
fn load_memories(memories: &mut Vec<MemoryRecord>, loaded: &[MemoryRecord]) {
    let drafts: Vec<MemoryRecord> = memories.drain(..).filter(|m| m.is_optimistic()).collect();

    for record in loaded {
        if record.id.is_none() {
            continue;
        }
        if memories.iter().any(|m| m.id == record.id) {
            continue;
        }
        let mut authoritative = record.clone();
        authoritative.status = SyncStatus::Confirmed;
        clamp_emotions(&mut authoritative);
        insert_memory_sorted(memories, authoritative);
    }

    // Each loaded record answers at most one draft: its nonce owner, or the
    // oldest same-key draft when it carries no nonce.
    let mut answered = vec![false; drafts.len()];
    for record in memories.iter() {
        let hit = match record.client_ref.as_deref() {
            Some(nonce) => drafts.iter().position(|d| d.client_ref.as_deref() == Some(nonce)),
            None => drafts
                .iter()
                .enumerate()
                .rev()
                .find(|(i, d)| !answered[*i] && d.owner_id == record.owner_id && d.timestamp == record.timestamp)
                .map(|(i, _)| i),
        };
        if let Some(i) = hit {
            answered[i] = true;
        }
    }
    for (draft, done) in drafts.into_iter().zip(answered) {
        if !done {
            insert_memory_sorted(memories, draft);
        }
    }
}

// ── Insight helpers ────────────────────────────────────────────────────────

fn upsert_insight(insights: &mut Vec<InsightRecord>, insight: InsightRecord) {
    insights.retain(|i| i.id != insight.id);
    let pos = insights
        .iter()
        .position(|i| i.timestamp < insight.timestamp)
        .unwrap_or(insights.len());
    insights.insert(pos, insight);
}

// ── Chat helpers ───────────────────────────────────────────────────────────

fn push_chat_message(history: &mut Vec<ChatMessage>, message: ChatMessage, max: usize) {
    if history.iter().any(|m| m.id == message.id) {
        return;
    }
    history.push(message);
    if history.len() > max {
        let overflow = history.len() - max;
        history.drain(..overflow);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ConnectionState, UserId};
    use std::collections::HashSet;

    fn limits() -> StoreLimits {
        StoreLimits { max_memories: 100, insight_ring: 3, max_history: 4 }
    }

    fn apply(state: ApplicationSnapshot, action: Action) -> ApplicationSnapshot {
        reduce(&state, &action, &limits()).unwrap_or(state)
    }

    fn draft(owner: &str, text: &str, ts: i64, nonce: &str) -> MemoryRecord {
        let mut d = MemoryRecord::draft(UserId::new(owner), text, ts);
        d.client_ref = Some(nonce.into());
        d
    }

    fn confirmed(id: &str, owner: &str, text: &str, ts: i64) -> MemoryRecord {
        let mut m = MemoryRecord::draft(UserId::new(owner), text, ts);
        m.id = Some(id.into());
        m.status = SyncStatus::Confirmed;
        m
    }

    fn insight(id: &str, ts: i64) -> InsightRecord {
        InsightRecord {
            id: id.into(),
            owner_id: UserId::new("u1"),
            text: format!("insight {}", id),
            timestamp: ts,
            category: "weekly".into(),
            collage_url: None,
        }
    }

    #[test]
    fn optimistic_then_reconcile_keeps_position() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::LoadSuccess(vec![confirmed("m0", "u1", "older", 500)]));
        let s = apply(s, Action::AddOptimistic(MemoryRecord::draft(UserId::new("u1"), "hello", 1000)));
        assert_eq!(s.memories.len(), 2);
        assert!(s.memories[0].id.is_none());

        let s = apply(
            s,
            Action::Reconcile { fingerprint: None, record: confirmed("m1", "u1", "hello", 1000) },
        );
        assert_eq!(s.memories.len(), 2);
        assert_eq!(s.memories[0].id.as_deref(), Some("m1"));
        assert_eq!(s.memories[0].status, SyncStatus::Confirmed);
        assert_eq!(s.memories[1].id.as_deref(), Some("m0"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let s = apply(ApplicationSnapshot::default(), Action::AddOptimistic(draft("u1", "hi", 1000, "n1")));
        let action = Action::Reconcile { fingerprint: None, record: confirmed("m1", "u1", "hi", 1000) };
        let once = apply(s, action.clone());
        assert!(reduce(&once, &action, &limits()).is_none());
        let twice = apply(once.clone(), action);
        assert_eq!(once, twice);
    }

    #[test]
    fn same_millisecond_drafts_reconcile_independently() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::AddOptimistic(draft("u1", "first", 1000, "a")));
        let s = apply(s, Action::AddOptimistic(draft("u1", "second", 1000, "b")));
        assert_eq!(s.memories.len(), 2);

        let mut second = confirmed("m2", "u1", "second", 1000);
        second.client_ref = Some("b".into());
        let s = apply(s, Action::Reconcile { fingerprint: None, record: second });
        assert_eq!(s.memories.len(), 2);
        assert_eq!(s.memories.iter().filter(|m| m.is_optimistic()).count(), 1);
        let remaining = s.memories.iter().find(|m| m.is_optimistic()).unwrap();
        assert_eq!(remaining.text, "first");
    }

    #[test]
    fn owner_timestamp_fallback_takes_oldest_draft() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::AddOptimistic(draft("u1", "first", 1000, "a")));
        let s = apply(s, Action::AddOptimistic(draft("u1", "second", 1000, "b")));
        let s = apply(s, Action::Reconcile { fingerprint: None, record: confirmed("m1", "u1", "first", 1000) });
        let remaining = s.memories.iter().find(|m| m.is_optimistic()).unwrap();
        assert_eq!(remaining.client_ref.as_deref(), Some("b"));
    }

    #[test]
    fn repeated_reconcile_leaves_same_millisecond_draft_alone() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::AddOptimistic(draft("u1", "first", 1000, "a")));
        let s = apply(s, Action::AddOptimistic(draft("u1", "second", 1000, "b")));

        let mut first = confirmed("m1", "u1", "first", 1000);
        first.client_ref = Some("a".into());
        let action = Action::Reconcile { fingerprint: None, record: first };
        let once = apply(s, action.clone());
        let twice = apply(once.clone(), action);
        assert_eq!(once, twice);

        assert_eq!(twice.memories.len(), 2);
        let b = twice.memories.iter().find(|m| m.client_ref.as_deref() == Some("b")).unwrap();
        assert!(b.is_optimistic());
        assert_eq!(b.status, SyncStatus::Pending);
        assert!(twice.memories.iter().any(|m| m.id.as_deref() == Some("m1")));
    }

    #[test]
    fn known_id_without_nonce_does_not_consume_a_draft() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::LoadSuccess(vec![confirmed("m1", "u1", "first", 1000)]));
        let s = apply(s, Action::AddOptimistic(draft("u1", "second", 1000, "b")));
        let s = apply(s, Action::Reconcile { fingerprint: None, record: confirmed("m1", "u1", "first", 1000) });
        assert_eq!(s.memories.len(), 2);
        assert!(s.memories.iter().any(|m| m.client_ref.as_deref() == Some("b") && m.is_optimistic()));
    }

    #[test]
    fn load_answers_only_the_draft_its_nonce_names() {
        let s = ApplicationSnapshot::default();
        let s = apply(s, Action::AddOptimistic(draft("u1", "first", 1000, "a")));
        let s = apply(s, Action::AddOptimistic(draft("u1", "second", 1000, "b")));

        let mut first = confirmed("m1", "u1", "first", 1000);
        first.client_ref = Some("a".into());
        let s = apply(s, Action::LoadSuccess(vec![first]));
        assert_eq!(s.memories.len(), 2);
        let pending: Vec<_> = s.memories.iter().filter(|m| m.is_optimistic()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_ref.as_deref(), Some("b"));

        let s = apply(s, Action::LoadSuccess(vec![confirmed("m1", "u1", "first", 1000)]));
        assert!(s.memories.iter().all(|m| !m.is_optimistic()));
    }

    #[test]
    fn never_duplicates_backend_ids() {
        let actions = vec![
            Action::LoadSuccess(vec![confirmed("m1", "u1", "a", 1), confirmed("m1", "u1", "a", 1)]),
            Action::Reconcile { fingerprint: None, record: confirmed("m1", "u1", "a", 1) },
            Action::AddOptimistic(draft("u1", "b", 2, "n")),
            Action::Reconcile { fingerprint: None, record: confirmed("m2", "u1", "b", 2) },
            Action::Reconcile { fingerprint: None, record: confirmed("m2", "u1", "b", 2) },
            Action::Update(confirmed("m2", "u1", "b2", 3)),
            Action::LoadSuccess(vec![confirmed("m2", "u1", "b2", 3), confirmed("m3", "u1", "c", 4)]),
            Action::InsightAdded(insight("i1", 1)),
            Action::InsightAdded(insight("i1", 2)),
        ];
        let mut s = ApplicationSnapshot::default();
        for a in actions {
            s = apply(s, a);
            let ids: Vec<_> = s.memories.iter().filter_map(|m| m.id.clone()).collect();
            let unique: HashSet<_> = ids.iter().collect();
            assert_eq!(ids.len(), unique.len());
            let iids: HashSet<_> = s.insights.iter().map(|i| i.id.clone()).collect();
            assert_eq!(iids.len(), s.insights.len());
        }
    }

    #[test]
    fn failed_draft_stays_visible_and_heals() {
        let s = apply(ApplicationSnapshot::default(), Action::AddOptimistic(draft("u1", "x", 1000, "n1")));
        let fp = Fingerprint { owner_id: UserId::new("u1"), timestamp: 1000, nonce: "n1".into() };
        let s = apply(s, Action::OptimisticFailed(fp.clone()));
        assert_eq!(s.memories.len(), 1);
        assert_eq!(s.memories[0].status, SyncStatus::Failed);

        let s = apply(s, Action::Reconcile { fingerprint: Some(fp), record: confirmed("m1", "u1", "x", 1000) });
        assert_eq!(s.memories.len(), 1);
        assert_eq!(s.memories[0].status, SyncStatus::Confirmed);
    }

    #[test]
    fn load_success_keeps_unanswered_drafts() {
        let s = apply(ApplicationSnapshot::default(), Action::AddOptimistic(draft("u1", "pending", 3000, "n")));
        let s = apply(s, Action::LoadSuccess(vec![confirmed("m1", "u1", "a", 1000)]));
        assert_eq!(s.memories.len(), 2);
        assert!(s.memories[0].is_optimistic());
        assert!(!s.memories_loading);
    }

    #[test]
    fn insight_ring_drops_oldest() {
        let mut s = ApplicationSnapshot::default();
        for (i, ts) in [(1, 10), (2, 40), (3, 20), (4, 30)] {
            s = apply(s, Action::InsightAdded(insight(&format!("i{}", i), ts)));
        }
        let ids: Vec<_> = s.insights.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i2", "i4", "i3"]);
    }

    #[test]
    fn memory_cap_drops_oldest() {
        let small = StoreLimits { max_memories: 2, insight_ring: 10, max_history: 10 };
        let mut s = ApplicationSnapshot::default();
        for (id, ts) in [("a", 3), ("b", 1), ("c", 2)] {
            s = reduce(&s, &Action::Reconcile { fingerprint: None, record: confirmed(id, "u1", id, ts) }, &small)
                .unwrap_or(s);
        }
        let ids: Vec<_> = s.memories.iter().filter_map(|m| m.id.as_deref()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn unknown_and_unmatched_actions_are_noops() {
        let s = ApplicationSnapshot::default();
        assert!(reduce(&s, &Action::Unknown, &limits()).is_none());
        assert!(reduce(&s, &Action::Delete("missing".into()), &limits()).is_none());
        assert!(reduce(&s, &Action::Update(confirmed("missing", "u1", "x", 1)), &limits()).is_none());
        assert!(reduce(&s, &Action::ClearError, &limits()).is_none());
    }

    #[test]
    fn identity_change_clears_user_data() {
        let s = apply(ApplicationSnapshot::default(), Action::IdentityChanged(Some(UserId::new("u1"))));
        let s = apply(s, Action::ConnectionChanged(ConnectionState::Connected));
        let s = apply(s, Action::LoadSuccess(vec![confirmed("m1", "u1", "a", 1)]));
        let s = apply(s, Action::IdentityChanged(Some(UserId::new("u2"))));
        assert!(s.memories.is_empty());
        assert_eq!(s.identity, Some(UserId::new("u2")));
        assert_eq!(s.connection, ConnectionState::Connected);
    }

    #[test]
    fn set_error_clears_loading_and_revision_advances() {
        let s = apply(ApplicationSnapshot::default(), Action::LoadStart);
        assert!(s.memories_loading);
        let rev = s.revision;
        let s = apply(s, Action::SetError("feed down".into()));
        assert!(!s.memories_loading);
        assert_eq!(s.error.as_deref(), Some("feed down"));
        assert_eq!(s.revision, rev + 1);
    }

    #[test]
    fn chat_history_is_bounded() {
        let mut s = ApplicationSnapshot::default();
        s = apply(s, Action::TypingChanged(true));
        for i in 0..6 {
            s = apply(
                s,
                Action::ChatMessageReceived(ChatMessage {
                    id: format!("c{}", i),
                    content: "hi".into(),
                    sender: ChatSender::Assistant,
                    timestamp: i,
                    kind: Default::default(),
                    metadata: None,
                }),
            );
        }
        assert_eq!(s.chat.history.len(), 4);
        assert_eq!(s.chat.history[0].id, "c2");
        assert!(!s.chat.typing);
    }
}

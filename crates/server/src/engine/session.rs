//! Session progress accounting.
//!
//! Counters keyed by (session owner, session) let callers follow the progress of
//! their submissions. They never influence scheduling.

use crate::metrics::SESSION_REQUESTS;
use std::collections::HashMap;
use std::sync::Mutex;
use stowage_core::{FileRequest, RequestKind, RequestStatus};

/// Which counter a request contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCounter {
    /// TO_DO, PENDING, RUNNING or DELAYED.
    Running,
    Error,
    Success,
}

impl SessionCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    /// Counter a live request with `status` is accounted under.
    pub fn for_status(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Error => Self::Error,
            _ => Self::Running,
        }
    }
}

/// Receives counter changes.
pub trait SessionNotifier: Send + Sync {
    fn add(
        &self,
        kind: RequestKind,
        session_owner: &str,
        session: &str,
        counter: SessionCounter,
        delta: i64,
    );
}

/// Move one request from one counter to another. Requests without a session are skipped.
pub fn transition(
    notifier: &dyn SessionNotifier,
    request: &FileRequest,
    from: Option<SessionCounter>,
    to: Option<SessionCounter>,
) {
    if request.session_owner.is_empty() {
        return;
    }
    if let Some(from) = from {
        notifier.add(
            request.kind,
            &request.session_owner,
            &request.session,
            from,
            -1,
        );
    }
    if let Some(to) = to {
        notifier.add(request.kind, &request.session_owner, &request.session, to, 1);
    }
}

type SessionKey = (RequestKind, String, String, SessionCounter);

/// Keeps counters in process memory and mirrors per-kind totals in a gauge.
#[derive(Debug, Default)]
pub struct InMemorySessionNotifier {
    counters: Mutex<HashMap<SessionKey, i64>>,
}

impl InMemorySessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter.
    pub fn get(
        &self,
        kind: RequestKind,
        session_owner: &str,
        session: &str,
        counter: SessionCounter,
    ) -> i64 {
        let key = (kind, session_owner.to_string(), session.to_string(), counter);
        self.counters
            .lock()
            .map(|counters| counters.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl SessionNotifier for InMemorySessionNotifier {
    fn add(
        &self,
        kind: RequestKind,
        session_owner: &str,
        session: &str,
        counter: SessionCounter,
        delta: i64,
    ) {
        let key = (kind, session_owner.to_string(), session.to_string(), counter);
        if let Ok(mut counters) = self.counters.lock() {
            let value = counters.entry(key).or_insert(0);
            *value += delta;
        }
        SESSION_REQUESTS
            .with_label_values(&[kind.as_str(), counter.as_str()])
            .add(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn request(session_owner: &str) -> FileRequest {
        let now = OffsetDateTime::now_utc();
        FileRequest {
            id: 1,
            kind: RequestKind::Cache,
            checksum: "abc".to_string(),
            backend: "tape".to_string(),
            status: RequestStatus::ToDo,
            group_ids: BTreeSet::new(),
            owners: BTreeSet::new(),
            session_owner: session_owner.to_string(),
            session: "s1".to_string(),
            job_id: None,
            error_cause: None,
            file_name: None,
            origin_url: None,
            file_size: 0,
            storage_subdirectory: None,
            force_delete: false,
            expiration_date: None,
            cache_group_id: None,
            storage_group_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn transition_moves_between_counters() {
        let notifier = InMemorySessionNotifier::new();
        let request = request("alice");
        transition(&notifier, &request, None, Some(SessionCounter::Running));
        transition(
            &notifier,
            &request,
            Some(SessionCounter::Running),
            Some(SessionCounter::Error),
        );

        let get = |counter| notifier.get(RequestKind::Cache, "alice", "s1", counter);
        assert_eq!(get(SessionCounter::Running), 0);
        assert_eq!(get(SessionCounter::Error), 1);
        assert_eq!(get(SessionCounter::Success), 0);
    }

    #[test]
    fn requests_without_session_are_not_counted() {
        let notifier = InMemorySessionNotifier::new();
        transition(&notifier, &request(""), None, Some(SessionCounter::Running));
        assert_eq!(
            notifier.get(RequestKind::Cache, "", "s1", SessionCounter::Running),
            0
        );
    }

    #[test]
    fn status_maps_to_counter() {
        assert_eq!(
            SessionCounter::for_status(RequestStatus::Delayed),
            SessionCounter::Running
        );
        assert_eq!(
            SessionCounter::for_status(RequestStatus::Error),
            SessionCounter::Error
        );
    }
}

//! # Call Registry
//!
//! Tracks the calls currently owned by the server and enforces the
//! concurrent call limit.
//!
//! ## Thread Safety:
//! The map sits behind an `RwLock`: lookups from HTTP handlers share the read
//! lock, registration and removal take the write lock. Sessions are handed
//! out as `Arc<CallSession>` so callers never hold the lock while awaiting.

use crate::call::session::{CallSession, CallSummary};
use crate::error::CallError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub struct CallRegistry {
    calls: RwLock<HashMap<String, Arc<CallSession>>>,
    max_concurrent_calls: AtomicUsize,
}

/// Registry overview for the API.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_calls: usize,
    pub max_calls: usize,
    pub status_counts: HashMap<String, usize>,
    pub total_packets_queued: u64,
    pub total_packets_dropped: u64,
    pub calls: Vec<CallSummary>,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_concurrent_calls: AtomicUsize::new(max_concurrent_calls),
        }
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls.load(Ordering::Relaxed)
    }

    /// Applies to registrations made afterwards; running calls are kept.
    pub fn set_max_concurrent_calls(&self, max: usize) {
        self.max_concurrent_calls.store(max, Ordering::Relaxed);
    }

    /// Add a call.
    ///
    /// Fails when the limit is reached or the id is already taken.
    pub fn register(&self, session: Arc<CallSession>) -> Result<(), CallError> {
        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);

        let max = self.max_concurrent_calls();
        if calls.len() >= max {
            return Err(CallError::CapacityExceeded(format!(
                "maximum concurrent calls ({}) reached",
                max
            )));
        }

        if calls.contains_key(session.id()) {
            return Err(CallError::CapacityExceeded(format!(
                "call id '{}' is already registered",
                session.id()
            )));
        }

        calls.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);
        calls.remove(call_id)
    }

    pub fn active_count(&self) -> usize {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.len()
    }

    pub fn call_ids(&self) -> Vec<String> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.keys().cloned().collect()
    }

    /// Every registered call, for shutdown.
    pub fn sessions(&self) -> Vec<Arc<CallSession>> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.values().cloned().collect()
    }

    /// Drop calls that already ended. Returns how many were removed.
    pub fn prune_ended(&self) -> usize {
        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);
        let before = calls.len();
        calls.retain(|_, session| !session.status().is_terminal());
        before - calls.len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);

        let mut status_counts = HashMap::new();
        let mut total_packets_queued = 0;
        let mut total_packets_dropped = 0;
        let mut summaries = Vec::with_capacity(calls.len());

        for session in calls.values() {
            let summary = session.summary();
            *status_counts
                .entry(summary.status.as_str().to_string())
                .or_insert(0) += 1;
            total_packets_queued += summary.stats.packets_queued;
            total_packets_dropped += summary.stats.packets_dropped;
            summaries.push(summary);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        RegistrySummary {
            total_calls: calls.len(),
            max_calls: self.max_concurrent_calls(),
            status_counts,
            total_packets_queued,
            total_packets_dropped,
            calls: summaries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::testing::{FakeCapture, FakeOutput};
    use crate::call::transport::testing::ScriptedTransport;
    use crate::config::AppConfig;

    fn session(id: &str) -> Arc<CallSession> {
        let (capture, _) = FakeCapture::new();
        let (output, _) = FakeOutput::new();
        Arc::new(CallSession::new(
            id,
            AppConfig::default().call,
            Arc::new(ScriptedTransport::new()),
            Box::new(capture),
            Box::new(output),
        ))
    }

    #[test]
    fn test_register_respects_limit() {
        let registry = CallRegistry::new(2);
        registry.register(session("a")).unwrap();
        registry.register(session("b")).unwrap();

        let err = registry.register(session("c")).unwrap_err();
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(registry.active_count(), 2);

        assert!(registry.remove("a").is_some());
        registry.register(session("c")).unwrap();
        assert!(registry.get("c").is_some());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = CallRegistry::new(5);
        registry.register(session("a")).unwrap();
        assert!(registry.register(session("a")).is_err());
    }

    #[tokio::test]
    async fn test_summary_and_prune() {
        let registry = CallRegistry::new(5);
        let ended = session("a");
        registry.register(ended.clone()).unwrap();
        registry.register(session("b")).unwrap();
        ended.end().await;

        let summary = registry.summary();
        assert_eq!(summary.total_calls, 2);
        assert_eq!(summary.status_counts.get("ended"), Some(&1));
        assert_eq!(summary.status_counts.get("connecting"), Some(&1));

        assert_eq!(registry.prune_ended(), 1);
        assert_eq!(registry.call_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_lowering_limit_keeps_running_calls() {
        let registry = CallRegistry::new(3);
        registry.register(session("a")).unwrap();
        registry.register(session("b")).unwrap();

        registry.set_max_concurrent_calls(1);

        assert_eq!(registry.active_count(), 2);
        assert!(registry.register(session("c")).is_err());
    }
}

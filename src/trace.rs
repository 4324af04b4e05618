//! Trace identity
//!
//! A trace groups every event of one logical checkout workflow. Without a
//! workflow key the trace id lives and dies with the tracker. With one, the id
//! is persisted as `{trace_id, expires_at}` and reused by any tracker created
//! for the same workflow before it expires. Each read slides the expiry
//! forward by [`TRACE_ID_TTL_MS`]; [`TraceIdentity::id`] reads without
//! touching the store.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::KeyValueStore;

const TRACE_ID_PREFIX: &str = "rc_trace_id";

/// One hour
pub const TRACE_ID_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Serialize, Deserialize)]
struct StoredTraceId {
    trace_id: String,
    expires_at: i64,
}

/// Persistence backing for a workflow-scoped trace
struct WorkflowPersistence {
    workflow_identifier: String,
    store: Arc<dyn KeyValueStore>,
}

impl WorkflowPersistence {
    fn storage_key(&self) -> String {
        format!("{}_{}", TRACE_ID_PREFIX, self.workflow_identifier)
    }
}

/// Stable trace identifier for a tracker, optionally persisted per workflow
pub struct TraceIdentity {
    trace_id: String,
    persistence: Option<WorkflowPersistence>,
    clock: Arc<dyn Clock>,
    next_index: AtomicU64,
}

impl TraceIdentity {
    /// Trace id generated once for this instance and never persisted
    pub fn ephemeral(clock: Arc<dyn Clock>) -> Self {
        trace!("No workflow identifier provided, generating ephemeral trace_id");
        Self {
            trace_id: Uuid::new_v4().to_string(),
            persistence: None,
            clock,
            next_index: AtomicU64::new(0),
        }
    }

    /// Trace id loaded from `store` when still valid, otherwise generated and persisted
    pub fn for_workflow(
        workflow_identifier: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persistence = WorkflowPersistence {
            workflow_identifier: workflow_identifier.into(),
            store,
        };

        let (trace_id, loaded) = match load_from_store(&persistence, clock.as_ref()) {
            Some(existing) => (existing, true),
            None => (Uuid::new_v4().to_string(), false),
        };

        let identity = Self {
            trace_id,
            persistence: Some(persistence),
            clock,
            next_index: AtomicU64::new(0),
        };

        if loaded {
            debug!(
                workflow = identity.workflow_identifier().unwrap_or_default(),
                "Loaded existing trace_id"
            );
        } else {
            identity.refresh_ttl();
            debug!(
                workflow = identity.workflow_identifier().unwrap_or_default(),
                "Generated new trace_id"
            );
        }

        identity
    }

    /// Current trace id; extends the persisted expiry as a side effect
    pub fn trace_id(&self) -> String {
        self.refresh_ttl();
        self.trace_id.clone()
    }

    /// Current trace id without touching the persisted expiry
    pub fn id(&self) -> &str {
        &self.trace_id
    }

    pub fn workflow_identifier(&self) -> Option<&str> {
        self.persistence
            .as_ref()
            .map(|p| p.workflow_identifier.as_str())
    }

    /// Position of the next event within this trace
    pub fn next_trace_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove the persisted trace for this workflow
    pub fn clear(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        match persistence.store.remove(&persistence.storage_key()) {
            Ok(()) => trace!(
                workflow = %persistence.workflow_identifier,
                "Cleared trace_id"
            ),
            Err(e) => debug!(error = %e, "Failed to clear trace_id from store"),
        }
    }

    fn refresh_ttl(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        let data = StoredTraceId {
            trace_id: self.trace_id.clone(),
            expires_at: self.clock.now_ms() + TRACE_ID_TTL_MS,
        };

        let result = serde_json::to_string(&data)
            .map_err(crate::errors::EventsError::from)
            .and_then(|json| persistence.store.set(&persistence.storage_key(), &json));

        match result {
            Ok(()) => trace!(
                workflow = %persistence.workflow_identifier,
                "Refreshed trace_id TTL"
            ),
            // The in-memory trace id stays valid
            Err(e) => debug!(error = %e, "Failed to refresh trace_id TTL"),
        }
    }
}

fn load_from_store(persistence: &WorkflowPersistence, clock: &dyn Clock) -> Option<String> {
    let key = persistence.storage_key();

    let raw = match persistence.store.get(&key) {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            trace!(workflow = %persistence.workflow_identifier, "No stored trace_id found");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "Failed to load trace_id from store");
            return None;
        }
    };

    let data: StoredTraceId = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => {
            debug!(
                workflow = %persistence.workflow_identifier,
                error = %e,
                "Invalid stored trace_id data"
            );
            let _ = persistence.store.remove(&key);
            return None;
        }
    };

    if data.trace_id.is_empty() {
        let _ = persistence.store.remove(&key);
        return None;
    }

    if clock.now_ms() > data.expires_at {
        debug!(workflow = %persistence.workflow_identifier, "Stored trace_id has expired");
        let _ = persistence.store.remove(&key);
        return None;
    }

    Some(data.trace_id)
}

impl std::fmt::Debug for TraceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceIdentity")
            .field("trace_id", &self.trace_id)
            .field("workflow_identifier", &self.workflow_identifier())
            .finish()
    }
}

//! Connection admission control.
//!
//! Every WebSocket upgrade reserves a slot before the handshake completes.
//! The slot is held by an [`AdmissionGuard`] and released when it drops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::timestamp_now;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Default ceiling on concurrently admitted connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("connection capacity exceeded ({max} connections)")]
    CapacityExceeded { max: usize },
}

/// A tracked connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub peer_addr: Option<String>,
    /// Unix milliseconds.
    pub connected_at: u64,
}

/// Tracks admitted connections against a fixed ceiling.
pub struct ConnectionAdmission {
    max_connections: usize,
    active: AtomicUsize,
    connections: DashMap<String, ConnectionInfo>,
}

impl ConnectionAdmission {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            max_connections,
            active: AtomicUsize::new(0),
            connections: DashMap::new(),
        })
    }

    /// Reserves a slot for a new connection.
    ///
    /// The check and the increment are one atomic step, so concurrent
    /// upgrades can never overshoot the ceiling.
    pub fn try_admit(
        self: &Arc<Self>,
        peer_addr: Option<SocketAddr>,
    ) -> Result<AdmissionGuard, AdmissionError> {
        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| AdmissionError::CapacityExceeded { max })?;

        let info = ConnectionInfo {
            id: Uuid::new_v4().to_string(),
            peer_addr: peer_addr.map(|a| a.to_string()),
            connected_at: timestamp_now(),
        };
        self.connections.insert(info.id.clone(), info.clone());

        tracing::debug!(
            connection_id = %info.id,
            peer = ?info.peer_addr,
            active = self.active(),
            "Connection admitted"
        );

        Ok(AdmissionGuard {
            admission: Arc::clone(self),
            info,
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of currently admitted connections.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    fn release(&self, id: &str) {
        self.connections.remove(id);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An admitted connection's slot. Dropping it frees the slot.
pub struct AdmissionGuard {
    admission: Arc<ConnectionAdmission>,
    info: ConnectionInfo,
}

impl AdmissionGuard {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.admission.release(&self.info.id);
        tracing::debug!(connection_id = %self.info.id, "Connection released");
    }
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("info", &self.info)
            .finish()
    }
}

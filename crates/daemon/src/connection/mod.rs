//! Client connection handling.
//!
//! [`admission`] caps the number of concurrent WebSocket connections and
//! [`protocol`] implements the per-connection message state machine.

pub mod admission;
pub mod protocol;

pub use admission::{
    AdmissionError, AdmissionGuard, ConnectionAdmission, ConnectionInfo, DEFAULT_MAX_CONNECTIONS,
};
pub use protocol::{ConnectionError, ConnectionProtocol};

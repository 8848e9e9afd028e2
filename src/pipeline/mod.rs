//! Host surface: a TCP server speaking newline-delimited JSON, one Runner per
//! connection.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod accepting;
pub mod session;

/// Live sessions and the token that shuts each one down.
pub type SessionRegistry = Arc<DashMap<Uuid, CancellationToken>>;

/// Asks every live session to dispose its Runner and close.
pub fn shutdown_sessions(sessions: &SessionRegistry) {
    for entry in sessions.iter() {
        tracing::debug!(session = %entry.key(), "Shutting down session");
        entry.value().cancel();
    }
}

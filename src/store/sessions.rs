//! In-memory store of active SRP sessions, keyed by a server-assigned
//! 32-bit id.
//!
//! The store is authoritative for session state transitions. Every
//! transition is a compare-and-set under one lock: concurrent handlers for
//! the same session race on the precondition, and the loser observes a
//! failed transition (surfaced on the wire as a session error). Expiry is
//! driven by the caller's clock — `get` and `sweep` take `now` — so tests
//! control time without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

/// Redraws allowed when a random session id collides before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CreateError {
    #[error("session id space exhausted after {MAX_ID_ATTEMPTS} draws")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created by SERVER_NEGOTIATE; waiting for the client ephemeral.
    Negotiated,
    /// Ephemerals exchanged; waiting for the client proof.
    EphemeralSent,
    /// Proof verified; the handshake answered.
    Proven,
    /// Killed by a protocol violation or failed proof; unusable.
    Dead,
}

/// One in-flight handshake.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: u32,
    pub user_id: i64,
    /// Negotiated protocol version; selects the AUTH_NEGOTIATE framing.
    pub version: u8,
    /// Client-chosen correlation id, echoed back on version 2.
    pub client_session: u32,
    pub state: SessionState,
    pub created_at: Instant,
    pub client_ephemeral: Option<Vec<u8>>,
    pub server_ephemeral: Option<Vec<u8>>,
    pub server_secret: Option<Vec<u8>>,
    /// Client proof M expected at the proof step, cached at the
    /// ephemeral step.
    pub expected_proof: Option<Vec<u8>>,
    /// Server proof HAMK sent back on success, cached likewise.
    pub server_proof: Option<Vec<u8>>,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<u32, SessionRow>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expired(&self, row: &SessionRow, now: Instant) -> bool {
        now.duration_since(row.created_at) > self.ttl
    }

    /// Create a session in NEGOTIATED with a fresh random non-zero id.
    /// Collisions with live sessions are redrawn a bounded number of times;
    /// exhaustion is the caller's cue to shed load (TRY_LATER).
    pub fn create(
        &self,
        user_id: i64,
        version: u8,
        client_session: u32,
        now: Instant,
    ) -> Result<u32, CreateError> {
        let mut sessions = self.sessions.lock();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = OsRng.next_u32();
            if id == 0 {
                continue;
            }
            if let Some(existing) = sessions.get(&id) {
                let live = existing.state != SessionState::Dead && !self.expired(existing, now);
                if live {
                    continue;
                }
            }
            sessions.insert(
                id,
                SessionRow {
                    id,
                    user_id,
                    version,
                    client_session,
                    state: SessionState::Negotiated,
                    created_at: now,
                    client_ephemeral: None,
                    server_ephemeral: None,
                    server_secret: None,
                    expected_proof: None,
                    server_proof: None,
                },
            );
            return Ok(id);
        }
        Err(CreateError::Exhausted)
    }

    /// Fetch a live session. Expired and dead sessions are indistinguishable
    /// from absent ones.
    pub fn get(&self, id: u32, now: Instant) -> Option<SessionRow> {
        let sessions = self.sessions.lock();
        let row = sessions.get(&id)?;
        if row.state == SessionState::Dead || self.expired(row, now) {
            return None;
        }
        Some(row.clone())
    }

    /// NEGOTIATED → EPHEMERAL_SENT, writing (A, B, b) and the cached proofs
    /// exactly once. A second call is a replay and fails.
    #[allow(clippy::too_many_arguments)]
    pub fn set_ephemeral(
        &self,
        id: u32,
        now: Instant,
        client_ephemeral: Vec<u8>,
        server_ephemeral: Vec<u8>,
        server_secret: Vec<u8>,
        expected_proof: Vec<u8>,
        server_proof: Vec<u8>,
    ) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(row) = sessions.get_mut(&id) else {
            return false;
        };
        if row.state != SessionState::Negotiated || self.expired(row, now) {
            return false;
        }
        row.client_ephemeral = Some(client_ephemeral);
        row.server_ephemeral = Some(server_ephemeral);
        row.server_secret = Some(server_secret);
        row.expected_proof = Some(expected_proof);
        row.server_proof = Some(server_proof);
        row.state = SessionState::EphemeralSent;
        true
    }

    /// EPHEMERAL_SENT → PROVEN. A session answers at most one proof.
    pub fn mark_proven(&self, id: u32, now: Instant) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(row) = sessions.get_mut(&id) else {
            return false;
        };
        if row.state != SessionState::EphemeralSent || self.expired(row, now) {
            return false;
        }
        row.state = SessionState::Proven;
        true
    }

    /// Any state → DEAD; the id stops resolving immediately.
    pub fn kill(&self, id: u32) {
        if let Some(row) = self.sessions.lock().get_mut(&id) {
            row.state = SessionState::Dead;
        }
    }

    /// Remove expired and dead sessions; returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, row| row.state != SessionState::Dead && !self.expired(row, now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

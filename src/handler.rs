//! Per-datagram protocol state machine.
//!
//! Each inbound datagram is handled independently: decode, consult the
//! stores, emit at most one reply. Handlers are straight-line pipelines of
//! fallible steps that short-circuit into a wire error; nothing propagates
//! past [`handle_datagram`]. Datagrams that do not decode are dropped
//! silently — the service does not reveal whether it recognized them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::srp;
use crate::store::{SessionState, SessionStore, UserStore};
use crate::wire::{
    ClientPacket, ServerPacket, SessionError, UserError, MAX_VERSION, MIN_VERSION,
};

/// Ambient state every handler invocation needs, passed explicitly.
pub struct HandlerContext {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<SessionStore>,
}

/// Handle one inbound datagram. Returns the reply to send back to the
/// source, or `None` for a silent drop.
pub fn handle_datagram(
    ctx: &HandlerContext,
    payload: &[u8],
    src: IpAddr,
    now: Instant,
) -> Option<Vec<u8>> {
    let packet = match ClientPacket::decode(payload) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::debug!(%src, %err, "dropping datagram");
            return None;
        }
    };

    let reply = match packet {
        ClientPacket::Negotiate {
            version,
            client_session,
            username,
        } => handle_negotiate(ctx, version, client_session, &username, now),
        ClientPacket::Ephemeral {
            session,
            client_ephemeral,
        } => handle_ephemeral(ctx, session, client_ephemeral, now),
        ClientPacket::Proof { session, proof } => handle_proof(ctx, session, &proof, src, now),
    };
    Some(reply.encode())
}

fn user_error(error: UserError, username: &str) -> ServerPacket {
    ServerPacket::UserError {
        error,
        username: username.to_string(),
    }
}

fn session_error(error: SessionError, session: u32) -> ServerPacket {
    ServerPacket::SessionError { error, session }
}

/// SERVER_NEGOTIATE: look the user up and open a session.
///
/// Unknown, inactive and unverified users all answer NO_EXIST so the wire
/// does not permit account enumeration.
fn handle_negotiate(
    ctx: &HandlerContext,
    version: u8,
    client_session: u32,
    username: &str,
    now: Instant,
) -> ServerPacket {
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return user_error(UserError::OutdatedProtocol, username);
    }

    let user = match ctx.users.find_by_username(username) {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(%err, "credential store read failed");
            return user_error(UserError::TryLater, username);
        }
    };
    let user = match user {
        Some(user) if user.active && user.access.may_authenticate() => user,
        _ => return user_error(UserError::NoExist, username),
    };

    let session = match ctx.sessions.create(user.id, version, client_session, now) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(%err, "session creation failed");
            return user_error(UserError::TryLater, username);
        }
    };

    tracing::debug!(user = %user.username, session, version, "session negotiated");
    ServerPacket::Negotiate {
        version,
        client_session,
        session,
        salt: user.salt,
        username: user.username,
    }
}

/// SERVER_EPHEMERAL: derive (B, b) and the session keys, then advance the
/// session with a compare-and-set. Losing the set is a replay.
fn handle_ephemeral(
    ctx: &HandlerContext,
    session: u32,
    client_ephemeral: Vec<u8>,
    now: Instant,
) -> ServerPacket {
    let Some(row) = ctx.sessions.get(session, now) else {
        return session_error(SessionError::NoExist, session);
    };
    if row.state != SessionState::Negotiated {
        return session_error(SessionError::NoExist, session);
    }

    let user = match ctx.users.find_by_id(row.user_id) {
        Ok(Some(user)) => user,
        Ok(None) => {
            // User deleted mid-handshake.
            ctx.sessions.kill(session);
            return session_error(SessionError::NoExist, session);
        }
        Err(err) => {
            tracing::warn!(%err, "credential store read failed");
            return session_error(SessionError::TryLater, session);
        }
    };

    let ephemeral = srp::server_ephemeral(&user.verifier);
    let keys = match srp::session_keys(
        &user.username,
        &user.salt,
        &user.verifier,
        &client_ephemeral,
        &ephemeral.secret,
        &ephemeral.public,
    ) {
        Ok(keys) => keys,
        Err(err) => {
            tracing::debug!(session, %err, "unsafe client ephemeral");
            ctx.sessions.kill(session);
            return session_error(SessionError::VerifierUnsafe, session);
        }
    };

    let advanced = ctx.sessions.set_ephemeral(
        session,
        now,
        client_ephemeral,
        ephemeral.public.clone(),
        ephemeral.secret,
        keys.expected_proof.to_vec(),
        keys.server_proof.to_vec(),
    );
    if !advanced {
        return session_error(SessionError::NoExist, session);
    }

    ServerPacket::Ephemeral {
        session,
        server_ephemeral: ephemeral.public,
    }
}

/// SERVER_PROOF: verify M in constant time; answer with HAMK or kill the
/// session.
fn handle_proof(
    ctx: &HandlerContext,
    session: u32,
    proof: &[u8],
    src: IpAddr,
    now: Instant,
) -> ServerPacket {
    let Some(row) = ctx.sessions.get(session, now) else {
        return session_error(SessionError::NoExist, session);
    };
    if row.state != SessionState::EphemeralSent {
        return session_error(SessionError::NoExist, session);
    }
    let (Some(expected), Some(server_proof)) = (row.expected_proof, row.server_proof) else {
        // EPHEMERAL_SENT always caches both; treat a gap as a dead session.
        ctx.sessions.kill(session);
        return session_error(SessionError::NoExist, session);
    };

    if !srp::verify_proof(proof, &expected) {
        tracing::info!(session, user_id = row.user_id, %src, "proof mismatch");
        ctx.sessions.kill(session);
        return session_error(SessionError::AuthFailed, session);
    }

    if !ctx.sessions.mark_proven(session, now) {
        return session_error(SessionError::NoExist, session);
    }

    if let Err(err) = ctx
        .users
        .record_auth_action(row.user_id, src, SystemTime::now())
    {
        tracing::warn!(%err, user_id = row.user_id, "failed to record auth action");
    }
    tracing::info!(session, user_id = row.user_id, %src, "authenticated");

    ServerPacket::Proof {
        session,
        proof: server_proof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::{AccessLevel, MemoryUserStore};

    const SRC: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn context() -> (Arc<MemoryUserStore>, HandlerContext) {
        let users = Arc::new(MemoryUserStore::new());
        let ctx = HandlerContext {
            users: users.clone(),
            sessions: Arc::new(SessionStore::new(Duration::from_secs(30))),
        };
        (users, ctx)
    }

    fn negotiate(ctx: &HandlerContext, username: &str, now: Instant) -> ServerPacket {
        let bytes = ClientPacket::Negotiate {
            version: 2,
            client_session: 1,
            username: username.into(),
        }
        .encode();
        let reply = handle_datagram(ctx, &bytes, SRC, now).unwrap();
        ServerPacket::decode(&reply, 2).unwrap()
    }

    #[test]
    fn garbage_is_dropped_silently() {
        let (_, ctx) = context();
        assert!(handle_datagram(&ctx, b"", SRC, Instant::now()).is_none());
        assert!(handle_datagram(&ctx, b"\xde\xad\xbe\xef rest", SRC, Instant::now()).is_none());
    }

    #[test]
    fn unknown_user_answers_no_exist() {
        let (_, ctx) = context();
        let reply = negotiate(&ctx, "mallory", Instant::now());
        assert_eq!(
            reply,
            ServerPacket::UserError {
                error: UserError::NoExist,
                username: "mallory".into(),
            }
        );
    }

    #[test]
    fn inactive_and_unverified_match_unknown_byte_for_byte() {
        let (users, ctx) = context();
        let now = Instant::now();
        users
            .create_user("ghost", "hunter2", AccessLevel::Unverified)
            .unwrap();
        users
            .create_user("shade", "hunter2", AccessLevel::User)
            .unwrap();
        users.set_active("shade", false).unwrap();

        let expected = |name: &str| {
            ServerPacket::UserError {
                error: UserError::NoExist,
                username: name.into(),
            }
            .encode()
        };
        for name in ["ghost", "shade", "never"] {
            let bytes = ClientPacket::Negotiate {
                version: 2,
                client_session: 1,
                username: name.into(),
            }
            .encode();
            let reply = handle_datagram(&ctx, &bytes, SRC, now).unwrap();
            assert_eq!(reply, expected(name), "user {name}");
        }
    }

    #[test]
    fn negotiate_opens_session_with_salt() {
        let (users, ctx) = context();
        users
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();

        match negotiate(&ctx, "alice", Instant::now()) {
            ServerPacket::Negotiate {
                client_session,
                session,
                salt,
                username,
                ..
            } => {
                assert_eq!(client_session, 1);
                assert_ne!(session, 0);
                assert_eq!(salt.len(), srp::SALT_LEN);
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn negotiate_is_case_insensitive_but_canonical() {
        let (users, ctx) = context();
        users
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();

        match negotiate(&ctx, "ALICE", Instant::now()) {
            ServerPacket::Negotiate { username, .. } => assert_eq!(username, "alice"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn ephemeral_for_unknown_session_answers_no_exist() {
        let (_, ctx) = context();
        let bytes = ClientPacket::Ephemeral {
            session: 555,
            client_ephemeral: vec![1; 256],
        }
        .encode();
        let reply = handle_datagram(&ctx, &bytes, SRC, Instant::now()).unwrap();
        assert_eq!(
            ServerPacket::decode(&reply, 2).unwrap(),
            ServerPacket::SessionError {
                error: SessionError::NoExist,
                session: 555,
            }
        );
    }

    #[test]
    fn proof_before_ephemeral_answers_no_exist() {
        let (users, ctx) = context();
        let now = Instant::now();
        users
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();
        let ServerPacket::Negotiate { session, .. } = negotiate(&ctx, "alice", now) else {
            panic!("negotiate failed");
        };

        let bytes = ClientPacket::Proof {
            session,
            proof: vec![0; 20],
        }
        .encode();
        let reply = handle_datagram(&ctx, &bytes, SRC, now).unwrap();
        assert_eq!(
            ServerPacket::decode(&reply, 2).unwrap(),
            ServerPacket::SessionError {
                error: SessionError::NoExist,
                session,
            }
        );
    }
}

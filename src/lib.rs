//! warden — SRP-6a authentication service for multiplayer game servers.
//!
//! A game server holding a player connection verifies the player's identity
//! against a central credentials database without ever observing the
//! password: the game server runs the SRP client side on the player's
//! behalf, warden runs the server side against the stored verifier. The
//! exchange rides on UDP; reliability is the client's problem (it retries),
//! confidentiality is a property of the SRP-derived session key.
//!
//! Crate layout:
//! - [`wire`] — datagram codec for the six packet types
//! - [`srp`] — SRP-6a arithmetic for the RFC 5054 2048-bit group
//! - [`store`] — credential store (SQLite) and in-memory session store
//! - [`handler`] — per-datagram protocol state machine
//! - [`listener`] — UDP socket loop and session sweeper
//! - [`config`] — TOML configuration bundle

pub mod config;
pub mod handler;
pub mod listener;
pub mod srp;
pub mod store;
pub mod wire;

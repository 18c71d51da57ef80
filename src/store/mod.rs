//! Durable credential store and in-memory session store.

pub mod sessions;
pub mod users;

pub use sessions::{SessionRow, SessionState, SessionStore};
pub use users::{AccessLevel, MemoryUserStore, SqliteUserStore, UserRow, UserStore};

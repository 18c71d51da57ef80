//! Credential store: username → (salt, verifier, access, active).
//!
//! The authentication core only reads this store; the companion web app and
//! admin tooling write through the same interface (`create_user`,
//! `set_password`, `set_access`, `set_active`). Salt and verifier are only
//! ever written together — a password is one atomic (salt, verifier) pair.
//!
//! Backends:
//! - `SqliteUserStore`: durable, WAL-mode SQLite keyed by the DSN in
//!   `database.uri`.
//! - `MemoryUserStore`: HashMap-backed, for tests and ephemeral setups.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::srp;

/// Usernames are 1-32 bytes of printable ASCII, stored lowercase.
pub const MAX_USERNAME_LEN: usize = 32;

/// Role tag on a user row. Everything except `Unverified` may authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Owner,
    Master,
    Op,
    User,
    Unverified,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Master => "master",
            Self::Op => "op",
            Self::User => "user",
            Self::Unverified => "unverified",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "owner" => Some(Self::Owner),
            "master" => Some(Self::Master),
            "op" => Some(Self::Op),
            "user" => Some(Self::User),
            "unverified" => Some(Self::Unverified),
            _ => None,
        }
    }

    pub fn may_authenticate(self) -> bool {
        !matches!(self, Self::Unverified)
    }
}

/// A credential row as the core sees it.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
    pub access: AccessLevel,
    pub active: bool,
}

/// Read interface the protocol handler depends on. Reads may proceed
/// concurrently; the handler never writes credentials.
pub trait UserStore: Send + Sync {
    /// Case-insensitive lookup; the canonical key is lowercase.
    fn find_by_username(&self, name: &str) -> Result<Option<UserRow>>;

    fn find_by_id(&self, id: i64) -> Result<Option<UserRow>>;

    /// Append an `auth` action for audit. Fire-and-forget from the
    /// handler's perspective: a failure is logged, never sent on the wire.
    fn record_auth_action(&self, user_id: i64, ip: IpAddr, at: SystemTime) -> Result<()>;
}

/// Lowercase and validate a username; `None` means it can never match a row.
fn normalize_username(name: &str) -> Option<String> {
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return None;
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

fn epoch_secs(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

// ── SQLite backend ──────────────────────────────────────────────────

pub struct SqliteUserStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteUserStore {
    /// Open (or create) the credential database at the given DSN.
    pub fn open(uri: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(uri)
            .with_context(|| format!("failed to open credential store at {uri}"))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                salt BLOB NOT NULL,
                verifier BLOB NOT NULL,
                access TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                ip TEXT,
                at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_user ON actions(user_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a new user. Returns the row id.
    pub fn create_user(&self, username: &str, password: &str, access: AccessLevel) -> Result<i64> {
        let Some(username) = normalize_username(username) else {
            bail!("invalid username (1-{MAX_USERNAME_LEN} printable ASCII bytes)");
        };
        let salt = srp::generate_salt();
        let verifier = srp::compute_verifier(&salt, &username, password);

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (username, salt, verifier, access, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            rusqlite::params![username, salt.as_slice(), verifier, access.as_str()],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("username '{username}' is already taken")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Regenerate the (salt, verifier) pair for a new password.
    pub fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let Some(username) = normalize_username(username) else {
            bail!("invalid username");
        };
        let salt = srp::generate_salt();
        let verifier = srp::compute_verifier(&salt, &username, password);

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET salt = ?1, verifier = ?2 WHERE username = ?3",
            rusqlite::params![salt.as_slice(), verifier, username],
        )?;
        if updated == 0 {
            bail!("no such user '{username}'");
        }
        Ok(())
    }

    pub fn set_access(&self, username: &str, access: AccessLevel) -> Result<()> {
        let Some(username) = normalize_username(username) else {
            bail!("invalid username");
        };
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET access = ?1 WHERE username = ?2",
            rusqlite::params![access.as_str(), username],
        )?;
        if updated == 0 {
            bail!("no such user '{username}'");
        }
        Ok(())
    }

    pub fn set_active(&self, username: &str, active: bool) -> Result<()> {
        let Some(username) = normalize_username(username) else {
            bail!("invalid username");
        };
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET active = ?1 WHERE username = ?2",
            rusqlite::params![active, username],
        )?;
        if updated == 0 {
            bail!("no such user '{username}'");
        }
        Ok(())
    }
}

impl SqliteUserStore {
    fn query_one(&self, sql: &str, param: &dyn rusqlite::ToSql) -> Result<Option<UserRow>> {
        let conn = self.conn.lock();
        let result = conn.query_row(sql, [param], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        });
        match result {
            Ok((id, username, salt, verifier, access_text, active)) => {
                let Some(access) = AccessLevel::parse(&access_text) else {
                    bail!("corrupt access level '{access_text}' for user {id}");
                };
                Ok(Some(UserRow {
                    id,
                    username,
                    salt,
                    verifier,
                    access,
                    active,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl UserStore for SqliteUserStore {
    fn find_by_username(&self, name: &str) -> Result<Option<UserRow>> {
        let Some(username) = normalize_username(name) else {
            return Ok(None);
        };
        self.query_one(
            "SELECT id, username, salt, verifier, access, active FROM users WHERE username = ?1",
            &username,
        )
    }

    fn find_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.query_one(
            "SELECT id, username, salt, verifier, access, active FROM users WHERE id = ?1",
            &id,
        )
    }

    fn record_auth_action(&self, user_id: i64, ip: IpAddr, at: SystemTime) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO actions (user_id, action, ip, at) VALUES (?1, 'auth', ?2, ?3)",
            rusqlite::params![user_id, ip.to_string(), epoch_secs(at)],
        )?;
        Ok(())
    }
}

// ── In-memory backend ───────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, UserRow>,
    actions: Vec<(i64, IpAddr, i64)>,
    next_id: i64,
}

/// HashMap-backed store with the same semantics as the SQLite backend.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(&self, username: &str, password: &str, access: AccessLevel) -> Result<i64> {
        let Some(username) = normalize_username(username) else {
            bail!("invalid username (1-{MAX_USERNAME_LEN} printable ASCII bytes)");
        };
        let salt = srp::generate_salt();
        let verifier = srp::compute_verifier(&salt, &username, password);

        let mut inner = self.inner.lock();
        if inner.users.contains_key(&username) {
            bail!("username '{username}' is already taken");
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.users.insert(
            username.clone(),
            UserRow {
                id,
                username,
                salt: salt.to_vec(),
                verifier,
                access,
                active: true,
            },
        );
        Ok(id)
    }

    pub fn set_active(&self, username: &str, active: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.users.get_mut(username) {
            Some(user) => {
                user.active = active;
                Ok(())
            }
            None => bail!("no such user '{username}'"),
        }
    }

    pub fn set_access(&self, username: &str, access: AccessLevel) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.users.get_mut(username) {
            Some(user) => {
                user.access = access;
                Ok(())
            }
            None => bail!("no such user '{username}'"),
        }
    }

    /// Recorded `auth` actions, for assertions in tests.
    pub fn auth_actions(&self) -> Vec<(i64, IpAddr)> {
        self.inner
            .lock()
            .actions
            .iter()
            .map(|(id, ip, _)| (*id, *ip))
            .collect()
    }
}

impl UserStore for MemoryUserStore {
    fn find_by_username(&self, name: &str) -> Result<Option<UserRow>> {
        let Some(username) = normalize_username(name) else {
            return Ok(None);
        };
        Ok(self.inner.lock().users.get(&username).cloned())
    }

    fn find_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|user| user.id == id)
            .cloned())
    }

    fn record_auth_action(&self, user_id: i64, ip: IpAddr, at: SystemTime) -> Result<()> {
        self.inner.lock().actions.push((user_id, ip, epoch_secs(at)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_store() -> (TempDir, SqliteUserStore) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("users.db");
        let store = SqliteUserStore::open(path.to_str().unwrap()).unwrap();
        (tmp, store)
    }

    #[test]
    fn create_and_find() {
        let (_tmp, store) = sqlite_store();
        let id = store
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();

        let user = store.find_by_username("alice").unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.username, "alice");
        assert_eq!(user.salt.len(), srp::SALT_LEN);
        assert!(user.active);
        assert!(user.access.may_authenticate());
    }

    #[test]
    fn find_is_case_insensitive_and_stores_lowercase() {
        let (_tmp, store) = sqlite_store();
        store
            .create_user("Alice", "hunter2", AccessLevel::User)
            .unwrap();

        let user = store.find_by_username("ALICE").unwrap().unwrap();
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn duplicate_username_fails() {
        let (_tmp, store) = sqlite_store();
        store
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();
        let err = store.create_user("ALICE", "other", AccessLevel::User);
        assert!(err.unwrap_err().to_string().contains("already taken"));
    }

    #[test]
    fn invalid_usernames_rejected_on_create() {
        let (_tmp, store) = sqlite_store();
        let too_long = "x".repeat(33);
        for name in ["", "has space", too_long.as_str()] {
            assert!(store.create_user(name, "hunter2", AccessLevel::User).is_err());
        }
    }

    #[test]
    fn invalid_username_lookup_is_not_found() {
        let (_tmp, store) = sqlite_store();
        assert!(store.find_by_username("").unwrap().is_none());
        assert!(store.find_by_username("has space").unwrap().is_none());
    }

    #[test]
    fn missing_user_is_none() {
        let (_tmp, store) = sqlite_store();
        assert!(store.find_by_username("mallory").unwrap().is_none());
        assert!(store.find_by_id(999).unwrap().is_none());
    }

    #[test]
    fn set_password_replaces_salt_and_verifier_together() {
        let (_tmp, store) = sqlite_store();
        store
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();
        let before = store.find_by_username("alice").unwrap().unwrap();

        store.set_password("alice", "hunter3").unwrap();
        let after = store.find_by_username("alice").unwrap().unwrap();

        assert_ne!(before.salt, after.salt);
        assert_ne!(before.verifier, after.verifier);
        assert_eq!(
            after.verifier,
            srp::compute_verifier(&after.salt, "alice", "hunter3")
        );
    }

    #[test]
    fn access_and_active_flags_round_trip() {
        let (_tmp, store) = sqlite_store();
        store
            .create_user("alice", "hunter2", AccessLevel::Unverified)
            .unwrap();

        let user = store.find_by_username("alice").unwrap().unwrap();
        assert_eq!(user.access, AccessLevel::Unverified);
        assert!(!user.access.may_authenticate());

        store.set_access("alice", AccessLevel::Op).unwrap();
        store.set_active("alice", false).unwrap();
        let user = store.find_by_username("alice").unwrap().unwrap();
        assert_eq!(user.access, AccessLevel::Op);
        assert!(!user.active);
    }

    #[test]
    fn records_auth_actions() {
        let (_tmp, store) = sqlite_store();
        let id = store
            .create_user("alice", "hunter2", AccessLevel::User)
            .unwrap();
        store
            .record_auth_action(id, "127.0.0.1".parse().unwrap(), SystemTime::now())
            .unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM actions WHERE user_id = ?1 AND action = 'auth'",
                [id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn memory_store_matches_sqlite_semantics() {
        let store = MemoryUserStore::new();
        let id = store
            .create_user("Alice", "hunter2", AccessLevel::User)
            .unwrap();

        let user = store.find_by_username("ALICE").unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(store.find_by_id(id).unwrap().unwrap().id, id);
        assert!(store.create_user("alice", "x", AccessLevel::User).is_err());

        store
            .record_auth_action(id, "10.0.0.1".parse().unwrap(), SystemTime::now())
            .unwrap();
        assert_eq!(store.auth_actions(), vec![(id, "10.0.0.1".parse().unwrap())]);
    }

    #[test]
    fn access_levels_parse_round_trip() {
        for level in [
            AccessLevel::Owner,
            AccessLevel::Master,
            AccessLevel::Op,
            AccessLevel::User,
            AccessLevel::Unverified,
        ] {
            assert_eq!(AccessLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(AccessLevel::parse("sudo"), None);
    }
}

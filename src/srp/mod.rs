//! Server-side SRP-6a engine for the RFC 5054 2048-bit group with SHA-1.
//!
//! Encoding conventions shared with the game-server client side: group
//! elements (A, B, S, v) are padded to the 256-byte width of N before
//! hashing and transmission; `k = H(N | PAD(g))`, `u = H(PAD(A) | PAD(B))`,
//! `x = H(salt | H(username ':' password))`, `K = H(PAD(S))`,
//! `M = H(H(N) xor H(g) | H(username) | salt | PAD(A) | PAD(B) | K)`,
//! `HAMK = H(PAD(A) | M | K)`. Usernames must be lowercased by the caller
//! before they reach the engine.
//!
//! All functions are pure with respect to their inputs (plus the RNG for
//! ephemeral generation) and never log anything.

pub mod client;
pub mod group;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use self::group::{generator, modulus, GROUP_LEN_BYTES};

/// SHA-1 output width: proofs, session keys and x are this long.
pub const PROOF_LEN: usize = 20;

/// Salt width used when provisioning credentials. The wire tolerates any
/// 1-255 byte salt; generation is fixed at four bytes.
pub const SALT_LEN: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SrpError {
    #[error("client ephemeral is divisible by the group modulus")]
    UnsafeClientEphemeral,
    #[error("server ephemeral is divisible by the group modulus")]
    UnsafeServerEphemeral,
    #[error("scrambling parameter is zero")]
    ZeroScramblingParameter,
}

/// A freshly generated server ephemeral pair.
pub struct ServerEphemeral {
    /// B, padded to the group width; goes out in AUTH_EPHEMERAL.
    pub public: Vec<u8>,
    /// b, the private exponent; never leaves the process.
    pub secret: Vec<u8>,
}

/// Everything the proof step needs, derived once per session.
#[derive(Debug)]
pub struct SessionKeys {
    /// Shared session key K, available to upper layers after proof.
    pub key: [u8; PROOF_LEN],
    /// The client proof M this server expects.
    pub expected_proof: [u8; PROOF_LEN],
    /// The server proof HAMK sent back after a matching M.
    pub server_proof: [u8; PROOF_LEN],
}

/// Generate a fresh credential salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the password verifier `v = g^x mod N`, padded to the group width.
/// `username` must already be lowercase.
pub fn compute_verifier(salt: &[u8], username: &str, password: &str) -> Vec<u8> {
    let x = private_key(salt, username, password);
    let v = generator().modpow(&x, modulus());
    pad(&v.to_bytes_be(), GROUP_LEN_BYTES)
}

/// Generate `(B, b)` for a session: `b` uniform in [1, N-1],
/// `B = (k*v + g^b) mod N`, regenerated in the unlikely event B ≡ 0.
pub fn server_ephemeral(verifier: &[u8]) -> ServerEphemeral {
    let n = modulus();
    let v = BigUint::from_bytes_be(verifier);
    let k = multiplier();
    loop {
        let b = random_exponent();
        let g_b = generator().modpow(&b, n);
        let b_pub = (&k * &v + g_b) % n;
        if b_pub.is_zero() {
            continue;
        }
        return ServerEphemeral {
            public: pad(&b_pub.to_bytes_be(), GROUP_LEN_BYTES),
            secret: b.to_bytes_be(),
        };
    }
}

/// Derive the shared key and both proofs from the session's ephemeral
/// material. Rejects A ≡ 0 (mod N) and u = 0, the two unsafe inputs a
/// hostile client can force.
pub fn session_keys(
    username: &str,
    salt: &[u8],
    verifier: &[u8],
    client_ephemeral: &[u8],
    server_secret: &[u8],
    server_ephemeral: &[u8],
) -> Result<SessionKeys, SrpError> {
    let n = modulus();
    let a = BigUint::from_bytes_be(client_ephemeral);
    if (&a % n).is_zero() {
        return Err(SrpError::UnsafeClientEphemeral);
    }

    let a_pad = pad(client_ephemeral, GROUP_LEN_BYTES);
    let b_pad = pad(server_ephemeral, GROUP_LEN_BYTES);
    let u = hash_to_int(&[&a_pad, &b_pad]);
    if (&u % n).is_zero() {
        return Err(SrpError::ZeroScramblingParameter);
    }

    // S = (A * v^u) ^ b mod N
    let v = BigUint::from_bytes_be(verifier);
    let b = BigUint::from_bytes_be(server_secret);
    let a_vu = (a * v.modpow(&u, n)) % n;
    let s = a_vu.modpow(&b, n);

    let key = sha1(&[&pad(&s.to_bytes_be(), GROUP_LEN_BYTES)]);
    let expected_proof = client_proof(username, salt, &a_pad, &b_pad, &key);
    let server_proof = sha1(&[&a_pad, &expected_proof, &key]);

    Ok(SessionKeys {
        key,
        expected_proof,
        server_proof,
    })
}

/// Constant-time comparison of a received proof against the expected one.
pub fn verify_proof(received: &[u8], expected: &[u8]) -> bool {
    received.ct_eq(expected).into()
}

// ── Shared arithmetic ───────────────────────────────────────────────

/// `x = H(salt | H(username ':' password))`
fn private_key(salt: &[u8], username: &str, password: &str) -> BigUint {
    let identity = sha1(&[username.as_bytes(), b":", password.as_bytes()]);
    hash_to_int(&[salt, &identity])
}

/// `k = H(N | PAD(g))`
fn multiplier() -> BigUint {
    let n_bytes = modulus().to_bytes_be();
    let g_pad = pad(&generator().to_bytes_be(), n_bytes.len());
    hash_to_int(&[&n_bytes, &g_pad])
}

/// `M = H(H(N) xor H(g) | H(username) | salt | PAD(A) | PAD(B) | K)`
fn client_proof(
    username: &str,
    salt: &[u8],
    a_pad: &[u8],
    b_pad: &[u8],
    key: &[u8],
) -> [u8; PROOF_LEN] {
    let h_n = sha1(&[&modulus().to_bytes_be()]);
    let h_g = sha1(&[&generator().to_bytes_be()]);
    let mut group_hash = [0u8; PROOF_LEN];
    for (out, (x, y)) in group_hash.iter_mut().zip(h_n.iter().zip(h_g.iter())) {
        *out = x ^ y;
    }
    let h_user = sha1(&[username.as_bytes()]);
    sha1(&[&group_hash, &h_user, salt, a_pad, b_pad, key])
}

/// Uniform draw from [1, N-1].
fn random_exponent() -> BigUint {
    let mut bytes = [0u8; GROUP_LEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let n_minus_one = modulus() - BigUint::one();
    BigUint::from_bytes_be(&bytes) % n_minus_one + BigUint::one()
}

fn sha1(parts: &[&[u8]]) -> [u8; PROOF_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_to_int(parts: &[&[u8]]) -> BigUint {
    BigUint::from_bytes_be(&sha1(parts))
}

/// Left-pad with zero bytes to `len`; inputs at or above `len` pass through.
fn pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

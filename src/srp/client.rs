//! Client-side SRP-6a handshake.
//!
//! This is the arithmetic a game server runs on a player's behalf. It lives
//! here so integrators share one set of encoding conventions with the
//! service, and so the engine's correctness is testable end to end.

use num_bigint::BigUint;
use num_traits::Zero;

use super::group::{generator, modulus, GROUP_LEN_BYTES};
use super::{hash_to_int, pad, private_key, sha1, verify_proof, SrpError, PROOF_LEN};

/// Client state between sending A and receiving (salt, B).
pub struct ClientHandshake {
    secret: BigUint,
    /// A, padded to the group width; goes out in SERVER_EPHEMERAL.
    pub public: Vec<u8>,
    username: String,
    password: String,
}

/// Client state after processing the server reply.
#[derive(Debug)]
pub struct ClientSession {
    /// A as transmitted, kept for the proof packet.
    pub public: Vec<u8>,
    /// The proof M to send in SERVER_PROOF.
    pub proof: [u8; PROOF_LEN],
    /// The shared session key K.
    pub key: [u8; PROOF_LEN],
    expected_server_proof: [u8; PROOF_LEN],
}

impl ClientHandshake {
    /// Start a handshake: draw `a` and compute `A = g^a mod N`.
    /// `username` must already be lowercase.
    pub fn new(username: &str, password: &str) -> Self {
        let secret = super::random_exponent();
        let public = generator().modpow(&secret, modulus());
        Self {
            secret,
            public: pad(&public.to_bytes_be(), GROUP_LEN_BYTES),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Process the server's (salt, B) reply and derive the proof and key.
    pub fn process(self, salt: &[u8], server_ephemeral: &[u8]) -> Result<ClientSession, SrpError> {
        let n = modulus();
        let b_pub = BigUint::from_bytes_be(server_ephemeral);
        if (&b_pub % n).is_zero() {
            return Err(SrpError::UnsafeServerEphemeral);
        }

        let b_pad = pad(server_ephemeral, GROUP_LEN_BYTES);
        let u = hash_to_int(&[&self.public, &b_pad]);
        if (&u % n).is_zero() {
            return Err(SrpError::ZeroScramblingParameter);
        }

        let x = private_key(salt, &self.username, &self.password);
        let k = super::multiplier();

        // S = (B - k*g^x) ^ (a + u*x) mod N; N is added before the
        // subtraction so the difference stays non-negative.
        let kg_x = (&k * generator().modpow(&x, n)) % n;
        let base = (n + &b_pub - kg_x) % n;
        let exponent = &self.secret + &u * &x;
        let s = base.modpow(&exponent, n);

        let key = sha1(&[&pad(&s.to_bytes_be(), GROUP_LEN_BYTES)]);
        let proof = super::client_proof(&self.username, salt, &self.public, &b_pad, &key);
        let expected_server_proof = sha1(&[&self.public, &proof, &key]);

        Ok(ClientSession {
            public: self.public,
            proof,
            key,
            expected_server_proof,
        })
    }
}

impl ClientSession {
    /// Check the HAMK from AUTH_PROOF in constant time.
    pub fn verify_server(&self, server_proof: &[u8]) -> bool {
        verify_proof(server_proof, &self.expected_server_proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_server_ephemeral() {
        let handshake = ClientHandshake::new("alice", "hunter2");
        let err = handshake.process(&[1, 2, 3, 4], &vec![0u8; GROUP_LEN_BYTES]);
        assert_eq!(err.unwrap_err(), SrpError::UnsafeServerEphemeral);
    }

    #[test]
    fn public_ephemeral_is_group_width() {
        let handshake = ClientHandshake::new("alice", "hunter2");
        assert_eq!(handshake.public.len(), GROUP_LEN_BYTES);
    }
}

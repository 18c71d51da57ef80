//! Datagram codec for the authentication protocol.
//!
//! Every packet starts with a 32-bit magic; all multi-byte integers are
//! little-endian. Strings are NUL-terminated ASCII with no embedded NULs.
//! Decoding is total: any input that does not match a known packet shape
//! fails with [`WireError::Malformed`], never panics. Encoding pre-sizes
//! the output buffer exactly.
//!
//! The AUTH_NEGOTIATE reply has two framings, selected by the protocol
//! version the client negotiated: version 2 carries the client's own
//! correlation id (`client_session`), version 1 omits that field. The
//! negotiated version is therefore a decode parameter on the receiving
//! (game server) side.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

// Inbound magics (game server -> warden).
pub const SERVER_NEGOTIATE: u32 = 0xD003_CA01;
pub const SERVER_EPHEMERAL: u32 = 0xD003_CA02;
pub const SERVER_PROOF: u32 = 0xD003_CA03;

// Outbound magics (warden -> game server).
pub const AUTH_NEGOTIATE: u32 = 0xD003_CA10;
pub const AUTH_EPHEMERAL: u32 = 0xD003_CA20;
pub const AUTH_PROOF: u32 = 0xD003_CA30;
pub const ERROR_USER: u32 = 0xD003_CAFF;
pub const ERROR_SESSION: u32 = 0xD003_CAEE;

/// Protocol versions the service speaks.
pub const MIN_VERSION: u8 = 1;
pub const MAX_VERSION: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Error codes carried by ERROR_USER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserError {
    TryLater = 0,
    NoExist = 1,
    OutdatedProtocol = 2,
    WillNotAuth = 3,
}

impl UserError {
    fn from_wire(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(Self::TryLater),
            1 => Ok(Self::NoExist),
            2 => Ok(Self::OutdatedProtocol),
            3 => Ok(Self::WillNotAuth),
            _ => Err(WireError::Malformed("unknown user error code")),
        }
    }
}

/// Error codes carried by ERROR_SESSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionError {
    TryLater = 0,
    NoExist = 1,
    VerifierUnsafe = 2,
    AuthFailed = 3,
}

impl SessionError {
    fn from_wire(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(Self::TryLater),
            1 => Ok(Self::NoExist),
            2 => Ok(Self::VerifierUnsafe),
            3 => Ok(Self::AuthFailed),
            _ => Err(WireError::Malformed("unknown session error code")),
        }
    }
}

/// Packets a game server sends to warden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// SERVER_NEGOTIATE. `client_session` is zero for version 1, which has
    /// no such field on the wire.
    Negotiate {
        version: u8,
        client_session: u32,
        username: String,
    },
    /// SERVER_EPHEMERAL carrying the client public ephemeral A.
    Ephemeral {
        session: u32,
        client_ephemeral: Vec<u8>,
    },
    /// SERVER_PROOF carrying the client proof M.
    Proof { session: u32, proof: Vec<u8> },
}

/// Packets warden sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// AUTH_NEGOTIATE. `version` is the version the client negotiated and
    /// selects the framing; it is not itself a wire field.
    Negotiate {
        version: u8,
        client_session: u32,
        session: u32,
        salt: Vec<u8>,
        username: String,
    },
    /// AUTH_EPHEMERAL carrying the server public ephemeral B.
    Ephemeral {
        session: u32,
        server_ephemeral: Vec<u8>,
    },
    /// AUTH_PROOF carrying the server proof HAMK.
    Proof { session: u32, proof: Vec<u8> },
    UserError { error: UserError, username: String },
    SessionError { error: SessionError, session: u32 },
}

impl ClientPacket {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let magic = read_u32(&mut cur)?;
        match magic {
            SERVER_NEGOTIATE => {
                let version = read_u8(&mut cur)?;
                let client_session = match version {
                    1 => 0,
                    2 => read_u32(&mut cur)?,
                    _ => return Err(WireError::Malformed("unsupported protocol version")),
                };
                let username = read_cstr(&mut cur)?;
                Ok(Self::Negotiate {
                    version,
                    client_session,
                    username,
                })
            }
            SERVER_EPHEMERAL => {
                let session = read_u32(&mut cur)?;
                let client_ephemeral = read_prefixed(&mut cur)?;
                Ok(Self::Ephemeral {
                    session,
                    client_ephemeral,
                })
            }
            SERVER_PROOF => {
                let session = read_u32(&mut cur)?;
                let proof = read_prefixed(&mut cur)?;
                Ok(Self::Proof { session, proof })
            }
            _ => Err(WireError::Malformed("unknown magic")),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Negotiate {
                version,
                client_session,
                username,
            } => {
                let extra = if *version >= 2 { 4 } else { 0 };
                let mut buf = Vec::with_capacity(4 + 1 + extra + username.len() + 1);
                write_u32(&mut buf, SERVER_NEGOTIATE);
                buf.push(*version);
                if *version >= 2 {
                    write_u32(&mut buf, *client_session);
                }
                write_cstr(&mut buf, username);
                buf
            }
            Self::Ephemeral {
                session,
                client_ephemeral,
            } => encode_blob(SERVER_EPHEMERAL, *session, client_ephemeral),
            Self::Proof { session, proof } => encode_blob(SERVER_PROOF, *session, proof),
        }
    }
}

impl ServerPacket {
    /// Decode a reply. `negotiated_version` disambiguates the two
    /// AUTH_NEGOTIATE framings; it is ignored for every other packet.
    pub fn decode(buf: &[u8], negotiated_version: u8) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let magic = read_u32(&mut cur)?;
        match magic {
            AUTH_NEGOTIATE => {
                // Fixed format octet, always 1.
                if read_u8(&mut cur)? != 1 {
                    return Err(WireError::Malformed("bad negotiate format octet"));
                }
                let client_session = if negotiated_version >= 2 {
                    read_u32(&mut cur)?
                } else {
                    0
                };
                let session = read_u32(&mut cur)?;
                let salt_len = read_u8(&mut cur)? as usize;
                let salt = read_exact(&mut cur, salt_len)?;
                let username = read_cstr(&mut cur)?;
                Ok(Self::Negotiate {
                    version: negotiated_version,
                    client_session,
                    session,
                    salt,
                    username,
                })
            }
            AUTH_EPHEMERAL => {
                let session = read_u32(&mut cur)?;
                let server_ephemeral = read_prefixed(&mut cur)?;
                Ok(Self::Ephemeral {
                    session,
                    server_ephemeral,
                })
            }
            AUTH_PROOF => {
                let session = read_u32(&mut cur)?;
                let proof = read_prefixed(&mut cur)?;
                Ok(Self::Proof { session, proof })
            }
            ERROR_USER => {
                let error = UserError::from_wire(read_u8(&mut cur)?)?;
                let username = read_cstr(&mut cur)?;
                Ok(Self::UserError { error, username })
            }
            ERROR_SESSION => {
                let error = SessionError::from_wire(read_u8(&mut cur)?)?;
                let session = read_u32(&mut cur)?;
                Ok(Self::SessionError { error, session })
            }
            _ => Err(WireError::Malformed("unknown magic")),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Negotiate {
                version,
                client_session,
                session,
                salt,
                username,
            } => {
                let extra = if *version >= 2 { 4 } else { 0 };
                let mut buf =
                    Vec::with_capacity(4 + 1 + extra + 4 + 1 + salt.len() + username.len() + 1);
                write_u32(&mut buf, AUTH_NEGOTIATE);
                buf.push(1);
                if *version >= 2 {
                    write_u32(&mut buf, *client_session);
                }
                write_u32(&mut buf, *session);
                buf.push(salt.len() as u8);
                buf.extend_from_slice(salt);
                write_cstr(&mut buf, username);
                buf
            }
            Self::Ephemeral {
                session,
                server_ephemeral,
            } => encode_blob(AUTH_EPHEMERAL, *session, server_ephemeral),
            Self::Proof { session, proof } => encode_blob(AUTH_PROOF, *session, proof),
            Self::UserError { error, username } => {
                let mut buf = Vec::with_capacity(4 + 1 + username.len() + 1);
                write_u32(&mut buf, ERROR_USER);
                buf.push(*error as u8);
                write_cstr(&mut buf, username);
                buf
            }
            Self::SessionError { error, session } => {
                let mut buf = Vec::with_capacity(4 + 1 + 4);
                write_u32(&mut buf, ERROR_SESSION);
                buf.push(*error as u8);
                write_u32(&mut buf, *session);
                buf
            }
        }
    }
}

/// `magic | session u32 | len u16 | bytes` — shared by the four
/// ephemeral/proof packets. Lengths are unsigned in both directions.
fn encode_blob(magic: u32, session: u32, bytes: &[u8]) -> Vec<u8> {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    let mut buf = Vec::with_capacity(4 + 4 + 2 + bytes.len());
    write_u32(&mut buf, magic);
    write_u32(&mut buf, session);
    buf.write_u16::<LittleEndian>(bytes.len() as u16)
        .expect("vec write");
    buf.extend_from_slice(bytes);
    buf
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, WireError> {
    cur.read_u8()
        .map_err(|_| WireError::Malformed("truncated packet"))
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, WireError> {
    cur.read_u32::<LittleEndian>()
        .map_err(|_| WireError::Malformed("truncated packet"))
}

fn read_exact(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, WireError> {
    let mut out = vec![0u8; len];
    cur.read_exact(&mut out)
        .map_err(|_| WireError::Malformed("length exceeds packet"))?;
    Ok(out)
}

/// Length-prefixed byte string: `len u16 | bytes`.
fn read_prefixed(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, WireError> {
    let len = cur
        .read_u16::<LittleEndian>()
        .map_err(|_| WireError::Malformed("truncated packet"))? as usize;
    read_exact(cur, len)
}

fn read_cstr(cur: &mut Cursor<&[u8]>) -> Result<String, WireError> {
    let mut out = Vec::new();
    loop {
        let byte = read_u8(cur).map_err(|_| WireError::Malformed("unterminated string"))?;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii() {
            return Err(WireError::Malformed("non-ascii string"));
        }
        out.push(byte);
    }
    // All bytes checked ASCII above.
    Ok(String::from_utf8(out).expect("ascii is valid utf-8"))
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.write_u32::<LittleEndian>(value).expect("vec write");
}

fn write_cstr(buf: &mut Vec<u8>, value: &str) {
    debug_assert!(value.is_ascii() && !value.contains('\0'));
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_v2_round_trip() {
        let packet = ClientPacket::Negotiate {
            version: 2,
            client_session: 0x1122_3344,
            username: "alice".into(),
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[..4], &SERVER_NEGOTIATE.to_le_bytes());
        assert_eq!(bytes[4], 2);
        assert_eq!(ClientPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn negotiate_v1_has_no_client_session() {
        let packet = ClientPacket::Negotiate {
            version: 1,
            client_session: 0,
            username: "alice".into(),
        };
        let bytes = packet.encode();
        // magic + version + "alice\0"
        assert_eq!(bytes.len(), 4 + 1 + 6);
        assert_eq!(ClientPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn ephemeral_and_proof_round_trip() {
        for packet in [
            ClientPacket::Ephemeral {
                session: 7,
                client_ephemeral: vec![0xAB; 256],
            },
            ClientPacket::Proof {
                session: 7,
                proof: vec![0xCD; 20],
            },
        ] {
            assert_eq!(ClientPacket::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn auth_negotiate_round_trip_both_framings() {
        for version in [1u8, 2] {
            let packet = ServerPacket::Negotiate {
                version,
                client_session: if version >= 2 { 0xDEAD_BEEF } else { 0 },
                session: 42,
                salt: vec![1, 2, 3, 4],
                username: "alice".into(),
            };
            let bytes = packet.encode();
            assert_eq!(ServerPacket::decode(&bytes, version).unwrap(), packet);
        }
    }

    #[test]
    fn auth_negotiate_v1_framing_is_shorter() {
        let mk = |version| {
            ServerPacket::Negotiate {
                version,
                client_session: 0,
                session: 42,
                salt: vec![1, 2, 3, 4],
                username: "alice".into(),
            }
            .encode()
            .len()
        };
        assert_eq!(mk(1) + 4, mk(2));
    }

    #[test]
    fn server_replies_round_trip() {
        for packet in [
            ServerPacket::Ephemeral {
                session: 9,
                server_ephemeral: vec![0x42; 256],
            },
            ServerPacket::Proof {
                session: 9,
                proof: vec![0x17; 20],
            },
            ServerPacket::UserError {
                error: UserError::NoExist,
                username: "mallory".into(),
            },
            ServerPacket::SessionError {
                error: SessionError::AuthFailed,
                session: 9,
            },
        ] {
            assert_eq!(ServerPacket::decode(&packet.encode(), 2).unwrap(), packet);
        }
    }

    #[test]
    fn decode_rejects_unknown_magic() {
        let mut bytes = ClientPacket::Proof {
            session: 1,
            proof: vec![0; 20],
        }
        .encode();
        bytes[..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        assert!(ClientPacket::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unknown_version() {
        for version in [0u8, 3, 0xFF] {
            let bytes = [
                &SERVER_NEGOTIATE.to_le_bytes()[..],
                &[version][..],
                &b"alice\0"[..],
            ]
            .concat();
            assert_eq!(
                ClientPacket::decode(&bytes),
                Err(WireError::Malformed("unsupported protocol version"))
            );
        }
    }

    #[test]
    fn decode_rejects_truncation() {
        let full = ClientPacket::Ephemeral {
            session: 3,
            client_ephemeral: vec![0x55; 64],
        }
        .encode();
        for len in 0..full.len() {
            assert!(ClientPacket::decode(&full[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn decode_rejects_missing_terminator() {
        let bytes = [&SERVER_NEGOTIATE.to_le_bytes()[..], &[1][..], &b"alice"[..]].concat();
        assert_eq!(
            ClientPacket::decode(&bytes),
            Err(WireError::Malformed("unterminated string"))
        );
    }

    #[test]
    fn decode_rejects_oversized_length_field() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SERVER_PROOF.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&500u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 20]);
        assert_eq!(
            ClientPacket::decode(&bytes),
            Err(WireError::Malformed("length exceeds packet"))
        );
    }

    #[test]
    fn decode_rejects_non_ascii_username() {
        let bytes = [
            &SERVER_NEGOTIATE.to_le_bytes()[..],
            &[1][..],
            &[0xC3, 0xA9, 0x00][..],
        ]
        .concat();
        assert!(ClientPacket::decode(&bytes).is_err());
    }

    #[test]
    fn decode_never_panics_on_noise() {
        // A handful of adversarial shapes; totality is the property.
        let cases: &[&[u8]] = &[
            b"",
            b"\x01",
            b"\x01\xca\x03\xd0",
            b"\x01\xca\x03\xd0\x02",
            b"\xff\xca\x03\xd0\x04",
            &[0xEE, 0xCA, 0x03, 0xD0, 9],
        ];
        for case in cases {
            let _ = ClientPacket::decode(case);
            let _ = ServerPacket::decode(case, 2);
        }
    }
}

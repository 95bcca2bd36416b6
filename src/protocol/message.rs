//! Wire message encoding and decoding for the startup phase.
//!
//! Implements the PostgreSQL v3 protocol messages exchanged during
//! connection establishment: the startup packet, the authentication
//! family, and the session parameters the backend reports before
//! ReadyForQuery.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Transaction status indicators carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Startup message sent at connection start.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Placeholder for length (filled in at the end)
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        buf.put_slice(b"user\0");
        buf.put_slice(self.user.as_bytes());
        buf.put_u8(0);

        if let Some(ref db) = self.database {
            buf.put_slice(b"database\0");
            buf.put_slice(db.as_bytes());
            buf.put_u8(0);
        }

        for (key, value) in &self.options {
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }

        // Terminator
        buf.put_u8(0);

        // Length includes the length field itself
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// Password message (for MD5 or cleartext auth).
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_i32(4 + self.password.len() as i32 + 1);
        buf.put_slice(self.password.as_bytes());
        buf.put_u8(0);
        buf
    }
}

/// SASL initial response ('p') - first SCRAM message.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_i32(4 + self.mechanism.len() as i32 + 1 + 4 + self.data.len() as i32);
        buf.put_slice(self.mechanism.as_bytes());
        buf.put_u8(0);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(&self.data);
        buf
    }
}

/// SASL response ('p') - subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_i32(4 + self.data.len() as i32);
        buf.put_slice(&self.data);
        buf
    }
}

/// Terminate message ('X') - close the connection.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'X');
        buf.put_i32(4);
        buf
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Backend messages the establishment handshake understands.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery {
        status: TransactionStatus,
    },
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },
    /// A message type the handshake does not care about; skipped.
    Other {
        tag: u8,
    },
}

impl BackendMessage {
    /// Decode a backend message from a complete frame.
    ///
    /// The input must start with the message type byte and contain the
    /// whole message body.
    pub fn decode(buf: &mut Bytes) -> io::Result<Self> {
        if buf.remaining() < 5 {
            return Err(invalid("incomplete message header"));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32() as usize;
        if len < 4 || buf.remaining() < len - 4 {
            return Err(invalid("incomplete message body"));
        }
        let body = buf.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_fields(body)?,
            }),
            tag => Ok(BackendMessage::Other { tag }),
        }
    }

    fn decode_auth(mut body: Bytes) -> io::Result<Self> {
        if body.remaining() < 4 {
            return Err(invalid("truncated authentication message"));
        }
        match body.get_i32() {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(invalid("truncated MD5 salt"));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            other => Err(invalid(&format!(
                "unsupported authentication request: {other}"
            ))),
        }
    }

    fn decode_parameter_status(mut body: Bytes) -> io::Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> io::Result<Self> {
        if body.remaining() < 8 {
            return Err(invalid("truncated backend key data"));
        }
        Ok(BackendMessage::BackendKeyData {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }

    fn decode_ready_for_query(mut body: Bytes) -> io::Result<Self> {
        if body.remaining() < 1 {
            return Err(invalid("truncated ready-for-query"));
        }
        Ok(BackendMessage::ReadyForQuery {
            status: TransactionStatus::from(body.get_u8()),
        })
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> io::Result<String> {
    let mut end = 0;
    while end < buf.remaining() && buf[end] != 0 {
        end += 1;
    }
    if end >= buf.remaining() {
        return Err(invalid("missing null terminator in string"));
    }

    let s = std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());
    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields.
fn read_fields(mut body: Bytes) -> io::Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(&mut body)?);
    }
    Ok(fields)
}

/// Render error/notice fields as a one-line narrative, severity first.
pub fn describe_fields(fields: &HashMap<u8, String>) -> String {
    let severity = fields.get(&b'S').map(String::as_str).unwrap_or("ERROR");
    let code = fields.get(&b'C').map(String::as_str).unwrap_or("?????");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or("");
    format!("{severity}: {message} ({code})")
}

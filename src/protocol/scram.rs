//! SCRAM-SHA-256 client state machine.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) as used by
//! PostgreSQL SASL authentication. The client proceeds through three
//! exchanges: client-first, server-first/client-final, server-final.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SCRAM exchange failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    /// The server message could not be parsed or was missing fields.
    Malformed(&'static str),
    /// The server echoed a nonce that does not extend ours, or its final
    /// signature did not verify.
    Verification(&'static str),
    /// A phase was invoked out of order.
    OutOfOrder,
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(what) => write!(f, "malformed SCRAM server message: {what}"),
            Self::Verification(what) => write!(f, "SCRAM verification failed: {what}"),
            Self::OutOfOrder => write!(f, "SCRAM exchange out of order"),
        }
    }
}

impl std::error::Error for ScramError {}

/// Client side of a SCRAM-SHA-256 exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes, base64-encoded to a 24 character nonce
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: None,
            salted_password: None,
        }
    }

    /// The client-first-message: `n,,n=<user>,r=<client-nonce>`.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", sasl_prep(&self.username), self.client_nonce)
    }

    /// Consume the server-first-message (`r=<nonce>,s=<salt>,i=<count>`)
    /// and produce the client-final-message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first = std::str::from_utf8(server_msg)
            .map_err(|_| ScramError::Malformed("not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| ScramError::Malformed("salt"))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::Malformed("iteration count"))?,
                );
            }
        }
        let combined_nonce = nonce.ok_or(ScramError::Malformed("nonce"))?;
        let salt = salt.ok_or(ScramError::Malformed("salt"))?;
        let iterations = iterations.ok_or(ScramError::Malformed("iteration count"))?;

        // The server nonce must extend the one we sent
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::Verification("server nonce"));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor32(&client_key, &client_signature);

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verify the server-final-message (`v=<signature>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final = std::str::from_utf8(server_msg)
            .map_err(|_| ScramError::Malformed("not UTF-8"))?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::Malformed("verifier"))?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::Malformed("verifier"))?;

        let salted_password = self.salted_password.ok_or(ScramError::OutOfOrder)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::OutOfOrder)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_signature != expected {
            return Err(ScramError::Verification("server signature"));
        }
        Ok(())
    }
}

/// Hi() - PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// SASLprep normalization. PostgreSQL is lenient with usernames, so this
/// stays minimal; the username also travels in the startup packet, which
/// is what the server actually authenticates.
fn sasl_prep(s: &str) -> String {
    s.to_string()
}

//! SASL/SCRAM-SHA-256 client implementation, spec.md §4.1 and the S1
//! worked example. Grounded on the HMAC/SHA-256 primitives used by the
//! teacher's `proxy::scram` module (`ScramKey`, `sha256`), reimplemented
//! here for the client role since pgmoneta authenticates *to* the origin
//! rather than terminating client auth.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const CLIENT_NONCE_BYTES: usize = 18;

#[derive(Debug, Error)]
pub enum ScramError {
    #[error("malformed server-first-message: {0:?}")]
    MalformedServerFirst(String),
    #[error("malformed server-final-message: {0:?}")]
    MalformedServerFinal(String),
    #[error("server signature mismatch")]
    BadServerSignature,
    #[error("server reported SASL error: {0}")]
    ServerError(String),
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// `Hi(password, salt, iterations)`: PBKDF2-HMAC-SHA256 with a single
/// output block, per RFC 5802.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut salted = {
        let mut msg = Vec::with_capacity(salt.len() + 4);
        msg.extend_from_slice(salt);
        msg.extend_from_slice(&1u32.to_be_bytes());
        hmac(password, &msg)
    };
    let mut result = salted;
    for _ in 1..iterations {
        salted = hmac(password, &salted);
        for i in 0..32 {
            result[i] ^= salted[i];
        }
    }
    result
}

/// Constant-time comparison, used to verify `ServerSignature`.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn gen_nonce() -> String {
    let mut bytes = [0u8; CLIENT_NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Drives the three SCRAM round trips. Constructed once per authentication
/// attempt.
pub struct ScramClient {
    password: Vec<u8>,
    client_nonce: String,
    client_first_bare: String,
    server_first: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let client_nonce = gen_nonce();
        let client_first_bare = format!("n=,r={}", client_nonce);
        ScramClient {
            password: password.as_bytes().to_vec(),
            client_nonce,
            client_first_bare,
            server_first: None,
            salted_password: None,
        }
    }

    #[cfg(test)]
    fn with_nonce(password: &str, client_nonce: &str) -> Self {
        ScramClient {
            password: password.as_bytes().to_vec(),
            client_nonce: client_nonce.to_string(),
            client_first_bare: format!("n=,r={}", client_nonce),
            server_first: None,
            salted_password: None,
        }
    }

    /// The SASLInitialResponse body: mechanism name is sent separately by
    /// the caller (pq_proto framing), this returns just `gs2-header +
    /// client-first-message-bare`.
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consumes the server-first-message (`r=...,s=...,i=...`) and
    /// produces the client-final-message including the proof.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, ScramError> {
        let mut server_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(r) = part.strip_prefix("r=") {
                server_nonce = Some(r.to_string());
            } else if let Some(s) = part.strip_prefix("s=") {
                salt_b64 = Some(s.to_string());
            } else if let Some(i) = part.strip_prefix("i=") {
                iterations = i.parse::<u32>().ok();
            }
        }
        let server_nonce = server_nonce
            .ok_or_else(|| ScramError::MalformedServerFirst(server_first.to_string()))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::MalformedServerFirst(server_first.to_string()));
        }
        let salt_b64 =
            salt_b64.ok_or_else(|| ScramError::MalformedServerFirst(server_first.to_string()))?;
        let iterations =
            iterations.ok_or_else(|| ScramError::MalformedServerFirst(server_first.to_string()))?;
        let salt = BASE64
            .decode(&salt_b64)
            .map_err(|_| ScramError::MalformedServerFirst(server_first.to_string()))?;

        let salted_password = hi(&self.password, &salt, iterations);
        self.salted_password = Some(salted_password);
        self.server_first = Some(server_first.to_string());

        let channel_binding = BASE64.encode("n,,");
        let client_final_without_proof = format!("c={},r={}", channel_binding, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    /// Recomputes `AuthMessage` the same way `handle_server_first` did, so
    /// `ServerSignature` can be verified without storing extra state.
    fn auth_message(&self, server_nonce: &str) -> String {
        let channel_binding = BASE64.encode("n,,");
        let client_final_without_proof = format!("c={},r={}", channel_binding, server_nonce);
        format!(
            "{},{},{}",
            self.client_first_bare,
            self.server_first.as_deref().unwrap_or(""),
            client_final_without_proof
        )
    }

    /// Verifies the server-final-message's `v=` signature, completing
    /// mutual authentication.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ScramError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }
        let sig_b64 = server_final
            .strip_prefix("v=")
            .ok_or_else(|| ScramError::MalformedServerFinal(server_final.to_string()))?;
        let claimed = BASE64
            .decode(sig_b64)
            .map_err(|_| ScramError::MalformedServerFinal(server_final.to_string()))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| ScramError::MalformedServerFinal(server_final.to_string()))?;
        let server_nonce = self
            .server_first
            .as_ref()
            .and_then(|sf| sf.split(',').find_map(|p| p.strip_prefix("r=")))
            .ok_or_else(|| ScramError::MalformedServerFinal(server_final.to_string()))?
            .to_string();

        let server_key = hmac(&salted_password, b"Server Key");
        let expected = hmac(&server_key, self.auth_message(&server_nonce).as_bytes());

        if constant_time_eq(&expected, &claimed) {
            Ok(())
        } else {
            Err(ScramError::BadServerSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec.md S1: literal SCRAM handshake fixture.
    #[test]
    fn s1_scram_handshake_matches_literal_expectation() {
        let salt = BASE64.encode(b"salt16bytes___!!");
        let mut client = ScramClient::with_nonce("abc", "cn");

        assert_eq!(client.client_first_message(), "n,,n=,r=cn");

        let server_first = format!("r=cnsn,s={},i=4096", salt);
        let client_final = client.handle_server_first(&server_first).unwrap();

        let channel_binding = BASE64.encode("n,,");
        assert!(client_final.starts_with(&format!("c={},r=cnsn,p=", channel_binding)));

        // Recompute the expected proof independently, per the S1 formula.
        let salted = hi(b"abc", b"salt16bytes___!!", 4096);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let auth_message = format!(
            "n=,r=cn,{},c={},r=cnsn",
            server_first, channel_binding
        );
        let client_sig = hmac(&stored_key, auth_message.as_bytes());
        let expected_proof = xor(&client_key, &client_sig);
        let expected_final = format!(
            "c={},r=cnsn,p={}",
            channel_binding,
            BASE64.encode(expected_proof)
        );
        assert_eq!(client_final, expected_final);
    }

    #[test]
    fn server_signature_round_trips() {
        let salt = b"0123456789abcdef";
        let mut client = ScramClient::with_nonce("hunter2", "abcd");
        let server_first = format!("r=abcdEFGH,s={},i=4096", BASE64.encode(salt));
        let _ = client.handle_server_first(&server_first).unwrap();

        let salted_password = client.salted_password.unwrap();
        let server_key = hmac(&salted_password, b"Server Key");
        let sig = hmac(&server_key, client.auth_message("abcdEFGH").as_bytes());
        let server_final = format!("v={}", BASE64.encode(sig));

        assert!(client.verify_server_final(&server_final).is_ok());
    }

    #[test]
    fn bad_password_fails_signature_verification() {
        let salt = b"0123456789abcdef";
        let mut good = ScramClient::with_nonce("correct-password", "abcd");
        let server_first = format!("r=abcdEFGH,s={},i=4096", BASE64.encode(salt));
        let _ = good.handle_server_first(&server_first).unwrap();
        let salted_password = good.salted_password.unwrap();
        let server_key = hmac(&salted_password, b"Server Key");
        let sig = hmac(&server_key, good.auth_message("abcdEFGH").as_bytes());
        let server_final = format!("v={}", BASE64.encode(sig));

        let mut bad = ScramClient::with_nonce("wrong-password", "abcd");
        let _ = bad.handle_server_first(&server_first).unwrap();
        assert!(matches!(
            bad.verify_server_final(&server_final),
            Err(ScramError::BadServerSignature)
        ));
    }
}

//! Message bodies used by the replication session (C2): the startup
//! packet, the authentication sub-protocol selector, error fields, and the
//! standby status update.

use crate::frame::{get_cstring, PutCString, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const STARTUP_PROTOCOL_VERSION: i32 = 0x0003_0000;

/// `StartupMessage`: protocol version followed by `key\0value\0` pairs,
/// terminated by an empty string. spec.md §4.2.
pub fn encode_startup_message(params: &BTreeMap<String, String>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(STARTUP_PROTOCOL_VERSION);
    for (k, v) in params {
        buf.put_cstring(k);
        buf.put_cstring(v);
    }
    buf.put_u8(0);
    buf.freeze()
}

pub fn encode_ssl_request() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(SSL_REQUEST_CODE);
    buf.freeze()
}

/// The origin's `R` auth-type sub-protocol selector, spec.md §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    SaslInit { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    Unknown(i32),
}

pub fn parse_auth_request(mut payload: Bytes) -> Result<AuthRequest, WireError> {
    if payload.len() < 4 {
        return Err(WireError::Truncated);
    }
    let code = payload.get_i32();
    Ok(match code {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            if payload.len() < 4 {
                return Err(WireError::Truncated);
            }
            let mut salt = [0u8; 4];
            payload.copy_to_slice(&mut salt);
            AuthRequest::Md5Password { salt }
        }
        10 => {
            let mut mechanisms = Vec::new();
            while !payload.is_empty() && payload[0] != 0 {
                mechanisms.push(get_cstring(&mut payload)?);
            }
            AuthRequest::SaslInit { mechanisms }
        }
        11 => AuthRequest::SaslContinue { data: payload },
        12 => AuthRequest::SaslFinal { data: payload },
        other => AuthRequest::Unknown(other),
    })
}

/// Fields `S` (severity) and `C` (sqlstate) out of an `ErrorResponse`,
/// spec.md §4.2.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    pub severity: Option<String>,
    pub sqlstate: Option<String>,
    pub message: Option<String>,
}

pub fn parse_error_response(mut payload: Bytes) -> ErrorFields {
    let mut fields = ErrorFields::default();
    while !payload.is_empty() {
        let tag = payload[0];
        payload.advance(1);
        if tag == 0 {
            break;
        }
        let value = get_cstring(&mut payload).unwrap_or_default();
        match tag {
            b'S' => fields.severity = Some(value),
            b'C' => fields.sqlstate = Some(value),
            b'M' => fields.message = Some(value),
            _ => {}
        }
    }
    fields
}

/// Standby status update (kind `d`, sub-kind `r`): `(received, flushed,
/// applied, timestamp)` plus a reply-requested byte, spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub timestamp: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(self.write_lsn);
        buf.put_u64(self.flush_lsn);
        buf.put_u64(self.apply_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        if payload.is_empty() || payload[0] != b'r' {
            return Err(WireError::BadLength(payload.len() as i32));
        }
        payload.advance(1);
        if payload.len() < 33 {
            return Err(WireError::Truncated);
        }
        Ok(StandbyStatusUpdate {
            write_lsn: payload.get_u64(),
            flush_lsn: payload.get_u64(),
            apply_lsn: payload.get_u64(),
            timestamp: payload.get_i64(),
            reply_requested: payload.get_u8() != 0,
        })
    }
}

/// CopyData payload kinds the WAL streamer distinguishes, spec.md §4.8.
#[derive(Debug, Clone)]
pub enum CopyDataMessage {
    WalData {
        start_lsn: u64,
        wal_end: u64,
        timestamp: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: u64,
        timestamp: i64,
        reply_requested: bool,
    },
}

pub fn parse_copy_data(mut payload: Bytes) -> Result<CopyDataMessage, WireError> {
    if payload.is_empty() {
        return Err(WireError::Truncated);
    }
    let tag = payload.get_u8();
    match tag {
        b'w' => {
            if payload.len() < 24 {
                return Err(WireError::Truncated);
            }
            let start_lsn = payload.get_u64();
            let wal_end = payload.get_u64();
            let timestamp = payload.get_i64();
            Ok(CopyDataMessage::WalData {
                start_lsn,
                wal_end,
                timestamp,
                data: payload,
            })
        }
        b'k' => {
            if payload.len() < 17 {
                return Err(WireError::Truncated);
            }
            let wal_end = payload.get_u64();
            let timestamp = payload.get_i64();
            let reply_requested = payload.get_u8() != 0;
            Ok(CopyDataMessage::PrimaryKeepalive {
                wal_end,
                timestamp,
                reply_requested,
            })
        }
        other => Err(WireError::BadLength(other as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standby_status_update_round_trips() {
        let msg = StandbyStatusUpdate {
            write_lsn: 100,
            flush_lsn: 90,
            apply_lsn: 80,
            timestamp: 12345,
            reply_requested: true,
        };
        let encoded = msg.encode();
        let decoded = StandbyStatusUpdate::decode(encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn parses_sasl_auth_request() {
        let mut payload = BytesMut::new();
        payload.put_i32(10);
        payload.put_cstring("SCRAM-SHA-256");
        payload.put_u8(0);
        let req = parse_auth_request(payload.freeze()).unwrap();
        assert_eq!(
            req,
            AuthRequest::SaslInit {
                mechanisms: vec!["SCRAM-SHA-256".to_string()]
            }
        );
    }

    #[test]
    fn parses_error_response_fields() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'S');
        payload.put_cstring("FATAL");
        payload.put_u8(b'C');
        payload.put_cstring("28000");
        payload.put_u8(0);
        let fields = parse_error_response(payload.freeze());
        assert_eq!(fields.severity.as_deref(), Some("FATAL"));
        assert_eq!(fields.sqlstate.as_deref(), Some("28000"));
    }

    #[test]
    fn parses_wal_data_copy_message() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'w');
        payload.put_u64(100);
        payload.put_u64(200);
        payload.put_i64(1);
        payload.put_slice(b"walbytes");
        match parse_copy_data(payload.freeze()).unwrap() {
            CopyDataMessage::WalData {
                start_lsn, data, ..
            } => {
                assert_eq!(start_lsn, 100);
                assert_eq!(&data[..], b"walbytes");
            }
            _ => panic!("expected WalData"),
        }
    }
}

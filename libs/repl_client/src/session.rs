//! C2 — replication session: a long-lived connection driving
//! `IDENTIFY_SYSTEM`, `TIMELINE_HISTORY`, `CREATE_REPLICATION_SLOT`,
//! `START_REPLICATION`, `BASE_BACKUP`, `UPLOAD_MANIFEST`, and arbitrary SQL
//! queries over a single socket, spec.md §4.2.

use crate::auth::{authenticate, AuthFlowError};
use crate::stream_buffer::StreamBuffer;
use bytes::{Buf, Bytes};
use pgmoneta_proto::frame::{self, WireError};
use pgmoneta_proto::message::{encode_startup_message, parse_error_response, StandbyStatusUpdate};
use pgmoneta_utils::{Lsn, PgmonetaError, TokenBucket};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Auth(#[from] AuthFlowError),
    #[error("origin returned an error: severity={severity:?} sqlstate={sqlstate:?} message={message:?}")]
    ServerError {
        severity: Option<String>,
        sqlstate: Option<String>,
        message: Option<String>,
    },
    #[error("unexpected message kind {0:?} in this phase")]
    UnexpectedMessage(u8),
    #[error("session cancelled")]
    Cancelled,
}

impl From<SessionError> for PgmonetaError {
    fn from(e: SessionError) -> Self {
        match &e {
            SessionError::Wire(_) => PgmonetaError::Protocol(e.to_string()),
            SessionError::Auth(_) => PgmonetaError::Auth(e.to_string()),
            SessionError::Cancelled => PgmonetaError::Network(e.to_string()),
            _ => PgmonetaError::Protocol(e.to_string()),
        }
    }
}

/// An LSN/timeline pair as reported by one of the `BASE_BACKUP` result-set
/// rows (spec.md §4.2: the leading begin row and the trailing end row
/// share this shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseBackupLsn {
    pub lsn: Lsn,
    pub timeline: u32,
}

pub struct IdentifySystem {
    pub systemid: String,
    pub timeline: u32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Selects which mode the replication channel negotiates (spec.md §4.2:
/// `replication=1` is only set when opening a replication channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Plain,
    Replication,
}

pub struct ReplicationSession<S> {
    stream: S,
    buf: StreamBuffer,
    rate_limit: Option<Arc<TokenBucket>>,
    /// Flipped by the supervisor/server to request cooperative shutdown;
    /// checked at each message boundary per spec.md §4.2 cancellation.
    running: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationSession<S> {
    pub fn new(stream: S, running: watch::Receiver<bool>, rate_limit: Option<Arc<TokenBucket>>) -> Self {
        ReplicationSession {
            stream,
            buf: StreamBuffer::new(),
            rate_limit,
            running,
        }
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Sends `StartupMessage` with `user`, `database`, `application_name`
    /// and, for a replication channel, `replication=1`; then authenticates.
    pub async fn start_up(
        &mut self,
        user: &str,
        database: &str,
        application_name: &str,
        password: &str,
        mode: ConnectionMode,
    ) -> Result<(), SessionError> {
        let mut params = BTreeMap::new();
        params.insert("user".to_string(), user.to_string());
        params.insert("database".to_string(), database.to_string());
        params.insert("application_name".to_string(), application_name.to_string());
        if mode == ConnectionMode::Replication {
            params.insert("replication".to_string(), "1".to_string());
        }
        let body = encode_startup_message(&params);
        frame::write_untagged(&mut self.stream, &body).await?;
        authenticate(&mut self.stream, user, password).await?;

        // Drain ParameterStatus/BackendKeyData up to ReadyForQuery.
        loop {
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'Z' => break,
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
        Ok(())
    }

    /// `IDENTIFY_SYSTEM;`
    pub async fn identify_system(&mut self) -> Result<IdentifySystem, SessionError> {
        let rows = self.simple_query("IDENTIFY_SYSTEM;").await?;
        let row = rows.first().ok_or(SessionError::UnexpectedMessage(b'T'))?;
        Ok(IdentifySystem {
            systemid: row.first().cloned().unwrap_or_default(),
            timeline: row.get(1).and_then(|s| s.parse().ok()).unwrap_or(1),
            xlogpos: row
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Lsn::INVALID),
            dbname: row.get(3).cloned(),
        })
    }

    /// `TIMELINE_HISTORY <tli>;`
    pub async fn timeline_history(&mut self, tli: u32) -> Result<Vec<u8>, SessionError> {
        let rows = self
            .simple_query(&format!("TIMELINE_HISTORY {tli};"))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get(1))
            .map(|s| s.clone().into_bytes())
            .unwrap_or_default())
    }

    /// `CREATE_REPLICATION_SLOT <slot> PHYSICAL RESERVE_WAL;` (or the
    /// parenthesized form for v>=15, left to the caller via `modern`).
    pub async fn create_replication_slot(
        &mut self,
        slot: &str,
        modern: bool,
    ) -> Result<(), SessionError> {
        let sql = if modern {
            format!("CREATE_REPLICATION_SLOT {slot} PHYSICAL (RESERVE_WAL true);")
        } else {
            format!("CREATE_REPLICATION_SLOT {slot} PHYSICAL RESERVE_WAL;")
        };
        self.simple_query(&sql).await?;
        Ok(())
    }

    /// `READ_REPLICATION_SLOT <slot>;`
    pub async fn read_replication_slot(&mut self, slot: &str) -> Result<bool, SessionError> {
        let rows = self
            .simple_query(&format!("READ_REPLICATION_SLOT {slot};"))
            .await?;
        Ok(rows.first().map(|r| !r.is_empty()).unwrap_or(false))
    }

    /// Arbitrary SQL used for cluster introspection (page size, tablespace
    /// list, etc). Reads until `ReadyForQuery`; on `ErrorResponse`,
    /// surfaces `S`/`C`.
    pub async fn query_execute(&mut self, sql: &str) -> Result<Vec<Vec<String>>, SessionError> {
        self.simple_query(sql).await
    }

    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Vec<String>>, SessionError> {
        if !self.is_running() {
            return Err(SessionError::Cancelled);
        }
        let mut body = Vec::with_capacity(sql.len() + 1);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        frame::write_frame(&mut self.stream, b'Q', &body).await?;

        let mut rows = Vec::new();
        loop {
            if !self.is_running() {
                return Err(SessionError::Cancelled);
            }
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'T' => continue, // RowDescription: field metadata not needed here
                b'D' => rows.push(parse_data_row(frame.payload)),
                b'C' => continue, // CommandComplete
                b'Z' => break,
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
        Ok(rows)
    }

    /// Issues `START_REPLICATION [SLOT <slot>] PHYSICAL <xlog> TIMELINE
    /// <tli>;` and leaves the session ready to consume CopyData.
    pub async fn start_replication(
        &mut self,
        slot: Option<&str>,
        start_lsn: Lsn,
        timeline: u32,
    ) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Cancelled);
        }
        let slot_clause = slot.map(|s| format!("SLOT {s} ")).unwrap_or_default();
        let sql = format!(
            "START_REPLICATION {slot_clause}PHYSICAL {start_lsn} TIMELINE {timeline};"
        );
        let mut body = Vec::with_capacity(sql.len() + 1);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        frame::write_frame(&mut self.stream, b'Q', &body).await?;

        let frame = frame::read_frame(&mut self.stream).await?;
        match frame.kind {
            b'W' => Ok(()), // CopyBothResponse
            b'E' => Err(server_error(frame.payload)),
            other => Err(SessionError::UnexpectedMessage(other)),
        }
    }

    /// Reads the next CopyData/CopyDone frame while a replication stream
    /// or base backup is in progress. Terminates the read loop at the
    /// next message boundary when cancelled, per spec.md §4.2.
    pub async fn next_copy_message(&mut self) -> Result<Option<(u8, Bytes)>, SessionError> {
        if !self.is_running() {
            self.send_copy_done().await.ok();
            return Err(SessionError::Cancelled);
        }
        let rate_limit = self.rate_limit.clone();
        let accepted = [b'd', b'c'];
        match self
            .buf
            .next_message(&mut self.stream, rate_limit.as_deref(), &accepted)
            .await
            .map_err(WireError::Io)?
        {
            None => Ok(None),
            Some((b'c', _)) => Ok(None), // CopyDone
            Some((kind, payload)) => Ok(Some((kind, payload))),
        }
    }

    /// Sends a standby status update (`d` + `r` + 3 LSNs + timestamp +
    /// reply-requested byte), spec.md §4.2/§6.
    pub async fn standby_status_update(&mut self, update: StandbyStatusUpdate) -> Result<(), SessionError> {
        let payload = update.encode();
        frame::write_frame(&mut self.stream, b'd', &payload).await?;
        Ok(())
    }

    pub async fn send_copy_done(&mut self) -> Result<(), SessionError> {
        frame::write_frame(&mut self.stream, b'c', &[]).await?;
        Ok(())
    }

    /// Reads the inline result-set row the server sends on the
    /// replication connection immediately after `CopyDone`, naming the
    /// timeline and LSN to resume streaming from (spec.md §4.8, S4).
    /// This is *not* a second query — it is the same `START_REPLICATION`
    /// command's own trailing result set, read as plain frames (not
    /// CopyData) until `ReadyForQuery`. Returns `None` when the server
    /// closes out without proposing a switch (no `D` row appeared).
    pub async fn read_timeline_switch(&mut self) -> Result<Option<(u32, Lsn)>, SessionError> {
        let mut row = None;
        loop {
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'T' => continue,
                b'D' => row = Some(parse_data_row(frame.payload)),
                b'C' => continue,
                b'Z' => break,
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
        Ok(row.and_then(|r| parse_timeline_switch_row(&r)))
    }

    pub async fn terminate(&mut self) -> Result<(), SessionError> {
        frame::write_frame(&mut self.stream, b'X', &[]).await?;
        self.stream.shutdown().await.ok();
        Ok(())
    }

    /// `BASE_BACKUP (...)`: issues the command and reads the leading
    /// result-set row (begin LSN, begin timeline). The archive receiver
    /// (C7) then drains the following tar stream(s) itself via
    /// `next_copy_message`, and must call `base_backup_end` once every
    /// tablespace has finished to read the trailing (end LSN, end
    /// timeline) row spec.md §4.2 names.
    pub async fn base_backup(&mut self, options: &BaseBackupOptions) -> Result<BaseBackupLsn, SessionError> {
        let sql = options.to_sql();
        let mut body = Vec::with_capacity(sql.len() + 1);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        frame::write_frame(&mut self.stream, b'Q', &body).await?;

        // RowDescription, then one DataRow with (begin LSN, begin timeline).
        loop {
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'T' => continue,
                b'D' => return Ok(parse_lsn_row(frame.payload)),
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
    }

    /// Reads the trailing result-set row the server sends once every
    /// tablespace tar stream has finished (spec.md §4.2: "...then a
    /// final row (end LSN/timeline)"), draining through to
    /// `ReadyForQuery` so the session is ready for the next command.
    pub async fn base_backup_end(&mut self) -> Result<BaseBackupLsn, SessionError> {
        let mut result = None;
        loop {
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'T' => continue,
                b'D' => result = Some(parse_lsn_row(frame.payload)),
                b'C' => continue,
                b'Z' => {
                    return result.ok_or(SessionError::UnexpectedMessage(b'Z'));
                }
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
    }

    /// `UPLOAD_MANIFEST`: streams a previously saved manifest as CopyData,
    /// finished by a CopyDone.
    pub async fn upload_manifest(&mut self, manifest: &[u8]) -> Result<(), SessionError> {
        let mut body = Vec::with_capacity(15);
        body.extend_from_slice(b"UPLOAD_MANIFEST");
        body.push(0);
        frame::write_frame(&mut self.stream, b'Q', &body).await?;

        let frame = frame::read_frame(&mut self.stream).await?;
        if frame.kind != b'G' && frame.kind != b'W' {
            return Err(SessionError::UnexpectedMessage(frame.kind));
        }

        const CHUNK: usize = 64 * 1024;
        for chunk in manifest.chunks(CHUNK) {
            frame::write_frame(&mut self.stream, b'd', chunk).await?;
        }
        self.send_copy_done().await?;

        loop {
            let frame = frame::read_frame(&mut self.stream).await?;
            match frame.kind {
                b'Z' => return Ok(()),
                b'E' => return Err(server_error(frame.payload)),
                _ => continue,
            }
        }
    }
}

fn server_error(payload: Bytes) -> SessionError {
    let fields = parse_error_response(payload);
    SessionError::ServerError {
        severity: fields.severity,
        sqlstate: fields.sqlstate,
        message: fields.message,
    }
}

/// `row` is the decoded text columns of the `D` frame following a
/// timeline switch's `CopyDone`: `(timeline, lsn)`.
fn parse_timeline_switch_row(row: &[String]) -> Option<(u32, Lsn)> {
    let tli: u32 = row.first()?.parse().ok()?;
    let lsn: Lsn = row.get(1)?.parse().ok()?;
    Some((tli, lsn))
}

fn parse_lsn_row(payload: Bytes) -> BaseBackupLsn {
    let row = parse_data_row(payload);
    BaseBackupLsn {
        lsn: row
            .first()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Lsn::INVALID),
        timeline: row.get(1).and_then(|s| s.parse().ok()).unwrap_or(0),
    }
}

fn parse_data_row(mut payload: Bytes) -> Vec<String> {
    // payload here retains the leading kind+length per stream-buffer
    // semantics only when read via StreamBuffer; simple_query reads raw
    // frames directly, so this payload starts at the column count.
    if payload.len() < 2 {
        return Vec::new();
    }
    let ncols = payload.get_u16() as usize;
    let mut out = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        if payload.len() < 4 {
            break;
        }
        let len = payload.get_i32();
        if len < 0 {
            out.push(String::new());
            continue;
        }
        let len = len as usize;
        if payload.len() < len {
            break;
        }
        let bytes = payload.copy_to_bytes(len);
        out.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    out
}

/// Arguments to `BASE_BACKUP`, spec.md §4.2 and §6.
pub struct BaseBackupOptions {
    pub label: String,
    pub wal: bool,
    pub wait: bool,
    pub compression: Option<String>,
    pub compression_detail: Option<String>,
    pub checkpoint_fast: bool,
    pub manifest: bool,
    pub manifest_checksums: Option<String>,
    /// Servers older than v15 only understand the positional form.
    pub modern: bool,
}

impl BaseBackupOptions {
    fn to_sql(&self) -> String {
        if !self.modern {
            let mut parts = vec![format!("LABEL '{}'", self.label)];
            if self.wal {
                parts.push("PROGRESS".to_string());
            }
            if self.checkpoint_fast {
                parts.push("FAST".to_string());
            }
            return format!("BASE_BACKUP ({});", parts.join(", "));
        }
        let mut parts = vec![format!("LABEL '{}'", self.label)];
        parts.push(format!("WAL {}", self.wal));
        parts.push(format!("WAIT {}", self.wait));
        if let Some(c) = &self.compression {
            parts.push(format!("COMPRESSION '{c}'"));
        }
        if let Some(d) = &self.compression_detail {
            parts.push(format!("COMPRESSION_DETAIL '{d}'"));
        }
        parts.push(format!(
            "CHECKPOINT '{}'",
            if self.checkpoint_fast { "fast" } else { "spread" }
        ));
        if self.manifest {
            parts.push("MANIFEST 'yes'".to_string());
        }
        if let Some(m) = &self.manifest_checksums {
            parts.push(format!("MANIFEST_CHECKSUMS '{m}'"));
        }
        format!("BASE_BACKUP ({});", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_base_backup_sql_matches_spec_example() {
        let opts = BaseBackupOptions {
            label: "tag".to_string(),
            wal: true,
            wait: false,
            compression: Some("zstd".to_string()),
            compression_detail: Some("level=3,workers=4".to_string()),
            checkpoint_fast: true,
            manifest: true,
            manifest_checksums: Some("SHA512".to_string()),
            modern: true,
        };
        let sql = opts.to_sql();
        assert!(sql.starts_with("BASE_BACKUP (LABEL 'tag', WAL true, WAIT false"));
        assert!(sql.contains("COMPRESSION 'zstd'"));
        assert!(sql.contains("MANIFEST_CHECKSUMS 'SHA512'"));
    }

    #[test]
    fn legacy_base_backup_uses_positional_form() {
        let opts = BaseBackupOptions {
            label: "tag".to_string(),
            wal: true,
            wait: false,
            compression: None,
            compression_detail: None,
            checkpoint_fast: true,
            manifest: false,
            manifest_checksums: None,
            modern: false,
        };
        assert_eq!(opts.to_sql(), "BASE_BACKUP (LABEL 'tag', PROGRESS, FAST);");
    }

    fn encode_text_data_row(cols: &[&str]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&(cols.len() as u16).to_be_bytes());
        for col in cols {
            out.extend_from_slice(&(col.len() as i32).to_be_bytes());
            out.extend_from_slice(col.as_bytes());
        }
        Bytes::from(out)
    }

    #[test]
    fn parse_lsn_row_reads_lsn_and_timeline_columns() {
        let row = encode_text_data_row(&["0/3000060", "2"]);
        let parsed = parse_lsn_row(row);
        assert_eq!(parsed.lsn, "0/3000060".parse().unwrap());
        assert_eq!(parsed.timeline, 2);
    }

    /// spec.md S4: after a switch to timeline 2 at LSN 0/3000000 the
    /// streamer must resume from that exact pair.
    #[test]
    fn parse_timeline_switch_row_reads_new_timeline_and_lsn() {
        let row = vec!["2".to_string(), "0/3000000".to_string()];
        let (tli, lsn) = parse_timeline_switch_row(&row).unwrap();
        assert_eq!(tli, 2);
        assert_eq!(lsn, Lsn(0x3000000));
    }

    #[test]
    fn parse_timeline_switch_row_rejects_malformed_row() {
        assert!(parse_timeline_switch_row(&["not-a-timeline".to_string()]).is_none());
    }
}

//! Live `supervisor::Operations` implementation: the real backup, restore,
//! verify, delete, retain, expunge, archive and list-backup pipelines,
//! wired through `repl_client::ReplicationSession`, `archive_receiver`,
//! `repository`, `retention::plan_expunge`, `verify::verify_backup` and
//! `incremental::reconstruct` (spec.md §4).
//!
//! Incremental-backup *creation* is not wired here: producing a
//! `BackupType::Incremental` backup needs a block-reference table built
//! from the origin's WAL-summary files (`incremental::brt`), and nothing
//! in this pass fetches those summaries from a live connection. `backup`
//! below always produces a `BackupType::Full` backup. Restoring an
//! existing `INCREMENTAL.*` tree (however it was produced) is fully wired
//! through `incremental::reconstruct`.

use crate::archive_receiver::{self, TablespaceSpec};
use crate::config::{Config, ServerConfig};
use crate::external::{NoneCodec, Sha256Hasher};
use crate::retention::{self, RetentionPolicy};
use crate::supervisor::Operations;
use crate::verify::{self, ManifestEntry};
use camino::{Utf8Path, Utf8PathBuf};
use incremental::{reconstruct, AncestorSource, IncrementalFileReader, ReconstructMode, ReconstructOutput};
use pgmoneta_utils::PgmonetaError;
use repl_client::session::{BaseBackupOptions, ConnectionMode, ReplicationSession};
use repository::{
    backup_to_document, document_to_backup, listing, resolve_ancestor_chain, Backup, BackupType,
    BackupInfoDocument, CompressionKind, EncryptionKind, ServerLayout, Validity,
};
use std::collections::BTreeMap;
use std::io::Write;
use tokio::net::TcpStream;
use tokio::sync::watch;

pub struct LiveOperations {
    config: Config,
    users: BTreeMap<String, String>,
}

impl LiveOperations {
    pub fn new(config: Config, users: BTreeMap<String, String>) -> Self {
        LiveOperations { config, users }
    }

    fn server_config(&self, name: &str) -> Result<ServerConfig, PgmonetaError> {
        self.config
            .servers
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| PgmonetaError::Config(format!("unknown server {name}")))
    }

    fn password_for(&self, user: &str) -> Result<&str, PgmonetaError> {
        self.users
            .get(user)
            .map(String::as_str)
            .ok_or_else(|| PgmonetaError::Auth(format!("no credentials for user {user}")))
    }

    fn layout(&self, server_name: &str) -> ServerLayout {
        ServerLayout::new(&self.config.base_dir, server_name)
    }

    /// Dials and authenticates a replication channel to `server`. The
    /// `running` watch is dropped immediately after construction: a
    /// one-shot operation like backup/restore has no supervisor-level
    /// cancellation signal of its own to forward.
    async fn dial(&self, server: &ServerConfig) -> Result<ReplicationSession<TcpStream>, PgmonetaError> {
        let password = self.password_for(&server.user)?;
        let addr = format!("{}:{}", server.host, server.port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PgmonetaError::Network(e.to_string()))?;
        let (_tx, rx) = watch::channel(true);
        let mut session = ReplicationSession::new(stream, rx, None);
        session
            .start_up(&server.user, "postgres", "pgmoneta", password, ConnectionMode::Replication)
            .await?;
        Ok(session)
    }

    fn load_all_backups(&self, layout: &ServerLayout) -> Result<BTreeMap<String, Backup>, PgmonetaError> {
        let mut backups = BTreeMap::new();
        let backup_root = layout.root().join("backup");
        if !backup_root.exists() {
            return Ok(backups);
        }
        for entry in std::fs::read_dir(backup_root.as_std_path()).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            let label = entry.file_name().to_string_lossy().into_owned();
            let info_path = layout.backup_info_path(&label);
            if !info_path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&info_path).map_err(io_err)?;
            let doc = BackupInfoDocument::parse(&text)
                .map_err(|e| PgmonetaError::Integrity(e.to_string()))?;
            let backup =
                document_to_backup(&doc).map_err(|e| PgmonetaError::Integrity(e.to_string()))?;
            backups.insert(label, backup);
        }
        Ok(backups)
    }

    fn write_backup_info(&self, layout: &ServerLayout, backup: &Backup) -> Result<(), PgmonetaError> {
        let doc = backup_to_document(backup);
        std::fs::write(layout.backup_info_path(&backup.label), doc.render()).map_err(io_err)
    }
}

fn io_err(e: std::io::Error) -> PgmonetaError {
    PgmonetaError::Other(e.into())
}

/// `YYYYMMDDTHHMMSS`, the label convention `repository::listing` sorts
/// lexicographically-as-chronologically (spec.md §6).
fn new_backup_label() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Extracts every tablespace tar this backup stored into a scratch
/// directory under its workspace, once. Subsequent calls for the same
/// label reuse the already-extracted tree.
fn extract_backup(layout: &ServerLayout, label: &str) -> Result<Utf8PathBuf, PgmonetaError> {
    let dest = layout.workspace_dir(label).join("extracted");
    if dest.exists() {
        return Ok(dest);
    }
    std::fs::create_dir_all(&dest).map_err(io_err)?;
    let data_dir = layout.data_dir(label);
    for entry in std::fs::read_dir(data_dir.as_std_path()).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tar") {
            let file = std::fs::File::open(&path).map_err(io_err)?;
            let mut archive = tar::Archive::new(file);
            archive.unpack(dest.as_std_path()).map_err(io_err)?;
        }
    }
    Ok(dest)
}

fn collect_files(root: &Utf8Path, current: &Utf8Path, out: &mut Vec<String>) -> Result<(), PgmonetaError> {
    for entry in std::fs::read_dir(current.as_std_path()).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|p| PgmonetaError::Integrity(format!("non-utf8 path {p:?}")))?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| PgmonetaError::Other(e.into()))?;
            out.push(rel.to_string());
        }
    }
    Ok(())
}

/// Reconstructs (or plain-copies) one relation file from `chain[0]`'s
/// extracted tree into `restore_root`, pulling ancestor pages from
/// `extracted[chain[1..]]` as needed (spec.md §4.6).
fn restore_one_file(
    chain: &[String],
    extracted: &BTreeMap<String, Utf8PathBuf>,
    rel: &str,
    restore_root: &Utf8Path,
) -> Result<(), PgmonetaError> {
    let latest_label = &chain[0];
    let latest_root = &extracted[latest_label];
    let path = Utf8Path::new(rel);
    let file_name = path.file_name().unwrap_or(rel);

    let Some(basename) = file_name.strip_prefix("INCREMENTAL.") else {
        let dest = restore_root.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::copy(latest_root.join(rel), &dest).map_err(io_err)?;
        return Ok(());
    };
    let out_rel = path.with_file_name(basename);

    let mut latest_reader = IncrementalFileReader::open(
        std::fs::File::open(latest_root.join(rel)).map_err(io_err)?,
        pgmoneta_pg::BLCKSZ,
    )
    .map_err(|e| PgmonetaError::Integrity(e.to_string()))?;

    let mut ancestor_sources = Vec::new();
    for ancestor_label in &chain[1..] {
        let ancestor_root = &extracted[ancestor_label];
        let incremental_name = format!("INCREMENTAL.{basename}");
        let incremental_path = ancestor_root.join(path.with_file_name(&incremental_name));
        let full_path = ancestor_root.join(&out_rel);
        if incremental_path.exists() {
            let reader = IncrementalFileReader::open(
                std::fs::File::open(&incremental_path).map_err(io_err)?,
                pgmoneta_pg::BLCKSZ,
            )
            .map_err(|e| PgmonetaError::Integrity(e.to_string()))?;
            ancestor_sources.push(AncestorSource::Incremental(reader));
        } else if full_path.exists() {
            let size_bytes = std::fs::metadata(&full_path).map_err(io_err)?.len();
            ancestor_sources.push(AncestorSource::Full {
                reader: std::fs::File::open(&full_path).map_err(io_err)?,
                size_bytes,
            });
        }
    }

    let output = reconstruct(
        &mut latest_reader,
        &mut ancestor_sources,
        ReconstructMode::RebuildFull,
        pgmoneta_pg::BLCKSZ,
    )
    .map_err(|e| PgmonetaError::Integrity(e.to_string()))?;
    let ReconstructOutput::Full { pages } = output else {
        unreachable!("RebuildFull always produces ReconstructOutput::Full")
    };

    let dest = restore_root.join(&out_rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut out_file = std::fs::File::create(&dest).map_err(io_err)?;
    for page in pages {
        out_file.write_all(&page).map_err(io_err)?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Operations for LiveOperations {
    async fn backup(&self, server_name: &str) -> Result<serde_json::Value, PgmonetaError> {
        let started = std::time::Instant::now();
        let server = self.server_config(server_name)?;
        let layout = self.layout(server_name);
        let label = new_backup_label();

        let mut session = self.dial(&server).await?;
        let tablespaces = vec![TablespaceSpec {
            oid: None,
            name: "pg_default".to_string(),
        }];
        let options = BaseBackupOptions {
            label: label.clone(),
            wal: false,
            wait: true,
            compression: None,
            compression_detail: None,
            checkpoint_fast: true,
            manifest: true,
            manifest_checksums: Some("SHA256".to_string()),
            modern: true,
        };
        let begin = session.base_backup(&options).await?;
        let codec = NoneCodec;
        let end = archive_receiver::receive(&mut session, &layout, &label, &tablespaces, &codec, "").await?;
        session.terminate().await.ok();

        let backup = Backup {
            label: label.clone(),
            backup_type: BackupType::Full,
            valid: Validity::Valid,
            parent_label: None,
            start_lsn: begin.lsn,
            end_lsn: end.lsn,
            start_timeline: begin.timeline,
            end_timeline: end.timeline,
            checkpoint_lsn: begin.lsn,
            wal_file_name: String::new(),
            restore_size: 0,
            biggest_file_size: 0,
            major_version: 0,
            minor_version: 0,
            compression: CompressionKind::None,
            encryption: EncryptionKind::None,
            tablespaces: vec![],
            elapsed_seconds: started.elapsed().as_secs_f64(),
            keep: false,
            comments: String::new(),
            unknown_fields: BTreeMap::new(),
        };
        self.write_backup_info(&layout, &backup)?;

        Ok(serde_json::json!({"label": label, "type": "full"}))
    }

    async fn restore(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let backups = self.load_all_backups(&layout)?;
        if !backups.contains_key(label) {
            return Err(PgmonetaError::MissingAncestor(label.to_string()));
        }
        let chain = resolve_ancestor_chain(&backups, label)?;

        let mut extracted = BTreeMap::new();
        for l in &chain {
            extracted.insert(l.clone(), extract_backup(&layout, l)?);
        }

        let restore_root =
            layout.restored_tablespace_dir(&self.config.base_dir, server_name, label, "pg_default");
        std::fs::create_dir_all(&restore_root).map_err(io_err)?;

        let latest_root = extracted[&chain[0]].clone();
        let mut files = Vec::new();
        collect_files(&latest_root, &latest_root, &mut files)?;

        let pool = crate::worker_pool::WorkerPool::new(self.config.workers.max(1));
        let restored = files.len();
        for rel in files {
            let chain = chain.clone();
            let extracted = extracted.clone();
            let restore_root = restore_root.clone();
            pool.submit(move || restore_one_file(&chain, &extracted, &rel, &restore_root).is_ok());
        }
        let ok = pool.wait_for_quiescence();
        pool.shutdown();
        if !ok {
            return Err(PgmonetaError::Integrity(format!(
                "restore of {label} failed on one or more files"
            )));
        }

        Ok(serde_json::json!({
            "label": label,
            "restored_files": restored,
            "path": restore_root.to_string(),
        }))
    }

    async fn verify(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let manifest_text =
            std::fs::read_to_string(layout.backup_manifest_path(label)).map_err(io_err)?;
        let manifest_json: serde_json::Value =
            serde_json::from_str(&manifest_text).map_err(|e| PgmonetaError::Integrity(e.to_string()))?;
        let files = verify::parse_manifest_files(&manifest_json);

        let extracted = extract_backup(&layout, label)?;
        let entries: Vec<ManifestEntry> = files
            .into_iter()
            .map(|(path, expected_digest_hex)| ManifestEntry { path, expected_digest_hex })
            .collect();

        let hasher = Sha256Hasher;
        let (validity, mismatches) = verify::verify_backup(&entries, &hasher, |path| {
            Ok(Box::new(std::fs::File::open(extracted.join(path))?) as Box<dyn std::io::Read>)
        })
        .map_err(io_err)?;

        let mut backups = self.load_all_backups(&layout)?;
        if let Some(backup) = backups.get_mut(label) {
            backup.valid = validity;
            self.write_backup_info(&layout, backup)?;
        }

        Ok(serde_json::json!({
            "label": label,
            "valid": matches!(validity, Validity::Valid),
            "mismatches": mismatches.into_iter().map(|m| m.path).collect::<Vec<_>>(),
        }))
    }

    async fn delete(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let backups = self.load_all_backups(&layout)?;
        if !backups.contains_key(label) {
            return Err(PgmonetaError::MissingAncestor(label.to_string()));
        }
        if let Some(dependent) = backups
            .iter()
            .find(|(other_label, b)| *other_label != label && b.parent_label.as_deref() == Some(label))
        {
            return Err(PgmonetaError::Integrity(format!(
                "{label} is still the parent of {}",
                dependent.0
            )));
        }
        std::fs::remove_dir_all(layout.backup_dir(label).as_std_path()).map_err(io_err)?;
        let workspace = layout.workspace_dir(label);
        if workspace.exists() {
            std::fs::remove_dir_all(workspace.as_std_path()).map_err(io_err)?;
        }
        Ok(serde_json::json!({"label": label, "deleted": true}))
    }

    async fn retain(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let mut backups = self.load_all_backups(&layout)?;
        let backup = backups
            .get_mut(label)
            .ok_or_else(|| PgmonetaError::MissingAncestor(label.to_string()))?;
        backup.keep = true;
        let backup = backup.clone();
        self.write_backup_info(&layout, &backup)?;
        Ok(serde_json::json!({"label": label, "keep": true}))
    }

    async fn expunge(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let backups = self.load_all_backups(&layout)?;
        if !backups.contains_key(label) {
            return Err(PgmonetaError::MissingAncestor(label.to_string()));
        }

        // Every other backup is forced to survive so `plan_expunge` tells
        // us exactly one thing: whether some surviving incremental backup
        // still needs `label` on its ancestor chain.
        let mut probe = backups.clone();
        for (other_label, b) in probe.iter_mut() {
            b.keep = other_label != label;
        }
        let policy = RetentionPolicy { keep_count: 0, keep_seconds: None };
        let candidates = retention::plan_expunge(&probe, &policy, &BTreeMap::new());
        if !candidates.contains(&label.to_string()) {
            return Err(PgmonetaError::Integrity(format!(
                "{label} cannot be expunged: a later incremental backup still depends on it"
            )));
        }

        std::fs::remove_dir_all(layout.backup_dir(label).as_std_path()).map_err(io_err)?;
        Ok(serde_json::json!({"label": label, "expunged": true}))
    }

    async fn archive(&self, server_name: &str, label: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let backups = self.load_all_backups(&layout)?;
        if !backups.contains_key(label) {
            return Err(PgmonetaError::MissingAncestor(label.to_string()));
        }

        let archive_dir = layout.root().join("archive");
        std::fs::create_dir_all(&archive_dir).map_err(io_err)?;
        let archive_path = archive_dir.join(format!("{label}.tar"));
        let file = std::fs::File::create(&archive_path).map_err(io_err)?;
        let mut builder = tar::Builder::new(file);
        builder
            .append_dir_all(".", layout.backup_dir(label).as_std_path())
            .map_err(io_err)?;
        builder.finish().map_err(io_err)?;

        Ok(serde_json::json!({"label": label, "archive_path": archive_path.to_string()}))
    }

    async fn list_backup(&self, server_name: &str) -> Result<serde_json::Value, PgmonetaError> {
        let layout = self.layout(server_name);
        let backups = self.load_all_backups(&layout)?;
        let mut labels: Vec<String> = backups.keys().cloned().collect();
        listing::sort_labels(&mut labels, listing::SortOrder::Desc);

        let items: Vec<serde_json::Value> = labels
            .iter()
            .map(|label| {
                let backup = &backups[label];
                serde_json::json!({
                    "label": label,
                    "type": match backup.backup_type {
                        BackupType::Full => "full",
                        BackupType::Incremental => "incremental",
                    },
                    "valid": matches!(backup.valid, Validity::Valid),
                    "keep": backup.keep,
                })
            })
            .collect();
        Ok(serde_json::Value::Array(items))
    }
}

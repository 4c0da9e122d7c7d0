//! `backup.info`: one `KEY=VALUE` per line, UTF-8, LF line endings
//! (spec.md §6). Field order is not significant; unknown keys are
//! preserved verbatim on rewrite (spec.md §4.11).

use crate::model::{Backup, BackupType, CompressionKind, EncryptionKind, Tablespace, Validity};
use pgmoneta_utils::lsn::Lsn;
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupInfoError {
    #[error("line {0} is not in KEY=VALUE form")]
    MalformedLine(usize),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} has an unrecognised value {value:?}")]
    BadValue { field: &'static str, value: String },
}

/// Ordered key/value document. Known fields are written first in a fixed
/// order, followed by whatever unrecognised keys were read in, so a
/// round trip through an implementation that doesn't understand a newer
/// field still reproduces it byte-identically modulo key ordering.
#[derive(Debug, Clone, Default)]
pub struct BackupInfoDocument {
    pub fields: BTreeMap<String, String>,
}

impl BackupInfoDocument {
    pub fn parse(text: &str) -> Result<Self, BackupInfoError> {
        let mut fields = BTreeMap::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(BackupInfoError::MalformedLine(i + 1))?;
            fields.insert(key.to_string(), value.to_string());
        }
        Ok(BackupInfoDocument { fields })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.fields {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    fn get(&self, key: &'static str) -> Result<&str, BackupInfoError> {
        self.fields
            .get(key)
            .map(|s| s.as_str())
            .ok_or(BackupInfoError::MissingField(key))
    }

    fn parse_field<T: FromStr>(&self, key: &'static str) -> Result<T, BackupInfoError> {
        self.get(key)?
            .parse::<T>()
            .map_err(|_| BackupInfoError::BadValue {
                field: key,
                value: self.get(key).unwrap_or_default().to_string(),
            })
    }
}

const KNOWN_KEYS: &[&str] = &[
    "label",
    "type",
    "valid",
    "parent_label",
    "start_lsn",
    "end_lsn",
    "start_timeline",
    "end_timeline",
    "checkpoint_lsn",
    "wal_file_name",
    "restore_size",
    "biggest_file_size",
    "major_version",
    "minor_version",
    "compression",
    "encryption",
    "tablespaces",
    "elapsed_seconds",
    "keep",
    "comments",
];

fn compression_to_str(c: CompressionKind) -> &'static str {
    match c {
        CompressionKind::None => "none",
        CompressionKind::Gzip => "gzip",
        CompressionKind::Zstd => "zstd",
        CompressionKind::Lz4 => "lz4",
        CompressionKind::Bzip2 => "bzip2",
    }
}

fn compression_from_str(s: &str) -> Result<CompressionKind, BackupInfoError> {
    Ok(match s {
        "none" => CompressionKind::None,
        "gzip" => CompressionKind::Gzip,
        "zstd" => CompressionKind::Zstd,
        "lz4" => CompressionKind::Lz4,
        "bzip2" => CompressionKind::Bzip2,
        other => {
            return Err(BackupInfoError::BadValue {
                field: "compression",
                value: other.to_string(),
            })
        }
    })
}

fn encryption_to_str(e: EncryptionKind) -> &'static str {
    match e {
        EncryptionKind::None => "none",
        EncryptionKind::Aes => "aes",
        EncryptionKind::Aes128 => "aes128",
        EncryptionKind::Aes192 => "aes192",
        EncryptionKind::Aes256 => "aes256",
    }
}

fn encryption_from_str(s: &str) -> Result<EncryptionKind, BackupInfoError> {
    Ok(match s {
        "none" => EncryptionKind::None,
        "aes" => EncryptionKind::Aes,
        "aes128" => EncryptionKind::Aes128,
        "aes192" => EncryptionKind::Aes192,
        "aes256" => EncryptionKind::Aes256,
        other => {
            return Err(BackupInfoError::BadValue {
                field: "encryption",
                value: other.to_string(),
            })
        }
    })
}

/// `name:oid:path` tuples joined by `;`.
fn tablespaces_to_str(ts: &[Tablespace]) -> String {
    ts.iter()
        .map(|t| format!("{}:{}:{}", t.name, t.oid, t.path))
        .collect::<Vec<_>>()
        .join(";")
}

fn tablespaces_from_str(s: &str) -> Result<Vec<Tablespace>, BackupInfoError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(';')
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let name = parts.next().unwrap_or_default().to_string();
            let oid = parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or(BackupInfoError::BadValue {
                    field: "tablespaces",
                    value: entry.to_string(),
                })?;
            let path = parts.next().unwrap_or_default().to_string();
            Ok(Tablespace { name, oid, path })
        })
        .collect()
}

pub fn backup_to_document(backup: &Backup) -> BackupInfoDocument {
    let mut fields = backup.unknown_fields.clone();
    fields.insert("label".into(), backup.label.clone());
    fields.insert(
        "type".into(),
        match backup.backup_type {
            BackupType::Full => "full".into(),
            BackupType::Incremental => "incremental".into(),
        },
    );
    fields.insert(
        "valid".into(),
        match backup.valid {
            Validity::Valid => "true".into(),
            Validity::Invalid => "false".into(),
            Validity::Unknown => "unknown".into(),
        },
    );
    fields.insert(
        "parent_label".into(),
        backup.parent_label.clone().unwrap_or_default(),
    );
    fields.insert("start_lsn".into(), backup.start_lsn.0.to_string());
    fields.insert("end_lsn".into(), backup.end_lsn.0.to_string());
    fields.insert("start_timeline".into(), backup.start_timeline.to_string());
    fields.insert("end_timeline".into(), backup.end_timeline.to_string());
    fields.insert("checkpoint_lsn".into(), backup.checkpoint_lsn.0.to_string());
    fields.insert("wal_file_name".into(), backup.wal_file_name.clone());
    fields.insert("restore_size".into(), backup.restore_size.to_string());
    fields.insert(
        "biggest_file_size".into(),
        backup.biggest_file_size.to_string(),
    );
    fields.insert("major_version".into(), backup.major_version.to_string());
    fields.insert("minor_version".into(), backup.minor_version.to_string());
    fields.insert(
        "compression".into(),
        compression_to_str(backup.compression).to_string(),
    );
    fields.insert(
        "encryption".into(),
        encryption_to_str(backup.encryption).to_string(),
    );
    fields.insert(
        "tablespaces".into(),
        tablespaces_to_str(&backup.tablespaces),
    );
    fields.insert("elapsed_seconds".into(), backup.elapsed_seconds.to_string());
    fields.insert("keep".into(), backup.keep.to_string());
    fields.insert("comments".into(), backup.comments.clone());
    BackupInfoDocument { fields }
}

pub fn document_to_backup(doc: &BackupInfoDocument) -> Result<Backup, BackupInfoError> {
    let backup_type = match doc.get("type")? {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        other => {
            return Err(BackupInfoError::BadValue {
                field: "type",
                value: other.to_string(),
            })
        }
    };
    let valid = match doc.get("valid")? {
        "true" => Validity::Valid,
        "false" => Validity::Invalid,
        "unknown" => Validity::Unknown,
        other => {
            return Err(BackupInfoError::BadValue {
                field: "valid",
                value: other.to_string(),
            })
        }
    };
    let parent_label = doc.get("parent_label").ok().filter(|s| !s.is_empty()).map(|s| s.to_string());

    let mut unknown_fields = doc.fields.clone();
    for key in KNOWN_KEYS {
        unknown_fields.remove(*key);
    }

    Ok(Backup {
        label: doc.get("label")?.to_string(),
        backup_type,
        valid,
        parent_label,
        start_lsn: Lsn(doc.parse_field("start_lsn")?),
        end_lsn: Lsn(doc.parse_field("end_lsn")?),
        start_timeline: doc.parse_field("start_timeline")?,
        end_timeline: doc.parse_field("end_timeline")?,
        checkpoint_lsn: Lsn(doc.parse_field("checkpoint_lsn")?),
        wal_file_name: doc.get("wal_file_name")?.to_string(),
        restore_size: doc.parse_field("restore_size")?,
        biggest_file_size: doc.parse_field("biggest_file_size")?,
        major_version: doc.parse_field("major_version")?,
        minor_version: doc.parse_field("minor_version")?,
        compression: compression_from_str(doc.get("compression")?)?,
        encryption: encryption_from_str(doc.get("encryption")?)?,
        tablespaces: tablespaces_from_str(doc.get("tablespaces")?)?,
        elapsed_seconds: doc.parse_field("elapsed_seconds")?,
        keep: doc.parse_field("keep")?,
        comments: doc.get("comments").unwrap_or("").to_string(),
        unknown_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backup() -> Backup {
        Backup {
            label: "20240101T000000".into(),
            backup_type: BackupType::Full,
            valid: Validity::Valid,
            parent_label: None,
            start_lsn: Lsn(100),
            end_lsn: Lsn(200),
            start_timeline: 1,
            end_timeline: 1,
            checkpoint_lsn: Lsn(150),
            wal_file_name: "000000010000000000000001".into(),
            restore_size: 1024,
            biggest_file_size: 512,
            major_version: 16,
            minor_version: 2,
            compression: CompressionKind::Zstd,
            encryption: EncryptionKind::None,
            tablespaces: vec![Tablespace {
                name: "ts1".into(),
                oid: 16385,
                path: "/data/ts1".into(),
            }],
            elapsed_seconds: 12.5,
            keep: true,
            comments: "nightly".into(),
            unknown_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_through_document() {
        let backup = sample_backup();
        let doc = backup_to_document(&backup);
        let text = doc.render();
        assert!(text.ends_with('\n'));
        assert!(!text.contains('\r'));

        let reparsed = BackupInfoDocument::parse(&text).unwrap();
        let restored = document_to_backup(&reparsed).unwrap();
        assert_eq!(restored.label, backup.label);
        assert_eq!(restored.start_lsn, backup.start_lsn);
        assert_eq!(restored.tablespaces, backup.tablespaces);
        assert_eq!(restored.keep, backup.keep);
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let mut backup = sample_backup();
        backup
            .unknown_fields
            .insert("future_field".into(), "some-value".into());
        let doc = backup_to_document(&backup);
        let text = doc.render();
        assert!(text.contains("future_field=some-value"));

        let reparsed = BackupInfoDocument::parse(&text).unwrap();
        let restored = document_to_backup(&reparsed).unwrap();
        assert_eq!(
            restored.unknown_fields.get("future_field").map(String::as_str),
            Some("some-value")
        );
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(matches!(
            BackupInfoDocument::parse("label 20240101"),
            Err(BackupInfoError::MalformedLine(1))
        ));
    }
}

//! C7 — archive receiver: drains a `BASE_BACKUP` tar stream per
//! tablespace plus the manifest, storing each as a single, optionally
//! compressed file under the backup's data directory (spec.md §4.7).
//!
//! pgmoneta stores a tablespace's contents as the tar stream the origin
//! sent, not expanded into a directory tree — `base.tar`/`<oid>.tar`,
//! suffixed per `repository::file_type`'s extension chain. Expansion
//! only happens at restore time.

use crate::external::Codec;
use camino::Utf8Path;
use pgmoneta_utils::PgmonetaError;
use repl_client::session::{BaseBackupLsn, ReplicationSession};
use repository::ServerLayout;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub struct TablespaceSpec {
    pub oid: Option<String>,
    pub name: String,
}

/// Drains one `BASE_BACKUP`'s tablespace tar streams and its manifest
/// into `layout`'s data directory for `label`, then reads the trailing
/// end-LSN/timeline row the server sends once every stream has finished
/// (spec.md §4.2) so the caller can record it in `backup.info`.
///
/// An interrupted receive (an `Err` return partway through) leaves
/// `backup_manifest.tmp` on disk instead of renaming it, so the caller
/// can record `valid == false` without guessing at a partially written
/// manifest's status.
pub async fn receive<S>(
    session: &mut ReplicationSession<S>,
    layout: &ServerLayout,
    label: &str,
    tablespaces: &[TablespaceSpec],
    codec: &dyn Codec,
    extension: &str,
) -> Result<BaseBackupLsn, PgmonetaError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fs::create_dir_all(layout.data_dir(label))
        .await
        .map_err(|e| PgmonetaError::Other(e.into()))?;

    for tablespace in tablespaces {
        let file_name = match &tablespace.oid {
            Some(oid) => format!("{oid}.tar{extension}"),
            None => format!("base.tar{extension}"),
        };
        let dest = layout.data_dir(label).join(&file_name);
        receive_one_stream(session, &dest, codec).await?;
    }

    let manifest_tmp = layout.backup_manifest_tmp_path(label);
    receive_manifest(session, &manifest_tmp).await?;
    fs::rename(&manifest_tmp, layout.backup_manifest_path(label))
        .await
        .map_err(|e| PgmonetaError::Other(e.into()))?;

    // The end-LSN/timeline row follows the manifest's CopyData/CopyDone,
    // not the tablespace streams (the manifest is itself one more
    // CopyOut sequence wrapped by BASE_BACKUP before the trailing row).
    let end = session.base_backup_end().await?;

    Ok(end)
}

/// Reads CopyData frames until CopyDone into a raw scratch file, then
/// runs the configured codec over the complete stream and writes the
/// result to `dest`. The scratch file is removed once the compressed
/// copy lands; on error it (and a partial `dest`) are left for the
/// caller to clean up via the surrounding `.tmp` convention.
async fn receive_one_stream<S>(
    session: &mut ReplicationSession<S>,
    dest: &Utf8Path,
    codec: &dyn Codec,
) -> Result<(), PgmonetaError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw_path = dest.with_extension("raw");
    {
        let mut raw_file = fs::File::create(&raw_path)
            .await
            .map_err(|e| PgmonetaError::Other(e.into()))?;
        while let Some((_, payload)) = session.next_copy_message().await? {
            raw_file
                .write_all(&payload)
                .await
                .map_err(|e| PgmonetaError::Other(e.into()))?;
        }
        raw_file
            .flush()
            .await
            .map_err(|e| PgmonetaError::Other(e.into()))?;
    }

    let mut raw_reader =
        std::fs::File::open(&raw_path).map_err(|e| PgmonetaError::Other(e.into()))?;
    let mut out = std::fs::File::create(dest).map_err(|e| PgmonetaError::Other(e.into()))?;
    codec
        .compress(&mut raw_reader, &mut out)
        .map_err(|e| PgmonetaError::Other(e.into()))?;
    drop(raw_reader);
    std::fs::remove_file(&raw_path).map_err(|e| PgmonetaError::Other(e.into()))?;
    Ok(())
}

/// The manifest is stored uncompressed regardless of the data-file
/// compression setting — it's read back by `verify`/`list-backup`
/// without needing to know which codec a given backup used.
async fn receive_manifest<S>(
    session: &mut ReplicationSession<S>,
    manifest_tmp: &Utf8Path,
) -> Result<(), PgmonetaError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = fs::File::create(manifest_tmp)
        .await
        .map_err(|e| PgmonetaError::Other(e.into()))?;
    while let Some((_, payload)) = session.next_copy_message().await? {
        file.write_all(&payload)
            .await
            .map_err(|e| PgmonetaError::Other(e.into()))?;
    }
    file.flush().await.map_err(|e| PgmonetaError::Other(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NoneCodec;
    use camino_tempfile::tempdir;
    use std::io::Read;

    /// Exercises only the scratch-file-then-codec leg of `receive_one_stream`
    /// by writing to the raw path directly, since a live `ReplicationSession`
    /// needs a real socket.
    #[test]
    fn none_codec_pass_through_matches_input() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("base.raw");
        std::fs::write(&raw_path, b"hello tar bytes").unwrap();
        let dest = dir.path().join("base.tar");

        let mut raw_reader = std::fs::File::open(&raw_path).unwrap();
        let mut out = std::fs::File::create(&dest).unwrap();
        NoneCodec.compress(&mut raw_reader, &mut out).unwrap();

        let mut written = String::new();
        std::fs::File::open(&dest)
            .unwrap()
            .read_to_string(&mut written)
            .unwrap();
        assert_eq!(written, "hello tar bytes");
    }

    #[test]
    fn tablespace_file_name_uses_oid_when_present() {
        let base = TablespaceSpec {
            oid: None,
            name: "pg_default".into(),
        };
        let other = TablespaceSpec {
            oid: Some("16401".into()),
            name: "fast_ssd".into(),
        };
        assert_eq!(
            match &base.oid {
                Some(oid) => format!("{oid}.tar"),
                None => "base.tar".to_string(),
            },
            "base.tar"
        );
        assert_eq!(
            match &other.oid {
                Some(oid) => format!("{oid}.tar"),
                None => "base.tar".to_string(),
            },
            "16401.tar"
        );
    }
}

//! C11 — filesystem layout under `<base>/<server>/`, spec.md §4.11.

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone)]
pub struct ServerLayout {
    root: Utf8PathBuf,
}

impl ServerLayout {
    pub fn new(base: impl AsRef<Utf8Path>, server_name: &str) -> Self {
        ServerLayout {
            root: base.as_ref().join(server_name),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn backup_dir(&self, label: &str) -> Utf8PathBuf {
        self.root.join("backup").join(label)
    }

    pub fn data_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join("data")
    }

    pub fn backup_info_path(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join("backup.info")
    }

    pub fn backup_manifest_path(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join("backup_manifest")
    }

    pub fn backup_manifest_tmp_path(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join("backup_manifest.tmp")
    }

    pub fn extra_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join("extra")
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.root.join("wal")
    }

    pub fn workspace_dir(&self, label: &str) -> Utf8PathBuf {
        self.root.join("workspace").join(label)
    }

    /// `<server>-<label>-<tblspc>`, sibling of `root`'s parent (the base
    /// directory), per spec.md's literal layout diagram.
    pub fn restored_tablespace_dir(&self, base: impl AsRef<Utf8Path>, server_name: &str, label: &str, tablespace: &str) -> Utf8PathBuf {
        base.as_ref()
            .join(format!("{server_name}-{label}-{tablespace}"))
    }

    /// An incremental-backup relation file, named `INCREMENTAL.<basename>`
    /// in the backup's data tree (spec.md §4.11).
    pub fn incremental_file_name(basename: &str) -> String {
        format!("INCREMENTAL.{basename}")
    }

    /// A backup is invalid until `backup_manifest.tmp` has been renamed to
    /// `backup_manifest`; this checks for that leftover marker.
    pub fn manifest_is_pending(&self, label: &str) -> bool {
        self.backup_manifest_tmp_path(label).exists()
    }
}

//! Copyable files. An [`Asset`] is the unit every runner knows how to place on
//! a host: its bytes (held in memory or read on demand from a local path), the
//! destination directory and name, octal permissions and an optional
//! modification time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::io::AsyncRead;

/// Largest asset a runner will transfer.
pub const MAX_ASSET_LENGTH: u64 = 1 << 31;

/// Reasons an asset cannot be constructed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AssetError {
    /// The permission string is not an octal file mode.
    #[error("invalid octal permissions {0:?}")]
    InvalidPermissions(String),
    /// The asset is larger than [`MAX_ASSET_LENGTH`].
    #[error("asset is {0} bytes, larger than the 2147483648 byte limit")]
    TooLarge(u64),
}

/// Parses an octal permission string such as `"0644"` or `"755"`.
pub fn parse_permissions(permissions: &str) -> Result<u32, AssetError> {
    let trimmed = permissions.trim();
    if trimmed.is_empty() {
        return Err(AssetError::InvalidPermissions(permissions.to_string()));
    }
    match u32::from_str_radix(trimmed, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(AssetError::InvalidPermissions(permissions.to_string())),
    }
}

/// Where an asset's bytes come from.
#[derive(Clone, Debug)]
pub enum AssetSource {
    /// The bytes are held in memory.
    Memory(Vec<u8>),
    /// The bytes are read from a local path when the asset is copied.
    File(PathBuf),
}

/// A file that can be copied to a host by a [`Runner`](crate::Runner).
#[derive(Clone, Debug)]
pub struct Asset {
    source: AssetSource,
    target_dir: String,
    target_name: String,
    permissions: String,
    mode: u32,
    modtime: Option<SystemTime>,
    length: u64,
}

impl Asset {
    /// Creates a memory-backed asset.
    pub fn from_bytes(
        bytes: impl Into<Vec<u8>>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Result<Self, AssetError> {
        let bytes = bytes.into();
        let permissions = permissions.into();
        let mode = parse_permissions(&permissions)?;
        let length = bytes.len() as u64;
        if length > MAX_ASSET_LENGTH {
            return Err(AssetError::TooLarge(length));
        }
        Ok(Asset {
            source: AssetSource::Memory(bytes),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions,
            mode,
            modtime: None,
            length,
        })
    }

    /// Creates a file-backed asset. The file is stat'ed now for its length
    /// and modification time and read again when copied.
    pub async fn from_file(
        source: impl AsRef<Path>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let source = source.as_ref().to_path_buf();
        let permissions = permissions.into();
        let mode = parse_permissions(&permissions)?;
        let metadata = tokio::fs::metadata(&source).await.map_err(|e| {
            anyhow::anyhow!("unable to stat asset source {}: {}", source.display(), e)
        })?;
        let length = metadata.len();
        if length > MAX_ASSET_LENGTH {
            return Err(AssetError::TooLarge(length).into());
        }
        Ok(Asset {
            source: AssetSource::File(source),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions,
            mode,
            modtime: metadata.modified().ok(),
            length,
        })
    }

    /// Sets the modification time to preserve on the host.
    pub fn with_modtime(mut self, modtime: SystemTime) -> Self {
        self.modtime = Some(modtime);
        self
    }

    /// Where the bytes come from.
    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    /// The local path backing this asset, if it is file-backed.
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            AssetSource::File(p) => Some(p),
            AssetSource::Memory(_) => None,
        }
    }

    /// Directory on the host.
    pub fn target_dir(&self) -> &str {
        &self.target_dir
    }

    /// File name on the host.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Full path on the host.
    pub fn target_path(&self) -> String {
        join_guest_path(&self.target_dir, &self.target_name)
    }

    /// Permissions as given, e.g. `"0644"`.
    pub fn permissions(&self) -> &str {
        &self.permissions
    }

    /// Permissions as a numeric mode.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Permissions as a four digit octal string, as `chmod` and scp expect.
    pub fn octal_mode(&self) -> String {
        format!("{:04o}", self.mode)
    }

    /// Modification time to preserve, if any.
    pub fn modtime(&self) -> Option<SystemTime> {
        self.modtime
    }

    /// Length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Reads the whole asset.
    pub async fn contents(&self) -> std::io::Result<Vec<u8>> {
        match &self.source {
            AssetSource::Memory(b) => Ok(b.clone()),
            AssetSource::File(p) => tokio::fs::read(p).await,
        }
    }

    /// Opens a reader over the asset's bytes.
    pub async fn reader(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            AssetSource::Memory(b) => Ok(Box::new(std::io::Cursor::new(b.clone()))),
            AssetSource::File(p) => Ok(Box::new(tokio::fs::File::open(p).await?)),
        }
    }
}

/// Joins a guest directory and a file name with exactly one `/`.
pub fn join_guest_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permissions_must_be_octal() {
        assert_eq!(parse_permissions("0644"), Ok(0o644));
        assert_eq!(parse_permissions("755"), Ok(0o755));
        assert_eq!(
            parse_permissions("0999"),
            Err(AssetError::InvalidPermissions("0999".to_string()))
        );
        assert!(parse_permissions("").is_err());
        assert!(parse_permissions("rwx").is_err());
        assert!(parse_permissions("17777").is_err());
    }

    #[test]
    fn memory_asset_reports_its_shape() {
        let asset = Asset::from_bytes("hello", "/etc/foo/", "bar.conf", "644")
            .expect("asset should be valid");
        assert_eq!(asset.length(), 5);
        assert_eq!(asset.target_path(), "/etc/foo/bar.conf");
        assert_eq!(asset.octal_mode(), "0644");
        assert!(asset.source_path().is_none());
    }

    #[test]
    fn memory_asset_rejects_bad_permissions() {
        let err = Asset::from_bytes("x", "/tmp", "x", "abc").unwrap_err();
        assert_eq!(err, AssetError::InvalidPermissions("abc".to_string()));
    }

    #[tokio::test]
    async fn file_asset_reads_on_demand() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let path = dir.path().join("kubelet");
        tokio::fs::write(&path, b"binary").await.unwrap();

        let asset = Asset::from_file(&path, "/var/lib/minikube/binaries/v1.23.0", "kubelet", "0755")
            .await
            .expect("asset should be valid");
        assert_eq!(asset.length(), 6);
        assert!(asset.modtime().is_some());

        tokio::fs::write(&path, b"binary-v2").await.unwrap();
        assert_eq!(asset.contents().await.unwrap(), b"binary-v2".to_vec());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = Asset::from_file("/definitely/not/here", "/tmp", "x", "0644").await;
        assert!(err.is_err());
    }
}

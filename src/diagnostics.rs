use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BinaryPaths;

/// Whether a tunnel binary can be found, and which build it is
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BinaryStatus {
    Present { path: PathBuf, fingerprint: String },
    Unreadable { path: PathBuf, reason: String },
    Missing,
}

impl BinaryStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, BinaryStatus::Present { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinariesInfo {
    pub client: BinaryStatus,
    pub server: BinaryStatus,
    pub ok: bool,
}

/// Resolve `binary` the way a spawn would: paths containing a separator are
/// used as-is, bare names are looked up on `PATH`.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return is_executable(binary).then(|| binary.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// First eight hex digits of the file's SHA-256
pub async fn fingerprint(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    Ok(digest[..4].iter().map(|b| format!("{b:02x}")).collect())
}

pub async fn binary_status(binary: &Path) -> BinaryStatus {
    let Some(path) = resolve_binary(binary) else {
        return BinaryStatus::Missing;
    };
    match fingerprint(&path).await {
        Ok(fingerprint) => BinaryStatus::Present { path, fingerprint },
        Err(e) => BinaryStatus::Unreadable {
            path,
            reason: e.to_string(),
        },
    }
}

pub async fn binaries_info(paths: &BinaryPaths) -> BinariesInfo {
    let client = binary_status(&paths.client).await;
    let server = binary_status(&paths.server).await;
    let ok = client.is_present() && server.is_present();
    BinariesInfo { client, server, ok }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_binary;

    #[tokio::test]
    async fn test_present_binary_has_fingerprint() {
        let status = binary_status(&stub_binary("exits")).await;
        match status {
            BinaryStatus::Present { fingerprint, .. } => {
                assert_eq!(fingerprint.len(), 8);
                assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
            }
            other => panic!("expected present binary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binaries() {
        let paths = BinaryPaths {
            client: PathBuf::from("phantun_client_that_does_not_exist"),
            server: stub_binary("long-running"),
        };
        let info = binaries_info(&paths).await;

        assert_eq!(info.client, BinaryStatus::Missing);
        assert!(info.server.is_present());
        assert!(!info.ok);
    }

    #[test]
    fn test_bare_name_resolves_on_path() {
        assert!(resolve_binary(Path::new("sh")).is_some());
    }

    #[test]
    fn test_non_executable_file_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"not a program").unwrap();
        assert!(resolve_binary(&path).is_none());
    }
}

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    command::CommandRunner,
    error::{ManagerError, ManagerResult},
};

/// Prefix shared by every interface the tunnel binaries create
pub const TUN_PREFIX: &str = "tun";

const SYSFS_NET: &str = "/sys/class/net";

/// Administrative state of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub status: LinkState,
    pub point_to_point: bool,
}

/// Removes tunnel interfaces left behind by instances that are no longer configured
#[derive(Clone)]
pub struct InterfaceJanitor {
    runner: Arc<dyn CommandRunner>,
    sysfs_root: PathBuf,
}

impl InterfaceJanitor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_sysfs_root(runner, SYSFS_NET)
    }

    /// Read interfaces from `root` instead of `/sys/class/net`
    pub fn with_sysfs_root(runner: Arc<dyn CommandRunner>, root: impl AsRef<Path>) -> Self {
        Self {
            runner,
            sysfs_root: root.as_ref().to_path_buf(),
        }
    }

    async fn interface_names(&self) -> ManagerResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_root).await.map_err(|e| {
            ManagerError::Interface(format!(
                "Failed to list interfaces in {}: {e}",
                self.sysfs_root.display()
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn flags(&self, name: &str) -> Option<u32> {
        let raw = tokio::fs::read_to_string(self.sysfs_root.join(name).join("flags"))
            .await
            .ok()?;
        let raw = raw.trim();
        u32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
    }

    /// Delete every `tun*` interface whose name is not in `allowed`.
    ///
    /// Deletion is best-effort: failures are logged and the remaining
    /// interfaces are still processed. Returns how many were deleted.
    pub async fn cleanup_unused(&self, allowed: &[String]) -> ManagerResult<usize> {
        let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
        let mut deleted = 0;

        for name in self.interface_names().await? {
            if !name.starts_with(TUN_PREFIX) || allowed.contains(name.as_str()) {
                continue;
            }

            info!("Cleaning up zombie interface: {}", name);
            let args = vec!["link".to_string(), "delete".to_string(), name.clone()];
            match self.runner.run("ip", &args).await {
                Ok(out) if out.success => deleted += 1,
                Ok(out) => warn!("Failed to delete interface {}: {}", name, out.output.trim()),
                Err(e) => warn!("Failed to delete interface {}: {}", name, e),
            }
        }

        debug!("Interface cleanup removed {} interfaces", deleted);
        Ok(deleted)
    }

    /// Point-to-point or `tun*` interfaces with their link state
    pub async fn tun_interfaces(&self) -> ManagerResult<Vec<InterfaceInfo>> {
        let mut infos = Vec::new();

        for name in self.interface_names().await? {
            let flags = self.flags(&name).await.unwrap_or(0);
            let point_to_point = flags & libc::IFF_POINTOPOINT as u32 != 0;
            if !point_to_point && !name.starts_with(TUN_PREFIX) {
                continue;
            }

            let status = if flags & libc::IFF_UP as u32 != 0 {
                LinkState::Up
            } else {
                LinkState::Down
            };
            infos.push(InterfaceInfo {
                name,
                status,
                point_to_point,
            });
        }

        Ok(infos)
    }
}

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{ManagerError, ManagerResult},
    instance::{Instance, InstanceKind, InstanceSpec},
    janitor::TUN_PREFIX,
};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/phantun/config.json";

/// Prefix of environment overrides, e.g. `PHANTUN_GENERAL__ENABLED=true`
pub const ENV_PREFIX: &str = "PHANTUN";

/// Configuration shared between the supervisor and whoever edits it
pub type SharedConfig = Arc<RwLock<Config>>;

/// Manager configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub clients: Vec<InstanceSpec>,
    #[serde(default)]
    pub servers: Vec<InstanceSpec>,
    #[serde(default)]
    pub binaries: BinaryPaths,
    /// File this configuration was loaded from and is saved to
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Master switch: nothing is started while this is off
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Tunnel executables, either bare names looked up on `PATH` or paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryPaths {
    #[serde(default = "default_client_binary")]
    pub client: PathBuf,
    #[serde(default = "default_server_binary")]
    pub server: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            client: default_client_binary(),
            server: default_server_binary(),
        }
    }
}

impl BinaryPaths {
    pub fn for_kind(&self, kind: InstanceKind) -> &Path {
        match kind {
            InstanceKind::Client => &self.client,
            InstanceKind::Server => &self.server,
        }
    }
}

fn default_client_binary() -> PathBuf {
    PathBuf::from("phantun_client")
}

fn default_server_binary() -> PathBuf {
    PathBuf::from("phantun_server")
}

impl Config {
    /// Defaults bound to `path`, used when there is no file yet
    pub fn default_at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file, with `PHANTUN_*` environment
    /// overrides on top. A missing file yields the defaults.
    ///
    /// Instances without an id get a fresh UUID and instances without a
    /// tunnel name get the first free `tunN`; the file is rewritten
    /// best-effort when anything was assigned.
    pub fn load<P: AsRef<Path>>(path: P) -> ManagerResult<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ManagerError::Config(format!("Failed to read config: {e}")))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| ManagerError::Config(format!("Failed to parse config: {e}")))?;
        config.path = Some(path.to_path_buf());

        if config.assign_missing() && path.exists() {
            if let Err(e) = config.save() {
                warn!("Could not persist generated ids to {}: {}", path.display(), e);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Give every instance an id and a tunnel interface name.
    /// Returns whether anything changed.
    fn assign_missing(&mut self) -> bool {
        let mut changed = false;
        let mut taken: HashSet<String> = self
            .clients
            .iter()
            .chain(self.servers.iter())
            .filter_map(|spec| spec.tun_name.clone())
            .filter(|name| !name.is_empty())
            .collect();
        let mut next_index = 0;

        for spec in self.clients.iter_mut().chain(self.servers.iter_mut()) {
            if spec.id.is_empty() {
                spec.id = Uuid::new_v4().to_string();
                changed = true;
            }
            if spec.tun_name.as_deref().is_none_or(str::is_empty) {
                let name = loop {
                    let candidate = format!("{TUN_PREFIX}{next_index}");
                    next_index += 1;
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                };
                taken.insert(name.clone());
                spec.tun_name = Some(name);
                changed = true;
            }
        }

        changed
    }

    /// Save configuration to its file as pretty JSON
    pub fn save(&self) -> ManagerResult<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| ManagerError::Config("Config has no file path".to_string()))?;
        self.save_to(path)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> ManagerResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ManagerError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ManagerError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Replace the editable sections, keeping the file path and binaries.
    ///
    /// New instances get ids and tunnel names the same way `load` assigns
    /// them. An invalid result is rejected and leaves `self` untouched.
    pub fn update(
        &mut self,
        general: GeneralConfig,
        clients: Vec<InstanceSpec>,
        servers: Vec<InstanceSpec>,
    ) -> ManagerResult<()> {
        let mut next = Config {
            general,
            clients,
            servers,
            binaries: self.binaries.clone(),
            path: self.path.clone(),
        };
        next.assign_missing();
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Delete the file and fall back to defaults
    pub fn reset(&mut self) -> ManagerResult<()> {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => info!("Removed config file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ManagerError::Config(format!(
                        "Failed to delete config file: {e}"
                    )));
                }
            }
        }
        let defaults = Config::default();
        self.update(defaults.general, defaults.clients, defaults.servers)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ManagerResult<()> {
        let mut ids = HashSet::new();
        let mut tun_names = HashSet::new();

        for (kind, spec) in self.specs() {
            if spec.alias.trim().is_empty() {
                return Err(ManagerError::Config(format!("{kind} {}: alias cannot be empty", spec.id)));
            }
            let label = format!("{} '{}'", kind, spec.alias);

            if spec.local_port == 0 || spec.remote_port == 0 {
                return Err(ManagerError::Config(format!("{label}: ports must be non-zero")));
            }
            if spec.remote_addr.is_empty() {
                return Err(ManagerError::Config(format!(
                    "{label}: remote address cannot be empty"
                )));
            }
            if !spec.id.is_empty() && !ids.insert(spec.id.as_str()) {
                return Err(ManagerError::Config(format!("{label}: duplicate id {}", spec.id)));
            }
            if let Some(name) = spec.tun_name.as_deref().filter(|name| !name.is_empty())
                && !tun_names.insert(name)
            {
                return Err(ManagerError::Config(format!(
                    "{label}: tunnel interface {name} is already used"
                )));
            }
        }

        Ok(())
    }

    fn specs(&self) -> impl Iterator<Item = (InstanceKind, &InstanceSpec)> {
        self.clients
            .iter()
            .map(|spec| (InstanceKind::Client, spec))
            .chain(self.servers.iter().map(|spec| (InstanceKind::Server, spec)))
    }

    /// Every configured instance, clients first, enabled or not
    pub fn instances(&self) -> impl Iterator<Item = Instance> + '_ {
        self.clients
            .iter()
            .cloned()
            .map(Instance::Client)
            .chain(self.servers.iter().cloned().map(Instance::Server))
    }

    pub fn enabled_instances(&self) -> Vec<Instance> {
        self.instances()
            .filter(|instance| instance.spec().enabled)
            .collect()
    }

    /// Tunnel interface names claimed by configured instances
    pub fn tun_names(&self) -> Vec<String> {
        self.clients
            .iter()
            .chain(self.servers.iter())
            .filter_map(|spec| spec.tun_name.clone())
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

use std::{collections::HashMap, path::Path, process::Stdio, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, error, info, warn};

use crate::{
    command::{CommandRunner, SystemRunner},
    config::SharedConfig,
    diagnostics::{BinariesInfo, binaries_info},
    error::{ManagerError, ManagerResult},
    firewall::{Family, FirewallError, FirewallReconciler, FirewallStats},
    hub::{LogHub, LogRecord, Stream},
    instance::{Instance, InstanceKind},
    janitor::{InterfaceInfo, InterfaceJanitor},
};

const READ_CHUNK: usize = 1024;

/// A tunnel instance the supervisor started
#[derive(Debug)]
pub struct RunningProcess {
    /// Instance as it was when started, with default addressing filled in
    pub instance: Instance,
    pub started_at: DateTime<Utc>,
    child: Child,
}

impl RunningProcess {
    pub fn kind(&self) -> InstanceKind {
        self.instance.kind()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the child has not exited yet. Reaps without signalling.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process {} exited with status: {}", self.instance.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Error checking process {} status: {}", self.instance.id(), e);
                false
            }
        }
    }

    /// Ask the child to exit with SIGTERM; does not wait for it
    fn terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not reaped yet.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Status of one running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub id: String,
    pub alias: String,
    #[serde(rename = "type")]
    pub kind: InstanceKind,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Everything an observer needs to render the manager's state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub processes: Vec<ProcessStatus>,
    pub binaries: BinariesInfo,
    pub firewall: Option<FirewallStats>,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Starts and stops tunnel instances and keeps the firewall in step with them.
///
/// `start_all`, `stop_all` and `status` are serialized by one lock over the
/// instance table. Output readers publish to the hub without taking it.
pub struct Supervisor {
    config: SharedConfig,
    firewall: FirewallReconciler,
    janitor: InterfaceJanitor,
    hub: LogHub,
    processes: Mutex<HashMap<String, RunningProcess>>,
}

impl Supervisor {
    pub fn new(config: SharedConfig, hub: LogHub, firewall: FirewallReconciler, janitor: InterfaceJanitor) -> Self {
        Self {
            config,
            firewall,
            janitor,
            hub,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Supervisor driving the real host tools
    pub fn from_system(config: SharedConfig, hub: LogHub) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self::new(
            config,
            hub,
            FirewallReconciler::new(runner.clone()),
            InterfaceJanitor::new(runner),
        )
    }

    pub fn firewall(&self) -> &FirewallReconciler {
        &self.firewall
    }

    pub fn janitor(&self) -> &InterfaceJanitor {
        &self.janitor
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Start every enabled instance that is not already running.
    ///
    /// Does nothing while the global switch is off. One instance failing to
    /// start is logged and the rest still start. Returns how many started.
    pub async fn start_all(&self) -> ManagerResult<usize> {
        let mut processes = self.processes.lock().await;
        let config = self.config.read().await.clone();

        if !config.general.enabled {
            info!("Global switch disabled. Skipping start.");
            return Ok(0);
        }

        if let Err(e) = self.janitor.cleanup_unused(&config.tun_names()).await {
            warn!("Failed to cleanup zombie interfaces: {}", e);
        }

        let enabled = config.enabled_instances();
        if enabled.is_empty() {
            info!("No enabled instances found. Skipping start.");
            return Ok(0);
        }

        info!("Starting {} active instances...", enabled.len());

        let mut started = 0;
        for instance in enabled {
            if let Some(existing) = processes.get_mut(instance.id()) {
                if existing.is_running() {
                    info!("{} {} already running, skipping", instance.kind(), instance.alias());
                    continue;
                }
                processes.remove(instance.id());
            }

            let binary = config.binaries.for_kind(instance.kind());
            match self.start_one(&instance, binary).await {
                Ok(process) => {
                    processes.insert(instance.id().to_string(), process);
                    started += 1;
                }
                Err(e) => error!("Failed to start {} {}: {}", instance.kind(), instance.alias(), e),
            }
        }

        Ok(started)
    }

    async fn start_one(&self, instance: &Instance, binary: &Path) -> ManagerResult<RunningProcess> {
        let instance = instance.clone().with_defaults();
        let kind = instance.kind();
        let spec = instance.spec();

        if let Err(e) = self.firewall.setup(&instance, Family::V4).await {
            if !matches!(e, FirewallError::ReservedPort(_)) {
                self.rollback(&instance).await;
            }
            return Err(e.into());
        }
        if !spec.ipv4_only
            && let Err(e) = self.firewall.setup(&instance, Family::V6).await
        {
            warn!("Failed to setup IPv6 firewall for {} {}: {}", kind, spec.alias, e);
        }

        let mut cmd = Command::new(binary);
        cmd.args(instance.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            "Starting {} command: {}",
            kind,
            instance.command_string(&binary.display().to_string())
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.rollback(&instance).await;
                return Err(ManagerError::Spawn(format!(
                    "Failed to start {}: {e}",
                    binary.display()
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.hub.clone(), instance.id().to_string(), Stream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.hub.clone(), instance.id().to_string(), Stream::Stderr, stderr);
        }

        info!(
            "Started {} {} (PID {})",
            kind,
            spec.alias,
            child.id().map_or_else(|| "?".to_string(), |pid| pid.to_string())
        );

        Ok(RunningProcess {
            instance,
            started_at: Utc::now(),
            child,
        })
    }

    /// Remove whatever rules a failed start may have left
    async fn rollback(&self, instance: &Instance) {
        if let Err(e) = self.firewall.cleanup(instance, Family::V4).await {
            warn!("Rollback of IPv4 rules for {} failed: {}", instance.alias(), e);
        }
        if !instance.spec().ipv4_only
            && let Err(e) = self.firewall.cleanup(instance, Family::V6).await
        {
            debug!("Rollback of IPv6 rules for {} failed: {}", instance.alias(), e);
        }
    }

    /// Signal every tracked instance and purge all owned firewall rules.
    ///
    /// The purge runs even with nothing tracked, so rules from crashed or
    /// forgotten instances are removed too. Children are not awaited.
    pub async fn stop_all(&self) {
        let mut processes = self.processes.lock().await;

        for (id, mut process) in processes.drain() {
            info!("Stopping process {} ({})", id, process.kind());
            if let Err(e) = process.terminate() {
                warn!("Error stopping process {}: {}", id, e);
            }
        }

        match self.firewall.cleanup_all().await {
            Ok(removed) => info!("Global firewall cleanup executed, {} rules removed", removed),
            Err(e) => error!("Error during forced cleanup: {}", e),
        }
    }

    pub async fn restart(&self) -> ManagerResult<usize> {
        self.stop_all().await;
        self.start_all().await
    }

    /// Snapshot of tracked instances, clients first, by alias
    pub async fn status(&self) -> Vec<ProcessStatus> {
        let mut processes = self.processes.lock().await;
        let mut list: Vec<ProcessStatus> = processes
            .values_mut()
            .map(|process| ProcessStatus {
                id: process.instance.id().to_string(),
                alias: process.instance.alias().to_string(),
                kind: process.kind(),
                pid: process.pid(),
                running: process.is_running(),
            })
            .collect();
        list.sort_by(|a, b| (a.kind.as_str(), &a.alias).cmp(&(b.kind.as_str(), &b.alias)));
        list
    }

    pub async fn report(&self) -> StatusReport {
        let (enabled, binaries) = {
            let config = self.config.read().await;
            (config.general.enabled, config.binaries.clone())
        };

        let firewall = match self.firewall.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Firewall stats unavailable: {}", e);
                None
            }
        };
        let interfaces = self.janitor.tun_interfaces().await.unwrap_or_else(|e| {
            debug!("Interface listing unavailable: {}", e);
            Vec::new()
        });

        StatusReport {
            enabled,
            processes: self.status().await,
            binaries: binaries_info(&binaries).await,
            firewall,
            interfaces,
        }
    }
}

/// Publish every chunk read from `reader` until it reaches EOF
fn forward_output<R>(hub: LogHub, process_id: String, stream: Stream, mut reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => hub.publish(LogRecord::new(
                    process_id.clone(),
                    stream,
                    String::from_utf8_lossy(&buf[..n]),
                )),
                Err(e) => {
                    debug!("Output reader for {} stopped: {}", process_id, e);
                    break;
                }
            }
        }
    });
}

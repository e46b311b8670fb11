use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::firewall::Family;

/// Interface name phantun falls back to when `--tun` is not given
pub const DEFAULT_TUN_NAME: &str = "tun0";

/// Bind address used for a client's `--local` when none is configured
pub const DEFAULT_CLIENT_BIND: &str = "127.0.0.1";

/// Settings shared by client and server tunnel instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Stable identifier, generated on load when empty
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub enabled: bool,
    /// Local bind address (clients only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_local: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_peer: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_local_ipv6: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_peer_ipv6: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_name: Option<String>,
    /// Packet file sent as the first payload after the fake TCP handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_file: Option<PathBuf>,
    #[serde(default)]
    pub ipv4_only: bool,
}

/// Which side of the tunnel an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Client,
    Server,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Client => "client",
            InstanceKind::Server => "server",
        }
    }

    /// Default IPv4 tunnel addresses (local, peer). Clients and servers use
    /// separate subnets so both can run on one host.
    fn default_tun_v4(&self) -> (Ipv4Addr, Ipv4Addr) {
        match self {
            InstanceKind::Client => (Ipv4Addr::new(192, 168, 200, 1), Ipv4Addr::new(192, 168, 200, 2)),
            InstanceKind::Server => (Ipv4Addr::new(192, 168, 201, 1), Ipv4Addr::new(192, 168, 201, 2)),
        }
    }

    fn default_tun_v6(&self) -> (Ipv6Addr, Ipv6Addr) {
        match self {
            InstanceKind::Client => (
                Ipv6Addr::new(0xfcc8, 0, 0, 0, 0, 0, 0, 1),
                Ipv6Addr::new(0xfcc8, 0, 0, 0, 0, 0, 0, 2),
            ),
            InstanceKind::Server => (
                Ipv6Addr::new(0xfcc9, 0, 0, 0, 0, 0, 0, 1),
                Ipv6Addr::new(0xfcc9, 0, 0, 0, 0, 0, 0, 2),
            ),
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel interface addressing with per-kind defaults applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelAddrs {
    pub local: Ipv4Addr,
    pub peer: Ipv4Addr,
    pub local6: Ipv6Addr,
    pub peer6: Ipv6Addr,
}

impl TunnelAddrs {
    pub fn peer(&self, family: Family) -> IpAddr {
        match family {
            Family::V4 => IpAddr::V4(self.peer),
            Family::V6 => IpAddr::V6(self.peer6),
        }
    }
}

impl InstanceSpec {
    /// Resolve tunnel addressing, filling gaps with the defaults for `kind`
    pub fn tunnel(&self, kind: InstanceKind) -> TunnelAddrs {
        let (local, peer) = kind.default_tun_v4();
        let (local6, peer6) = kind.default_tun_v6();
        TunnelAddrs {
            local: self.tun_local.unwrap_or(local),
            peer: self.tun_peer.unwrap_or(peer),
            local6: self.tun_local_ipv6.unwrap_or(local6),
            peer6: self.tun_peer_ipv6.unwrap_or(peer6),
        }
    }

    fn with_defaults(mut self, kind: InstanceKind) -> Self {
        let tunnel = self.tunnel(kind);
        self.tun_local = Some(tunnel.local);
        self.tun_peer = Some(tunnel.peer);
        if !self.ipv4_only {
            self.tun_local_ipv6 = Some(tunnel.local6);
            self.tun_peer_ipv6 = Some(tunnel.peer6);
        }
        self
    }

    /// Interface name the tunnel binary will create
    pub fn effective_tun_name(&self) -> &str {
        self.tun_name.as_deref().unwrap_or(DEFAULT_TUN_NAME)
    }
}

/// A configured tunnel endpoint, tagged with the side it runs
#[derive(Debug, Clone, PartialEq)]
pub enum Instance {
    Client(InstanceSpec),
    Server(InstanceSpec),
}

impl Instance {
    pub fn kind(&self) -> InstanceKind {
        match self {
            Instance::Client(_) => InstanceKind::Client,
            Instance::Server(_) => InstanceKind::Server,
        }
    }

    pub fn spec(&self) -> &InstanceSpec {
        match self {
            Instance::Client(spec) | Instance::Server(spec) => spec,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec().id
    }

    pub fn alias(&self) -> &str {
        &self.spec().alias
    }

    pub fn tunnel(&self) -> TunnelAddrs {
        self.spec().tunnel(self.kind())
    }

    /// Snapshot with every defaulted tunnel address written out
    pub fn with_defaults(self) -> Self {
        match self {
            Instance::Client(spec) => Instance::Client(spec.with_defaults(InstanceKind::Client)),
            Instance::Server(spec) => Instance::Server(spec.with_defaults(InstanceKind::Server)),
        }
    }

    /// Value for `--local`: `host:port` for clients, a bare port for servers
    pub fn local_arg(&self) -> String {
        match self {
            Instance::Client(spec) => {
                let addr = spec
                    .local_addr
                    .as_deref()
                    .filter(|addr| !addr.is_empty())
                    .unwrap_or(DEFAULT_CLIENT_BIND);
                format!("{}:{}", addr, spec.local_port)
            }
            Instance::Server(spec) => spec.local_port.to_string(),
        }
    }

    /// Arguments passed to the tunnel binary
    pub fn command_args(&self) -> Vec<String> {
        let spec = self.spec();
        let tunnel = self.tunnel();

        let mut args = vec![
            "--local".to_string(),
            self.local_arg(),
            "--remote".to_string(),
            format!("{}:{}", spec.remote_addr, spec.remote_port),
            "--tun-local".to_string(),
            tunnel.local.to_string(),
            "--tun-peer".to_string(),
            tunnel.peer.to_string(),
        ];

        if let Some(name) = spec.tun_name.as_deref().filter(|name| !name.is_empty()) {
            args.extend(["--tun".to_string(), name.to_string()]);
        }

        if spec.ipv4_only {
            args.push("--ipv4-only".to_string());
        } else {
            args.extend([
                "--tun-local6".to_string(),
                tunnel.local6.to_string(),
                "--tun-peer6".to_string(),
                tunnel.peer6.to_string(),
            ]);
        }

        if let Some(path) = &spec.handshake_file {
            args.extend([
                "--handshake-packet".to_string(),
                path.display().to_string(),
            ]);
        }

        args
    }

    /// Command line for debugging/logging
    pub fn command_string(&self, binary: &str) -> String {
        let mut parts = vec![binary.to_string()];
        parts.extend(self.command_args());
        parts.join(" ")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn client_spec(id: &str) -> InstanceSpec {
        InstanceSpec {
            id: id.to_string(),
            alias: format!("client-{id}"),
            enabled: true,
            local_addr: Some("127.0.0.1".to_string()),
            local_port: 4567,
            remote_addr: "203.0.113.10".to_string(),
            remote_port: 4567,
            tun_local: None,
            tun_peer: None,
            tun_local_ipv6: None,
            tun_peer_ipv6: None,
            tun_name: Some("tun0".to_string()),
            handshake_file: None,
            ipv4_only: false,
        }
    }

    pub(crate) fn server_spec(id: &str) -> InstanceSpec {
        InstanceSpec {
            id: id.to_string(),
            alias: format!("server-{id}"),
            enabled: true,
            local_addr: None,
            local_port: 4567,
            remote_addr: "127.0.0.1".to_string(),
            remote_port: 51820,
            tun_local: None,
            tun_peer: None,
            tun_local_ipv6: None,
            tun_peer_ipv6: None,
            tun_name: Some("tun1".to_string()),
            handshake_file: None,
            ipv4_only: false,
        }
    }

    #[test]
    fn test_defaults_differ_per_kind() {
        let client = Instance::Client(client_spec("a")).tunnel();
        let server = Instance::Server(server_spec("b")).tunnel();

        assert_eq!(client.peer, Ipv4Addr::new(192, 168, 200, 2));
        assert_eq!(server.peer, Ipv4Addr::new(192, 168, 201, 2));
        assert_ne!(client.local, server.local);
        assert_eq!(client.peer6.to_string(), "fcc8::2");
        assert_eq!(server.peer6.to_string(), "fcc9::2");
    }

    #[test]
    fn test_configured_addresses_win() {
        let mut spec = client_spec("a");
        spec.tun_peer = Some(Ipv4Addr::new(10, 9, 0, 2));

        let instance = Instance::Client(spec).with_defaults();
        assert_eq!(instance.spec().tun_peer, Some(Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(
            instance.spec().tun_local,
            Some(Ipv4Addr::new(192, 168, 200, 1))
        );
    }

    #[test]
    fn test_client_command_args() {
        let mut spec = client_spec("a");
        spec.handshake_file = Some(PathBuf::from("/etc/phantun/hs.bin"));
        let cmd = Instance::Client(spec).command_string("phantun_client");

        assert!(cmd.starts_with("phantun_client --local 127.0.0.1:4567"));
        assert!(cmd.contains("--remote 203.0.113.10:4567"));
        assert!(cmd.contains("--tun-local 192.168.200.1 --tun-peer 192.168.200.2"));
        assert!(cmd.contains("--tun tun0"));
        assert!(cmd.contains("--tun-local6 fcc8::1 --tun-peer6 fcc8::2"));
        assert!(cmd.ends_with("--handshake-packet /etc/phantun/hs.bin"));
    }

    #[test]
    fn test_server_command_args_ipv4_only() {
        let mut spec = server_spec("b");
        spec.ipv4_only = true;
        spec.tun_name = None;
        let args = Instance::Server(spec).command_args();

        assert_eq!(args[0..2], ["--local".to_string(), "4567".to_string()]);
        assert!(args.contains(&"--ipv4-only".to_string()));
        assert!(!args.contains(&"--tun-peer6".to_string()));
        assert!(!args.contains(&"--tun".to_string()));
    }

    #[test]
    fn test_client_without_bind_address() {
        let mut spec = client_spec("a");
        spec.local_addr = None;
        assert_eq!(Instance::Client(spec).local_arg(), "127.0.0.1:4567");
    }
}

//! NAT and forwarding rule reconciliation.
//!
//! Every rule the manager creates carries the comment [`OWNERSHIP_TAG`]. Per-instance
//! setup is idempotent (check before add) and per-instance cleanup tolerates
//! missing rules. [`FirewallReconciler::cleanup_all`] is the authoritative
//! teardown: it re-derives the owned rule set from the live `*-save` dump, so it
//! also removes rules whose instance no longer exists in memory or on disk.

use std::{fmt, net::IpAddr, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    command::{CommandRunner, display_command},
    instance::{Instance, InstanceKind, InstanceSpec},
};

/// Comment attached to every rule this manager creates
pub const OWNERSHIP_TAG: &str = "phantun";

/// Port that must never be redirected into a tunnel
pub const ADMIN_PORT: u16 = 22;

/// Substrings the iptables tools print when a rule to delete or check is absent
const ABSENT_MARKERS: [&str; 3] = [
    "No chain/target/match",
    "Bad rule",
    "Does a matching rule exist",
];

pub type FirewallResult<T> = Result<T, FirewallError>;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("refusing to redirect port {0}: this would lock you out of the host")]
    ReservedPort(u16),

    #[error("`{command}` failed: {output}")]
    Tool { command: String, output: String },

    #[error("failed to run {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn tool(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    pub fn save_tool(&self) -> &'static str {
        match self {
            Family::V4 => "iptables-save",
            Family::V6 => "ip6tables-save",
        }
    }

    fn host_prefix(&self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "nat" => Some(Table::Nat),
            "filter" => Some(Table::Filter),
            _ => None,
        }
    }
}

/// iptables rule directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Append,
    Insert,
    Delete,
    Check,
}

impl Directive {
    pub fn flag(&self) -> &'static str {
        match self {
            Directive::Append => "-A",
            Directive::Insert => "-I",
            Directive::Delete => "-D",
            Directive::Check => "-C",
        }
    }

    /// Directives for which an absent rule is an expected answer, not a fault
    fn tolerates_absent(&self) -> bool {
        matches!(self, Directive::Delete | Directive::Check)
    }
}

/// The rule shapes this manager ever creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Masquerade,
    Dnat,
    ForwardAccept,
}

impl RuleKind {
    fn classify(chain: &str, matchers: &[String]) -> Option<Self> {
        let target = matchers
            .windows(2)
            .find(|pair| pair[0] == "-j")
            .map(|pair| pair[1].as_str())?;

        match target {
            "MASQUERADE" => Some(RuleKind::Masquerade),
            "DNAT" => Some(RuleKind::Dnat),
            "ACCEPT" if chain == "FORWARD" => Some(RuleKind::ForwardAccept),
            _ => None,
        }
    }
}

/// One firewall rule, independent of the directive used to apply it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub family: Family,
    pub table: Table,
    pub chain: String,
    /// Directive used when the rule is added (`-A` or `-I`)
    pub placement: Directive,
    /// Everything after the chain name
    pub matchers: Vec<String>,
}

impl Rule {
    fn new(family: Family, table: Table, chain: &str, placement: Directive, matchers: Vec<String>) -> Self {
        Self {
            family,
            table,
            chain: chain.to_string(),
            placement,
            matchers,
        }
    }

    /// Masquerade traffic sourced from the tunnel peer
    pub fn masquerade_from(family: Family, source: IpAddr) -> Self {
        let mut matchers = vec!["-s".to_string(), format!("{}/{}", source, family.host_prefix())];
        matchers.extend(tag_and_jump("MASQUERADE"));
        Self::new(family, Table::Nat, "POSTROUTING", Directive::Append, matchers)
    }

    /// Masquerade TCP traffic destined to the tunnel peer on `port`
    pub fn masquerade_to(family: Family, destination: IpAddr, port: u16) -> Self {
        let mut matchers = vec![
            "-p".to_string(),
            "tcp".to_string(),
            "-d".to_string(),
            destination.to_string(),
            "--dport".to_string(),
            port.to_string(),
        ];
        matchers.extend(tag_and_jump("MASQUERADE"));
        Self::new(family, Table::Nat, "POSTROUTING", Directive::Append, matchers)
    }

    /// Redirect inbound TCP on `port` to the tunnel peer, keeping the port
    pub fn dnat(family: Family, port: u16, destination: IpAddr) -> Self {
        let mut matchers = vec![
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.to_string(),
        ];
        matchers.extend(tag_and_jump("DNAT"));
        matchers.extend(["--to-destination".to_string(), destination.to_string()]);
        Self::new(family, Table::Nat, "PREROUTING", Directive::Append, matchers)
    }

    /// Accept forwarded traffic entering (`-i`) or leaving (`-o`) the tunnel
    /// interface, inserted first so a default DROP policy cannot shadow it
    pub fn forward_accept(family: Family, direction: &str, interface: &str) -> Self {
        let mut matchers = vec![direction.to_string(), interface.to_string()];
        matchers.extend(tag_and_jump("ACCEPT"));
        Self::new(family, Table::Filter, "FORWARD", Directive::Insert, matchers)
    }

    pub fn kind(&self) -> Option<RuleKind> {
        RuleKind::classify(&self.chain, &self.matchers)
    }

    pub fn args(&self, directive: Directive) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            directive.flag().to_string(),
            self.chain.clone(),
        ];
        args.extend(self.matchers.iter().cloned());
        args
    }
}

fn tag_and_jump(target: &str) -> [String; 6] {
    [
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        OWNERSHIP_TAG.to_string(),
        "-j".to_string(),
        target.to_string(),
    ]
}

/// Rules needed by one instance for one address family
pub fn instance_rules(instance: &Instance, family: Family) -> Vec<Rule> {
    match instance {
        Instance::Client(spec) => client_rules(spec, family),
        Instance::Server(spec) => server_rules(spec, family),
    }
}

pub fn client_rules(spec: &InstanceSpec, family: Family) -> Vec<Rule> {
    let peer = spec.tunnel(InstanceKind::Client).peer(family);
    vec![Rule::masquerade_from(family, peer)]
}

pub fn server_rules(spec: &InstanceSpec, family: Family) -> Vec<Rule> {
    let peer = spec.tunnel(InstanceKind::Server).peer(family);
    let tun = spec.effective_tun_name();
    vec![
        Rule::dnat(family, spec.local_port, peer),
        Rule::masquerade_to(family, peer, spec.remote_port),
        Rule::forward_accept(family, "-i", tun),
        Rule::forward_accept(family, "-o", tun),
    ]
}

fn guard_admin_port(spec: &InstanceSpec) -> FirewallResult<()> {
    if spec.local_port == ADMIN_PORT {
        return Err(FirewallError::ReservedPort(ADMIN_PORT));
    }
    Ok(())
}

/// An owned rule recovered from a `*-save` dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpedRule {
    pub family: Family,
    pub table: Table,
    pub chain: String,
    pub matchers: Vec<String>,
    pub kind: RuleKind,
}

impl DumpedRule {
    /// Arguments deleting this rule from the table it was dumped from
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            Directive::Delete.flag().to_string(),
            self.chain.clone(),
        ];
        args.extend(self.matchers.iter().cloned());
        args
    }
}

/// Extract the rules owned by this manager from `*-save` output.
///
/// A line qualifies when it appends a rule (`-A`), carries the ownership
/// comment, and is one of the shapes in [`RuleKind`]. Anything else,
/// including rules in tables this manager never writes to, is left alone.
pub fn parse_owned_rules(family: Family, dump: &str) -> Vec<DumpedRule> {
    let mut table = None;
    let mut owned = Vec::new();

    for line in dump.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix('*') {
            table = Table::from_name(name.trim());
            continue;
        }
        if !line.starts_with("-A ") {
            continue;
        }
        let Some(table) = table else {
            continue;
        };

        let tokens = split_dump_line(line);
        if tokens.len() < 3 {
            continue;
        }
        let chain = tokens[1].clone();
        let matchers = tokens[2..].to_vec();

        if !has_ownership_tag(&matchers) {
            continue;
        }
        let Some(kind) = RuleKind::classify(&chain, &matchers) else {
            continue;
        };

        owned.push(DumpedRule {
            family,
            table,
            chain,
            matchers,
            kind,
        });
    }

    owned
}

fn has_ownership_tag(matchers: &[String]) -> bool {
    matchers
        .windows(2)
        .any(|pair| pair[0] == "--comment" && pair[1] == OWNERSHIP_TAG)
}

/// Split a dump line on whitespace, honouring the double quotes iptables-save
/// puts around comments containing spaces
fn split_dump_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }

    tokens
}

/// Counts of owned rules currently live on the host. `total` covers the NAT
/// rules only; FORWARD accepts are reported on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallStats {
    pub masquerade: usize,
    pub dnat: usize,
    pub forward: usize,
    pub total: usize,
}

impl FirewallStats {
    fn from_rules(rules: &[DumpedRule]) -> Self {
        let mut stats = FirewallStats::default();
        for rule in rules {
            match rule.kind {
                RuleKind::Masquerade => stats.masquerade += 1,
                RuleKind::Dnat => stats.dnat += 1,
                RuleKind::ForwardAccept => stats.forward += 1,
            }
        }
        stats.total = stats.masquerade + stats.dnat;
        stats
    }
}

enum ToolOutcome {
    Done,
    Absent,
}

/// Applies, removes and purges the NAT/forwarding rules tied to tunnel instances
#[derive(Clone)]
pub struct FirewallReconciler {
    runner: Arc<dyn CommandRunner>,
}

impl FirewallReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn exec(&self, family: Family, directive: Directive, args: Vec<String>) -> FirewallResult<ToolOutcome> {
        let program = family.tool();
        let result = self
            .runner
            .run(program, &args)
            .await
            .map_err(|source| FirewallError::Exec {
                program: program.to_string(),
                source,
            })?;

        if result.success {
            return Ok(ToolOutcome::Done);
        }

        if directive.tolerates_absent() && ABSENT_MARKERS.iter().any(|m| result.output.contains(m)) {
            return Ok(ToolOutcome::Absent);
        }

        let command = display_command(program, &args);
        error!("{} failed, output: {}", command, result.output.trim());
        Err(FirewallError::Tool {
            command,
            output: result.output.trim().to_string(),
        })
    }

    /// Whether an equivalent rule is already installed
    pub async fn check_rule(&self, rule: &Rule) -> FirewallResult<bool> {
        let outcome = self
            .exec(rule.family, Directive::Check, rule.args(Directive::Check))
            .await?;
        Ok(matches!(outcome, ToolOutcome::Done))
    }

    /// Add `rule` unless an equivalent one is already present
    pub async fn ensure_rule(&self, rule: &Rule) -> FirewallResult<()> {
        if self.check_rule(rule).await? {
            debug!("Rule already present: {}", display_command(rule.family.tool(), &rule.args(rule.placement)));
            return Ok(());
        }
        self.exec(rule.family, rule.placement, rule.args(rule.placement))
            .await?;
        Ok(())
    }

    /// Delete `rule`; a rule that is already gone counts as success
    pub async fn delete_rule(&self, rule: &Rule) -> FirewallResult<()> {
        self.exec(rule.family, Directive::Delete, rule.args(Directive::Delete))
            .await?;
        Ok(())
    }

    pub async fn setup(&self, instance: &Instance, family: Family) -> FirewallResult<()> {
        match instance {
            Instance::Client(spec) => self.setup_client(spec, family).await,
            Instance::Server(spec) => self.setup_server(spec, family).await,
        }
    }

    pub async fn cleanup(&self, instance: &Instance, family: Family) -> FirewallResult<()> {
        match instance {
            Instance::Client(spec) => self.cleanup_client(spec, family).await,
            Instance::Server(spec) => self.cleanup_server(spec, family).await,
        }
    }

    pub async fn setup_client(&self, spec: &InstanceSpec, family: Family) -> FirewallResult<()> {
        guard_admin_port(spec)?;
        for rule in client_rules(spec, family) {
            self.ensure_rule(&rule).await?;
        }
        Ok(())
    }

    /// NAT rules are mandatory; the FORWARD accepts only matter when the
    /// forward policy drops, so failing to add them is a warning.
    pub async fn setup_server(&self, spec: &InstanceSpec, family: Family) -> FirewallResult<()> {
        guard_admin_port(spec)?;
        for rule in server_rules(spec, family) {
            match rule.kind() {
                Some(RuleKind::ForwardAccept) => {
                    if let Err(e) = self.ensure_rule(&rule).await {
                        warn!("Failed to add {} FORWARD rule for {}: {}", family, spec.alias, e);
                    }
                }
                _ => self.ensure_rule(&rule).await?,
            }
        }
        Ok(())
    }

    pub async fn cleanup_client(&self, spec: &InstanceSpec, family: Family) -> FirewallResult<()> {
        self.delete_all(&client_rules(spec, family)).await
    }

    pub async fn cleanup_server(&self, spec: &InstanceSpec, family: Family) -> FirewallResult<()> {
        self.delete_all(&server_rules(spec, family)).await
    }

    /// Attempt every deletion, reporting the first real failure
    async fn delete_all(&self, rules: &[Rule]) -> FirewallResult<()> {
        let mut first_error = None;
        for rule in rules {
            if let Err(e) = self.delete_rule(rule).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Raw `*-save` output for one family
    pub async fn rules(&self, family: Family) -> FirewallResult<String> {
        let program = family.save_tool();
        let result = self
            .runner
            .run(program, &[])
            .await
            .map_err(|source| FirewallError::Exec {
                program: program.to_string(),
                source,
            })?;

        if !result.success {
            return Err(FirewallError::Tool {
                command: program.to_string(),
                output: result.output.trim().to_string(),
            });
        }
        Ok(result.output)
    }

    /// Owned rules currently installed for one family
    pub async fn owned_rules(&self, family: Family) -> FirewallResult<Vec<DumpedRule>> {
        let dump = self.rules(family).await?;
        Ok(parse_owned_rules(family, &dump))
    }

    /// Counts of owned IPv4 rules, plus IPv6 ones when ip6tables is usable
    pub async fn stats(&self) -> FirewallResult<FirewallStats> {
        let mut owned = self.owned_rules(Family::V4).await?;
        match self.owned_rules(Family::V6).await {
            Ok(v6) => owned.extend(v6),
            Err(e) => debug!("Skipping IPv6 rule stats: {}", e),
        }
        Ok(FirewallStats::from_rules(&owned))
    }

    /// Remove every rule carrying the ownership tag, whichever instance
    /// created it. Returns the number of rules deleted.
    ///
    /// The IPv4 dump must succeed; an unusable ip6tables is only logged.
    /// Failures deleting single rules are logged and the sweep continues.
    pub async fn cleanup_all(&self) -> FirewallResult<usize> {
        let mut removed = 0;

        for family in [Family::V4, Family::V6] {
            let owned = match self.owned_rules(family).await {
                Ok(owned) => owned,
                Err(e) if family == Family::V6 => {
                    debug!("Skipping IPv6 cleanup: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for rule in owned {
                let args = rule.delete_args();
                info!("Cleaning rule: {}", display_command(family.tool(), &args));
                match self.exec(family, Directive::Delete, args).await {
                    Ok(ToolOutcome::Done) => removed += 1,
                    Ok(ToolOutcome::Absent) => debug!("Rule vanished before deletion"),
                    Err(e) => warn!("Failed to delete rule: {}", e),
                }
            }
        }

        Ok(removed)
    }
}

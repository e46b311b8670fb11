//! In-memory stand-ins for host tools, so firewall and supervisor behaviour can
//! be exercised without root.

use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::{
    command::{CommandOutput, CommandRunner, display_command},
    firewall::{Family, OWNERSHIP_TAG},
};

const ABSENT: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeRule {
    table: String,
    chain: String,
    spec: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    rules: HashMap<Family, Vec<FakeRule>>,
    calls: Vec<String>,
    deleted_links: Vec<String>,
    stuck_links: HashSet<String>,
    failing_rules: Vec<String>,
    ipv6_broken: bool,
}

/// Emulates `iptables`, `ip6tables`, their `-save` variants and `ip link delete`
#[derive(Default)]
pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

fn ok(output: impl Into<String>) -> CommandOutput {
    CommandOutput {
        success: true,
        output: output.into(),
    }
}

fn fail(output: impl Into<String>) -> CommandOutput {
    CommandOutput {
        success: false,
        output: output.into(),
    }
}

impl FakeHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Install a rule directly, as if another tool or an earlier run added it
    pub(crate) fn seed(&self, family: Family, table: &str, chain: &str, spec: &[&str]) {
        self.lock().rules.entry(family).or_default().push(FakeRule {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Make every ip6tables invocation fail like a kernel without IPv6 NAT
    pub(crate) fn disable_ipv6(&self) {
        self.lock().ipv6_broken = true;
    }

    /// Make every add or delete whose arguments contain `needle` fail with a
    /// non-benign error; checks still answer normally
    pub(crate) fn fail_rule(&self, needle: &str) {
        self.lock().failing_rules.push(needle.to_string());
    }

    pub(crate) fn refuse_link_delete(&self, name: &str) {
        self.lock().stuck_links.insert(name.to_string());
    }

    /// Live rules as `-t <table> -A <chain> <spec>` lines
    pub(crate) fn rules(&self, family: Family) -> Vec<String> {
        self.lock()
            .rules
            .get(&family)
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| format!("-t {} -A {} {}", r.table, r.chain, r.spec.join(" ")))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn tagged_count(&self, family: Family) -> usize {
        self.count_matching(family, &format!("--comment {OWNERSHIP_TAG} "))
    }

    pub(crate) fn count_matching(&self, family: Family, needle: &str) -> usize {
        self.rules(family)
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn deleted_links(&self) -> Vec<String> {
        self.lock().deleted_links.clone()
    }

    fn iptables(&self, family: Family, args: &[String]) -> CommandOutput {
        let mut state = self.lock();
        if family == Family::V6 && state.ipv6_broken {
            return fail(
                "ip6tables v1.8.7 (legacy): can't initialize ip6tables table `nat': Table does not exist (do you need to insmod?)\n",
            );
        }

        let line = args.join(" ");
        let mutates = args.iter().any(|a| a == "-A" || a == "-I" || a == "-D");
        if mutates && state.failing_rules.iter().any(|needle| line.contains(needle)) {
            return fail("iptables v1.8.7 (legacy): Could not commit rule: Operation not permitted\n");
        }

        let (table, rest) = match args {
            [flag, table, rest @ ..] if flag == "-t" => (table.clone(), rest),
            rest => ("filter".to_string(), rest),
        };
        let [directive, chain, spec @ ..] = rest else {
            return fail("iptables v1.8.7 (legacy): no command specified\n");
        };
        let rule = FakeRule {
            table,
            chain: chain.clone(),
            spec: spec.to_vec(),
        };

        let rules = state.rules.entry(family).or_default();
        let position = rules.iter().position(|r| *r == rule);
        match (directive.as_str(), position) {
            ("-C", Some(_)) => ok(""),
            ("-C", None) | ("-D", None) => fail(ABSENT),
            ("-D", Some(idx)) => {
                rules.remove(idx);
                ok("")
            }
            ("-A", _) => {
                rules.push(rule);
                ok("")
            }
            ("-I", _) => {
                rules.insert(0, rule);
                ok("")
            }
            (other, _) => fail(format!("iptables v1.8.7 (legacy): unknown option \"{other}\"\n")),
        }
    }

    fn save(&self, family: Family) -> CommandOutput {
        let state = self.lock();
        if family == Family::V6 && state.ipv6_broken {
            return fail("ip6tables-save v1.8.7 (legacy): Cannot initialize: Address family not supported by protocol\n");
        }

        let rules = state.rules.get(&family).cloned().unwrap_or_default();
        let mut dump = String::from("# Generated by fake-save\n");
        for table in ["nat", "filter"] {
            dump.push_str(&format!("*{table}\n"));
            for rule in rules.iter().filter(|r| r.table == table) {
                dump.push_str(&format!("-A {} {}\n", rule.chain, rule.spec.join(" ")));
            }
            dump.push_str("COMMIT\n");
        }
        ok(dump)
    }

    fn ip(&self, args: &[String]) -> CommandOutput {
        let mut state = self.lock();
        match args {
            [link, delete, name] if link == "link" && delete == "delete" => {
                if state.stuck_links.contains(name) {
                    return fail(format!("Cannot find device \"{name}\"\n"));
                }
                state.deleted_links.push(name.clone());
                ok("")
            }
            _ => fail("Command not supported by fake\n"),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.lock().calls.push(display_command(program, args));
        match program {
            "iptables" => Ok(self.iptables(Family::V4, args)),
            "ip6tables" => Ok(self.iptables(Family::V6, args)),
            "iptables-save" => Ok(self.save(Family::V4)),
            "ip6tables-save" => Ok(self.save(Family::V6)),
            "ip" => Ok(self.ip(args)),
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{other}: not found"),
            )),
        }
    }
}

/// Build a fake `/sys/class/net` with the given interfaces and flag words
pub(crate) fn fake_sysfs(interfaces: &[(&str, u32)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, flags) in interfaces {
        let path = dir.path().join(name);
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("flags"), format!("{flags:#x}\n")).unwrap();
    }
    dir
}

/// Shell scripts standing in for the tunnel binaries: `long-running` echoes its
/// arguments and sleeps, `exits` terminates immediately.
pub(crate) fn stub_binary(name: &str) -> PathBuf {
    static STUBS: OnceLock<TempDir> = OnceLock::new();
    let dir = STUBS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let scripts = [
            (
                "long-running",
                "#!/bin/sh\necho \"stub started $*\"\necho \"stub diagnostics\" >&2\nexec sleep 30\n",
            ),
            ("exits", "#!/bin/sh\necho \"stub exiting\"\nexit 0\n"),
        ];
        for (file, body) in scripts {
            let path = dir.path().join(file);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    });
    dir.path().join(name)
}

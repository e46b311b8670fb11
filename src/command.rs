use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Exit state and combined stdout/stderr of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

/// Runs the host tools (`iptables`, `iptables-save`, `ip`) the manager drives.
///
/// Commands run to completion with no timeout: a hung tool hangs the caller.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("Running: {}", display_command(program, args));

        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(CommandOutput {
            success: out.status.success(),
            output,
        })
    }
}

pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_both_streams() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
        let result = SystemRunner.run("sh", &args).await.unwrap();

        assert!(!result.success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let result = SystemRunner.run("definitely-not-a-real-tool", &[]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_display_command() {
        let args = vec!["-t".to_string(), "nat".to_string(), "-S".to_string()];
        assert_eq!(display_command("iptables", &args), "iptables -t nat -S");
    }
}

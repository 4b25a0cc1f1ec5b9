//! Remote execution infrastructure for lab simulation.
//!
//! This module provides the command channel to a lab host: one long-lived
//! SSH session per host with a fresh channel per command, prompt-driven
//! interactive execution, container-scoped routing, a blocking session pool,
//! and connection retry with diagnostics.

pub mod container;
pub mod interactive;
pub mod pool;
pub mod retry;
pub mod session;

use serde::Serialize;
use std::borrow::Cow;
use std::time::Duration;

use crate::error::Result;

pub use container::{ContainerBinding, ContainerRouter};
pub use interactive::{PromptDriver, PromptResponse};
pub use pool::{PoolStats, SessionGuard, SessionPool};
pub use retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
pub use session::SshSession;

/// Exit code reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a command could not be dispatched at all.
pub const TRANSPORT_FAILURE_EXIT_CODE: i32 = -1;

/// Marker echoed back by liveness probes.
pub const SENTINEL: &str = "__LABSIM_ALIVE__";

/// Result of one remote command. Always a value, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Explanation when the command never produced a real exit code
    pub message: Option<String>,
}

impl CommandOutcome {
    pub fn completed(
        command: &str,
        stdout: String,
        stderr: String,
        exit_code: i32,
        elapsed: Duration,
    ) -> Self {
        Self {
            command: command.to_string(),
            stdout,
            stderr,
            exit_code,
            elapsed,
            timed_out: false,
            message: None,
        }
    }

    pub fn timed_out(command: &str, partial_stdout: String, elapsed: Duration, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            stdout: partial_stdout,
            stderr: String::new(),
            exit_code: TIMEOUT_EXIT_CODE,
            elapsed,
            timed_out: true,
            message: Some(format!(
                "command did not finish within {}s",
                timeout.as_secs()
            )),
        }
    }

    pub fn transport_failure(command: &str, message: String, elapsed: Duration) -> Self {
        Self {
            command: command.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: TRANSPORT_FAILURE_EXIT_CODE,
            elapsed,
            timed_out: false,
            message: Some(message),
        }
    }

    pub fn not_connected(command: &str, host: &str) -> Self {
        Self::transport_failure(
            command,
            format!("session to {} is not connected; reconnect before issuing commands", host),
            Duration::ZERO,
        )
    }

    /// Returns true if the command ran to completion with exit code 0.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Stdout and stderr joined, for pattern scanning.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// One-line summary for bug descriptions.
    pub fn summary(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        let detail = last_meaningful_line(&self.stderr)
            .or_else(|| last_meaningful_line(&self.stdout))
            .unwrap_or("no output");
        format!("exit code {}: {}", self.exit_code, detail)
    }
}

fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// A command channel to one lab host.
///
/// Implementations must never block past the supplied timeout and must never
/// reconnect on their own: a dead channel is reported through `is_alive` and
/// failing outcomes, and the caller decides when to `connect` again.
pub trait RemoteShell: Send {
    fn host(&self) -> &str;

    /// Establishes (or re-establishes) the control channel.
    fn connect(&mut self) -> Result<()>;

    /// Round-trips a sentinel over the current channel.
    fn is_alive(&mut self) -> bool;

    fn disconnect(&mut self);

    fn exec(&mut self, command: &str, timeout: Duration) -> CommandOutcome;

    /// Runs a command on a pseudo-terminal, answering prompts as they appear.
    fn exec_interactive(
        &mut self,
        command: &str,
        prompts: &[PromptResponse],
        timeout: Duration,
    ) -> CommandOutcome;
}

/// Quotes a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Quotes a path while leaving a leading `~/` unquoted so the remote shell
/// still expands it.
pub fn quote_path(path: &str) -> String {
    if path == "~" {
        return "~".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", shell_quote(rest)),
        Some(_) => "~/".to_string(),
        None => shell_quote(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success() {
        let ok = CommandOutcome::completed("true", String::new(), String::new(), 0, Duration::ZERO);
        assert!(ok.is_success());

        let failed = CommandOutcome::completed(
            "false",
            String::new(),
            "boom\n".to_string(),
            1,
            Duration::ZERO,
        );
        assert!(!failed.is_success());
        assert_eq!(failed.summary(), "exit code 1: boom");
    }

    #[test]
    fn test_timed_out_outcome_uses_sentinel() {
        let outcome = CommandOutcome::timed_out(
            "sleep 600",
            String::new(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!outcome.is_success());
        assert!(outcome.summary().contains("5s"));
    }

    #[test]
    fn test_not_connected_outcome() {
        let outcome = CommandOutcome::not_connected("ls", "workstation");
        assert_eq!(outcome.exit_code, TRANSPORT_FAILURE_EXIT_CODE);
        assert!(outcome.summary().contains("workstation"));
    }

    #[test]
    fn test_combined_output() {
        let outcome = CommandOutcome::completed(
            "x",
            "out".to_string(),
            "err".to_string(),
            0,
            Duration::ZERO,
        );
        assert_eq!(outcome.combined_output(), "out\nerr");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_quote_path_keeps_tilde() {
        assert_eq!(quote_path("~"), "~");
        assert_eq!(quote_path("~/my dir"), "~/'my dir'");
        assert_eq!(quote_path("/etc/hosts"), "/etc/hosts");
    }
}

//! Lifecycle verbs of the remote `lab` tool.
//!
//! `lab start|grade|finish|solve <name>` only promise stdout, stderr and an
//! exit code. A run is treated as failed on a non-zero exit or when the
//! output reports a failure in prose, which is detected by an ordered table
//! of phrases. Start carries its own recovery for the "another lab is in
//! progress" refusal.

use log::{info, warn};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::LabSettings;
use crate::remote::{shell_quote, CommandOutcome, RemoteShell};

static BLOCKED_BY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)another lab is in progress.*?lab\s+finish\s+([A-Za-z0-9_.-]+)")
        .expect("blocker regex is valid")
});

/// Self-reported failure phrases, checked in order.
static FAILURE_PHRASES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)traceback \(most recent call last\)", "lab script crashed"),
        (r"(?i)command not found", "lab tool is not installed"),
        (r"(?i)(no such|is not a valid|unknown) (lab|exercise)", "exercise name not recognized"),
        (r"(?i)cannot continue", "lab script cannot continue"),
        (r"(?im)\.{3,}\s*FAIL(ED)?\s*$", "a lab check reported FAIL"),
        (r"(?im)^\s*error\b", "lab script reported an error"),
    ]
    .iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("failure phrase regex is valid"), *reason))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleVerb {
    Start,
    Grade,
    Finish,
    Solve,
}

impl LifecycleVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleVerb::Start => "start",
            LifecycleVerb::Grade => "grade",
            LifecycleVerb::Finish => "finish",
            LifecycleVerb::Solve => "solve",
        }
    }
}

/// Structured outcome of one lifecycle invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LifecycleStatus {
    Succeeded,
    Failed { reason: String },
    /// Refused because another exercise is active
    Blocked { blocker: String },
    TimedOut,
}

impl LifecycleStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, LifecycleStatus::Succeeded)
    }

    pub fn describe(&self) -> String {
        match self {
            LifecycleStatus::Succeeded => "succeeded".to_string(),
            LifecycleStatus::Failed { reason } => reason.clone(),
            LifecycleStatus::Blocked { blocker } => format!("blocked by active exercise {}", blocker),
            LifecycleStatus::TimedOut => "timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleResult {
    pub verb: LifecycleVerb,
    pub outcome: CommandOutcome,
    pub status: LifecycleStatus,
}

/// Everything `start_with_recovery` issued, in order.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    /// One start, or two when recovery ran
    pub attempts: Vec<LifecycleResult>,
    /// The blocker's finish, plus the status reset if that finish failed
    pub recovery: Vec<LifecycleResult>,
    pub blocker: Option<String>,
}

impl StartReport {
    pub fn last(&self) -> Option<&LifecycleResult> {
        self.attempts.last()
    }

    pub fn succeeded(&self) -> bool {
        self.last().map(|r| r.status.is_success()).unwrap_or(false)
    }
}

/// Classifies a start/finish/solve outcome.
///
/// Grading output is judged separately, so only the exit code and timeout
/// matter for [`LifecycleVerb::Grade`].
pub fn classify(verb: LifecycleVerb, outcome: &CommandOutcome) -> LifecycleStatus {
    if outcome.timed_out {
        return LifecycleStatus::TimedOut;
    }
    let output = outcome.combined_output();
    if verb == LifecycleVerb::Start {
        if let Some(caps) = BLOCKED_BY.captures(&output) {
            return LifecycleStatus::Blocked {
                blocker: caps[1].to_string(),
            };
        }
    }
    if outcome.exit_code != 0 {
        return LifecycleStatus::Failed {
            reason: outcome.summary(),
        };
    }
    if verb != LifecycleVerb::Grade {
        if let Some((_, reason)) = FAILURE_PHRASES.iter().find(|(re, _)| re.is_match(&output)) {
            return LifecycleStatus::Failed {
                reason: reason.to_string(),
            };
        }
    }
    LifecycleStatus::Succeeded
}

/// Issues lifecycle verbs for one exercise.
#[derive(Debug, Clone)]
pub struct LifecycleRunner {
    binary: String,
    timeout: Duration,
    profile: Option<String>,
}

impl LifecycleRunner {
    pub fn new(settings: &LabSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            timeout: settings.lifecycle_timeout(),
            profile: None,
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn command_line(&self, verb: LifecycleVerb, lab_name: &str) -> String {
        match (&self.profile, verb) {
            (Some(profile), LifecycleVerb::Start) => format!(
                "{} start -t {} {}",
                self.binary,
                shell_quote(profile),
                shell_quote(lab_name)
            ),
            _ => format!("{} {} {}", self.binary, verb.as_str(), shell_quote(lab_name)),
        }
    }

    pub fn run(&self, shell: &mut dyn RemoteShell, verb: LifecycleVerb, lab_name: &str) -> LifecycleResult {
        let command = self.command_line(verb, lab_name);
        info!("Running {}", command);
        let outcome = shell.exec(&command, self.timeout);
        let status = classify(verb, &outcome);
        if !status.is_success() {
            warn!("{} {}: {}", verb.as_str(), lab_name, status.describe());
        }
        LifecycleResult { verb, outcome, status }
    }

    /// Clears the tool's record of an active exercise.
    pub fn reset_status(&self, shell: &mut dyn RemoteShell) -> LifecycleResult {
        let command = format!("{} status --reset", self.binary);
        warn!("Resetting lab status with {}", command);
        let outcome = shell.exec(&command, self.timeout);
        let status = if outcome.timed_out {
            LifecycleStatus::TimedOut
        } else if outcome.exit_code != 0 {
            LifecycleStatus::Failed {
                reason: outcome.summary(),
            }
        } else {
            LifecycleStatus::Succeeded
        };
        LifecycleResult {
            verb: LifecycleVerb::Finish,
            outcome,
            status,
        }
    }

    /// Starts the exercise, clearing a blocking exercise first if needed.
    ///
    /// On a blocked start the named blocker is finished (falling back to a
    /// status reset only when that finish fails) and start is retried exactly
    /// once. A second refusal is reported as a failure.
    pub fn start_with_recovery(&self, shell: &mut dyn RemoteShell, lab_name: &str) -> StartReport {
        let first = self.run(shell, LifecycleVerb::Start, lab_name);
        let blocker = match &first.status {
            LifecycleStatus::Blocked { blocker } => blocker.clone(),
            _ => {
                return StartReport {
                    attempts: vec![first],
                    recovery: Vec::new(),
                    blocker: None,
                }
            }
        };

        info!("Exercise {} is blocking {}; finishing it first", blocker, lab_name);
        let mut recovery = Vec::new();
        let finish = self.run(shell, LifecycleVerb::Finish, &blocker);
        let finished = finish.status.is_success();
        recovery.push(finish);
        if !finished {
            recovery.push(self.reset_status(shell));
        }

        let mut retry = self.run(shell, LifecycleVerb::Start, lab_name);
        if let LifecycleStatus::Blocked { blocker } = &retry.status {
            retry.status = LifecycleStatus::Failed {
                reason: format!("still blocked by {} after recovery", blocker),
            };
        }

        StartReport {
            attempts: vec![first, retry],
            recovery,
            blocker: Some(blocker),
        }
    }
}

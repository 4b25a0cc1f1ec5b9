//! Defect classification.
//!
//! Every defect the engine can report is a [`BugKind`]. A single ordered
//! table maps each kind to its severity and to description, fix and
//! verification templates, so severity is a pure function of what failed.

use serde::Serialize;
use std::fmt;

use super::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    P0,
    P1,
    P2,
    P3,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::P0 => "P0",
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BugKind {
    HostUnreachable,
    ToolMissing,
    UnexpectedError,
    GradeScriptCrashed,
    StartFailed,
    GradeFalsePositive,
    GradeFalseNegative,
    SolveFailed,
    FinishFailed,
    CleanupIncomplete,
    NonIdempotent,
    VerificationFailed,
    FileWriteFailed,
    StepFailed,
}

/// What went wrong, before it is rendered into a [`Bug`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: BugKind,
    pub step: Option<String>,
    pub command: Option<String>,
    pub detail: String,
}

impl Finding {
    pub fn new(kind: BugKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            step: None,
            command: None,
            detail: detail.into(),
        }
    }

    pub fn at_step(mut self, step: &str) -> Self {
        self.step = Some(step.to_string());
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bug {
    pub id: String,
    pub severity: Severity,
    pub kind: BugKind,
    pub phase: Phase,
    pub exercise_id: String,
    pub description: String,
    pub fix: String,
    pub verification_steps: Vec<String>,
}

struct BugRule {
    kind: BugKind,
    severity: Severity,
    description: &'static str,
    fix: &'static str,
    verification: &'static [&'static str],
}

// Placeholders: {exercise} {lab} {host} {step} {command} {detail}
const RULES: &[BugRule] = &[
    BugRule {
        kind: BugKind::HostUnreachable,
        severity: Severity::P0,
        description: "Cannot reach lab host {host} to run {exercise}: {detail}",
        fix: "Restore SSH access to {host} before simulating {exercise}",
        verification: &["ssh {host} true"],
    },
    BugRule {
        kind: BugKind::ToolMissing,
        severity: Severity::P0,
        description: "Lifecycle tool is not available on {host}: {detail}",
        fix: "Install the course lifecycle tooling on {host}",
        verification: &["ssh {host} command -v lab"],
    },
    BugRule {
        kind: BugKind::UnexpectedError,
        severity: Severity::P0,
        description: "Unexpected error while simulating {exercise}: {detail}",
        fix: "Correct the simulator configuration or input that caused the error",
        verification: &["labsim simulate <content> {exercise}"],
    },
    BugRule {
        kind: BugKind::GradeScriptCrashed,
        severity: Severity::P0,
        description: "Grading script for {exercise} crashed or produced no verdict: {detail}",
        fix: "Fix lab grade {lab} so it runs to completion and reports PASS/FAIL per check",
        verification: &["lab start {lab}", "lab grade {lab}"],
    },
    BugRule {
        kind: BugKind::StartFailed,
        severity: Severity::P1,
        description: "`{command}` failed for {exercise}: {detail}",
        fix: "Fix lab start {lab} so it succeeds on a clean environment",
        verification: &["lab finish {lab}", "{command}"],
    },
    BugRule {
        kind: BugKind::GradeFalsePositive,
        severity: Severity::P1,
        description: "Grading {exercise} before any work was done reported success (false positive): {detail}",
        fix: "Make lab grade {lab} detect the unsolved state and report FAIL",
        verification: &["lab start {lab}", "lab grade {lab}"],
    },
    BugRule {
        kind: BugKind::GradeFalseNegative,
        severity: Severity::P1,
        description: "Grading {exercise} after completing every step reported failures (false negative): {detail}",
        fix: "Align the checks in lab grade {lab} with the documented solution",
        verification: &["lab start {lab}", "<complete the exercise steps>", "lab grade {lab}"],
    },
    BugRule {
        kind: BugKind::SolveFailed,
        severity: Severity::P1,
        description: "`{command}` failed for {exercise}: {detail}",
        fix: "Fix lab solve {lab} so it applies the solution",
        verification: &["lab start {lab}", "lab solve {lab}"],
    },
    BugRule {
        kind: BugKind::FinishFailed,
        severity: Severity::P1,
        description: "`{command}` failed for {exercise}: {detail}",
        fix: "Fix lab finish {lab} so it completes after the exercise",
        verification: &["lab start {lab}", "lab finish {lab}"],
    },
    BugRule {
        kind: BugKind::CleanupIncomplete,
        severity: Severity::P1,
        description: "lab finish {lab} reported success but left the environment dirty; restarting {exercise} failed: {detail}",
        fix: "Make lab finish {lab} remove everything lab start {lab} and the steps create",
        verification: &["lab start {lab}", "lab finish {lab}", "lab start {lab}"],
    },
    BugRule {
        kind: BugKind::NonIdempotent,
        severity: Severity::P1,
        description: "{exercise} is not repeatable: {detail}",
        fix: "Make lab start {lab} and lab finish {lab} restore the same initial state on every run",
        verification: &["lab start {lab}", "lab finish {lab}", "lab start {lab}", "lab finish {lab}"],
    },
    BugRule {
        kind: BugKind::VerificationFailed,
        severity: Severity::P2,
        description: "Verification in step {step} of {exercise} failed: `{command}` {detail}",
        fix: "Correct step {step} or the steps before it so the check passes",
        verification: &["lab start {lab}", "<complete steps up to {step}>", "{command}"],
    },
    BugRule {
        kind: BugKind::FileWriteFailed,
        severity: Severity::P2,
        description: "Step {step} of {exercise} could not write {command}: {detail}",
        fix: "Make sure the directory for {command} exists when step {step} is reached",
        verification: &["lab start {lab}", "<complete steps up to {step}>", "ls -ld $(dirname {command})"],
    },
    BugRule {
        kind: BugKind::StepFailed,
        severity: Severity::P3,
        description: "Step {step} of {exercise}: `{command}` failed ({detail})",
        fix: "Fix the command in step {step}, or state in the text that the failure is expected",
        verification: &["lab start {lab}", "<complete steps up to {step}>", "{command}"],
    },
];

fn rule_for(kind: BugKind) -> &'static BugRule {
    // every kind has exactly one rule
    RULES
        .iter()
        .find(|rule| rule.kind == kind)
        .unwrap_or(&RULES[2])
}

pub fn severity_of(kind: BugKind) -> Severity {
    rule_for(kind).severity
}

/// Identity of the run a bug belongs to.
#[derive(Debug, Clone)]
pub struct BugScope<'a> {
    pub exercise_id: &'a str,
    pub lab_name: &'a str,
    pub host: &'a str,
}

fn render(template: &str, scope: &BugScope, finding: &Finding) -> String {
    template
        .replace("{exercise}", scope.exercise_id)
        .replace("{lab}", scope.lab_name)
        .replace("{host}", scope.host)
        .replace("{step}", finding.step.as_deref().unwrap_or("?"))
        .replace("{command}", finding.command.as_deref().unwrap_or(""))
        .replace("{detail}", &finding.detail)
}

/// Renders a finding through the rule table.
pub fn classify(finding: &Finding, phase: Phase, scope: &BugScope, sequence: usize) -> Bug {
    let rule = rule_for(finding.kind);
    Bug {
        id: format!("{}-{:03}", scope.exercise_id, sequence),
        severity: rule.severity,
        kind: finding.kind,
        phase,
        exercise_id: scope.exercise_id.to_string(),
        description: render(rule.description, scope, finding),
        fix: render(rule.fix, scope, finding),
        verification_steps: rule.verification.iter().map(|v| render(v, scope, finding)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: &[BugKind] = &[
        BugKind::HostUnreachable,
        BugKind::ToolMissing,
        BugKind::UnexpectedError,
        BugKind::GradeScriptCrashed,
        BugKind::StartFailed,
        BugKind::GradeFalsePositive,
        BugKind::GradeFalseNegative,
        BugKind::SolveFailed,
        BugKind::FinishFailed,
        BugKind::CleanupIncomplete,
        BugKind::NonIdempotent,
        BugKind::VerificationFailed,
        BugKind::FileWriteFailed,
        BugKind::StepFailed,
    ];

    fn scope() -> BugScope<'static> {
        BugScope {
            exercise_id: "deploy-app-ge",
            lab_name: "deploy-app",
            host: "workstation",
        }
    }

    #[test]
    fn test_every_kind_has_one_rule_with_verification() {
        for kind in ALL_KINDS {
            let rules: Vec<_> = RULES.iter().filter(|r| r.kind == *kind).collect();
            assert_eq!(rules.len(), 1, "{:?}", kind);
            assert!(!rules[0].verification.is_empty(), "{:?}", kind);
        }
    }

    #[test]
    fn test_severity_follows_failing_phase() {
        assert_eq!(severity_of(BugKind::HostUnreachable), Severity::P0);
        assert_eq!(severity_of(BugKind::ToolMissing), Severity::P0);
        assert_eq!(severity_of(BugKind::StartFailed), Severity::P1);
        assert_eq!(severity_of(BugKind::FinishFailed), Severity::P1);
        assert_eq!(severity_of(BugKind::CleanupIncomplete), Severity::P1);
        assert_eq!(severity_of(BugKind::VerificationFailed), Severity::P2);
        assert_eq!(severity_of(BugKind::FileWriteFailed), Severity::P2);
        assert_eq!(severity_of(BugKind::StepFailed), Severity::P3);
        assert!(Severity::P0 < Severity::P3);
    }

    #[test]
    fn test_templates_are_rendered() {
        let finding = Finding::new(BugKind::VerificationFailed, "exit code 7: connection refused")
            .at_step("3.b")
            .with_command("curl http://servera");
        let bug = classify(&finding, Phase::Instructions, &scope(), 4);

        assert_eq!(bug.id, "deploy-app-ge-004");
        assert_eq!(bug.severity, Severity::P2);
        assert_eq!(
            bug.description,
            "Verification in step 3.b of deploy-app-ge failed: `curl http://servera` exit code 7: connection refused"
        );
        assert_eq!(bug.verification_steps.last().unwrap(), "curl http://servera");
        assert!(!bug.description.contains('{'));
        assert!(bug.verification_steps.iter().all(|v| !v.contains("{lab}")));
    }

    #[test]
    fn test_false_positive_references_exercise() {
        let bug = classify(
            &Finding::new(BugKind::GradeFalsePositive, "1 PASS, 0 FAIL"),
            Phase::GradeWithoutSolution,
            &scope(),
            1,
        );
        assert_eq!(bug.severity, Severity::P1);
        assert!(bug.description.contains("deploy-app-ge"));
        assert_eq!(bug.verification_steps, vec!["lab start deploy-app", "lab grade deploy-app"]);
    }
}

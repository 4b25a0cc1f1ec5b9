//! Depth-first walk over an instruction tree.
//!
//! The walk threads an [`ExecutionContext`] through a [`StepVisitor`]: each
//! visit receives the current context and returns the next one together with
//! what it recorded. [`RemoteVisitor`] is the visitor that actually performs
//! the steps on a lab host.

use log::{debug, info, warn};
use std::time::Duration;
use uuid::Uuid;

use super::bugs::{BugKind, Finding};
use super::context::{parse_cd, ExecutionContext};
use super::tty::{self, Conversion};
use super::{ExecutedStep, Phase, StepOutcome};
use crate::extractor::{Command, FileAction, FileActionKind, InstructionStep, StepAction};
use crate::remote::{quote_path, CommandOutcome, ContainerRouter, PromptResponse, RemoteShell};

/// What one visit produced.
#[derive(Debug, Clone)]
pub struct Visit {
    pub context: ExecutionContext,
    pub step: ExecutedStep,
    pub finding: Option<Finding>,
    /// Stop the walk after this action
    pub abort: bool,
}

pub trait StepVisitor {
    fn visit_command(&mut self, step: &InstructionStep, command: &Command, context: ExecutionContext) -> Visit;

    fn visit_file(&mut self, step: &InstructionStep, file: &FileAction, context: ExecutionContext) -> Visit;
}

#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub context: ExecutionContext,
    pub steps: Vec<ExecutedStep>,
    pub findings: Vec<Finding>,
    pub aborted: bool,
}

/// Visits every action in document order: a step's own actions, then its
/// substeps.
pub fn walk<V: StepVisitor>(steps: &[InstructionStep], context: ExecutionContext, visitor: &mut V) -> WalkResult {
    let mut result = WalkResult {
        context,
        ..WalkResult::default()
    };
    walk_into(steps, visitor, &mut result);
    result
}

fn walk_into<V: StepVisitor>(steps: &[InstructionStep], visitor: &mut V, result: &mut WalkResult) {
    for step in steps {
        for action in &step.actions {
            let context = std::mem::take(&mut result.context);
            let visit = match action {
                StepAction::Command(command) => visitor.visit_command(step, command, context),
                StepAction::File(file) => visitor.visit_file(step, file, context),
            };
            result.context = visit.context;
            result.steps.push(visit.step);
            result.findings.extend(visit.finding);
            if visit.abort {
                result.aborted = true;
                return;
            }
        }
        walk_into(&step.substeps, visitor, result);
        if result.aborted {
            return;
        }
    }
}

/// Performs steps on a lab host, inside a container when one is bound.
pub struct RemoteVisitor<'a> {
    shell: &'a mut dyn RemoteShell,
    router: &'a ContainerRouter,
    timeout: Duration,
}

impl<'a> RemoteVisitor<'a> {
    pub fn new(shell: &'a mut dyn RemoteShell, router: &'a ContainerRouter, timeout: Duration) -> Self {
        Self { shell, router, timeout }
    }

    fn dispatch(&mut self, command: &str, prompts: &[PromptResponse], context: &ExecutionContext) -> CommandOutcome {
        let full = match &context.container {
            Some(binding) => binding.wrap(self.router.runtime(), command, context.cwd.as_deref()),
            None => context.host_command(command),
        };
        debug!("Executing: {}", full);
        if prompts.is_empty() {
            self.shell.exec(&full, self.timeout)
        } else {
            self.shell.exec_interactive(&full, prompts, self.timeout)
        }
    }
}

fn failure_kind(step: &InstructionStep) -> BugKind {
    if step.is_verification {
        BugKind::VerificationFailed
    } else {
        BugKind::StepFailed
    }
}

impl StepVisitor for RemoteVisitor<'_> {
    fn visit_command(&mut self, step: &InstructionStep, command: &Command, context: ExecutionContext) -> Visit {
        let (text, prompts, note) = match tty::convert(command) {
            Conversion::Skip { reason } => {
                info!("Step {}: skipping `{}`: {}", step.number, command.text(), reason);
                return Visit {
                    step: ExecutedStep::skipped(&step.number, Phase::Instructions, command.text(), &reason),
                    context,
                    finding: None,
                    abort: false,
                };
            }
            Conversion::Run { command, prompts, note } => (command, prompts, note),
        };

        // a bare cd becomes tracked state; running it only checks the target
        let (outcome, next) = match parse_cd(&text) {
            Some(target) => {
                let next = context.change_dir(target);
                let check = format!("cd {}", quote_path(next.cwd.as_deref().unwrap_or("~")));
                let probe_context = ExecutionContext {
                    cwd: None,
                    container: next.container.clone(),
                };
                let outcome = self.dispatch(&check, &[], &probe_context);
                let next = if outcome.is_success() { next } else { context };
                (outcome, next)
            }
            None => (self.dispatch(&text, &prompts, &context), context),
        };

        let finding = (!outcome.is_success()).then(|| {
            warn!("Step {}: `{}` failed: {}", step.number, text, outcome.summary());
            Finding::new(failure_kind(step), outcome.summary())
                .at_step(&step.number)
                .with_command(&text)
        });
        let status = if finding.is_some() {
            StepOutcome::Warn
        } else {
            StepOutcome::Pass
        };
        let mut executed = ExecutedStep::from_outcome(&step.number, Phase::Instructions, &outcome, status);
        if let Some(note) = note {
            executed = executed.with_note(note);
        }

        Visit {
            context: next,
            step: executed,
            finding,
            abort: false,
        }
    }

    fn visit_file(&mut self, step: &InstructionStep, file: &FileAction, context: ExecutionContext) -> Visit {
        if file.kind == FileActionKind::Modify {
            return Visit {
                step: ExecutedStep::skipped(
                    &step.number,
                    Phase::Instructions,
                    &file.filename,
                    "edit of an existing file cannot be replayed",
                ),
                context,
                finding: None,
                abort: false,
            };
        }

        let path = context.host_path(&file.filename);
        let delimiter = format!("LABSIM_EOF_{}", Uuid::new_v4().simple());
        let quoted = quote_path(&path);
        let write = format!(
            "mkdir -p \"$(dirname {path})\" && cat > {path} <<'{delim}'\n{content}{delim}",
            path = quoted,
            delim = delimiter,
            content = file.content
        );
        info!("Step {}: writing {} ({} bytes)", step.number, path, file.content.len());
        let outcome = self.shell.exec(&write, self.timeout);

        if outcome.is_success() {
            let mut executed = ExecutedStep::from_outcome(&step.number, Phase::Instructions, &outcome, StepOutcome::Pass);
            executed.command = format!("write {}", path);
            return Visit {
                context,
                step: executed,
                finding: None,
                abort: false,
            };
        }

        warn!("Step {}: writing {} failed: {}", step.number, path, outcome.summary());
        let mut executed = ExecutedStep::from_outcome(&step.number, Phase::Instructions, &outcome, StepOutcome::Fail);
        executed.command = format!("write {}", path);
        Visit {
            context,
            step: executed,
            finding: Some(
                Finding::new(BugKind::FileWriteFailed, outcome.summary())
                    .at_step(&step.number)
                    .with_command(&path),
            ),
            abort: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSettings;
    use crate::remote::ContainerBinding;
    use crate::test_support::{command, create_file, step, Reply, ScriptedShell};

    fn router() -> ContainerRouter {
        ContainerRouter::new(ContainerSettings::default(), Duration::from_secs(5))
    }

    fn run(shell: &mut ScriptedShell, steps: &[InstructionStep], context: ExecutionContext) -> WalkResult {
        let router = router();
        let mut visitor = RemoteVisitor::new(shell, &router, Duration::from_secs(5));
        walk(steps, context, &mut visitor)
    }

    #[test]
    fn test_cd_updates_context_and_prefixes_later_commands() {
        let mut shell = ScriptedShell::new("workstation");
        let steps = vec![
            step("1", "Change directory.", vec![command("cd ~/deploy-app")]),
            step("2", "List.", vec![command("ls -l")]),
        ];
        let result = run(&mut shell, &steps, ExecutionContext::on_host());

        assert_eq!(result.context.cwd.as_deref(), Some("~/deploy-app"));
        assert_eq!(shell.commands(), &["cd ~/deploy-app".to_string(), "cd ~/deploy-app && ls -l".to_string()]);
        assert!(result.steps.iter().all(|s| s.outcome == StepOutcome::Pass));
    }

    #[test]
    fn test_failed_cd_keeps_previous_directory() {
        let mut shell = ScriptedShell::new("workstation").on("cd /nope", Reply::fail(1, "No such file or directory"));
        let steps = vec![step("1", "Change.", vec![command("cd /nope"), command("pwd")])];
        let result = run(&mut shell, &steps, ExecutionContext::on_host());

        assert_eq!(result.context.cwd, None);
        assert_eq!(shell.commands().last().unwrap(), "pwd");
        assert_eq!(result.findings.len(), 1);
    }

    #[test]
    fn test_command_failure_is_warning_not_abort() {
        let mut shell = ScriptedShell::new("workstation").on("false", Reply::fail(1, "nope"));
        let mut verify = step("2", "Verify.", vec![command("curl http://servera")]);
        verify.is_verification = true;
        let steps = vec![step("1", "Run.", vec![command("false")]), verify];
        let mut shell2 = ScriptedShell::new("workstation").on("curl", Reply::fail(7, "refused"));

        let result = run(&mut shell, &steps, ExecutionContext::on_host());
        assert!(!result.aborted);
        assert_eq!(result.steps[0].outcome, StepOutcome::Warn);
        assert_eq!(result.findings[0].kind, BugKind::StepFailed);
        assert_eq!(result.steps.len(), 2);

        let result = run(&mut shell2, &steps, ExecutionContext::on_host());
        assert_eq!(result.findings[0].kind, BugKind::VerificationFailed);
        assert_eq!(result.findings[0].step.as_deref(), Some("2"));
    }

    #[test]
    fn test_file_write_uses_heredoc() {
        let mut shell = ScriptedShell::new("workstation");
        let steps = vec![step("1", "Create.", vec![create_file("site.yml", "- hosts: all\n")])];
        let result = run(&mut shell, &steps, ExecutionContext::on_host().change_dir("~/deploy-app"));

        let issued = &shell.commands()[0];
        assert!(issued.starts_with("mkdir -p \"$(dirname ~/deploy-app/site.yml)\" && cat > ~/deploy-app/site.yml <<'LABSIM_EOF_"));
        assert!(issued.contains("\n- hosts: all\nLABSIM_EOF_"));
        assert_eq!(result.steps[0].command, "write ~/deploy-app/site.yml");
        assert_eq!(result.steps[0].outcome, StepOutcome::Pass);
    }

    #[test]
    fn test_file_write_failure_aborts_walk() {
        let mut shell = ScriptedShell::new("workstation").on("cat >", Reply::fail(1, "Permission denied"));
        let steps = vec![
            step("1", "Create.", vec![create_file("/etc/app.conf", "x=1\n")]),
            step("2", "Run.", vec![command("ls")]),
        ];
        let result = run(&mut shell, &steps, ExecutionContext::on_host());

        assert!(result.aborted);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].outcome, StepOutcome::Fail);
        assert_eq!(result.findings[0].kind, BugKind::FileWriteFailed);
        assert_eq!(shell.count("ls"), 0);
    }

    #[test]
    fn test_modify_and_tty_skips() {
        let mut shell = ScriptedShell::new("workstation");
        let steps = vec![step(
            "1",
            "Edit.",
            vec![
                StepAction::File(FileAction::new("site.yml", "  - x\n", FileActionKind::Modify)),
                command("vim site.yml"),
                command("watch -n 2 systemctl status httpd"),
            ],
        )];
        let result = run(&mut shell, &steps, ExecutionContext::on_host());

        let outcomes: Vec<StepOutcome> = result.steps.iter().map(|s| s.outcome).collect();
        assert_eq!(outcomes, vec![StepOutcome::Skip, StepOutcome::Skip, StepOutcome::Pass]);
        assert_eq!(shell.commands(), &["systemctl status httpd".to_string()]);
    }

    #[test]
    fn test_substeps_follow_parent_actions() {
        let mut shell = ScriptedShell::new("workstation");
        let mut parent = step("1", "Parent.", vec![command("echo parent")]);
        parent.substeps = vec![step("1.a", "Child.", vec![command("echo child")])];
        let steps = vec![parent, step("2", "Next.", vec![command("echo next")])];
        run(&mut shell, &steps, ExecutionContext::on_host());

        assert_eq!(
            shell.commands(),
            &["echo parent".to_string(), "echo child".to_string(), "echo next".to_string()]
        );
    }

    #[test]
    fn test_container_routing() {
        let mut shell = ScriptedShell::new("workstation");
        let binding = ContainerBinding {
            name: "labsim-deploy-app-ge".to_string(),
            image: "ee:latest".to_string(),
            host_workdir: "/home/student/deploy-app".to_string(),
            container_workdir: "/workspace".to_string(),
        };
        let steps = vec![step(
            "1",
            "Run.",
            vec![command("ansible-navigator run site.yml"), create_file("inventory", "[web]\n")],
        )];
        run(&mut shell, &steps, ExecutionContext::in_container(binding));

        assert_eq!(
            shell.commands()[0],
            "podman exec -w /workspace labsim-deploy-app-ge bash -lc 'ansible-navigator run site.yml'"
        );
        assert!(shell.commands()[1].contains("cat > /home/student/deploy-app/inventory"));
    }

    #[test]
    fn test_interactive_commands_answer_prompts() {
        let mut shell = ScriptedShell::new("workstation");
        let vault = Command::with_prompts(
            "ansible-vault create secret.yml",
            vec![PromptResponse::new("New Vault password:", "redhat")],
        );
        let steps = vec![step("1", "Vault.", vec![StepAction::Command(vault)])];
        run(&mut shell, &steps, ExecutionContext::on_host());

        assert_eq!(shell.interactive_calls().len(), 1);
        assert_eq!(shell.interactive_calls()[0].1[0].response, "redhat");
    }
}

//! Test-only helpers: a scripted lab host and small tree builders.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::extractor::{
    Command, ExerciseInstructions, ExerciseType, FileAction, FileActionKind, InstructionStep,
    StepAction,
};
use crate::remote::{CommandOutcome, PromptResponse, RemoteShell, TIMEOUT_EXIT_CODE};

/// A canned reply from the scripted host.
#[derive(Debug, Clone)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
            timed_out: false,
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn timeout() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        }
    }

    fn to_outcome(&self, command: &str, timeout: Duration) -> CommandOutcome {
        if self.timed_out {
            CommandOutcome::timed_out(command, self.stdout.clone(), timeout, timeout)
        } else {
            CommandOutcome::completed(
                command,
                self.stdout.clone(),
                self.stderr.clone(),
                self.exit_code,
                Duration::from_millis(1),
            )
        }
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// A lab host that answers commands from a script and records every call.
///
/// Rules are tried in registration order; the first whose needle is a
/// substring of the command answers. A rule with several replies hands them
/// out in order and repeats the last one. Unmatched commands succeed with
/// empty output.
pub struct ScriptedShell {
    host: String,
    rules: Vec<Rule>,
    commands: Vec<String>,
    interactive: Vec<(String, Vec<PromptResponse>)>,
    alive: bool,
    reachable: bool,
    connects: usize,
}

impl ScriptedShell {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            rules: Vec::new(),
            commands: Vec::new(),
            interactive: Vec::new(),
            alive: true,
            reachable: true,
            connects: 0,
        }
    }

    pub fn on(mut self, needle: &str, reply: Reply) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            replies: VecDeque::from(vec![reply]),
        });
        self
    }

    pub fn on_sequence(mut self, needle: &str, replies: Vec<Reply>) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self.alive = false;
        self
    }

    pub fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
    }

    /// Every command issued, interactive ones included, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn interactive_calls(&self) -> &[(String, Vec<PromptResponse>)] {
        &self.interactive
    }

    /// Number of issued commands containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.commands.iter().filter(|c| c.contains(needle)).count()
    }

    /// Number of issued commands exactly equal to `command`.
    pub fn count_exact(&self, command: &str) -> usize {
        self.commands.iter().filter(|c| c.as_str() == command).count()
    }

    pub fn connects(&self) -> usize {
        self.connects
    }

    fn answer(&mut self, command: &str, timeout: Duration) -> CommandOutcome {
        self.commands.push(command.to_string());
        if !self.alive {
            return CommandOutcome::not_connected(command, &self.host);
        }
        for rule in &mut self.rules {
            if command.contains(&rule.needle) {
                let reply = if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                };
                if let Some(reply) = reply {
                    return reply.to_outcome(command, timeout);
                }
            }
        }
        Reply::ok("").to_outcome(command, timeout)
    }
}

impl RemoteShell for ScriptedShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&mut self) -> Result<()> {
        self.connects += 1;
        if self.reachable {
            self.alive = true;
            Ok(())
        } else {
            Err(Error::Connection(format!("connection refused by {}", self.host)))
        }
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn disconnect(&mut self) {
        self.alive = false;
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> CommandOutcome {
        self.answer(command, timeout)
    }

    fn exec_interactive(
        &mut self,
        command: &str,
        prompts: &[PromptResponse],
        timeout: Duration,
    ) -> CommandOutcome {
        self.interactive.push((command.to_string(), prompts.to_vec()));
        self.answer(command, timeout)
    }
}

/// A step holding the given actions.
pub fn step(number: &str, lead: &str, actions: Vec<StepAction>) -> InstructionStep {
    InstructionStep {
        number: number.to_string(),
        lead: lead.to_string(),
        is_verification: false,
        actions,
        substeps: Vec::new(),
    }
}

pub fn command(text: &str) -> StepAction {
    StepAction::Command(Command::new(text))
}

pub fn create_file(filename: &str, content: &str) -> StepAction {
    StepAction::File(FileAction::new(filename, content, FileActionKind::Create))
}

/// An exercise tree with the given top-level steps.
pub fn exercise(id: &str, kind: ExerciseType, steps: Vec<InstructionStep>) -> ExerciseInstructions {
    ExerciseInstructions {
        exercise_id: id.to_string(),
        exercise_type: kind,
        title: format!("{} title", id),
        outcomes: Vec::new(),
        setup: None,
        steps,
        source: None,
    }
}

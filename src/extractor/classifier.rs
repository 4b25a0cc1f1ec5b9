//! Classifies a single code block as commands, a file, or neither.
//!
//! The classifier works on a [`CodeBlock`], a flat text buffer with the
//! ranges the student is meant to type, so it can be exercised without any
//! markup. Typed tokens pass through an ordered table of noise rules; the
//! first rule that matches discards the token and is recorded as evidence.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

use super::filename::{resolve_filename, BlockContext};
use super::model::{Command, FileAction, FileActionKind};
use crate::remote::PromptResponse;

/// Leading spaces that mark a block as an inline snippet rather than a file.
const SNIPPET_INDENT: usize = 4;

static SHELL_PROMPT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\([^)]*\)\s*)?(\[[^\]]+\]|[\w.-]+@[\w.:~/-]+|[\w.-]+)?\s*[$#]$")
        .expect("shell prompt prefix regex is valid")
});

static SHELL_PROMPT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*((\([^)]*\)\s*)?(\[[^\]]+\]|[\w.-]+@[\w.:~/-]+)\s*[$#]|[$#]\s)")
        .expect("shell prompt line regex is valid")
});

static PROMPT_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(user ?name|password|passphrase|(new |confirm new )?vault password)[^:]*:$")
        .expect("prompt word regex is valid")
});

static CONFIRMATION_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\(yes/no|\[y/n\]|\(y/n\)|\?\s*$)").expect("confirmation regex is valid")
});

static YES_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(y|n|yes|no)$").expect("yes/no regex is valid"));

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-\s+\S|[\w.-]+:$|[\w.-]+:\s+\S)").expect("key/value regex is valid")
});

static USER_AT_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+@[\w.-]+$").expect("user@host regex is valid"));

static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bchanged=\d+|^PLAY \[|^PLAY RECAP|^TASK \[|^RUNNING HANDLER \[|^fatal:|^ok: \[|^changed: \[|^skipping: \[)",
    )
    .expect("status line regex is valid")
});

static CREDENTIAL_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(user ?name|password|passphrase)[^:\n]*:").expect("credential prompt regex is valid")
});

static OUTPUT_OMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)output omitted").expect("output omitted regex is valid"));

/// Text of a `<pre>` block with the ranges typed by the student.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBlock {
    text: String,
    typed: Vec<Range<usize>>,
}

impl CodeBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a block from (text, typed) segments.
    pub fn from_segments(segments: &[(&str, bool)]) -> Self {
        let mut block = Self::new();
        for (text, typed) in segments {
            block.push(text, *typed);
        }
        block
    }

    /// Appends text; adjacent typed segments merge into one range.
    pub fn push(&mut self, text: &str, typed: bool) {
        let start = self.text.len();
        self.text.push_str(text);
        if !typed || text.is_empty() {
            return;
        }
        match self.typed.last_mut() {
            Some(last) if last.end == start => last.end = self.text.len(),
            _ => self.typed.push(start..self.text.len()),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_typed_input(&self) -> bool {
        self.typed.iter().any(|r| !self.text[r.clone()].trim().is_empty())
    }

    fn typed_tokens(&self) -> Vec<TypedToken> {
        self.typed
            .iter()
            .filter_map(|range| {
                let raw = &self.text[range.clone()];
                let leading = raw.len() - raw.trim_start().len();
                let start = range.start + leading;
                let text = raw.trim();
                if text.is_empty() {
                    return None;
                }
                let line_start = self.text[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
                let previous_line = if line_start == 0 {
                    ""
                } else {
                    let before = &self.text[..line_start - 1];
                    &before[before.rfind('\n').map(|i| i + 1).unwrap_or(0)..]
                };
                Some(TypedToken {
                    text: text.to_string(),
                    prefix: self.text[line_start..start].trim().to_string(),
                    previous_line: previous_line.trim().to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TypedToken {
    text: String,
    /// Visible text on the same line before the token
    prefix: String,
    previous_line: String,
}

enum Position {
    ShellPrompt,
    Continuation,
    Answer,
}

impl TypedToken {
    fn position(&self) -> Position {
        if self.prefix.is_empty() || SHELL_PROMPT_PREFIX.is_match(&self.prefix) {
            Position::ShellPrompt
        } else if self.prefix == ">" {
            Position::Continuation
        } else {
            Position::Answer
        }
    }
}

/// One entry in the noise filter.
struct NoiseRule {
    name: &'static str,
    matches: fn(&Classifier, &TypedToken) -> bool,
}

fn is_password_or_prompt(c: &Classifier, t: &TypedToken) -> bool {
    c.known_passwords.iter().any(|p| p == &t.text) || PROMPT_WORD.is_match(&t.text)
}

fn is_confirmation_answer(_: &Classifier, t: &TypedToken) -> bool {
    YES_NO.is_match(&t.text)
        && (CONFIRMATION_PROMPT.is_match(&t.prefix) || CONFIRMATION_PROMPT.is_match(&t.previous_line))
}

fn is_key_value(_: &Classifier, t: &TypedToken) -> bool {
    KEY_VALUE.is_match(&t.text)
}

fn is_user_at_host(_: &Classifier, t: &TypedToken) -> bool {
    USER_AT_HOST.is_match(&t.text)
}

fn is_status_line(_: &Classifier, t: &TypedToken) -> bool {
    STATUS_LINE.is_match(&t.text)
}

static NOISE_RULES: &[NoiseRule] = &[
    NoiseRule {
        name: "known password or prompt",
        matches: is_password_or_prompt,
    },
    NoiseRule {
        name: "confirmation answer",
        matches: is_confirmation_answer,
    },
    NoiseRule {
        name: "key/value or list item",
        matches: is_key_value,
    },
    NoiseRule {
        name: "bare user@host",
        matches: is_user_at_host,
    },
    NoiseRule {
        name: "status line",
        matches: is_status_line,
    },
];

/// Classification of one code block, with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockClass {
    Commands { commands: Vec<Command>, evidence: Vec<String> },
    File { action: FileAction, evidence: Vec<String> },
    Neither { evidence: Vec<String> },
}

impl BlockClass {
    pub fn evidence(&self) -> &[String] {
        match self {
            BlockClass::Commands { evidence, .. }
            | BlockClass::File { evidence, .. }
            | BlockClass::Neither { evidence } => evidence,
        }
    }
}

pub struct Classifier {
    known_passwords: Vec<String>,
}

impl Classifier {
    pub fn new(known_passwords: Vec<String>) -> Self {
        Self { known_passwords }
    }

    pub fn classify(&self, block: &CodeBlock, ctx: &BlockContext) -> BlockClass {
        if block.has_typed_input() {
            self.classify_commands(block)
        } else {
            self.classify_file(block, ctx)
        }
    }

    fn noise_rule(&self, token: &TypedToken) -> Option<&'static str> {
        NOISE_RULES
            .iter()
            .find(|rule| (rule.matches)(self, token))
            .map(|rule| rule.name)
    }

    fn classify_commands(&self, block: &CodeBlock) -> BlockClass {
        let mut evidence = Vec::new();
        let mut commands: Vec<(String, Vec<PromptResponse>)> = Vec::new();

        for token in block.typed_tokens() {
            match token.position() {
                Position::Answer => {
                    if is_confirmation_answer(self, &token) {
                        evidence.push(format!("dropped '{}': confirmation answer", token.text));
                        continue;
                    }
                    match commands.last_mut() {
                        Some((_, prompts)) => {
                            evidence.push(format!("answer '{}' to prompt '{}'", token.text, token.prefix));
                            prompts.push(PromptResponse::new(token.prefix.clone(), token.text.clone()));
                        }
                        None => evidence.push(format!("dropped '{}': answer with no command", token.text)),
                    }
                    continue;
                }
                Position::Continuation => {
                    // a trailing backslash is joined below; otherwise this is
                    // a heredoc or quoted multi-line argument
                    if let Some((text, _)) = commands.last_mut().filter(|(t, _)| !t.ends_with('\\')) {
                        text.push('\n');
                        text.push_str(&token.text);
                        continue;
                    }
                }
                Position::ShellPrompt => {}
            }

            if let Some(rule) = self.noise_rule(&token) {
                evidence.push(format!("dropped '{}': {}", token.text, rule));
                continue;
            }

            let text = join_continuations(&token.text);
            match commands.last_mut() {
                Some((previous, _)) if previous.ends_with('\\') => {
                    let trimmed = previous.trim_end_matches('\\').trim_end().to_string();
                    *previous = format!("{} {}", trimmed, text);
                }
                _ => commands.push((text, Vec::new())),
            }
        }

        if commands.is_empty() {
            evidence.push("typed input was all noise".to_string());
            return BlockClass::Neither { evidence };
        }

        if CREDENTIAL_PROMPT.is_match(block.text()) {
            evidence.push("credential prompt visible in block".to_string());
        }

        let commands = commands
            .into_iter()
            .map(|(text, prompts)| {
                let text = text.trim_end_matches('\\').trim_end().to_string();
                Command::with_prompts(text, prompts)
            })
            .collect();
        BlockClass::Commands { commands, evidence }
    }

    fn classify_file(&self, block: &CodeBlock, ctx: &BlockContext) -> BlockClass {
        let mut evidence = vec!["no typed input".to_string()];
        let lines: Vec<&str> = block.text().lines().collect();

        let first = lines.iter().position(|l| !l.trim().is_empty());
        let last = lines.iter().rposition(|l| !l.trim().is_empty());
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                evidence.push("empty block".to_string());
                return BlockClass::Neither { evidence };
            }
        };
        let body = &lines[first..=last];

        if SHELL_PROMPT_LINE.is_match(body[0]) {
            evidence.push("starts with a shell prompt; output only".to_string());
            return BlockClass::Neither { evidence };
        }

        let indent = body[0].len() - body[0].trim_start().len();
        if indent >= SNIPPET_INDENT {
            evidence.push(format!("first line indented {} spaces; inline snippet", indent));
            return BlockClass::Neither { evidence };
        }

        let resolved = match resolve_filename(ctx) {
            Some(resolved) => resolved,
            None => {
                evidence.push("no filename in surrounding prose".to_string());
                return BlockClass::Neither { evidence };
            }
        };
        evidence.push(format!(
            "filename '{}' from {}",
            resolved.filename,
            resolved.source.describe()
        ));

        let mut kind = resolved.kind;
        if OUTPUT_OMITTED.is_match(block.text()) {
            evidence.push("output omitted marker".to_string());
            kind = FileActionKind::Modify;
        }

        BlockClass::File {
            action: FileAction::new(resolved.filename, &body.join("\n"), kind),
            evidence,
        }
    }
}

/// Joins backslash line-continuations inside one typed token.
fn join_continuations(text: &str) -> String {
    let mut joined = String::new();
    for line in text.lines() {
        if joined.ends_with('\\') {
            joined.pop();
            let trimmed_len = joined.trim_end().len();
            joined.truncate(trimmed_len);
            joined.push(' ');
            joined.push_str(line.trim());
        } else if joined.is_empty() {
            joined.push_str(line.trim_end());
        } else {
            joined.push('\n');
            joined.push_str(line.trim_end());
        }
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "[student@workstation ~]$ ";

    fn classifier() -> Classifier {
        Classifier::new(vec!["redhat".to_string(), "student".to_string()])
    }

    fn commands(class: BlockClass) -> Vec<Command> {
        match class {
            BlockClass::Commands { commands, .. } => commands,
            other => panic!("expected commands, got {:?}", other),
        }
    }

    fn texts(class: BlockClass) -> Vec<String> {
        commands(class).iter().map(|c| c.text().to_string()).collect()
    }

    #[test]
    fn test_single_command() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("ansible-navigator run site.yml -m stdout", true),
            ("\nPLAY [web] ***\n", false),
        ]);
        let class = classifier().classify(&block, &BlockContext::default());
        assert_eq!(texts(class), vec!["ansible-navigator run site.yml -m stdout"]);
    }

    #[test]
    fn test_adjacent_typed_segments_merge() {
        let block = CodeBlock::from_segments(&[(PROMPT, false), ("cd ", true), ("~/deploy-app", true)]);
        assert_eq!(texts(classifier().classify(&block, &BlockContext::default())), vec!["cd ~/deploy-app"]);
    }

    #[test]
    fn test_backslash_continuation_across_tokens() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("podman run -d \\", true),
            ("\n> ", false),
            ("--name web httpd", true),
        ]);
        assert_eq!(
            texts(classifier().classify(&block, &BlockContext::default())),
            vec!["podman run -d --name web httpd"]
        );
    }

    #[test]
    fn test_backslash_continuation_within_token() {
        let block = CodeBlock::from_segments(&[(PROMPT, false), ("ansible-playbook \\\n  site.yml", true)]);
        assert_eq!(
            texts(classifier().classify(&block, &BlockContext::default())),
            vec!["ansible-playbook site.yml"]
        );
    }

    #[test]
    fn test_multiple_commands_in_one_block() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("mkdir web", true),
            ("\n", false),
            (PROMPT, false),
            ("cd web", true),
        ]);
        assert_eq!(
            texts(classifier().classify(&block, &BlockContext::default())),
            vec!["mkdir web", "cd web"]
        );
    }

    #[test]
    fn test_noise_tokens_are_dropped() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("ansible-navigator run site.yml", true),
            ("\n", false),
            ("changed=2", true),
            ("\n", false),
            ("TASK [Install httpd]", true),
            ("\n", false),
            ("student@servera", true),
            ("\n", false),
            ("hosts: web", true),
        ]);
        let class = classifier().classify(&block, &BlockContext::default());
        let evidence = class.evidence().to_vec();
        assert_eq!(texts(class), vec!["ansible-navigator run site.yml"]);
        assert!(evidence.iter().any(|e| e.contains("status line")));
        assert!(evidence.iter().any(|e| e.contains("user@host")));
        assert!(evidence.iter().any(|e| e.contains("key/value")));
    }

    #[test]
    fn test_only_noise_is_neither() {
        let block = CodeBlock::from_segments(&[("redhat", true)]);
        assert!(matches!(
            classifier().classify(&block, &BlockContext::default()),
            BlockClass::Neither { .. }
        ));
    }

    #[test]
    fn test_bare_yes_after_confirmation_prompt_is_noise() {
        let block = CodeBlock::from_segments(&[
            ("Do you want to continue?\n", false),
            ("yes", true),
        ]);
        assert!(matches!(
            classifier().classify(&block, &BlockContext::default()),
            BlockClass::Neither { .. }
        ));
    }

    #[test]
    fn test_yes_on_confirmation_line_is_not_a_prompt_pair() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("rm -ri old-site", true),
            ("\nrm: remove directory 'old-site'? ", false),
            ("y", true),
        ]);
        let class = classifier().classify(&block, &BlockContext::default());
        assert!(class.evidence().iter().any(|e| e.contains("confirmation answer")));

        let cmds = commands(class);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].text(), "rm -ri old-site");
        assert!(!cmds[0].is_interactive());
    }

    #[test]
    fn test_credential_prompts_make_command_interactive() {
        let block = CodeBlock::from_segments(&[
            (PROMPT, false),
            ("podman login registry.lab.example.com", true),
            ("\nUsername: ", false),
            ("admin", true),
            ("\nPassword: ", false),
            ("redhat", true),
            ("\nLogin Succeeded!\n", false),
        ]);
        let class = classifier().classify(&block, &BlockContext::default());
        assert!(class.evidence().iter().any(|e| e.contains("credential prompt")));

        let cmds = commands(class);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].is_interactive());
        assert_eq!(
            cmds[0].prompts(),
            &[
                PromptResponse::new("Username:", "admin"),
                PromptResponse::new("Password:", "redhat"),
            ]
        );
    }

    #[test]
    fn test_prompt_pairs_preserve_order() {
        let pairs = [("Vault password:", "redhat"), ("Confirm Vault password:", "redhat"), ("Username:", "dev")];
        let mut segments: Vec<(&str, bool)> = vec![(PROMPT, false), ("ansible-vault create secret.yml", true)];
        for &(prompt, answer) in &pairs {
            segments.push(("\n", false));
            segments.push((prompt, false));
            segments.push((" ", false));
            segments.push((answer, true));
        }
        let cmds = commands(classifier().classify(&CodeBlock::from_segments(&segments), &BlockContext::default()));
        let decoded: Vec<(&str, &str)> = cmds[0]
            .prompts()
            .iter()
            .map(|p| (p.prompt.as_str(), p.response.as_str()))
            .collect();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn test_file_block_with_resolved_name() {
        let block = CodeBlock::from_segments(&[("\n---\n- name: Deploy\n  hosts: web\n\n", false)]);
        let ctx = BlockContext {
            lead: "Create the `deploy.yml` playbook.".into(),
            ..BlockContext::default()
        };
        match classifier().classify(&block, &ctx) {
            BlockClass::File { action, evidence } => {
                assert_eq!(action.filename, "deploy.yml");
                assert_eq!(action.content, "---\n- name: Deploy\n  hosts: web\n");
                assert_eq!(action.kind, FileActionKind::Create);
                assert!(evidence.iter().any(|e| e.contains("deploy.yml")));
            }
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_output_only_block_is_neither() {
        let block = CodeBlock::from_segments(&[("[student@workstation ~]$ ls\nsite.yml\n", false)]);
        let ctx = BlockContext {
            lead: "Create the `deploy.yml` playbook.".into(),
            ..BlockContext::default()
        };
        assert!(matches!(classifier().classify(&block, &ctx), BlockClass::Neither { .. }));
    }

    #[test]
    fn test_indented_snippet_is_neither() {
        let block = CodeBlock::from_segments(&[("    - name: Start httpd\n      service: {}\n", false)]);
        let ctx = BlockContext {
            lead: "Create the `deploy.yml` playbook.".into(),
            ..BlockContext::default()
        };
        let class = classifier().classify(&block, &ctx);
        assert!(matches!(class, BlockClass::Neither { .. }));
        assert!(class.evidence().iter().any(|e| e.contains("indented")));
    }

    #[test]
    fn test_output_omitted_demotes_to_modify() {
        let block = CodeBlock::from_segments(&[("---\n...output omitted...\n  tasks:\n", false)]);
        let ctx = BlockContext {
            lead: "Create the `deploy.yml` playbook.".into(),
            ..BlockContext::default()
        };
        match classifier().classify(&block, &ctx) {
            BlockClass::File { action, .. } => assert_eq!(action.kind, FileActionKind::Modify),
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_file_block_without_filename_is_neither() {
        let block = CodeBlock::from_segments(&[("key: value\n", false)]);
        assert!(matches!(
            classifier().classify(&block, &BlockContext::default()),
            BlockClass::Neither { .. }
        ));
    }
}

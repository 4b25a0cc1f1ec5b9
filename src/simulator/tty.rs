//! Conversion of terminal-bound commands into batch equivalents.
//!
//! Commands run without a terminal and with a timeout, so anything that
//! redraws the screen, follows output forever or opens an editor is either
//! rewritten into a form that terminates or skipped. Rules are tried in
//! order and the first that applies wins.

use log::debug;
use regex::Regex;
use std::sync::LazyLock;

use crate::extractor::Command;
use crate::remote::{shell_quote, PromptResponse};

const EDITORS: &[&str] = &[
    "vi", "vim", "nvim", "nano", "emacs", "gedit", "vimdiff", "view", "sudoedit",
];

/// Lines kept when a follow command is turned into a one-shot read.
const FOLLOW_LINE_CAP: usize = 100;

/// Options of `sudo` that take a separate value.
const SUDO_VALUE_OPTIONS: &[&str] = &["-u", "-g", "-C", "-D", "-h", "-p", "-r", "-t", "-T", "-U"];

/// Options of `watch` that take a separate value.
const WATCH_VALUE_OPTIONS: &[&str] = &["-n", "--interval", "--equexit"];

/// Tools whose `logs` subcommand follows with `-f`.
const LOG_TOOLS: &[&str] = &["podman", "docker", "oc", "kubectl"];

static BARE_SSH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ssh(\s+(-[iploFJ]\s+\S+|-[A-Za-z]+))*\s+[A-Za-z0-9_.@-]+\s*$").expect("ssh regex is valid")
});
static REGISTRY_LOGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(podman|docker|buildah|skopeo)\s+login\b").expect("login regex is valid"));
static USERNAME_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)user(name)?\s*:?\s*$").expect("username prompt regex is valid"));
static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pass(word)?\s*:?\s*$").expect("password prompt regex is valid"));
static PAGER_PIPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*(less|more)(\s+-\S+)*\s*$").expect("pager pipe regex is valid"));
static SHORT_FLAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-[A-Za-z]+$").expect("short flag regex is valid"));
static LINE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-n\d*|-c\d*|--lines(=.*)?|--bytes(=.*)?|--tail(=.*)?|-[A-Za-z]*n)$").expect("line limit regex is valid")
});

/// What to do with a command before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Run {
        command: String,
        /// Answers still to be typed; empty runs the command non-interactively
        prompts: Vec<PromptResponse>,
        note: Option<String>,
    },
    Skip {
        reason: String,
    },
}

impl Conversion {
    fn rewritten(command: String, note: &str) -> Self {
        Conversion::Run {
            command,
            prompts: Vec::new(),
            note: Some(note.to_string()),
        }
    }
}

/// Command text split into a `sudo [options]` prefix and the program line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Invocation<'a> {
    sudo: &'a str,
    body: &'a str,
}

impl<'a> Invocation<'a> {
    fn parse(text: &'a str) -> Self {
        let text = text.trim();
        let words = words(text);
        if words.first().map(|(_, w)| *w) != Some("sudo") {
            return Self { sudo: "", body: text };
        }
        let mut idx = 1;
        while let Some((_, word)) = words.get(idx) {
            if !word.starts_with('-') {
                break;
            }
            idx += if SUDO_VALUE_OPTIONS.contains(word) { 2 } else { 1 };
        }
        match words.get(idx) {
            Some((offset, _)) => Self {
                sudo: text[..*offset].trim_end(),
                body: &text[*offset..],
            },
            None => Self { sudo: text, body: "" },
        }
    }

    fn program(&self) -> Option<&'a str> {
        self.body.split_whitespace().next()
    }

    /// Puts the `sudo` prefix back in front of a rewritten body.
    fn rebuild(&self, body: &str) -> String {
        if self.sudo.is_empty() {
            body.to_string()
        } else {
            format!("{} {}", self.sudo, body)
        }
    }
}

/// Whitespace-separated words of `text` with their byte offsets.
fn words(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &text[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &text[s..]));
    }
    out
}

/// Removes one level of matching single or double quotes.
fn unquote_once(text: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = text.strip_prefix(quote).and_then(|t| t.strip_suffix(quote)) {
            if !inner.contains(quote) {
                return inner;
            }
        }
    }
    text
}

struct TtyRule {
    name: &'static str,
    apply: fn(&Invocation, &Command) -> Option<Conversion>,
}

static RULES: &[TtyRule] = &[
    TtyRule {
        name: "editor",
        apply: skip_editor,
    },
    TtyRule {
        name: "interactive ssh",
        apply: skip_bare_ssh,
    },
    TtyRule {
        name: "registry login",
        apply: login_with_flags,
    },
    TtyRule {
        name: "watch",
        apply: strip_watch,
    },
    TtyRule {
        name: "top",
        apply: batch_top,
    },
    TtyRule {
        name: "pager pipe",
        apply: drop_pager_pipe,
    },
    TtyRule {
        name: "pager",
        apply: pager_to_cat,
    },
    TtyRule {
        name: "follow",
        apply: drop_follow,
    },
];

/// Applies the first matching rule, or runs the command unchanged.
pub fn convert(command: &Command) -> Conversion {
    let invocation = Invocation::parse(command.text());
    for rule in RULES {
        if let Some(conversion) = (rule.apply)(&invocation, command) {
            debug!("{} rule applied to {:?}", rule.name, command.text());
            return conversion;
        }
    }
    Conversion::Run {
        command: command.text().to_string(),
        prompts: command.prompts().to_vec(),
        note: None,
    }
}

fn skip_editor(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    let program = invocation.program()?;
    EDITORS.contains(&program).then(|| Conversion::Skip {
        reason: format!("{} needs an interactive terminal", program),
    })
}

fn skip_bare_ssh(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    BARE_SSH.is_match(invocation.body).then(|| Conversion::Skip {
        reason: "interactive ssh session without a remote command".to_string(),
    })
}

fn login_with_flags(invocation: &Invocation, command: &Command) -> Option<Conversion> {
    let text = invocation.body;
    let caps = REGISTRY_LOGIN.captures(text)?;
    if !command.is_interactive() {
        return None;
    }
    let username = command.prompts().iter().find(|p| USERNAME_PROMPT.is_match(&p.prompt));
    let password = command.prompts().iter().find(|p| PASSWORD_PROMPT.is_match(&p.prompt));
    let (username, password) = (username?, password?);

    let rest = text[caps[0].len()..].trim();
    let mut rewritten = format!(
        "{} -u {} -p {}",
        &caps[0],
        shell_quote(&username.response),
        shell_quote(&password.response)
    );
    if !rest.is_empty() {
        rewritten.push(' ');
        rewritten.push_str(rest);
    }
    Some(Conversion::rewritten(invocation.rebuild(&rewritten), "credentials passed as flags"))
}

fn strip_watch(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    let words = words(invocation.body);
    if words.first()?.1 != "watch" {
        return None;
    }
    let mut idx = 1;
    while let Some((_, word)) = words.get(idx) {
        if !word.starts_with('-') {
            break;
        }
        idx += if WATCH_VALUE_OPTIONS.contains(word) { 2 } else { 1 };
    }
    let Some((offset, _)) = words.get(idx) else {
        return Some(Conversion::Skip {
            reason: "watch without a command".to_string(),
        });
    };
    let inner = unquote_once(invocation.body[*offset..].trim_end());
    Some(Conversion::rewritten(invocation.rebuild(inner), "watch removed; ran once"))
}

fn batch_top(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    let words = words(invocation.body);
    if words.first()?.1 != "top" {
        return None;
    }
    let mut rewritten = "top -b -n 1".to_string();
    if let Some((offset, _)) = words.get(1) {
        rewritten.push(' ');
        rewritten.push_str(&invocation.body[*offset..]);
    }
    Some(Conversion::rewritten(
        invocation.rebuild(&rewritten),
        "top run in batch mode for one iteration",
    ))
}

/// Drops a trailing pager and converts what is left, so a follow or watch
/// in front of the pipe is still handled.
fn drop_pager_pipe(_: &Invocation, command: &Command) -> Option<Conversion> {
    let text = command.text();
    let m = PAGER_PIPE.find(text)?;
    let remaining = Command::new(&text[..m.start()]);
    Some(match convert(&remaining) {
        Conversion::Run { command, note, .. } => {
            let note = match note {
                Some(note) => format!("pager removed; {}", note),
                None => "pager removed".to_string(),
            };
            Conversion::rewritten(command, &note)
        }
        skip => skip,
    })
}

fn pager_to_cat(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    let program = invocation.program()?;
    if !matches!(program, "less" | "more") {
        return None;
    }
    let files: Vec<&str> = invocation
        .body
        .split_whitespace()
        .skip(1)
        .filter(|w| !w.starts_with('-'))
        .collect();
    if files.is_empty() {
        return None;
    }
    Some(Conversion::rewritten(
        invocation.rebuild(&format!("cat {}", files.join(" "))),
        "pager replaced with cat",
    ))
}

/// Strips `f`/`F` from a short flag; `None` when nothing of the flag remains.
fn without_follow(word: &str) -> Option<String> {
    if matches!(word, "--follow" | "-f" | "-F") || word.starts_with("--follow=") {
        return None;
    }
    if SHORT_FLAGS.is_match(word) && word.contains(['f', 'F']) {
        let kept: String = word.chars().filter(|c| !matches!(c, 'f' | 'F')).collect();
        return (kept != "-").then_some(kept);
    }
    Some(word.to_string())
}

/// Turns `tail -f`, `journalctl -f` and `<tool> logs -f` into one bounded read.
fn drop_follow(invocation: &Invocation, _: &Command) -> Option<Conversion> {
    let words: Vec<&str> = invocation.body.split_whitespace().collect();
    let (head, cap) = match words.as_slice() {
        ["tail", ..] | ["journalctl", ..] => (1, format!("-n {}", FOLLOW_LINE_CAP)),
        [tool, "logs", ..] if LOG_TOOLS.contains(tool) => (2, format!("--tail {}", FOLLOW_LINE_CAP)),
        _ => return None,
    };

    let args: Vec<String> = words[head..].iter().filter_map(|w| without_follow(w)).collect();
    if words[head..].iter().map(|w| w.to_string()).eq(args.iter().cloned()) {
        return None;
    }

    let mut rewritten: Vec<String> = words[..head].iter().map(|w| w.to_string()).collect();
    if !args.iter().any(|a| LINE_LIMIT.is_match(a)) {
        rewritten.push(cap);
    }
    rewritten.extend(args);
    Some(Conversion::rewritten(
        invocation.rebuild(&rewritten.join(" ")),
        "follow flag removed; output capped",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> String {
        match convert(&Command::new(text)) {
            Conversion::Run { command, .. } => command,
            Conversion::Skip { reason } => panic!("{} was skipped: {}", text, reason),
        }
    }

    fn skipped(text: &str) -> bool {
        matches!(convert(&Command::new(text)), Conversion::Skip { .. })
    }

    #[test]
    fn test_watch_runs_inner_command_once() {
        assert_eq!(run("watch -n 2 systemctl status httpd"), "systemctl status httpd");
        assert_eq!(run("watch -d oc get pods"), "oc get pods");
        assert_eq!(run("watch --interval 5 -d ls"), "ls");
        assert!(skipped("watch -n 2"));
    }

    #[test]
    fn test_watch_unquotes_inner_command() {
        assert_eq!(run("watch \"oc get pods\""), "oc get pods");
        assert_eq!(run("watch -n 1 'podman ps -a'"), "podman ps -a");
        assert_eq!(run("watch 'ls' | grep x"), "'ls' | grep x");
    }

    #[test]
    fn test_top_and_pagers() {
        assert_eq!(run("top"), "top -b -n 1");
        assert_eq!(run("top -u student"), "top -b -n 1 -u student");
        assert_eq!(run("less /etc/hosts"), "cat /etc/hosts");
        assert_eq!(run("journalctl -u httpd | less"), "journalctl -u httpd");
    }

    #[test]
    fn test_follow_flags_are_dropped_and_capped() {
        assert_eq!(run("tail -f /var/log/messages"), "tail -n 100 /var/log/messages");
        assert_eq!(run("journalctl -u httpd -f"), "journalctl -n 100 -u httpd");
        assert_eq!(run("journalctl --follow"), "journalctl -n 100");
        assert_eq!(run("tail -n 5 /var/log/messages"), "tail -n 5 /var/log/messages");
        assert_eq!(run("podman logs -f web"), "podman logs --tail 100 web");
        assert_eq!(run("oc logs --tail=20 -f deploy/web"), "oc logs --tail=20 deploy/web");
    }

    #[test]
    fn test_combined_follow_flags() {
        assert_eq!(run("tail -fn 20 /var/log/secure"), "tail -n 20 /var/log/secure");
        assert_eq!(run("journalctl -fu httpd"), "journalctl -n 100 -u httpd");
        assert_eq!(run("tail -F /var/log/messages"), "tail -n 100 /var/log/messages");
    }

    #[test]
    fn test_sudo_prefixed_commands_are_converted() {
        assert_eq!(run("sudo tail -f /var/log/secure"), "sudo tail -n 100 /var/log/secure");
        assert_eq!(run("sudo journalctl -f"), "sudo journalctl -n 100");
        assert_eq!(run("sudo -u apache less /var/log/httpd/error_log"), "sudo -u apache cat /var/log/httpd/error_log");
        assert_eq!(run("sudo top"), "sudo top -b -n 1");
        assert_eq!(run("sudo watch ss -tlnp"), "sudo ss -tlnp");
        assert!(skipped("sudo -i vim /etc/hosts"));
    }

    #[test]
    fn test_pager_pipe_keeps_converting() {
        assert_eq!(run("sudo journalctl -f | less"), "sudo journalctl -n 100");
        match convert(&Command::new("tail -f /var/log/messages | more")) {
            Conversion::Run { note, .. } => assert_eq!(
                note.as_deref(),
                Some("pager removed; follow flag removed; output capped")
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_editors_and_bare_ssh_are_skipped() {
        assert!(skipped("vim site.yml"));
        assert!(skipped("sudo vi /etc/hosts"));
        assert!(skipped("ssh student@servera"));
        assert!(skipped("ssh -i key servera"));
        assert_eq!(run("ssh servera hostname"), "ssh servera hostname");
    }

    #[test]
    fn test_registry_login_uses_flags() {
        let login = Command::with_prompts(
            "podman login registry.lab.example.com",
            vec![PromptResponse::new("Username:", "admin"), PromptResponse::new("Password:", "redhat")],
        );
        match convert(&login) {
            Conversion::Run { command, prompts, .. } => {
                assert_eq!(command, "podman login -u admin -p redhat registry.lab.example.com");
                assert!(prompts.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_interactive_commands_keep_prompts() {
        let cmd = Command::with_prompts("ansible-vault create secret.yml", vec![PromptResponse::new("New Vault password:", "redhat")]);
        match convert(&cmd) {
            Conversion::Run { command, prompts, note } => {
                assert_eq!(command, "ansible-vault create secret.yml");
                assert_eq!(prompts.len(), 1);
                assert!(note.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_commands_pass_through() {
        assert_eq!(run("systemctl status httpd"), "systemctl status httpd");
        assert_eq!(run("topology-check"), "topology-check");
    }
}

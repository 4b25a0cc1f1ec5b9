//! Working-directory state threaded through the instruction walk.

use regex::Regex;
use std::sync::LazyLock;

use crate::remote::{quote_path, ContainerBinding};

static BARE_CD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cd(?:\s+(\S+))?\s*$").expect("cd regex is valid"));

/// Where the next command runs.
///
/// Treated as immutable: visitors return an updated copy rather than
/// mutating the one they were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Tracked working directory; container-side when a container is bound
    pub cwd: Option<String>,
    pub container: Option<ContainerBinding>,
}

impl ExecutionContext {
    pub fn on_host() -> Self {
        Self::default()
    }

    /// A context that runs inside `binding`, starting in its workspace.
    pub fn in_container(binding: ContainerBinding) -> Self {
        Self {
            cwd: Some(binding.container_workdir.clone()),
            container: Some(binding),
        }
    }

    pub fn without_container(&self) -> Self {
        Self {
            cwd: self
                .cwd
                .as_deref()
                .zip(self.container.as_ref())
                .map(|(cwd, binding)| binding.to_host_path(cwd))
                .or_else(|| self.cwd.clone()),
            container: None,
        }
    }

    /// Returns the context after `cd target`.
    pub fn change_dir(&self, target: &str) -> Self {
        let cwd = match target {
            "" | "~" => "~".to_string(),
            "-" => return self.clone(),
            t if t.starts_with('/') || t.starts_with("~/") => normalize(t),
            t => join(self.cwd.as_deref().unwrap_or("~"), t),
        };
        Self {
            cwd: Some(cwd),
            container: self.container.clone(),
        }
    }

    /// Resolves a filename to the path to write on the lab host.
    pub fn host_path(&self, filename: &str) -> String {
        let path = if filename.starts_with('/') || filename == "~" || filename.starts_with("~/") {
            normalize(filename)
        } else {
            join(self.cwd.as_deref().unwrap_or("~"), filename)
        };
        match &self.container {
            Some(binding) => binding.to_host_path(&path),
            None => path,
        }
    }

    /// Prefixes a host command with the tracked directory.
    pub fn host_command(&self, command: &str) -> String {
        match &self.cwd {
            Some(cwd) => format!("cd {} && {}", quote_path(cwd), command),
            None => command.to_string(),
        }
    }
}

/// Target of a standalone `cd`, or `None` for any other command.
pub fn parse_cd(command: &str) -> Option<&str> {
    BARE_CD
        .captures(command.trim())
        .map(|caps| caps.get(1).map(|m| m.as_str()).unwrap_or(""))
}

fn join(base: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", base.trim_end_matches('/'), relative))
}

fn normalize(path: &str) -> String {
    let (root, rest) = if let Some(rest) = path.strip_prefix("~/") {
        ("~", rest)
    } else if let Some(rest) = path.strip_prefix('/') {
        ("", rest)
    } else {
        ("", path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    match (root, parts.is_empty()) {
        ("~", true) => "~".to_string(),
        ("~", false) => format!("~/{}", parts.join("/")),
        (_, true) if path.starts_with('/') => "/".to_string(),
        (_, true) => ".".to_string(),
        (_, false) if path.starts_with('/') => format!("/{}", parts.join("/")),
        (_, false) => parts.join("/"),
    }
}

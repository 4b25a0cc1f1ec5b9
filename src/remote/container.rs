//! Container-scoped command routing.
//!
//! Some exercises run their tooling inside a development container described
//! by a `devcontainer.json` manifest in the exercise working directory. The
//! router launches one container per exercise, bind-mounts the working
//! directory and credential material into it, and wraps later commands in
//! `<runtime> exec`.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ContainerSettings;
use crate::error::{Error, Result};
use crate::remote::{quote_path, shell_quote, CommandOutcome, RemoteShell, SENTINEL};

const CONTAINER_PREFIX: &str = "labsim-";

/// The subset of `devcontainer.json` the router understands.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevcontainerManifest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub run_args: Vec<String>,
    #[serde(default)]
    pub workspace_folder: Option<String>,
    #[serde(default)]
    pub container_env: BTreeMap<String, String>,
}

impl DevcontainerManifest {
    /// Parses a manifest, tolerating full-line `//` comments.
    pub fn parse(text: &str) -> Result<Self> {
        let stripped: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(serde_json::from_str(&stripped)?)
    }
}

/// A running container bound to one exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerBinding {
    pub name: String,
    pub image: String,
    /// Exercise working directory on the lab host
    pub host_workdir: String,
    /// Where `host_workdir` is mounted inside the container
    pub container_workdir: String,
}

impl ContainerBinding {
    /// Wraps `command` so it runs inside this container.
    pub fn wrap(&self, runtime: &str, command: &str, workdir: Option<&str>) -> String {
        let dir = workdir.unwrap_or(&self.container_workdir);
        format!(
            "{} exec -w {} {} bash -lc {}",
            runtime,
            shell_quote(dir),
            self.name,
            shell_quote(command)
        )
    }

    /// Maps a container path onto the bind-mounted host directory.
    ///
    /// Paths outside the mounted workspace, and relative paths, are returned
    /// unchanged.
    pub fn to_host_path(&self, container_path: &str) -> String {
        swap_prefix(container_path, &self.container_workdir, &self.host_workdir)
    }

    pub fn to_container_path(&self, host_path: &str) -> String {
        swap_prefix(host_path, &self.host_workdir, &self.container_workdir)
    }
}

fn swap_prefix(path: &str, from: &str, to: &str) -> String {
    let from = from.trim_end_matches('/');
    let to = to.trim_end_matches('/');
    if path == from {
        return to.to_string();
    }
    match path.strip_prefix(from) {
        Some(rest) if rest.starts_with('/') => format!("{}{}", to, rest),
        _ => path.to_string(),
    }
}

/// Picks the first locally cached image matching a fallback pattern.
///
/// Patterns are tried in priority order; within one pattern the inventory
/// order wins. Dangling `<none>` entries are ignored.
pub fn select_fallback(patterns: &[String], inventory: &str) -> Option<String> {
    let images: Vec<&str> = inventory
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("<none>"))
        .collect();
    patterns
        .iter()
        .find_map(|pattern| images.iter().find(|image| image.contains(pattern.as_str())))
        .map(|image| image.to_string())
}

/// Launches and routes commands into per-exercise containers.
pub struct ContainerRouter {
    settings: ContainerSettings,
    timeout: Duration,
}

impl ContainerRouter {
    pub fn new(settings: ContainerSettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    pub fn runtime(&self) -> &str {
        &self.settings.runtime
    }

    /// Container name for an exercise; distinct exercises never share one.
    pub fn container_name(exercise_id: &str) -> String {
        let sanitized: String = exercise_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}{}", CONTAINER_PREFIX, sanitized)
    }

    /// Exercise working directory on the lab host.
    pub fn host_workdir(&self, exercise_name: &str) -> String {
        format!("{}/{}", self.settings.exercise_root.trim_end_matches('/'), exercise_name)
    }

    fn manifest_path(&self, host_workdir: &str) -> String {
        format!("{}/{}", host_workdir, self.settings.manifest_path)
    }

    /// Reads the exercise manifest, or `None` when the exercise has none.
    pub fn discover(&self, shell: &mut dyn RemoteShell, exercise_name: &str) -> Result<Option<DevcontainerManifest>> {
        let path = self.manifest_path(&self.host_workdir(exercise_name));
        let outcome = shell.exec(&format!("cat {}", quote_path(&path)), self.timeout);
        if !outcome.is_success() {
            debug!("No container manifest at {}: {}", path, outcome.summary());
            return Ok(None);
        }
        DevcontainerManifest::parse(&outcome.stdout).map(Some)
    }

    /// Launches a fresh container for the exercise and verifies it responds.
    pub fn setup(
        &self,
        shell: &mut dyn RemoteShell,
        exercise_id: &str,
        exercise_name: &str,
    ) -> Result<ContainerBinding> {
        let manifest = self.discover(shell, exercise_name)?.ok_or_else(|| {
            Error::Container(format!("no container manifest for exercise {}", exercise_name))
        })?;
        let primary = manifest
            .image
            .clone()
            .ok_or_else(|| Error::Container("container manifest does not name an image".to_string()))?;

        let name = Self::container_name(exercise_id);
        let runtime = self.runtime();
        let removed = shell.exec(&format!("{} rm -f {}", runtime, name), self.timeout);
        if !removed.is_success() {
            debug!("Removing stale container {} failed: {}", name, removed.summary());
        }

        let image = self.ensure_image(shell, &primary)?;
        let host_workdir = self.host_workdir(exercise_name);
        let container_workdir = manifest
            .workspace_folder
            .clone()
            .unwrap_or_else(|| self.settings.default_workdir.clone());

        let launch = self.launch_command(&name, &image, &host_workdir, &container_workdir, &manifest);
        info!("Launching container {} from {}", name, image);
        let launched = shell.exec(&launch, self.timeout);
        if !launched.is_success() {
            return Err(Error::Container(format!(
                "failed to launch container {}: {}",
                name,
                launched.summary()
            )));
        }

        let binding = ContainerBinding {
            name,
            image,
            host_workdir,
            container_workdir,
        };

        let probe = shell.exec(
            &format!("{} exec {} echo {}", runtime, binding.name, SENTINEL),
            self.timeout,
        );
        if !probe.is_success() || !probe.stdout.contains(SENTINEL) {
            self.teardown(shell, &binding);
            return Err(Error::Container(format!(
                "container {} is not responding: {}",
                binding.name,
                probe.summary()
            )));
        }

        Ok(binding)
    }

    fn ensure_image(&self, shell: &mut dyn RemoteShell, image: &str) -> Result<String> {
        let runtime = self.runtime();
        let quoted = shell_quote(image);
        let pulled = shell.exec(
            &format!("{rt} image exists {img} || {rt} pull {img}", rt = runtime, img = quoted),
            self.timeout,
        );
        if pulled.is_success() {
            return Ok(image.to_string());
        }

        warn!("Cannot pull image {}: {}; looking for a cached fallback", image, pulled.summary());
        let listing = shell.exec(
            &format!("{} images --format '{{{{.Repository}}}}:{{{{.Tag}}}}'", runtime),
            self.timeout,
        );
        if !listing.is_success() {
            return Err(Error::Container(format!(
                "image {} unavailable and image inventory failed: {}",
                image,
                listing.summary()
            )));
        }

        match select_fallback(&self.settings.fallback_image_patterns, &listing.stdout) {
            Some(fallback) => {
                warn!("Using fallback image {} instead of {}", fallback, image);
                Ok(fallback)
            }
            None => Err(Error::Container(format!(
                "image {} unavailable and no cached image matches {:?}",
                image, self.settings.fallback_image_patterns
            ))),
        }
    }

    fn launch_command(
        &self,
        name: &str,
        image: &str,
        host_workdir: &str,
        container_workdir: &str,
        manifest: &DevcontainerManifest,
    ) -> String {
        let mut parts = vec![
            self.runtime().to_string(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            quote_path(&format!("{}:{}:Z", host_workdir, container_workdir)),
        ];
        for mount in &self.settings.credential_mounts {
            let spec = match &mount.options {
                Some(options) => format!("{}:{}:{}", mount.host, mount.container, options),
                None => format!("{}:{}", mount.host, mount.container),
            };
            parts.push("-v".to_string());
            parts.push(quote_path(&spec));
        }
        for (key, value) in &manifest.container_env {
            parts.push("-e".to_string());
            parts.push(shell_quote(&format!("{}={}", key, value)));
        }
        parts.push("-w".to_string());
        parts.push(shell_quote(container_workdir));
        parts.extend(manifest.run_args.iter().map(|arg| shell_quote(arg)));
        parts.push(shell_quote(image));
        parts.push("sleep".to_string());
        parts.push("infinity".to_string());
        parts.join(" ")
    }

    /// Runs `command` inside the bound container.
    pub fn exec(
        &self,
        shell: &mut dyn RemoteShell,
        binding: &ContainerBinding,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> CommandOutcome {
        shell.exec(&binding.wrap(self.runtime(), command, workdir), timeout)
    }

    /// Removes the container; failures are logged and returned, never raised.
    pub fn teardown(&self, shell: &mut dyn RemoteShell, binding: &ContainerBinding) -> CommandOutcome {
        info!("Removing container {}", binding.name);
        let outcome = shell.exec(&format!("{} rm -f {}", self.runtime(), binding.name), self.timeout);
        if !outcome.is_success() {
            warn!("Failed to remove container {}: {}", binding.name, outcome.summary());
        }
        outcome
    }
}

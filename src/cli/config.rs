//! `labsim config`: the lab hosts runs connect to and the settings they use.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use labsim::config::{Config, RemoteConfig};
use labsim::remote::{shell_quote, RemoteShell, SshSession};

#[derive(Args)]
#[command(about = "Inspect and edit lab hosts and simulator settings")]
pub struct ConfigCommand {
    #[arg(short, long, global = true, help = "Configuration file (defaults to the user config directory)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as YAML
    Show,

    /// Print where the configuration file lives
    Path,

    /// List lab hosts, marking the one runs use when none is named
    #[command(alias = "list-remotes")]
    Hosts,

    /// Register the classroom machine that runs the lab tool
    #[command(alias = "add-remote")]
    AddHost {
        /// Short name used with --remote (e.g., "workstation")
        name: String,

        /// Hostname of the lab machine
        #[arg(long)]
        host: String,

        /// Login the exercises are written for
        #[arg(long, default_value = "student")]
        user: String,

        #[arg(long, default_value = "22")]
        port: u16,

        /// Private key; the SSH agent is used when omitted
        #[arg(long)]
        ssh_key: Option<String>,

        /// Connect timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Use this host when no --remote is given
        #[arg(long)]
        default: bool,
    },

    /// Forget a lab host
    #[command(alias = "remove-remote")]
    RemoveHost { name: String },

    /// Show one lab host with the lab settings runs on it use
    #[command(alias = "show-remote")]
    ShowHost { name: String },

    /// Write a starter configuration for a classroom workstation
    Init {
        #[arg(long)]
        force: bool,
    },

    /// Connect to lab hosts and confirm the tools a run needs are installed
    #[command(alias = "validate")]
    Check {
        /// Only this host (all hosts when omitted)
        name: Option<String>,
    },
}

/// A configuration together with the file it is read from and saved to.
struct ConfigFile {
    path: PathBuf,
    config: Config,
}

impl ConfigFile {
    fn open(explicit: Option<PathBuf>) -> Result<Self> {
        let path = explicit.or_else(Config::default_path).ok_or_else(|| {
            anyhow!("Could not determine configuration directory\n\nSuggestions:\n• Pass --config with an explicit file path")
        })?;
        let config = Config::load_from(&path)?;
        Ok(Self { path, config })
    }

    fn save(&self) -> Result<()> {
        self.config.validate()?;
        self.config.save_to(&self.path)?;
        Ok(())
    }

    fn is_default_host(&self, name: &str) -> bool {
        self.config.defaults.remote.as_deref() == Some(name)
    }

    fn host(&self, name: &str) -> Result<&RemoteConfig> {
        self.config.get_remote(name).ok_or_else(|| {
            anyhow!(
                "No lab host named '{}' in {}\n\nSuggestions:\n• Run 'labsim config hosts' to see the configured hosts",
                name,
                self.path.display()
            )
        })
    }
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        let mut file = ConfigFile::open(self.config)?;
        match self.action {
            ConfigAction::Show => show(&file),
            ConfigAction::Path => {
                let state = if file.path.exists() { "exists" } else { "not created yet" };
                println!("{} ({})", file.path.display(), state);
                Ok(())
            }
            ConfigAction::Hosts => {
                list_hosts(&file);
                Ok(())
            }
            ConfigAction::AddHost {
                name,
                host,
                user,
                port,
                ssh_key,
                timeout,
                default,
            } => {
                let mut remote = RemoteConfig::new(host, user).with_port(port).with_timeout(timeout);
                if let Some(key) = ssh_key {
                    remote = remote.with_ssh_key(key);
                }
                add_host(&mut file, name, remote, default)
            }
            ConfigAction::RemoveHost { name } => {
                if file.config.remove_remote(&name).is_none() {
                    return Err(anyhow!("No lab host named '{}'", name));
                }
                file.save()?;
                println!("Removed lab host '{}'", name);
                Ok(())
            }
            ConfigAction::ShowHost { name } => show_host(&file, &name),
            ConfigAction::Init { force } => init(&mut file, force),
            ConfigAction::Check { name } => check_hosts(&file, name.as_deref()),
        }
    }
}

fn show(file: &ConfigFile) -> Result<()> {
    println!("# {}", file.path.display());
    print!("{}", serde_yaml::to_string(&file.config)?);
    if file.config.remotes.is_empty() {
        println!();
        println!("# No lab hosts yet. Add the classroom workstation with:");
        println!("#   labsim config add-host workstation --host workstation.lab.example.com --default");
    }
    Ok(())
}

fn list_hosts(file: &ConfigFile) {
    if file.config.remotes.is_empty() {
        println!("No lab hosts configured in {}", file.path.display());
        return;
    }

    let mut names: Vec<&String> = file.config.remotes.keys().collect();
    names.sort();
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    for name in names {
        let marker = if file.is_default_host(name) { "*" } else { " " };
        println!(
            "{} {:width$}  {}",
            marker,
            name,
            file.config.remotes[name].connection_string(),
            width = width
        );
    }
}

fn add_host(file: &mut ConfigFile, name: String, remote: RemoteConfig, make_default: bool) -> Result<()> {
    let replaced = file.config.get_remote(&name).is_some();
    let target = remote.connection_string();
    file.config.set_remote(name.clone(), remote);
    if make_default || file.config.defaults.remote.is_none() {
        file.config.defaults.remote = Some(name.clone());
    }
    file.save()?;

    let verb = if replaced { "Updated" } else { "Added" };
    println!("{} lab host '{}' ({})", verb, name, target);
    if file.is_default_host(&name) {
        println!("Runs without --remote will use it.");
    }
    println!("Check it with: labsim config check {}", name);
    Ok(())
}

fn show_host(file: &ConfigFile, name: &str) -> Result<()> {
    let remote = file.host(name)?;
    let lab = &file.config.lab;
    println!("{}{}", name, if file.is_default_host(name) { " (default)" } else { "" });
    println!("  connects to:      {}", remote.connection_string());
    println!("  key:              {}", remote.ssh_key.as_deref().unwrap_or("SSH agent"));
    println!("  connect timeout:  {}s", remote.timeout);
    println!("  lab tool:         {}", lab.binary);
    println!("  start/finish:     {}s per call", lab.lifecycle_timeout);
    println!("  student commands: {}s per call", lab.command_timeout);
    if file.config.container.enabled {
        println!("  containers:       {}", file.config.container.runtime);
    }
    Ok(())
}

fn init(file: &mut ConfigFile, force: bool) -> Result<()> {
    if file.path.exists() && !force {
        return Err(anyhow!(
            "Configuration already exists at {}\n\nSuggestions:\n• Use --force to replace it\n• Use 'labsim config add-host' to add another lab host",
            file.path.display()
        ));
    }

    file.config = Config::default();
    file.config.set_remote(
        "workstation".to_string(),
        RemoteConfig::new("workstation.lab.example.com".to_string(), "student".to_string()),
    );
    file.config.defaults.remote = Some("workstation".to_string());
    file.save()?;

    println!("Wrote {}", file.path.display());
    println!("The default lab host is student@workstation.lab.example.com.");
    println!("Confirm the classroom is reachable with: labsim config check");
    Ok(())
}

/// A command that must succeed on a lab host before runs can use it.
struct HostCheck {
    label: String,
    command: String,
}

fn host_checks(config: &Config) -> Vec<HostCheck> {
    let mut checks = vec![HostCheck {
        label: format!("{} tool", config.lab.binary),
        command: format!("command -v {}", shell_quote(&config.lab.binary)),
    }];
    if config.container.enabled {
        checks.push(HostCheck {
            label: format!("{} runtime", config.container.runtime),
            command: format!("command -v {}", shell_quote(&config.container.runtime)),
        });
    }
    checks
}

fn check_hosts(file: &ConfigFile, name: Option<&str>) -> Result<()> {
    let mut hosts: Vec<(&str, &RemoteConfig)> = match name {
        Some(name) => vec![(name, file.host(name)?)],
        None => file.config.remotes.iter().map(|(k, v)| (k.as_str(), v)).collect(),
    };
    if hosts.is_empty() {
        return Err(anyhow!(
            "No lab hosts configured in {}\n\nSuggestions:\n• Run 'labsim config init' or 'labsim config add-host'",
            file.path.display()
        ));
    }
    hosts.sort_by_key(|(name, _)| *name);

    let checks = host_checks(&file.config);
    let mut failed = Vec::new();
    for (name, remote) in &hosts {
        println!("{} ({})", name, remote.connection_string());
        if !check_host(remote, &checks) {
            failed.push(*name);
        }
    }

    println!();
    if !failed.is_empty() {
        return Err(anyhow!(
            "{} of {} lab hosts are not ready: {}",
            failed.len(),
            hosts.len(),
            failed.join(", ")
        ));
    }
    println!("All {} lab hosts are ready", hosts.len());
    Ok(())
}

/// Prints one line per check; false when the host cannot run exercises.
fn check_host(remote: &RemoteConfig, checks: &[HostCheck]) -> bool {
    let mut session = SshSession::new(remote.clone());
    let started = Instant::now();
    if let Err(e) = session.connect() {
        println!("  ✗ ssh: {}", e);
        return false;
    }
    println!("  ✓ ssh: connected in {:.1}s", started.elapsed().as_secs_f64());

    let timeout = Duration::from_secs(remote.timeout);
    let mut ready = true;
    for check in checks {
        let outcome = session.exec(&check.command, timeout);
        if outcome.is_success() {
            println!("  ✓ {}: {}", check.label, outcome.stdout.trim());
        } else {
            println!("  ✗ {}: {}", check.label, outcome.summary());
            ready = false;
        }
    }
    session.disconnect();
    ready
}

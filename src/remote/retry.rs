//! Retry logic with exponential backoff for establishing lab sessions.

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Retries an operation with exponential backoff.
///
/// The closure receives the 1-based attempt number. Returns the first
/// success, or the last error once `max_attempts` is exhausted.
pub fn retry_with_backoff<T, F>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                debug!("{} failed on final attempt {}: {}", operation_name, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_after(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation_name, attempt, attempts, e, delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// A class of connection failure and the advice that goes with it.
struct Diagnosis {
    /// Lowercase fragments of the error text, any of which selects the entry
    needles: &'static [&'static str],
    advice: fn(&RemoteConfig) -> Vec<String>,
}

const DIAGNOSES: &[Diagnosis] = &[
    Diagnosis {
        needles: &["connection refused", "timed out", "no route to host", "failed to resolve"],
        advice: unreachable_advice,
    },
    Diagnosis {
        needles: &["authentication", "permission denied", "publickey"],
        advice: authentication_advice,
    },
    Diagnosis {
        needles: &["host key", "known_hosts"],
        advice: host_key_advice,
    },
    Diagnosis {
        needles: &["sentinel"],
        advice: probe_advice,
    },
];

fn unreachable_advice(remote: &RemoteConfig) -> Vec<String> {
    vec![
        format!("Verify the lab host '{}' is reachable and powered on", remote.host),
        format!(
            "Check that sshd listens on port {} (try: ssh -p {} {})",
            remote.port,
            remote.port,
            remote.connection_string()
        ),
        "Verify the classroom network or VPN is up".to_string(),
    ]
}

fn authentication_advice(remote: &RemoteConfig) -> Vec<String> {
    match &remote.ssh_key {
        Some(key) => vec![
            format!("Check that the SSH key exists and is mode 600: {}", key),
            format!("Verify the public key is in ~/.ssh/authorized_keys of {} on {}", remote.user, remote.host),
        ],
        None => vec![
            "Set ssh_key for this remote in the configuration".to_string(),
            "Verify your SSH agent holds a key (ssh-add -l)".to_string(),
        ],
    }
}

fn host_key_advice(remote: &RemoteConfig) -> Vec<String> {
    vec![format!(
        "Add the host to known_hosts: ssh-keyscan -p {} {} >> ~/.ssh/known_hosts",
        remote.port, remote.host
    )]
}

fn probe_advice(_: &RemoteConfig) -> Vec<String> {
    vec!["The shell answered but did not echo the probe; check the login shell and profile scripts".to_string()]
}

/// Annotates a connection failure with troubleshooting suggestions.
pub fn diagnose_ssh_error(error: &Error, remote: &RemoteConfig) -> String {
    let text = error.to_string().to_lowercase();
    let mut suggestions: Vec<String> = DIAGNOSES
        .iter()
        .filter(|d| d.needles.iter().any(|needle| text.contains(needle)))
        .flat_map(|d| (d.advice)(remote))
        .collect();

    if suggestions.is_empty() {
        suggestions.push("Verify the lab host is accessible".to_string());
        suggestions.push(format!("Test the connection manually: ssh -p {} {}", remote.port, remote.connection_string()));
    }

    let bullets: Vec<String> = suggestions.iter().map(|s| format!("• {}", s)).collect();
    format!("SSH connection failed: {}\n\nTroubleshooting suggestions:\n{}", error, bullets.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteConfig {
        RemoteConfig::new("workstation.example.com".to_string(), "student".to_string())
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_delay_doubles_each_attempt() {
        let config = RetryConfig::new(5, Duration::from_millis(1000));
        assert_eq!(config.delay_after(0), Duration::from_millis(1000));
        assert_eq!(config.delay_after(1), Duration::from_millis(2000));
        assert_eq!(config.delay_after(2), Duration::from_millis(4000));
        assert_eq!(config.delay_after(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_success_on_first_attempt() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let mut calls = 0;

        let result = retry_with_backoff(&config, "probe", |_| {
            calls += 1;
            Ok::<i32, Error>(42)
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_success_after_failures() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let mut seen = Vec::new();

        let result = retry_with_backoff(&config, "probe", |attempt| {
            seen.push(attempt);
            if attempt < 3 {
                Err(Error::Connection("temporary failure".to_string()))
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_retry_stops_after_max_attempts() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let mut calls = 0;

        let result = retry_with_backoff(&config, "probe", |_| {
            calls += 1;
            Err::<(), Error>(Error::Connection("persistent failure".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_diagnose_connection_refused() {
        let error = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let diagnosis = diagnose_ssh_error(&error, &remote());
        assert!(diagnosis.contains("• Verify the lab host 'workstation.example.com' is reachable"));
        assert!(diagnosis.contains("port 22"));
        assert!(!diagnosis.contains("authorized_keys"));
    }

    #[test]
    fn test_diagnose_authentication_failure() {
        let error = Error::Connection("authentication failed: publickey".to_string());
        let remote = remote().with_ssh_key("~/.ssh/lab_rsa".to_string());
        let diagnosis = diagnose_ssh_error(&error, &remote);
        assert!(diagnosis.contains("~/.ssh/lab_rsa"));
        assert!(diagnosis.contains("authorized_keys"));
    }

    #[test]
    fn test_diagnose_generic_error() {
        let error = Error::Connection("something odd".to_string());
        let diagnosis = diagnose_ssh_error(&error, &remote());
        assert!(diagnosis.contains("Test the connection manually"));
    }
}

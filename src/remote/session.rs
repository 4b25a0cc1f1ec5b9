//! SSH-backed command channel to a lab host.
//!
//! One `ssh2::Session` is negotiated per host and kept open; every command
//! opens its own channel on that session, so commands pay no handshake cost.
//! Every call takes a timeout and returns a [`CommandOutcome`] value.

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::remote::interactive::{DriveEnd, DriveReport, PromptDriver, PromptResponse};
use crate::remote::retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
use crate::remote::{CommandOutcome, RemoteShell, SENTINEL};
use log::{debug, info, warn};
use ssh2::Session;
use std::io::{self, ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// libssh2's LIBSSH2_ERROR_TIMEOUT
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Timeout for liveness probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds between SSH keepalive messages
const KEEPALIVE_INTERVAL: u32 = 30;

/// Terminal size requested for interactive commands (cols, rows)
const PTY_SIZE: (u32, u32) = (200, 50);

/// Longest a single blocking channel read may wait before the deadline is rechecked
const READ_SLICE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8192;

/// Output gathered from a channel and whether both streams reached end-of-file.
#[derive(Debug, Default)]
struct Drained {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    complete: bool,
}

enum Captured {
    Finished {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    TimedOut {
        stdout: String,
    },
}

enum InteractiveRun {
    Finished { transcript: String, exit_code: i32 },
    TimedOut { transcript: String },
}

/// A multiplexed SSH command channel to one lab host.
pub struct SshSession {
    config: RemoteConfig,
    retry_config: RetryConfig,
    session: Option<Session>,
}

impl SshSession {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            retry_config: RetryConfig::default(),
            session: None,
        }
    }

    pub fn with_retry_config(config: RemoteConfig, retry_config: RetryConfig) -> Self {
        Self {
            config,
            retry_config,
            session: None,
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Negotiates one SSH session (TCP, handshake, authentication).
    fn connect_once(&self) -> Result<Session> {
        debug!(
            "Attempting SSH connection to {}:{}",
            self.config.host, self.config.port
        );

        let addr_str = format!("{}:{}", self.config.host, self.config.port);
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|e| {
                Error::Connection(format!("Failed to resolve host '{}': {}", self.config.host, e))
            })?
            .next()
            .ok_or_else(|| {
                Error::Connection(format!("No addresses found for host '{}'", self.config.host))
            })?;

        let connect_timeout = Duration::from_secs(self.config.timeout);
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to connect to {}: {}", self.config.host, e),
            ))
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(connect_timeout));
        session
            .handshake()
            .map_err(|e| Error::Connection(format!("SSH handshake failed: {}", e)))?;

        self.authenticate(&mut session)?;
        session.set_keepalive(true, KEEPALIVE_INTERVAL);
        session.set_timeout(0);

        debug!("SSH connection attempt successful");
        Ok(session)
    }

    /// Authenticates with the configured key, then the agent.
    fn authenticate(&self, session: &mut Session) -> Result<()> {
        debug!("Authenticating as user: {}", self.config.user);

        if let Some(key_path) = self.config.expanded_ssh_key() {
            debug!("Attempting public key authentication with: {:?}", key_path);
            match session.userauth_pubkey_file(&self.config.user, None, &key_path, None) {
                Ok(_) => {
                    debug!("Public key authentication successful");
                    return Ok(());
                }
                Err(e) => warn!("Public key authentication failed: {}", e),
            }
        }

        debug!("Attempting agent authentication");
        match session.userauth_agent(&self.config.user) {
            Ok(_) => {
                debug!("Agent authentication successful");
                return Ok(());
            }
            Err(e) => warn!("Agent authentication failed: {}", e),
        }

        Err(Error::Connection(format!(
            "SSH authentication failed for user {}. Tried: {}, agent",
            self.config.user,
            self.config.ssh_key.as_deref().unwrap_or("no key specified")
        )))
    }

    /// Round-trips the sentinel over a fresh channel.
    fn probe(session: &Session) -> Result<()> {
        let result = Self::capture(session, &format!("echo {}", SENTINEL), PROBE_TIMEOUT);
        session.set_timeout(0);

        match result? {
            Captured::Finished { stdout, exit_code, .. } if exit_code == 0 && stdout.contains(SENTINEL) => Ok(()),
            Captured::Finished { stdout, exit_code, .. } => Err(Error::Connection(format!(
                "sentinel echo failed (exit code {}, stdout {:?})",
                exit_code,
                stdout.trim()
            ))),
            Captured::TimedOut { .. } => Err(Error::Connection(format!(
                "sentinel echo did not return within {}s",
                PROBE_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Runs one command on a new channel and collects its output.
    ///
    /// The whole run, output included, is bounded by `timeout`. A command that
    /// keeps printing past the deadline has its channel closed and is
    /// reported as [`Captured::TimedOut`].
    fn capture(session: &Session, command: &str, timeout: Duration) -> Result<Captured> {
        let deadline = Instant::now() + timeout;
        session.set_timeout(timeout_ms(timeout));
        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        session.set_timeout(timeout_ms(timeout.min(READ_SLICE)));
        let drained = {
            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            drain(&mut out, &mut err, deadline)?
        };
        let stdout = String::from_utf8_lossy(&drained.stdout).into_owned();
        if !drained.complete {
            if let Err(e) = channel.close() {
                debug!("Ignoring close error on timed-out channel: {}", e);
            }
            return Ok(Captured::TimedOut { stdout });
        }

        session.set_timeout(timeout_ms(deadline.saturating_duration_since(Instant::now())));
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;
        Ok(Captured::Finished {
            stdout,
            stderr: String::from_utf8_lossy(&drained.stderr).into_owned(),
            exit_code,
        })
    }

    fn run_interactive(
        session: &Session,
        command: &str,
        driver: &PromptDriver,
        deadline: Instant,
    ) -> Result<InteractiveRun> {
        let mut channel = session.channel_session()?;
        channel.request_pty("xterm", None, Some((PTY_SIZE.0, PTY_SIZE.1, 0, 0)))?;
        channel.exec(command)?;
        session.set_timeout(timeout_ms(deadline.saturating_duration_since(Instant::now()).min(READ_SLICE)));

        let DriveReport {
            mut transcript,
            answered,
            end,
        } = driver.drive(&mut channel, deadline)?;
        debug!("Answered {} prompt(s) for: {}", answered.len(), command);

        match end {
            DriveEnd::TimedOut => {
                let _ = channel.close();
                return Ok(InteractiveRun::TimedOut { transcript });
            }
            DriveEnd::CapReached => {
                // no more answers will be sent; let the command run out
                let _ = channel.send_eof();
                let rest = {
                    let mut out = channel.stream(0);
                    drain(&mut out, &mut io::empty(), deadline)?
                };
                transcript.push_str(&String::from_utf8_lossy(&rest.stdout));
                if !rest.complete {
                    let _ = channel.close();
                    return Ok(InteractiveRun::TimedOut { transcript });
                }
            }
            DriveEnd::EndOfOutput => {}
        }

        session.set_timeout(timeout_ms(deadline.saturating_duration_since(Instant::now())));
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;
        Ok(InteractiveRun::Finished {
            transcript,
            exit_code,
        })
    }
}

impl RemoteShell for SshSession {
    fn host(&self) -> &str {
        &self.config.host
    }

    /// Connects with retry, verifying each attempt with a sentinel echo.
    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        info!("Connecting to {}", self.config.connection_string());

        let label = format!("SSH connection to {}", self.config.connection_string());
        let result = retry_with_backoff(&self.retry_config, &label, |_| {
            let session = self.connect_once()?;
            Self::probe(&session)?;
            Ok(session)
        });

        match result {
            Ok(session) => {
                info!("Connected to {}", self.config.connection_string());
                self.session = Some(session);
                Ok(())
            }
            Err(e) => Err(Error::Connection(diagnose_ssh_error(&e, &self.config))),
        }
    }

    fn is_alive(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if !session.authenticated() {
            debug!("Health check failed: session not authenticated");
            return false;
        }
        match Self::probe(session) {
            Ok(()) => true,
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "labsim run complete", None) {
                debug!("Ignoring disconnect error: {}", e);
            }
        }
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> CommandOutcome {
        info!("[{}] $ {}", self.config.host, command);
        let Some(session) = self.session.as_ref() else {
            warn!("Refusing to run on a disconnected session: {}", command);
            return CommandOutcome::not_connected(command, &self.config.host);
        };

        let started = Instant::now();
        let result = Self::capture(session, command, timeout);
        session.set_timeout(0);
        command_outcome(command, result, started.elapsed(), timeout)
    }

    fn exec_interactive(
        &mut self,
        command: &str,
        prompts: &[PromptResponse],
        timeout: Duration,
    ) -> CommandOutcome {
        info!("[{}] $ {} (interactive, {} prompt(s))", self.config.host, command, prompts.len());
        let Some(session) = self.session.as_ref() else {
            return CommandOutcome::not_connected(command, &self.config.host);
        };

        let driver = match PromptDriver::new(prompts) {
            Ok(driver) => driver,
            Err(e) => return CommandOutcome::transport_failure(command, e.to_string(), Duration::ZERO),
        };

        let started = Instant::now();
        session.set_timeout(timeout_ms(timeout));
        let result = Self::run_interactive(session, command, &driver, started + timeout);
        session.set_timeout(0);
        let elapsed = started.elapsed();

        match result {
            Ok(InteractiveRun::Finished {
                transcript,
                exit_code,
            }) => CommandOutcome::completed(command, transcript, String::new(), exit_code, elapsed),
            Ok(InteractiveRun::TimedOut { transcript }) => {
                warn!("Interactive command timed out after {:?}: {}", elapsed, command);
                CommandOutcome::timed_out(command, transcript, elapsed, timeout)
            }
            Err(e) if is_timeout(&e) => CommandOutcome::timed_out(command, String::new(), elapsed, timeout),
            Err(e) => CommandOutcome::transport_failure(command, format!("channel failure: {}", e), elapsed),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Turns a capture result into the outcome callers see; overruns become exit code 124.
fn command_outcome(command: &str, result: Result<Captured>, elapsed: Duration, timeout: Duration) -> CommandOutcome {
    match result {
        Ok(Captured::Finished {
            stdout,
            stderr,
            exit_code,
        }) => {
            debug!("Command exit code: {}", exit_code);
            if !stdout.is_empty() {
                debug!("Command stdout: {}", stdout);
            }
            if !stderr.is_empty() {
                debug!("Command stderr: {}", stderr);
            }
            CommandOutcome::completed(command, stdout, stderr, exit_code, elapsed)
        }
        Ok(Captured::TimedOut { stdout }) => {
            warn!("Command timed out after {:?}: {}", elapsed, command);
            CommandOutcome::timed_out(command, stdout, elapsed, timeout)
        }
        Err(e) if is_timeout(&e) || elapsed >= timeout => {
            warn!("Command timed out after {:?}: {}", elapsed, command);
            CommandOutcome::timed_out(command, String::new(), elapsed, timeout)
        }
        Err(e) => {
            warn!("Channel failure running '{}': {}", command, e);
            CommandOutcome::transport_failure(command, format!("channel failure: {}", e), elapsed)
        }
    }
}

/// Reads one chunk into `buf`; false once the stream is at end-of-file.
fn pump<R: Read>(stream: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    match stream.read(&mut chunk) {
        Ok(0) => Ok(false),
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Reads stdout and stderr in turns until both reach end-of-file or
/// `deadline` passes, whichever comes first.
fn drain<O: Read, E: Read>(stdout: &mut O, stderr: &mut E, deadline: Instant) -> io::Result<Drained> {
    let mut drained = Drained::default();
    let (mut out_open, mut err_open) = (true, true);
    while out_open || err_open {
        if Instant::now() >= deadline {
            return Ok(drained);
        }
        if out_open {
            out_open = pump(stdout, &mut drained.stdout)?;
        }
        if err_open {
            err_open = pump(stderr, &mut drained.stderr)?;
        }
    }
    drained.complete = true;
    Ok(drained)
}

/// libssh2 treats a zero timeout as "wait forever", so never return zero.
fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().clamp(1, u32::MAX as u128) as u32
}

fn is_timeout(error: &Error) -> bool {
    match error {
        Error::Io(e) => e.kind() == ErrorKind::TimedOut,
        Error::Ssh(e) => matches!(e.code(), ssh2::ErrorCode::Session(code) if code == LIBSSH2_ERROR_TIMEOUT),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SshSession {
        SshSession::new(RemoteConfig::new(
            "workstation.example.com".to_string(),
            "student".to_string(),
        ))
    }

    #[test]
    fn test_disconnected_session_refuses_commands() {
        let mut shell = session();
        let outcome = shell.exec("hostname", Duration::from_secs(5));
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, crate::remote::TRANSPORT_FAILURE_EXIT_CODE);

        let prompts = vec![PromptResponse::new("Password:", "redhat")];
        let outcome = shell.exec_interactive("podman login", &prompts, Duration::from_secs(5));
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_disconnected_session_is_not_alive() {
        let mut shell = session();
        assert!(!shell.is_alive());
        assert!(!shell.is_connected());
        assert_eq!(shell.host(), "workstation.example.com");
    }

    #[test]
    fn test_timeout_ms_never_zero() {
        assert_eq!(timeout_ms(Duration::ZERO), 1);
        assert_eq!(timeout_ms(Duration::from_secs(2)), 2000);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_io_timeout_is_detected() {
        let err = Error::Io(std::io::Error::new(ErrorKind::TimedOut, "timed out"));
        assert!(is_timeout(&err));
        let err = Error::Io(std::io::Error::new(ErrorKind::BrokenPipe, "gone"));
        assert!(!is_timeout(&err));
    }

    /// Stream that never ends, like `ping` or `podman logs -f`.
    struct EndlessOutput;

    impl Read for EndlessOutput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let line = b"64 bytes from servera: icmp_seq=1\n";
            buf[..line.len()].copy_from_slice(line);
            Ok(line.len())
        }
    }

    #[test]
    fn test_drain_collects_both_streams() {
        let mut out = io::Cursor::new(b"servera\n".to_vec());
        let mut err = io::Cursor::new(b"warning: deprecated\n".to_vec());
        let drained = drain(&mut out, &mut err, Instant::now() + Duration::from_secs(5)).unwrap();
        assert!(drained.complete);
        assert_eq!(drained.stdout, b"servera\n");
        assert_eq!(drained.stderr, b"warning: deprecated\n");
    }

    #[test]
    fn test_drain_stops_endless_output_at_deadline() {
        let started = Instant::now();
        let drained = drain(
            &mut EndlessOutput,
            &mut io::empty(),
            started + Duration::from_millis(50),
        )
        .unwrap();
        assert!(!drained.complete);
        assert!(!drained.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_drain_propagates_channel_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::ConnectionReset, "reset"))
            }
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(drain(&mut Broken, &mut io::empty(), deadline).is_err());
    }

    #[test]
    fn test_overrun_maps_to_timeout_exit_code() {
        let outcome = command_outcome(
            "ping servera",
            Ok(Captured::TimedOut {
                stdout: "64 bytes from servera\n".to_string(),
            }),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, crate::remote::TIMEOUT_EXIT_CODE);
        assert!(outcome.stdout.contains("servera"));

        let outcome = command_outcome(
            "hostname",
            Ok(Captured::Finished {
                stdout: "servera\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
            Duration::from_millis(10),
            Duration::from_secs(2),
        );
        assert!(outcome.is_success());
    }

    #[test]
    fn test_expanded_ssh_key() {
        let config = RemoteConfig::new("localhost".to_string(), "test".to_string())
            .with_ssh_key("~/.ssh/id_rsa".to_string());
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.expanded_ssh_key(), Some(home.join(".ssh/id_rsa")));
        }
    }
}

//! Prompt-driven execution for commands that ask questions on a terminal.
//!
//! Prompts such as `Username:`, `Password:` or `Vault password:` may arrive in
//! any order, repeat, or not appear at all. The driver races every expected
//! prompt against end-of-output and the deadline, answers whichever matches
//! first, and stops after end-of-output or after answering three times as many
//! prompts as it was given.

use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Multiplier applied to the prompt count to bound the number of answers.
const ANSWER_CAP_FACTOR: usize = 3;

const READ_CHUNK: usize = 4096;

/// An expected prompt and the text typed in reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptResponse {
    pub prompt: String,
    pub response: String,
}

impl PromptResponse {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
        }
    }
}

/// Why a prompt-driving session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveEnd {
    EndOfOutput,
    CapReached,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct DriveReport {
    pub transcript: String,
    /// Prompts answered, in the order they were seen
    pub answered: Vec<String>,
    pub end: DriveEnd,
}

/// Answers prompts on any bidirectional stream.
pub struct PromptDriver {
    patterns: Vec<(Regex, PromptResponse)>,
}

impl PromptDriver {
    pub fn new(prompts: &[PromptResponse]) -> Result<Self> {
        let patterns = prompts
            .iter()
            .map(|p| {
                let pattern = format!("(?i){}", regex::escape(p.prompt.trim()));
                Regex::new(&pattern)
                    .map(|re| (re, p.clone()))
                    .map_err(|e| Error::Config(format!("invalid prompt '{}': {}", p.prompt, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Maximum number of answers sent before the driver gives up.
    pub fn answer_cap(&self) -> usize {
        ANSWER_CAP_FACTOR * self.patterns.len()
    }

    /// Earliest prompt match in `text`, as (match end, index into patterns).
    fn earliest_match(&self, text: &str) -> Option<(usize, usize)> {
        self.patterns
            .iter()
            .enumerate()
            .filter_map(|(idx, (re, _))| re.find(text).map(|m| (m.start(), m.end(), idx)))
            .min_by_key(|(start, _, _)| *start)
            .map(|(_, end, idx)| (end, idx))
    }

    /// Drives `stream` until end-of-output, the answer cap, or `deadline`.
    pub fn drive<S: Read + Write>(&self, stream: &mut S, deadline: Instant) -> io::Result<DriveReport> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut consumed = 0;
        let mut answered = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let cap = self.answer_cap();

        let end = loop {
            let pending = String::from_utf8_lossy(&buffer[consumed..]).into_owned();
            if let Some((match_end, idx)) = self.earliest_match(&pending) {
                let (_, reply) = &self.patterns[idx];
                debug!("Answering prompt '{}'", reply.prompt);
                stream.write_all(reply.response.as_bytes())?;
                stream.write_all(b"\n")?;
                stream.flush()?;
                // lossy decoding can widen invalid bytes, so clamp to the buffer
                consumed = (consumed + match_end).min(buffer.len());
                answered.push(reply.prompt.clone());
                if answered.len() >= cap {
                    warn!("Prompt answer cap of {} reached; stopping", cap);
                    break DriveEnd::CapReached;
                }
                continue;
            }

            if Instant::now() >= deadline {
                break DriveEnd::TimedOut;
            }

            match stream.read(&mut chunk) {
                Ok(0) => break DriveEnd::EndOfOutput,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                // a read that waited out its slice is not the overall deadline
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        };

        Ok(DriveReport {
            transcript: String::from_utf8_lossy(&buffer).into_owned(),
            answered,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Terminal that emits scripted chunks and records everything typed.
    struct ScriptedTerminal {
        chunks: VecDeque<String>,
        typed: Vec<u8>,
    }

    impl ScriptedTerminal {
        fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                typed: Vec::new(),
            }
        }

        fn typed(&self) -> String {
            String::from_utf8(self.typed.clone()).unwrap()
        }
    }

    impl Read for ScriptedTerminal {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let bytes = chunk.as_bytes();
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedTerminal {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.typed.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Terminal that repeats the same prompt forever.
    struct NaggingTerminal {
        typed: usize,
    }

    impl Read for NaggingTerminal {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let prompt = b"Password: ";
            buf[..prompt.len()].copy_from_slice(prompt);
            Ok(prompt.len())
        }
    }

    impl Write for NaggingTerminal {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.typed += 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn login_prompts() -> Vec<PromptResponse> {
        vec![
            PromptResponse::new("Username:", "admin"),
            PromptResponse::new("Password:", "redhat"),
        ]
    }

    #[test]
    fn test_answers_prompts_in_arrival_order() {
        let driver = PromptDriver::new(&login_prompts()).unwrap();
        let mut term = ScriptedTerminal::new(&["Password: ", "Username: ", "Login Succeeded!\n"]);

        let report = driver.drive(&mut term, far_deadline()).unwrap();

        assert_eq!(term.typed(), "redhat\nadmin\n");
        assert_eq!(report.answered, vec!["Password:", "Username:"]);
        assert_eq!(report.end, DriveEnd::EndOfOutput);
        assert!(report.transcript.contains("Login Succeeded!"));
    }

    #[test]
    fn test_prompts_in_single_chunk() {
        let driver = PromptDriver::new(&login_prompts()).unwrap();
        let mut term = ScriptedTerminal::new(&["Username: Password: "]);

        driver.drive(&mut term, far_deadline()).unwrap();

        assert_eq!(term.typed(), "admin\nredhat\n");
    }

    #[test]
    fn test_skipped_prompt_is_harmless() {
        let driver = PromptDriver::new(&login_prompts()).unwrap();
        let mut term = ScriptedTerminal::new(&["Password: ", "done\n"]);

        let report = driver.drive(&mut term, far_deadline()).unwrap();

        assert_eq!(term.typed(), "redhat\n");
        assert_eq!(report.end, DriveEnd::EndOfOutput);
    }

    #[test]
    fn test_repeated_prompt_hits_cap() {
        let prompts = vec![PromptResponse::new("Password:", "wrong")];
        let driver = PromptDriver::new(&prompts).unwrap();
        let mut term = NaggingTerminal { typed: 0 };

        let report = driver.drive(&mut term, far_deadline()).unwrap();

        assert_eq!(report.end, DriveEnd::CapReached);
        assert_eq!(report.answered.len(), 3);
        // response and newline are written separately
        assert_eq!(term.typed, 6);
    }

    #[test]
    fn test_past_deadline_times_out() {
        let driver = PromptDriver::new(&login_prompts()).unwrap();
        let mut term = ScriptedTerminal::new(&["still working..."]);

        let report = driver.drive(&mut term, Instant::now()).unwrap();

        assert_eq!(report.end, DriveEnd::TimedOut);
        assert!(report.answered.is_empty());
    }

    /// Terminal whose reads keep timing out, as a channel with a short read timeout does.
    struct SilentTerminal;

    impl Read for SilentTerminal {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
        }
    }

    impl Write for SilentTerminal {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_timeouts_run_until_deadline() {
        let driver = PromptDriver::new(&login_prompts()).unwrap();
        let started = Instant::now();

        let report = driver
            .drive(&mut SilentTerminal, started + Duration::from_millis(60))
            .unwrap();

        assert_eq!(report.end, DriveEnd::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_prompt_match_is_case_insensitive() {
        let prompts = vec![PromptResponse::new("Vault password:", "redhat")];
        let driver = PromptDriver::new(&prompts).unwrap();
        let mut term = ScriptedTerminal::new(&["VAULT PASSWORD: "]);

        driver.drive(&mut term, far_deadline()).unwrap();

        assert_eq!(term.typed(), "redhat\n");
    }
}

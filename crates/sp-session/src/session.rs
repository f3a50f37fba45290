use std::time::Duration;

use sp_core::config::SessionConfig;
use sp_core::sanitize::sanitize_command;
use sp_core::secret::Secret;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::prompt::{PromptDetector, PromptState};
use crate::transport::Transport;

/// Budget for the exit handshake when a session is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// SessionState / SessionOptions / Reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Available,
    InUse,
    Closed,
}

/// Device dialect a session needs to drive its own exchanges.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub line_ending: String,
    pub elevate_command: String,
    pub elevated_prompt_suffix: String,
    pub failure_markers: Vec<String>,
}

impl SessionOptions {
    /// Whether `output` contains any configured rejection marker.
    pub fn is_rejection(&self, output: &str) -> bool {
        self.failure_markers
            .iter()
            .any(|marker| !marker.is_empty() && output.contains(marker.as_str()))
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            line_ending: config.line_ending.clone(),
            elevate_command: config.elevate_command.clone(),
            elevated_prompt_suffix: config.elevated_prompt_suffix.clone(),
            failure_markers: config.failure_markers.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Output of one exchange, with the prompt that ended it trimmed off.
#[derive(Debug, Clone)]
pub struct Reply {
    pub output: Vec<u8>,
    pub prompt: PromptState,
    pub prompt_text: String,
}

impl Reply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One authenticated command channel to the device.
///
/// A session is driven by exactly one holder at a time; every exchange takes
/// `&mut self`, so interleaving is ruled out by the borrow checker rather
/// than by a lock.
pub struct Session {
    id: u64,
    transport: Box<dyn Transport>,
    detector: PromptDetector,
    options: SessionOptions,
    elevated: bool,
    use_count: u64,
    created_at: Instant,
    last_released_at: Instant,
    state: SessionState,
    /// Set while an exchange is in flight and left set if it never finished,
    /// so a dropped or failed exchange marks the session unusable.
    poisoned: bool,
}

impl Session {
    pub fn new(
        id: u64,
        transport: Box<dyn Transport>,
        detector: PromptDetector,
        options: SessionOptions,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            detector,
            options,
            elevated: false,
            use_count: 0,
            created_at: now,
            last_released_at: now,
            state: SessionState::Available,
            poisoned: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_released_at(&self) -> Instant {
        self.last_released_at
    }

    /// Time spent in the pool since the last release.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_released_at)
    }

    /// False once closed or after an exchange failed or was interrupted.
    pub fn is_usable(&self) -> bool {
        self.state != SessionState::Closed && !self.poisoned
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Handed out to a caller.
    pub fn mark_in_use(&mut self) {
        self.state = SessionState::InUse;
        self.use_count += 1;
    }

    /// Back in the pool; the elevated flag is left untouched.
    pub fn mark_available(&mut self, now: Instant) {
        self.state = SessionState::Available;
        self.last_released_at = now;
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Read until the device shows a prompt, without writing anything.
    /// Used for the login banner.
    pub async fn wait_for_prompt(&mut self, deadline: Instant) -> Result<Reply> {
        self.begin()?;
        let raw = self.read_until_prompt(deadline).await?;
        self.poisoned = false;
        Ok(self.finish(raw, None))
    }

    /// Write one line and read until the device shows any prompt.
    pub async fn exchange(&mut self, line: &str, deadline: Instant) -> Result<Reply> {
        self.exchange_line(line, Some(line), deadline).await
    }

    /// Like [`Session::exchange`] for a secret; the line is never logged.
    pub async fn write_secret(&mut self, secret: &Secret, deadline: Instant) -> Result<Reply> {
        self.exchange_line(secret.expose(), None, deadline).await
    }

    /// Run a command that must end at the ready prompt and return its output.
    ///
    /// Any error leaves the session unusable; the caller must discard it.
    pub async fn send(&mut self, command: &str, deadline: Instant) -> Result<Vec<u8>> {
        debug!(
            session_id = self.id,
            command = %sanitize_command(command),
            "sending command"
        );
        let reply = self.exchange(command, deadline).await?;
        match reply.prompt {
            PromptState::ReadyPrompt => Ok(reply.output),
            _ => {
                self.poisoned = true;
                Err(SessionError::UnexpectedPrompt(reply.prompt_text))
            }
        }
    }

    /// Privilege-escalation handshake.
    ///
    /// Sets the elevated flag only once the device shows its privileged
    /// prompt. A rejected secret is [`SessionError::AuthenticationFailed`];
    /// transport failures keep their own variants.
    pub async fn elevate(&mut self, secret: &Secret, deadline: Instant) -> Result<()> {
        debug!(session_id = self.id, "requesting privileged mode");
        let command = self.options.elevate_command.clone();
        let reply = self.exchange(&command, deadline).await?;
        if reply.prompt != PromptState::SecretPrompt {
            if reply.prompt != PromptState::ReadyPrompt {
                self.poisoned = true;
            }
            return Err(SessionError::AuthenticationFailed(format!(
                "expected a password prompt, got `{}`",
                reply.prompt_text
            )));
        }

        let reply = self.write_secret(secret, deadline).await?;
        match reply.prompt {
            PromptState::ReadyPrompt => {
                if self.options.is_rejection(&reply.text()) {
                    return Err(SessionError::AuthenticationFailed(
                        "privileged secret rejected".into(),
                    ));
                }
                if !reply
                    .prompt_text
                    .ends_with(self.options.elevated_prompt_suffix.as_str())
                {
                    return Err(SessionError::AuthenticationFailed(format!(
                        "device did not enter privileged mode (prompt `{}`)",
                        reply.prompt_text
                    )));
                }
                self.elevated = true;
                info!(session_id = self.id, "session elevated");
                Ok(())
            }
            PromptState::SecretPrompt => {
                // Asked again: the secret was wrong and the device is still
                // waiting for input.
                self.poisoned = true;
                Err(SessionError::AuthenticationFailed(
                    "privileged secret rejected".into(),
                ))
            }
            _ => {
                self.poisoned = true;
                Err(SessionError::UnexpectedPrompt(reply.prompt_text))
            }
        }
    }

    /// Log out and tear the channel down. Best-effort and idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if !self.poisoned {
            let deadline = Instant::now() + CLOSE_GRACE;
            if self.elevated {
                if let Err(e) = self.leave_privileged(deadline).await {
                    debug!(session_id = self.id, "failed to leave privileged mode: {e}");
                }
            }
            if !self.poisoned {
                let exit = format!("exit{}", self.options.line_ending);
                if let Err(e) = self.transport.write(exit.as_bytes()).await {
                    debug!(session_id = self.id, "failed to send exit: {e}");
                }
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(session_id = self.id, "failed to close transport: {e}");
        }
        self.state = SessionState::Closed;
        self.elevated = false;
        debug!(
            session_id = self.id,
            use_count = self.use_count,
            "session closed"
        );
    }

    // ----- helpers -----

    async fn leave_privileged(&mut self, deadline: Instant) -> Result<()> {
        let reply = self.exchange("exit", deadline).await?;
        if reply.prompt == PromptState::ConfirmPrompt {
            debug!(session_id = self.id, "declining to save configuration");
            self.exchange("N", deadline).await?;
        }
        self.elevated = false;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.poisoned {
            return Err(SessionError::Poisoned);
        }
        self.poisoned = true;
        self.detector.reset();
        Ok(())
    }

    async fn exchange_line(
        &mut self,
        line: &str,
        echo: Option<&str>,
        deadline: Instant,
    ) -> Result<Reply> {
        self.begin()?;
        let mut data = Vec::with_capacity(line.len() + self.options.line_ending.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(self.options.line_ending.as_bytes());
        self.transport.write(&data).await?;

        let raw = self.read_until_prompt(deadline).await?;
        self.poisoned = false;
        Ok(self.finish(raw, echo))
    }

    async fn read_until_prompt(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut buffer = Vec::new();
        loop {
            let chunk = match tokio::time::timeout_at(deadline, self.transport.read()).await {
                Err(_elapsed) => {
                    self.detector.mark_timed_out();
                    debug!(
                        session_id = self.id,
                        buffered = buffer.len(),
                        "timed out waiting for prompt"
                    );
                    return Err(SessionError::Timeout(started.elapsed()));
                }
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Ok(Ok(None)) => return Err(SessionError::Eof),
                Ok(Ok(Some(chunk))) => chunk,
            };
            buffer.extend_from_slice(&chunk);
            if self.detector.scan(&buffer).is_terminal() {
                return Ok(buffer);
            }
        }
    }

    fn finish(&self, buffer: Vec<u8>, echo: Option<&str>) -> Reply {
        let prompt_start = self.detector.prompt_start(&buffer);
        let prompt_text = self.detector.prompt_text(&buffer);
        let mut body = &buffer[..prompt_start];

        if let Some(command) = echo {
            body = strip_echo(body, command);
        }

        Reply {
            output: trim_line_breaks(body).to_vec(),
            prompt: self.detector.state(),
            prompt_text,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("elevated", &self.elevated)
            .field("use_count", &self.use_count)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Drop a first line that merely repeats the command.
fn strip_echo<'a>(body: &'a [u8], command: &str) -> &'a [u8] {
    let body = trim_leading_line_breaks(body);
    let line_end = body.iter().position(|b| *b == b'\n').unwrap_or(body.len());
    let first = String::from_utf8_lossy(&body[..line_end]);
    if !command.trim().is_empty() && first.trim() == command.trim() {
        &body[(line_end + 1).min(body.len())..]
    } else {
        body
    }
}

fn trim_leading_line_breaks(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_line_breaks(bytes: &[u8]) -> &[u8] {
    let bytes = trim_leading_line_breaks(bytes);
    let end = bytes
        .iter()
        .rposition(|b| *b != b'\r' && *b != b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_echo_removes_repeated_command() {
        let body = b"show config\r\nip lan1 address 192.168.0.1/24\r\n";
        assert_eq!(
            trim_line_breaks(strip_echo(body, "show config")),
            b"ip lan1 address 192.168.0.1/24"
        );
    }

    #[test]
    fn strip_echo_keeps_unrelated_first_line() {
        let body = b"\r\nline one\r\nline two";
        assert_eq!(strip_echo(body, "show config"), b"line one\r\nline two");
    }

    #[test]
    fn trim_line_breaks_handles_empty() {
        assert_eq!(trim_line_breaks(b"\r\n\r\n"), b"");
        assert_eq!(trim_line_breaks(b""), b"");
    }

    #[test]
    fn rejection_markers_match_substrings() {
        let options = SessionOptions::default();
        assert!(options.is_rejection("Password incorrect"));
        assert!(options.is_rejection("Invalid password"));
        assert!(!options.is_rejection("ip lan1 address"));
    }
}

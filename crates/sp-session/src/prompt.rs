use regex::Regex;

/// Bytes from the end of the buffer that are inspected on every scan.
pub const DEFAULT_WINDOW: usize = 256;

/// Idle prompt: `[RTX1210] > `, `[RTX1210] # `, `router#`.
pub const DEFAULT_READY_PATTERN: &str = r"[>#]\s*$";
/// Password request: `Password:`, `Old_Password: `, `New_Password:`.
pub const DEFAULT_SECRET_PATTERN: &str = r"(?i)(password|passphrase)\s*:\s*$";
/// Yes/no confirmation, e.g. when leaving privileged mode with unsaved changes.
pub const DEFAULT_CONFIRM_PATTERN: &str = r"(?i)\((y/n|yes/no)\)\s*:?\s*$";

// ---------------------------------------------------------------------------
// PromptState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    /// Output is still arriving; no terminator seen.
    Streaming,
    /// The device is idle and ready for the next command.
    ReadyPrompt,
    /// The device is asking for a password or other sensitive value.
    SecretPrompt,
    /// The device is asking a yes/no question.
    ConfirmPrompt,
    /// The deadline passed without a recognizable terminator.
    Unknown,
}

impl PromptState {
    /// Whether the device stopped and is waiting for input.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PromptState::ReadyPrompt | PromptState::SecretPrompt | PromptState::ConfirmPrompt
        )
    }
}

// ---------------------------------------------------------------------------
// PromptDetector
// ---------------------------------------------------------------------------

/// Scans the tail of streamed output for prompt patterns.
///
/// Prompts always sit on the last, unterminated line, so each scan only
/// looks at the final line inside a bounded trailing window. The detector
/// never modifies the buffer; [`PromptDetector::prompt_start`] tells the
/// caller where the prompt begins so it can be trimmed.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    ready: Regex,
    secret: Regex,
    confirm: Regex,
    window: usize,
    state: PromptState,
}

impl PromptDetector {
    pub fn new() -> Self {
        Self::build(
            DEFAULT_READY_PATTERN,
            DEFAULT_SECRET_PATTERN,
            DEFAULT_CONFIRM_PATTERN,
        )
        .expect("built-in prompt patterns should compile")
    }

    /// Detector with custom ready and secret patterns.
    pub fn with_patterns(ready: &str, secret: &str) -> Result<Self, regex::Error> {
        Self::build(ready, secret, DEFAULT_CONFIRM_PATTERN)
    }

    /// Detector using the configured overrides, defaulting the rest.
    pub fn from_overrides(
        ready: Option<&str>,
        secret: Option<&str>,
    ) -> Result<Self, regex::Error> {
        Self::with_patterns(
            ready.unwrap_or(DEFAULT_READY_PATTERN),
            secret.unwrap_or(DEFAULT_SECRET_PATTERN),
        )
    }

    fn build(ready: &str, secret: &str, confirm: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            ready: Regex::new(ready)?,
            secret: Regex::new(secret)?,
            confirm: Regex::new(confirm)?,
            window: DEFAULT_WINDOW,
            state: PromptState::Streaming,
        })
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn state(&self) -> PromptState {
        self.state
    }

    /// Start a new exchange.
    pub fn reset(&mut self) {
        self.state = PromptState::Streaming;
    }

    /// Record that the deadline passed without a terminator.
    pub fn mark_timed_out(&mut self) {
        self.state = PromptState::Unknown;
    }

    /// Re-evaluate the state against the whole buffer accumulated so far.
    pub fn scan(&mut self, buffer: &[u8]) -> PromptState {
        let line = String::from_utf8_lossy(&buffer[self.prompt_start(buffer)..]);
        self.state = if line.trim().is_empty() {
            PromptState::Streaming
        } else if self.secret.is_match(&line) {
            PromptState::SecretPrompt
        } else if self.confirm.is_match(&line) {
            PromptState::ConfirmPrompt
        } else if self.ready.is_match(&line) {
            PromptState::ReadyPrompt
        } else {
            PromptState::Streaming
        };
        self.state
    }

    /// Offset of the last line within the trailing window.
    pub fn prompt_start(&self, buffer: &[u8]) -> usize {
        let tail_start = buffer.len().saturating_sub(self.window);
        buffer[tail_start..]
            .iter()
            .rposition(|b| *b == b'\n' || *b == b'\r')
            .map(|pos| tail_start + pos + 1)
            .unwrap_or(tail_start)
    }

    /// The trailing prompt line, whitespace-trimmed.
    pub fn prompt_text(&self, buffer: &[u8]) -> String {
        String::from_utf8_lossy(&buffer[self.prompt_start(buffer)..])
            .trim()
            .to_string()
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

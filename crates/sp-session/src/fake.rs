//! In-memory simulated router for tests.
//!
//! [`FakeDevice`] is both the controller (fault injection, counters) and the
//! factory for [`FakeOpener`]. Every opened channel speaks a small RTX-style
//! dialect:
//!
//! ```text
//! [RTX1210] > administrator
//! Password:
//! [RTX1210] # administrator password
//! Old_Password:
//! New_Password:
//! New_Password:
//! [RTX1210] # exit
//! Save new configuration ? (Y/N)
//! ```
//!
//! ```ignore
//! let device = FakeDevice::builder()
//!     .admin_secret("s3cret")
//!     .respond("show config", "ip lan1 address 192.168.100.1/24")
//!     .latency(Duration::from_millis(50))
//!     .build();
//! let pool = SessionPool::new(PoolConfig::default(), Arc::new(device.opener()));
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sp_core::config::SessionConfig;
use sp_core::secret::Secret;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Result, SessionError};
use crate::opener::{login, SessionOpener};
use crate::prompt::PromptDetector;
use crate::session::{Session, SessionOptions};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct FakeDeviceBuilder {
    state: DeviceState,
}

impl FakeDeviceBuilder {
    pub fn new() -> Self {
        Self {
            state: DeviceState {
                hostname: "RTX1210".into(),
                login_secret: None,
                admin_secret: "admin".into(),
                ask_old_login_secret: false,
                responses: HashMap::new(),
                hang_on: Vec::new(),
                latency: Duration::ZERO,
                open_delay: Duration::ZERO,
                fail_opens: 0,
                fail_writes: 0,
                open_attempts: 0,
                opened: 0,
                closed: 0,
                received: Vec::new(),
            },
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.state.hostname = hostname.into();
        self
    }

    /// Require a password right after connecting.
    pub fn login_secret(mut self, secret: impl Into<String>) -> Self {
        self.state.login_secret = Some(secret.into());
        self
    }

    pub fn admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.state.admin_secret = secret.into();
        self
    }

    /// Make `login password` ask for the current secret first.
    pub fn ask_old_login_secret(mut self) -> Self {
        self.state.ask_old_login_secret = true;
        self
    }

    pub fn respond(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.state.responses.insert(command.into(), output.into());
        self
    }

    /// Delay before each burst of output becomes readable.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.state.latency = latency;
        self
    }

    /// Delay inside every `open` call.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.state.open_delay = delay;
        self
    }

    pub fn build(self) -> FakeDevice {
        FakeDevice {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

impl Default for FakeDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FakeDevice (controller)
// ---------------------------------------------------------------------------

struct DeviceState {
    hostname: String,
    login_secret: Option<String>,
    admin_secret: String,
    ask_old_login_secret: bool,
    responses: HashMap<String, String>,
    hang_on: Vec<String>,
    latency: Duration,
    open_delay: Duration,
    fail_opens: u32,
    fail_writes: u32,
    open_attempts: u64,
    opened: u64,
    closed: u64,
    received: Vec<String>,
}

/// Shared handle to one simulated device.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn builder() -> FakeDeviceBuilder {
        FakeDeviceBuilder::new()
    }

    /// Opener using the default session dialect.
    pub fn opener(&self) -> FakeOpener {
        self.opener_with(SessionConfig::default(), None)
    }

    pub fn opener_with(&self, config: SessionConfig, login_secret: Option<Secret>) -> FakeOpener {
        FakeOpener {
            device: self.clone(),
            options: SessionOptions::from(&config),
            config,
            login_secret,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("fake device lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// The next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().fail_opens = count;
    }

    /// The next `count` writes on any channel fail with a broken pipe.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_writes = count;
    }

    /// Commands containing `fragment` never get a reply.
    pub fn hang_on(&self, fragment: impl Into<String>) {
        self.lock().hang_on.push(fragment.into());
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn admin_secret(&self) -> String {
        self.lock().admin_secret.clone()
    }

    pub fn login_secret(&self) -> Option<String> {
        self.lock().login_secret.clone()
    }

    pub fn open_attempts(&self) -> u64 {
        self.lock().open_attempts
    }

    /// Channels successfully opened.
    pub fn opened(&self) -> u64 {
        self.lock().opened
    }

    /// Channels torn down by the client.
    pub fn closed(&self) -> u64 {
        self.lock().closed
    }

    /// Every line written by any client, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub fn received_count(&self, line: &str) -> usize {
        self.lock().received.iter().filter(|l| *l == line).count()
    }
}

// ---------------------------------------------------------------------------
// FakeOpener
// ---------------------------------------------------------------------------

pub struct FakeOpener {
    device: FakeDevice,
    config: SessionConfig,
    options: SessionOptions,
    login_secret: Option<Secret>,
}

#[async_trait]
impl SessionOpener for FakeOpener {
    async fn open(&self, id: u64) -> Result<Session> {
        let delay = {
            let mut state = self.device.lock();
            state.open_attempts += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let transport = {
            let mut state = self.device.lock();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(SessionError::Spawn("injected open failure".into()));
            }
            state.opened += 1;
            FakeTransport::connect(self.device.clone(), &state)
        };

        let mut session = Session::new(
            id,
            Box::new(transport),
            PromptDetector::new(),
            self.options.clone(),
        );
        if let Err(e) = login(&mut session, self.login_secret.as_ref(), &self.config).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecretTarget {
    Admin,
    Login,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Login,
    User,
    AwaitAdmin,
    Admin,
    ConfirmExit,
    Old(SecretTarget),
    New(SecretTarget),
    Repeat(SecretTarget, String),
}

/// One simulated channel.
pub struct FakeTransport {
    device: FakeDevice,
    mode: Mode,
    /// Unsaved configuration changes; leaving admin mode asks to save.
    dirty: bool,
    output: Vec<u8>,
    ready_at: Instant,
    ended: bool,
    closed: bool,
}

impl FakeTransport {
    fn connect(device: FakeDevice, state: &DeviceState) -> Self {
        let (mode, banner) = if state.login_secret.is_some() {
            (Mode::Login, "\r\nPassword: ".to_string())
        } else {
            (
                Mode::User,
                format!("\r\nRTX1210 Rev.14.01.42\r\n\r\n[{}] > ", state.hostname),
            )
        };
        Self {
            device,
            mode,
            dirty: false,
            output: banner.into_bytes(),
            ready_at: Instant::now() + state.latency,
            ended: false,
            closed: false,
        }
    }

    fn handle(&mut self, state: &mut DeviceState, line: &str) -> String {
        let user = format!("[{}] > ", state.hostname);
        let admin = format!("[{}] # ", state.hostname);
        let echo = format!("{line}\r\n");

        match std::mem::replace(&mut self.mode, Mode::User) {
            Mode::Login => {
                if state.login_secret.as_deref() == Some(line) {
                    format!("\r\n{user}")
                } else {
                    self.mode = Mode::Login;
                    "\r\nPassword: ".into()
                }
            }
            Mode::User => match line {
                "administrator" => {
                    self.mode = Mode::AwaitAdmin;
                    format!("{echo}Password: ")
                }
                "exit" => {
                    self.ended = true;
                    echo
                }
                _ => format!("{echo}{}{user}", response(state, line)),
            },
            Mode::AwaitAdmin => {
                if line == state.admin_secret {
                    self.mode = Mode::Admin;
                    format!("\r\n{admin}")
                } else {
                    format!("\r\nPassword incorrect.\r\n{user}")
                }
            }
            Mode::Admin => {
                self.mode = Mode::Admin;
                match line {
                    "exit" if self.dirty => {
                        self.mode = Mode::ConfirmExit;
                        format!("{echo}Save new configuration ? (Y/N)")
                    }
                    "exit" => {
                        self.mode = Mode::User;
                        format!("{echo}{user}")
                    }
                    "save" => {
                        self.dirty = false;
                        format!("{echo}Saving ... CONFIG0 Done\r\n{admin}")
                    }
                    "administrator password" => {
                        self.mode = Mode::Old(SecretTarget::Admin);
                        format!("{echo}Old_Password: ")
                    }
                    "login password" if state.ask_old_login_secret => {
                        self.mode = Mode::Old(SecretTarget::Login);
                        format!("{echo}Old_Password: ")
                    }
                    "login password" => {
                        self.mode = Mode::New(SecretTarget::Login);
                        format!("{echo}New_Password: ")
                    }
                    _ => {
                        if !line.starts_with("show") {
                            self.dirty = true;
                        }
                        format!("{echo}{}{admin}", response(state, line))
                    }
                }
            }
            Mode::ConfirmExit => {
                self.dirty = false;
                format!("{line}\r\n{user}")
            }
            Mode::Old(target) => {
                let current = match target {
                    SecretTarget::Admin => Some(state.admin_secret.as_str()),
                    SecretTarget::Login => state.login_secret.as_deref(),
                };
                if current.unwrap_or_default() == line {
                    self.mode = Mode::New(target);
                    "\r\nNew_Password: ".into()
                } else {
                    self.mode = Mode::Admin;
                    format!("\r\nPassword incorrect.\r\n{admin}")
                }
            }
            Mode::New(target) => {
                self.mode = Mode::Repeat(target, line.to_string());
                "\r\nNew_Password: ".into()
            }
            Mode::Repeat(target, candidate) => {
                self.mode = Mode::Admin;
                if candidate != line {
                    return format!("\r\nPassword change failed.\r\n{admin}");
                }
                match target {
                    SecretTarget::Admin => state.admin_secret = candidate,
                    SecretTarget::Login => state.login_secret = Some(candidate),
                }
                self.dirty = true;
                format!("\r\n{admin}")
            }
        }
    }
}

fn response(state: &DeviceState, line: &str) -> String {
    match state.responses.get(line) {
        Some(output) if !output.is_empty() => format!("{}\r\n", output.replace('\n', "\r\n")),
        _ => String::new(),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed || self.ended {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let line = String::from_utf8_lossy(data)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        let device = self.device.clone();
        let mut state = device.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        state.received.push(line.clone());
        if state.hang_on.iter().any(|fragment| line.contains(fragment.as_str())) {
            return Ok(());
        }
        let reply = self.handle(&mut state, &line);
        self.output.extend_from_slice(reply.as_bytes());
        self.ready_at = Instant::now() + state.latency;
        Ok(())
    }

    async fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.output.is_empty() {
            if self.closed || self.ended {
                return Ok(None);
            }
            std::future::pending::<()>().await;
        }
        tokio::time::sleep_until(self.ready_at).await;
        Ok(Some(std::mem::take(&mut self.output)))
    }

    async fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.device.lock().closed += 1;
        }
        Ok(())
    }
}

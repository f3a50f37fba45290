use async_trait::async_trait;
use sp_core::config::{DeviceConfig, SessionConfig};
use sp_core::sanitize::sanitize_command;
use sp_core::secret::Secret;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::prompt::{PromptDetector, PromptState};
use crate::pty::PtyTransport;
use crate::session::{Session, SessionOptions};

// ---------------------------------------------------------------------------
// SessionOpener trait
// ---------------------------------------------------------------------------

/// Creates new, logged-in sessions for the pool.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    /// Open a channel, authenticate, and return a session sitting at the
    /// ready prompt.
    async fn open(&self, id: u64) -> Result<Session>;
}

/// Bring a freshly opened session to its first ready prompt.
///
/// A login password prompt is answered once with `login_secret`; a second
/// prompt means the secret was rejected. `init_commands` run afterwards and
/// a device-side complaint about one of them is only logged.
pub async fn login(
    session: &mut Session,
    login_secret: Option<&Secret>,
    config: &SessionConfig,
) -> Result<()> {
    let deadline = Instant::now() + config.login_timeout();
    let mut reply = session.wait_for_prompt(deadline).await?;
    let mut answered = false;
    loop {
        match reply.prompt {
            PromptState::ReadyPrompt => break,
            PromptState::SecretPrompt => {
                if answered {
                    return Err(SessionError::AuthenticationFailed(
                        "login secret rejected".into(),
                    ));
                }
                let secret = login_secret.ok_or_else(|| {
                    SessionError::AuthenticationFailed(
                        "device asked for a login password but none is configured".into(),
                    )
                })?;
                answered = true;
                reply = session.write_secret(secret, deadline).await?;
            }
            _ => {
                session.poison();
                return Err(SessionError::UnexpectedPrompt(reply.prompt_text));
            }
        }
    }

    for command in &config.init_commands {
        let deadline = Instant::now() + config.timeout_for(command);
        let output = session.send(command, deadline).await?;
        let output = String::from_utf8_lossy(&output);
        if session.options().is_rejection(&output) {
            warn!(
                session_id = session.id(),
                command = %sanitize_command(command),
                "init command rejected by device, continuing"
            );
        }
    }

    debug!(session_id = session.id(), "login complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// PTY opener
// ---------------------------------------------------------------------------

/// Opens sessions by running the configured SSH client in a PTY.
pub struct PtyOpener {
    device: DeviceConfig,
    session: SessionConfig,
    login_secret: Option<Secret>,
    detector: PromptDetector,
}

impl PtyOpener {
    pub fn new(
        device: DeviceConfig,
        session: SessionConfig,
        login_secret: Option<Secret>,
    ) -> Result<Self> {
        let detector = PromptDetector::from_overrides(
            session.ready_prompt_pattern.as_deref(),
            session.secret_prompt_pattern.as_deref(),
        )?;
        Ok(Self {
            device,
            session,
            login_secret,
            detector,
        })
    }

    /// Program and arguments used to reach the device.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let mut args = vec![
            "-tt".to_string(),
            "-p".to_string(),
            self.device.port.to_string(),
        ];
        args.extend(self.device.extra_args.iter().cloned());
        args.push(self.device.destination());
        (self.device.ssh_program.clone(), args)
    }
}

#[async_trait]
impl SessionOpener for PtyOpener {
    async fn open(&self, id: u64) -> Result<Session> {
        let (program, args) = self.command_line();
        let transport = PtyTransport::spawn(&program, &args, &[("TERM", "vt100")])?;
        let mut session = Session::new(
            id,
            Box::new(transport),
            self.detector.clone(),
            SessionOptions::from(&self.session),
        );
        if let Err(e) = login(&mut session, self.login_secret.as_ref(), &self.session).await {
            session.close().await;
            return Err(e);
        }
        info!(session_id = id, host = %self.device.host, "session opened");
        Ok(session)
    }
}

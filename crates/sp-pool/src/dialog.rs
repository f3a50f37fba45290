//! Interactive secret-change exchange.
//!
//! ```text
//! Command ──► Old ──► New ──► Confirm ──► Done
//!    └────────────────►┘
//! ```
//!
//! The Old step only happens when the device asks for the current secret;
//! a device without one goes straight to the new-secret prompt.

use sp_core::sanitize::sanitize_command;
use sp_core::secret::Secret;
use sp_session::{PromptState, Reply, Session, SessionError};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogStep {
    Command,
    Old,
    New,
    Confirm,
    Done,
}

/// What to change and with which values.
#[derive(Debug, Clone, Copy)]
pub struct SecretChange<'a> {
    pub command: &'a str,
    pub current: Option<&'a Secret>,
    pub new: &'a Secret,
}

/// Drive the dialog to completion on an elevated session.
///
/// Every refusal by the device is [`SessionError::AuthenticationFailed`].
pub async fn change_secret(
    session: &mut Session,
    change: &SecretChange<'_>,
    deadline: Instant,
) -> Result<(), SessionError> {
    debug!(
        session_id = session.id(),
        command = %sanitize_command(change.command),
        "starting secret change"
    );
    let mut step = DialogStep::Command;
    let mut reply = session.exchange(change.command, deadline).await?;

    loop {
        let next = match next_step(step, &reply) {
            Ok(next) => next,
            Err(e) => {
                if !matches!(reply.prompt, PromptState::ReadyPrompt) {
                    // Still inside the dialog; the session cannot be reused.
                    session.poison();
                }
                return Err(e);
            }
        };
        debug!(session_id = session.id(), ?step, ?next, "secret dialog");
        step = next;

        if step == DialogStep::Done {
            if session.options().is_rejection(&reply.text()) {
                return Err(SessionError::AuthenticationFailed(format!(
                    "secret change rejected: {}",
                    first_line(&reply)
                )));
            }
            return Ok(());
        }

        let answer = match (step, change.current) {
            (DialogStep::Old, Some(current)) => current,
            (DialogStep::Old, None) => {
                session.poison();
                return Err(SessionError::AuthenticationFailed(
                    "device asked for the current secret but none is known".into(),
                ));
            }
            _ => change.new,
        };
        reply = session.write_secret(answer, deadline).await?;
    }
}

/// Pure transition function of the dialog.
pub fn next_step(step: DialogStep, reply: &Reply) -> Result<DialogStep, SessionError> {
    match (step, reply.prompt) {
        (DialogStep::Command, PromptState::SecretPrompt) if asks_for_old(reply) => {
            Ok(DialogStep::Old)
        }
        (DialogStep::Command, PromptState::SecretPrompt) => Ok(DialogStep::New),
        (DialogStep::Old, PromptState::SecretPrompt) if asks_for_old(reply) => Err(
            SessionError::AuthenticationFailed("current secret rejected".into()),
        ),
        (DialogStep::Old, PromptState::SecretPrompt) => Ok(DialogStep::New),
        (DialogStep::New, PromptState::SecretPrompt) => Ok(DialogStep::Confirm),
        (DialogStep::Confirm, PromptState::ReadyPrompt) => Ok(DialogStep::Done),
        (DialogStep::Confirm, PromptState::SecretPrompt) => Err(
            SessionError::AuthenticationFailed("device asked again after confirmation".into()),
        ),
        (_, PromptState::ReadyPrompt) => Err(SessionError::AuthenticationFailed(format!(
            "secret change rejected: {}",
            first_line(reply)
        ))),
        (_, _) => Err(SessionError::UnexpectedPrompt(reply.prompt_text.clone())),
    }
}

fn asks_for_old(reply: &Reply) -> bool {
    reply.prompt_text.to_ascii_lowercase().contains("old")
}

fn first_line(reply: &Reply) -> String {
    let text = reply.text();
    let line = text.lines().map(str::trim).find(|l| !l.is_empty());
    line.unwrap_or("no output").to_string()
}

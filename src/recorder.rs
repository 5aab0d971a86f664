use crate::error::AppError;
use crate::sessions::{Interaction, InteractionState, Session, Usage};
use crate::store::SessionStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete {
        response: String,
        usage: Option<Usage>,
    },
    Error {
        error: String,
        /// Text streamed before the failure.
        partial: String,
    },
}

impl Outcome {
    fn state(&self) -> InteractionState {
        match self {
            Self::Complete { .. } => InteractionState::Complete,
            Self::Error { .. } => InteractionState::Error,
        }
    }

    fn matches(&self, interaction: &Interaction) -> bool {
        match self {
            Self::Complete { response, .. } => {
                interaction.state == InteractionState::Complete
                    && interaction.response_message == *response
            }
            Self::Error { error, partial } => {
                interaction.state == InteractionState::Error
                    && interaction.error == *error
                    && interaction.response_message == *partial
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecorderError {
    #[error("interaction {interaction_id} not found in session {session_id}")]
    UnknownInteraction {
        session_id: String,
        interaction_id: String,
    },
    #[error("interaction {interaction_id} is already {state}")]
    AlreadyFinalized {
        interaction_id: String,
        state: &'static str,
    },
    #[error("failed to persist session data: {0}")]
    Store(String),
    #[error("timed out persisting interaction {0}")]
    Timeout(String),
}

impl From<RecorderError> for AppError {
    fn from(err: RecorderError) -> Self {
        AppError::internal("session_store_error", err.to_string())
    }
}

#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn SessionStore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn open_session(&self, session: &Session) -> Result<(), RecorderError> {
        self.store
            .create_session(session)
            .await
            .map_err(RecorderError::Store)
    }

    /// Appends a waiting interaction to the end of the session.
    pub async fn append_interaction(
        &self,
        session: &mut Session,
        interaction: Interaction,
    ) -> Result<(), RecorderError> {
        self.store
            .create_interaction(&interaction)
            .await
            .map_err(RecorderError::Store)?;
        session.interactions.push(interaction);
        Ok(())
    }

    /// Writes the outcome onto the interaction in place and persists it with
    /// one store call. Repeating the same outcome is a no-op; any other change
    /// to a finished interaction is refused.
    pub async fn finalize(
        &self,
        session: &mut Session,
        interaction_id: &str,
        outcome: Outcome,
    ) -> Result<Interaction, RecorderError> {
        let session_id = session.id.clone();
        let interaction = session
            .interactions
            .iter_mut()
            .find(|i| i.id == interaction_id)
            .ok_or_else(|| RecorderError::UnknownInteraction {
                session_id: session_id.clone(),
                interaction_id: interaction_id.to_string(),
            })?;

        if interaction.state.is_terminal() {
            if outcome.matches(interaction) {
                return Ok(interaction.clone());
            }
            return Err(RecorderError::AlreadyFinalized {
                interaction_id: interaction_id.to_string(),
                state: interaction.state.as_str(),
            });
        }

        let now = Utc::now();
        interaction.state = outcome.state();
        match outcome {
            Outcome::Complete { response, usage } => {
                interaction.response_message = response;
                if let Some(usage) = usage {
                    interaction.usage = usage;
                }
            }
            Outcome::Error { error, partial } => {
                interaction.error = error;
                interaction.response_message = partial;
            }
        }
        interaction.finished = true;
        interaction.updated = now;
        interaction.completed = Some(now);
        let started = interaction.scheduled.unwrap_or(interaction.created);
        interaction.duration_ms = (now - started).num_milliseconds().max(0);

        let snapshot = interaction.clone();
        match tokio::time::timeout(FINALIZE_TIMEOUT, self.store.update_interaction(&snapshot)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                tracing::error!(
                    session_id = %session_id,
                    interaction_id = %snapshot.id,
                    "failed to persist interaction: {message}"
                );
                return Err(RecorderError::Store(message));
            }
            Err(_) => return Err(RecorderError::Timeout(snapshot.id)),
        }
        tracing::debug!(
            session_id = %session_id,
            interaction_id = %snapshot.id,
            state = snapshot.state.as_str(),
            duration_ms = snapshot.duration_ms,
            "interaction finalized"
        );
        Ok(snapshot)
    }
}

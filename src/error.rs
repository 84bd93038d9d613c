//! Error taxonomy shared by the settings store, the model service client and the command
//! dispatcher.
//!
//! Every variant knows how to describe itself to a Discord user via `user_message()`.  Internal
//! detail (I/O errors, HTTP bodies) stays in the `Display` impl, which is only ever logged.

use thiserror::Error;

pub const MSG_UNAUTHORIZED: &str = "You don't have permission to use this command.";
pub const MSG_GENERIC_FAILURE: &str = "Something went wrong on my end. Please try again later.";

#[derive(Debug, Error)]
pub enum SettingsError {
    /// Bad user input.  The message is safe to show to the user.
    #[error("{0}")]
    Validation(String),

    #[error("Could not persist settings: {0}")]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model `{0}` not found")]
    ModelNotFound(String),

    #[error("Model service returned an error: {0}")]
    InferenceError(String),
}

impl ModelError {
    pub fn user_message(&self) -> String {
        match self {
            ModelError::ServiceUnavailable(_) => {
                "Sorry, I can't reach the model service right now. Please try again later."
                    .to_owned()
            }
            ModelError::ModelNotFound(name) => {
                format!("Sorry, the model `{}` could not be found.", name)
            }
            ModelError::InferenceError(_) => {
                "Sorry, the model service failed to generate a response.".to_owned()
            }
        }
    }
}

/// Failure of a `/settings` invocation
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Member lacks the required role")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    Persistence(anyhow::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<SettingsError> for CommandError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::Validation(msg) => CommandError::Validation(msg),
            SettingsError::Persistence(err) => CommandError::Persistence(err),
        }
    }
}

impl CommandError {
    pub fn user_message(&self) -> String {
        match self {
            CommandError::Unauthorized => MSG_UNAUTHORIZED.to_owned(),
            CommandError::Validation(msg) => msg.clone(),
            CommandError::Model(err) => err.user_message(),
            CommandError::Persistence(_) | CommandError::Unexpected(_) => {
                MSG_GENERIC_FAILURE.to_owned()
            }
        }
    }

    /// Whether this is a failure on our side that deserves an error-level log line, as opposed to
    /// the user simply doing something they may not.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CommandError::Persistence(_) | CommandError::Unexpected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err: CommandError = SettingsError::Validation("Model name must not be empty.".into()).into();
        assert_eq!(err.user_message(), "Model name must not be empty.");
        assert!(!err.is_internal());
    }

    #[test]
    fn persistence_failure_does_not_leak_detail() {
        let err: CommandError =
            SettingsError::Persistence(anyhow::anyhow!("disk full at /var/lib/secret")).into();
        assert_eq!(err.user_message(), MSG_GENERIC_FAILURE);
        assert!(!err.user_message().contains("/var/lib"));
        assert!(err.is_internal());
    }

    #[test]
    fn model_errors_are_apologetic() {
        let err = ModelError::ServiceUnavailable("connect timeout".into());
        assert!(err.user_message().starts_with("Sorry"));
        assert!(!err.user_message().contains("timeout"));

        let err = ModelError::ModelNotFound("nope:latest".into());
        assert_eq!(
            err.user_message(),
            "Sorry, the model `nope:latest` could not be found."
        );
    }

    #[test]
    fn unauthorized_message() {
        assert_eq!(CommandError::Unauthorized.user_message(), MSG_UNAUTHORIZED);
    }
}

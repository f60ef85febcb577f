//! Conversation state for multi-step preference changes.
//!
//! A subscriber first picks an option, then answers with a value. Cancelling
//! returns to [`DialogState::Idle`] from any state. The registry keeps one
//! state per subscriber.

use crate::types::{parse_toggle, PreferenceOption};
use crate::{RelayError, Result};

/// Where a subscriber is in the preference dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogState {
    /// No dialog in progress.
    #[default]
    Idle,
    /// Waiting for the new value of an option.
    AwaitingPreferenceValue(PreferenceOption),
}

impl DialogState {
    /// Interpret an answer. On success the dialog is over and the caller
    /// applies `(option, value)`; on failure the state is unchanged.
    pub fn answer(&self, value: &str) -> Result<(PreferenceOption, bool)> {
        match self {
            DialogState::Idle => Err(RelayError::InvalidPreference(
                "no preference change in progress".to_string(),
            )),
            DialogState::AwaitingPreferenceValue(option) => Ok((*option, parse_toggle(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_while_idle() {
        assert!(DialogState::Idle.answer("enable").is_err());
    }

    #[test]
    fn test_answer_awaiting() {
        let state = DialogState::AwaitingPreferenceValue(PreferenceOption::IncludeMedia);
        assert_eq!(
            state.answer("disable").unwrap(),
            (PreferenceOption::IncludeMedia, false)
        );
        assert!(state.answer("sideways").is_err());
    }
}

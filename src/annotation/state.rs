use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::Score;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationState {
    #[default]
    Unanalyzed,
    Computing,
    Invalid,
    PendingGuess,
    Revealed,
}

impl AnnotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationState::Unanalyzed => "unanalyzed",
            AnnotationState::Computing => "computing",
            AnnotationState::Invalid => "invalid",
            AnnotationState::PendingGuess => "pendingGuess",
            AnnotationState::Revealed => "revealed",
        }
    }

    /// No further automatic transition happens from here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnnotationState::Invalid | AnnotationState::Revealed)
    }

    /// A result is on screen (or deliberately withheld); no computation needed.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == AnnotationState::PendingGuess
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from:?} -> {to:?} for item {item_id}")]
pub struct TransitionError {
    pub item_id: String,
    pub from: AnnotationState,
    pub to: AnnotationState,
}

/// One rendered annotation instance. Racing insertion paths can create
/// several for the same `item_id`; the sweep collapses them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemAnnotation {
    pub instance_id: Uuid,
    pub item_id: String,
    pub identity_key: String,
    pub state: AnnotationState,
    pub score: Option<Score>,
    pub guess: Option<f64>,
    /// The user has typed or submitted a guess on this instance.
    pub interacted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ItemAnnotation {
    pub fn new(item_id: impl Into<String>, identity_key: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            item_id: item_id.into(),
            identity_key: identity_key.into(),
            state: AnnotationState::Unanalyzed,
            score: None,
            guess: None,
            interacted: false,
            updated_at: Utc::now(),
        }
    }

    fn transition(
        &mut self,
        allowed_from: &[AnnotationState],
        to: AnnotationState,
    ) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.state) {
            return Err(TransitionError {
                item_id: self.item_id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Entered fresh, or again from `Revealed` when the cached score went stale.
    pub fn begin_computing(&mut self) -> Result<(), TransitionError> {
        self.transition(
            &[AnnotationState::Unanalyzed, AnnotationState::Revealed],
            AnnotationState::Computing,
        )
    }

    pub fn mark_invalid(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::Computing], AnnotationState::Invalid)?;
        self.score = None;
        Ok(())
    }

    pub fn await_guess(&mut self, score: Score) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::Computing], AnnotationState::PendingGuess)?;
        self.score = Some(score);
        Ok(())
    }

    pub fn reveal(&mut self, score: Score) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::Computing], AnnotationState::Revealed)?;
        self.score = Some(score);
        Ok(())
    }

    /// Stores the user's guess, then reveals.
    pub fn submit_guess(&mut self, guess: f64) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::PendingGuess], AnnotationState::Revealed)?;
        self.guess = Some(guess);
        self.interacted = true;
        Ok(())
    }

    /// Another context revealed this item; no local guess required.
    pub fn reveal_from_remote(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::PendingGuess], AnnotationState::Revealed)
    }

    /// Estimation failed; back to square one so a later pass can retry.
    pub fn revert(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AnnotationState::Computing], AnnotationState::Unanalyzed)?;
        self.score = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score() -> Score {
        Score {
            value: 104.0,
            confidence: 72.0,
        }
    }

    #[test]
    fn guess_flow_reaches_revealed() {
        let mut annotation = ItemAnnotation::new("post-1", "@author");
        annotation.begin_computing().unwrap();
        annotation.await_guess(score()).unwrap();
        assert!(annotation.state.is_settled());
        assert!(!annotation.state.is_terminal());

        annotation.submit_guess(120.0).unwrap();
        assert_eq!(annotation.state, AnnotationState::Revealed);
        assert_eq!(annotation.guess, Some(120.0));
        assert!(annotation.interacted);
    }

    #[test]
    fn remote_reveal_needs_no_guess() {
        let mut annotation = ItemAnnotation::new("post-1", "@author");
        annotation.begin_computing().unwrap();
        annotation.await_guess(score()).unwrap();
        annotation.reveal_from_remote().unwrap();

        assert_eq!(annotation.state, AnnotationState::Revealed);
        assert_eq!(annotation.guess, None);
        assert!(!annotation.interacted);
    }

    #[test]
    fn terminal_states_reject_guesses() {
        let mut annotation = ItemAnnotation::new("post-1", "@author");
        annotation.begin_computing().unwrap();
        annotation.mark_invalid().unwrap();

        let err = annotation.submit_guess(90.0).unwrap_err();
        assert_eq!(err.from, AnnotationState::Invalid);
        assert_eq!(err.to, AnnotationState::Revealed);
        assert!(annotation.begin_computing().is_err());
    }

    #[test]
    fn failure_reverts_to_unanalyzed() {
        let mut annotation = ItemAnnotation::new("post-1", "@author");
        annotation.begin_computing().unwrap();
        annotation.revert().unwrap();

        assert_eq!(annotation.state, AnnotationState::Unanalyzed);
        annotation.begin_computing().unwrap();
    }

    #[test]
    fn revealed_can_recompute_after_content_change() {
        let mut annotation = ItemAnnotation::new("post-1", "@author");
        annotation.begin_computing().unwrap();
        annotation.reveal(score()).unwrap();

        annotation.begin_computing().unwrap();
        assert_eq!(annotation.state, AnnotationState::Computing);
    }
}

//! Onboarding state machine: per-user progress through a form.
//!
//! There is one state per step id plus an implicit terminal state. The
//! initial state is the first step of the form. Submitting a step moves to
//! its explicit `next`, else to the following step in sequence, else to the
//! terminal state. A `finish` step hands over to finalization instead.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::forms::{FormDefinition, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    InProgress,
    Completed,
}

impl OnboardingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OnboardingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stored answer payload of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub answers: Value,
    pub saved_at: DateTime<Utc>,
}

/// A user's progress through one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingProgress {
    pub form_id: String,
    pub status: OnboardingStatus,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_snapshot: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingProgress {
    pub fn is_completed(&self) -> bool {
        self.status == OnboardingStatus::Completed
    }

    pub fn has_answered(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }
}

/// What happens after a step is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move to the step with this id.
    Advance(String),
    /// The submitted step was a `finish` step: finalize onboarding.
    Finalize,
    /// No successor: the flow ended without a `finish` step.
    End,
}

impl Transition {
    pub fn next_step(&self) -> Option<&str> {
        match self {
            Self::Advance(id) => Some(id),
            Self::Finalize | Self::End => None,
        }
    }

    pub fn is_finalize(&self) -> bool {
        matches!(self, Self::Finalize)
    }
}

/// Transition taken after submitting `step` in `form`.
pub fn transition(form: &FormDefinition, step: &Step) -> Transition {
    if step.is_finish() {
        return Transition::Finalize;
    }
    match form.successor(step) {
        Some(next) => Transition::Advance(next.id.clone()),
        None => Transition::End,
    }
}

/// Where a returning user should pick the flow back up: the first step on
/// the traversal path that has no saved answer.
///
/// `None` when every step on the path is answered or the form is invalid.
pub fn resume_step<'f>(
    form: &'f FormDefinition,
    progress: Option<&OnboardingProgress>,
) -> Option<&'f Step> {
    let path = form.path().ok()?;
    path.into_iter()
        .find(|step| progress.is_none_or(|p| !p.has_answered(&step.id)))
}

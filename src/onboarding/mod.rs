//! Onboarding: a user's walk through a published form, ending in
//! finalization and the pinned AI chat.

pub mod manager;
pub mod state;

pub use manager::{OnboardingManager, OnboardingView};
pub use state::{OnboardingProgress, OnboardingStatus, StepRecord, Transition};

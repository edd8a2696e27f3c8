//! OnboardingManager: publishes forms, records step submissions and hands
//! completed onboarding over to the session resolver.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::state::{OnboardingStatus, StepRecord, Transition, resume_step, transition};
use crate::chat::{Resolved, SessionResolver};
use crate::error::{FormError, Result};
use crate::forms::{FormDefinition, is_valid_identifier, route, validate_answers};
use crate::store::Database;

/// A user's onboarding state as shown to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingView {
    pub form_id: String,
    pub status: OnboardingStatus,
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Step to show next; `None` once completed.
    pub resume_step: Option<String>,
}

pub struct OnboardingManager {
    db: Arc<dyn Database>,
    resolver: Arc<SessionResolver>,
}

impl OnboardingManager {
    pub fn new(db: Arc<dyn Database>, resolver: Arc<SessionResolver>) -> Self {
        Self { db, resolver }
    }

    /// Validate and publish `form` under `form_id`, replacing any earlier
    /// definition.
    pub async fn upsert_form(&self, form_id: &str, form: &FormDefinition) -> Result<()> {
        if !is_valid_identifier(form_id) {
            return Err(FormError::InvalidDefinition(format!("invalid form id {form_id:?}")).into());
        }
        form.validate()?;
        self.db.upsert_form(form_id, form).await?;
        info!(form_id = %form_id, version = form.version, steps = form.steps.len(), "Form published");
        Ok(())
    }

    async fn load_form(&self, form_id: &str) -> Result<FormDefinition> {
        Ok(self
            .db
            .get_form(form_id)
            .await?
            .ok_or_else(|| FormError::NotFound(form_id.to_string()))?)
    }

    /// Record `uid`'s answers to one step, route them into the user
    /// document, and report where the flow goes next.
    ///
    /// Nothing is written when the form, the step or the answers are invalid.
    pub async fn save_step(
        &self,
        uid: &str,
        form_id: &str,
        step_id: &str,
        answers: &Value,
    ) -> Result<Transition> {
        let form = self.load_form(form_id).await?;
        let step = form.step(step_id).ok_or_else(|| FormError::UnknownStep {
            form_id: form_id.to_string(),
            step_id: step_id.to_string(),
        })?;
        validate_answers(step, answers)?;

        let patch = route(step, answers);
        self.db
            .save_onboarding_step(uid, form_id, step_id, answers, Utc::now())
            .await?;
        if !patch.is_empty() {
            self.db.merge_user_doc(uid, patch.as_value()).await?;
        }

        let next = transition(&form, step);
        debug!(
            uid = %uid,
            form_id = %form_id,
            step_id = %step_id,
            routed = !patch.is_empty(),
            next = ?next,
            "Onboarding step saved"
        );
        Ok(next)
    }

    /// Complete onboarding for an existing form and resolve the user's
    /// pinned AI chat.
    pub async fn finalize(&self, uid: &str, form_id: &str) -> Result<Resolved> {
        self.load_form(form_id).await?;
        self.resolver.finalize_onboarding(uid, form_id).await
    }

    pub async fn view(&self, uid: &str, form_id: &str) -> Result<OnboardingView> {
        let form = self.load_form(form_id).await?;
        let progress = self.db.get_onboarding_progress(uid, form_id).await?;

        let view = match progress {
            Some(progress) => OnboardingView {
                resume_step: if progress.is_completed() {
                    None
                } else {
                    resume_step(&form, Some(&progress)).map(|s| s.id.clone())
                },
                form_id: progress.form_id,
                status: progress.status,
                steps: progress.steps,
                completed_at: progress.completed_at,
            },
            None => OnboardingView {
                form_id: form_id.to_string(),
                status: OnboardingStatus::InProgress,
                steps: BTreeMap::new(),
                completed_at: None,
                resume_step: resume_step(&form, None).map(|s| s.id.clone()),
            },
        };
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chat::SessionKind;
    use crate::error::Error;
    use crate::persona::StrictConfigCache;
    use crate::store::LibSqlBackend;
    use crate::users::UserDocument;

    async fn manager() -> (Arc<LibSqlBackend>, OnboardingManager) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let prompts = Arc::new(StrictConfigCache::new(db.clone()));
        let resolver = Arc::new(SessionResolver::new(db.clone(), prompts));
        (db.clone(), OnboardingManager::new(db, resolver))
    }

    fn form() -> FormDefinition {
        serde_json::from_value(json!({
            "version": 1,
            "title": "Welcome",
            "steps": [
                {"id": "intro", "type": "intro"},
                {"id": "choiceA", "type": "choice", "required": true,
                 "options": [{"value": "18-24", "label": "18-24"}, {"value": "25-34", "label": "25-34"}],
                 "writeTo": "profile.age_bracket"},
                {"id": "finish", "type": "finish"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn full_flow_routes_answers_and_completes() {
        let (db, manager) = manager().await;
        manager.upsert_form("onboarding", &form()).await.unwrap();

        assert_eq!(
            manager.save_step("u1", "onboarding", "intro", &json!({})).await.unwrap(),
            Transition::Advance("choiceA".to_string())
        );
        assert_eq!(
            manager
                .save_step("u1", "onboarding", "choiceA", &json!({"choiceA": "18-24"}))
                .await
                .unwrap(),
            Transition::Advance("finish".to_string())
        );
        assert_eq!(
            manager.save_step("u1", "onboarding", "finish", &json!({})).await.unwrap(),
            Transition::Finalize
        );
        let resolved = manager.finalize("u1", "onboarding").await.unwrap();

        let user = UserDocument::new("u1", db.get_user_doc("u1").await.unwrap());
        assert_eq!(user.profile()["age_bracket"], "18-24");
        assert_eq!(user.pinned_chat_id(), Some(resolved.chat_id.as_str()));

        let view = manager.view("u1", "onboarding").await.unwrap();
        assert_eq!(view.status, OnboardingStatus::Completed);
        assert!(view.resume_step.is_none());
        assert!(view.completed_at.is_some());

        let sessions = db
            .list_sessions_for("user:u1", Some(SessionKind::UserAi), 10)
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn resubmitting_a_step_overwrites_only_that_step() {
        let (db, manager) = manager().await;
        manager.upsert_form("f", &form()).await.unwrap();
        manager.save_step("u1", "f", "intro", &json!({"seen": true})).await.unwrap();
        manager.save_step("u1", "f", "choiceA", &json!({"choiceA": "18-24"})).await.unwrap();
        manager.save_step("u1", "f", "choiceA", &json!({"choiceA": "25-34"})).await.unwrap();

        let progress = db.get_onboarding_progress("u1", "f").await.unwrap().unwrap();
        assert_eq!(progress.steps["intro"].answers, json!({"seen": true}));
        assert_eq!(progress.steps["choiceA"].answers, json!({"choiceA": "25-34"}));
        let user = UserDocument::new("u1", db.get_user_doc("u1").await.unwrap());
        assert_eq!(user.profile()["age_bracket"], "25-34");
    }

    #[tokio::test]
    async fn invalid_submissions_write_nothing() {
        let (db, manager) = manager().await;
        manager.upsert_form("f", &form()).await.unwrap();

        assert!(matches!(
            manager.save_step("u1", "missing", "intro", &json!({})).await,
            Err(Error::Form(FormError::NotFound(_)))
        ));
        assert!(matches!(
            manager.save_step("u1", "f", "nope", &json!({})).await,
            Err(Error::Form(FormError::UnknownStep { .. }))
        ));
        assert!(matches!(
            manager.save_step("u1", "f", "choiceA", &json!({})).await,
            Err(Error::Form(FormError::MissingAnswer(_)))
        ));
        assert!(matches!(
            manager.save_step("u1", "f", "choiceA", &json!({"choiceA": "99+"})).await,
            Err(Error::Form(FormError::InvalidAnswer { .. }))
        ));
        assert!(db.get_onboarding_progress("u1", "f").await.unwrap().is_none());
        assert!(db.get_user_doc("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn view_without_progress_starts_at_first_step() {
        let (_db, manager) = manager().await;
        manager.upsert_form("f", &form()).await.unwrap();
        let view = manager.view("u1", "f").await.unwrap();
        assert_eq!(view.status, OnboardingStatus::InProgress);
        assert_eq!(view.resume_step.as_deref(), Some("intro"));
    }

    #[tokio::test]
    async fn rejects_bad_form_ids_and_definitions() {
        let (_db, manager) = manager().await;
        assert!(manager.upsert_form("../etc", &form()).await.is_err());

        let dangling: FormDefinition = serde_json::from_value(json!({
            "version": 1, "title": "t",
            "steps": [{"id": "a", "type": "intro", "next": "ghost"}]
        }))
        .unwrap();
        assert!(matches!(
            manager.upsert_form("f", &dangling).await,
            Err(Error::Form(FormError::DanglingNext { .. }))
        ));
        assert!(matches!(
            manager.finalize("u1", "f").await,
            Err(Error::Form(FormError::NotFound(_)))
        ));
    }
}

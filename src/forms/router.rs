//! Answer router: turns a step's `writeTo` rules and a submitted answer
//! payload into a patch for the user document.

use serde_json::Value;
use tracing::debug;

use super::model::Step;
use super::rules::WriteRule;
use crate::document::Patch;

/// Compute the user-document patch for one step submission.
///
/// Pure: the result depends only on `step` and `answers`. Rules whose source
/// is undefined contribute nothing. Rules are applied in declaration order,
/// so a later rule targeting the same path wins.
pub fn route(step: &Step, answers: &Value) -> Patch {
    let mut patch = Patch::new();

    for rule in &step.write_to {
        let value = match rule {
            WriteRule::StepAnswer { .. } => answers.get(&step.id),
            WriteRule::Mapped { from, .. } => from.resolve(answers),
        };

        match value {
            Some(value) => patch.set(rule.destination(), value.clone()),
            None => debug!(
                step_id = %step.id,
                destination = %rule.destination(),
                "writeTo source undefined, skipping"
            ),
        }
    }

    patch
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn step(write_to: Value) -> Step {
        serde_json::from_value(json!({
            "id": "choiceA",
            "type": "choice",
            "writeTo": write_to,
        }))
        .unwrap()
    }

    #[test]
    fn bare_rule_copies_answer_keyed_by_step_id() {
        let patch = route(&step(json!("profile.age_bracket")), &json!({"choiceA": "18-24"}));
        assert_eq!(patch.into_value(), json!({"profile": {"age_bracket": "18-24"}}));
    }

    #[test]
    fn undefined_sources_are_skipped() {
        let s = step(json!(["profile.age_bracket", {"from": "answers.missing", "to": "profile.x"}]));
        let patch = route(&s, &json!({"other": 1}));
        assert!(patch.is_empty());
    }

    #[test]
    fn explicit_null_is_written() {
        let patch = route(&step(json!("profile.age_bracket")), &json!({"choiceA": null}));
        assert_eq!(patch.into_value(), json!({"profile": {"age_bracket": null}}));
    }

    #[test]
    fn mapped_rules_resolve_prefixed_and_direct_paths() {
        let s = step(json!([
            {"from": "answers.location.city", "to": "profile.city"},
            {"from": "location.country", "to": "profile.country"},
            {"to": "raw.choiceA"},
            {"from": "answers", "to": "raw.copy"}
        ]));
        let answers = json!({"location": {"city": "Taipei", "country": "TW"}});
        let patch = route(&s, &answers).into_value();

        assert_eq!(patch["profile"], json!({"city": "Taipei", "country": "TW"}));
        assert_eq!(patch["raw"]["choiceA"], answers);
        assert_eq!(patch["raw"]["copy"], answers);
    }

    #[test]
    fn later_rule_wins_on_same_destination() {
        let s = step(json!([
            {"from": "a", "to": "profile.v"},
            {"from": "b", "to": "profile.v"}
        ]));
        let patch = route(&s, &json!({"a": 1, "b": 2}));
        assert_eq!(patch.into_value(), json!({"profile": {"v": 2}}));
    }

    #[test]
    fn routing_is_deterministic() {
        let s = step(json!(["profile.a", {"from": "x.y", "to": "profile.b.c"}]));
        let answers = json!({"choiceA": [1, 2], "x": {"y": "z"}});
        let first = route(&s, &answers);
        let _unrelated = route(&step(json!("other.path")), &json!({"choiceA": 9}));
        let second = route(&s, &answers);
        assert_eq!(first, second);
    }

    #[test]
    fn step_without_rules_yields_empty_patch() {
        let s: Step = serde_json::from_value(json!({"id": "hi", "type": "intro"})).unwrap();
        assert!(route(&s, &json!({"hi": true})).is_empty());
    }
}

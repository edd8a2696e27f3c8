//! Onboarding form definitions and answer routing.
//!
//! A form is a published, immutable list of typed steps. Each step may carry
//! `writeTo` rules that copy parts of the submitted answers into the user
//! document. Routing is a pure function of the step and the answers.

pub mod answers;
pub mod model;
pub mod router;
pub mod rules;

pub use answers::validate_answers;
pub use model::{ChoiceOption, FormDefinition, Step, StepKind, Validation};
pub use router::route;
pub use rules::{AnswerSource, WriteRule};

use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]{0,63}$").expect("identifier pattern is valid")
});

/// Whether `id` is usable as a form or step identifier.
pub fn is_valid_identifier(id: &str) -> bool {
    IDENTIFIER.is_match(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("onboarding_v1"));
        assert!(is_valid_identifier("choice-A"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("_hidden"));
        assert!(!is_valid_identifier("forms/../x"));
        assert!(!is_valid_identifier(&"x".repeat(65)));
    }
}

//! Declarative onboarding form definitions.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

use super::rules::WriteRule;
use crate::error::FormError;

/// A published onboarding form: an ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormDefinition {
    pub version: u32,
    pub title: String,
    #[serde(default)]
    pub locales: Vec<String>,
    pub steps: Vec<Step>,
}

/// One screen of the onboarding flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    /// Explicit successor. Falls back to the next step in sequence when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Routing rules from this step's answers into the user document.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub write_to: Vec<WriteRule>,
}

/// Step variants. Each carries only the fields it renders or validates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    Intro,
    Choice {
        #[serde(default)]
        options: Vec<ChoiceOption>,
    },
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<Validation>,
    },
    Textarea {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<Validation>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<Validation>,
    },
    Upload,
    Finish,
    SingleSelect {
        #[serde(default)]
        options: Vec<ChoiceOption>,
    },
    MultiSelect {
        #[serde(default)]
        options: Vec<ChoiceOption>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<Validation>,
    },
}

impl StepKind {
    /// Wire name of the variant, as it appears in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Choice { .. } => "choice",
            Self::Text { .. } => "text",
            Self::Textarea { .. } => "textarea",
            Self::Number { .. } => "number",
            Self::Upload => "upload",
            Self::Finish => "finish",
            Self::SingleSelect { .. } => "single-select",
            Self::MultiSelect { .. } => "multi-select",
        }
    }
}

/// A selectable option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChoiceOption {
    pub value: String,
    #[serde(default)]
    pub label: String,
}

/// Numeric bounds. Interpreted per step kind: characters for text input,
/// the value itself for numbers, the selection count for multi-select.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Validation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Step {
    /// Heading shown for the step: the question if any, else the title.
    pub fn display_title(&self) -> &str {
        self.question
            .as_deref()
            .or(self.title.as_deref())
            .unwrap_or_default()
    }

    pub fn is_finish(&self) -> bool {
        matches!(self.kind, StepKind::Finish)
    }

    pub fn options(&self) -> &[ChoiceOption] {
        match &self.kind {
            StepKind::Choice { options }
            | StepKind::SingleSelect { options }
            | StepKind::MultiSelect { options, .. } => options,
            _ => &[],
        }
    }
}

impl FormDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The initial state of the flow.
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// Successor of `step`: its explicit `next`, else the following step in
    /// sequence. `None` means the flow is over.
    pub fn successor(&self, step: &Step) -> Option<&Step> {
        match &step.next {
            Some(next) => self.step(next),
            None => {
                let index = self.steps.iter().position(|s| s.id == step.id)?;
                self.steps.get(index + 1)
            }
        }
    }

    /// The steps visited when following successors from the first step,
    /// stopping at a `finish` step or at the end of the flow.
    pub fn path(&self) -> Result<Vec<&Step>, FormError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let mut current = self.first_step();

        while let Some(step) = current {
            if !visited.insert(step.id.as_str()) {
                return Err(FormError::Loop(step.id.clone()));
            }
            path.push(step);
            if step.is_finish() {
                break;
            }
            current = self.successor(step);
        }
        Ok(path)
    }

    /// Check the structural invariants of a definition before publishing it.
    pub fn validate(&self) -> Result<(), FormError> {
        if self.steps.is_empty() {
            return Err(FormError::InvalidDefinition(
                "form has no steps".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(FormError::InvalidDefinition(
                    "step id must not be empty".to_string(),
                ));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(FormError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &self.steps {
            if let Some(next) = &step.next {
                if !ids.contains(next.as_str()) {
                    return Err(FormError::DanglingNext {
                        step: step.id.clone(),
                        next: next.clone(),
                    });
                }
            }
        }

        self.path().map(|_| ())
    }
}

/// Accept either a single rule or a list of rules.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<WriteRule>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<WriteRule>),
        One(WriteRule),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::Many(rules)) => rules,
        Some(OneOrMany::One(rule)) => vec![rule],
        None => Vec::new(),
    })
}

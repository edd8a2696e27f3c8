//! `writeTo` routing rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::FieldPath;
use crate::error::FormError;

/// Where a mapped rule reads its value from inside the answer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerSource {
    /// The whole answer payload.
    All,
    /// A path inside the payload.
    Path(FieldPath),
}

impl AnswerSource {
    /// Interpret a raw `from` value. Absent and `"answers"` select the whole
    /// payload; an `answers.` prefix is stripped; anything else is a path
    /// inside the payload.
    pub fn parse(raw: Option<&str>) -> Result<Self, FormError> {
        match raw.map(str::trim) {
            None | Some("") | Some("answers") => Ok(Self::All),
            Some(raw) => {
                let path = FieldPath::parse(raw)?;
                Ok(Self::Path(path.strip_head("answers").unwrap_or(path)))
            }
        }
    }

    pub fn resolve<'a>(&self, answers: &'a Value) -> Option<&'a Value> {
        match self {
            Self::All => Some(answers),
            Self::Path(path) => path.resolve(answers),
        }
    }

    fn to_raw(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::Path(path) => Some(format!("answers.{path}")),
        }
    }
}

/// One routing rule from a step's answers into the user document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub enum WriteRule {
    /// Bare destination: receives the answer keyed by the step id.
    StepAnswer { to: FieldPath },
    /// Explicit `{from, to}` mapping.
    Mapped { from: AnswerSource, to: FieldPath },
}

impl WriteRule {
    pub fn destination(&self) -> &FieldPath {
        match self {
            Self::StepAnswer { to } | Self::Mapped { to, .. } => to,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRule {
    Path(String),
    Mapping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
    },
}

impl TryFrom<RawRule> for WriteRule {
    type Error = FormError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        match raw {
            RawRule::Path(to) => Ok(Self::StepAnswer {
                to: FieldPath::parse(&to)?,
            }),
            RawRule::Mapping { from, to } => Ok(Self::Mapped {
                from: AnswerSource::parse(from.as_deref())?,
                to: FieldPath::parse(&to)?,
            }),
        }
    }
}

impl From<WriteRule> for RawRule {
    fn from(rule: WriteRule) -> Self {
        match rule {
            WriteRule::StepAnswer { to } => RawRule::Path(to.to_string()),
            WriteRule::Mapped { from, to } => RawRule::Mapping {
                from: from.to_raw(),
                to: to.to_string(),
            },
        }
    }
}

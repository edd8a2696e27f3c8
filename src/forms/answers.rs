//! Server-side validation of a step's answer payload.

use serde_json::Value;

use super::model::{ChoiceOption, Step, StepKind, Validation};
use crate::error::FormError;

/// Validate `answers` for `step`.
///
/// The payload must be a JSON object. The step's own answer lives under its
/// id; other keys are free-form and only reachable through mapped `writeTo`
/// rules, so they are not checked here.
pub fn validate_answers(step: &Step, answers: &Value) -> Result<(), FormError> {
    let Some(map) = answers.as_object() else {
        return Err(invalid(step, "answers must be an object"));
    };

    let given = map.get(&step.id);
    let Some(answer) = given.filter(|v| !is_blank(v)) else {
        if step.required {
            return Err(FormError::MissingAnswer(step.id.clone()));
        }
        // An explicit empty selection still has to satisfy the minimum.
        if let (Some(Value::Array(_)), StepKind::MultiSelect { validation, .. }) =
            (given, &step.kind)
        {
            return check_bounds(step, validation, 0.0, "selections");
        }
        return Ok(());
    };

    match &step.kind {
        StepKind::Intro | StepKind::Upload | StepKind::Finish => Ok(()),
        StepKind::Choice { options } | StepKind::SingleSelect { options } => {
            let value = answer
                .as_str()
                .ok_or_else(|| invalid(step, "expected a single option value"))?;
            check_option(step, options, value)
        }
        StepKind::MultiSelect {
            options,
            validation,
        } => {
            let items = answer
                .as_array()
                .ok_or_else(|| invalid(step, "expected a list of option values"))?;
            for item in items {
                let value = item
                    .as_str()
                    .ok_or_else(|| invalid(step, "option values must be strings"))?;
                check_option(step, options, value)?;
            }
            check_bounds(step, validation, items.len() as f64, "selections")
        }
        StepKind::Text { validation, .. } | StepKind::Textarea { validation, .. } => {
            let text = answer
                .as_str()
                .ok_or_else(|| invalid(step, "expected text"))?;
            check_bounds(step, validation, text.trim().chars().count() as f64, "characters")
        }
        StepKind::Number { validation, .. } => {
            let number = match answer {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|n| n.is_finite())
            .ok_or_else(|| invalid(step, "expected a number"))?;
            check_bounds(step, validation, number, "value")
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn check_option(step: &Step, options: &[ChoiceOption], value: &str) -> Result<(), FormError> {
    if options.is_empty() || options.iter().any(|o| o.value == value) {
        Ok(())
    } else {
        Err(invalid(step, &format!("{value:?} is not one of the options")))
    }
}

fn check_bounds(
    step: &Step,
    validation: &Option<Validation>,
    measured: f64,
    unit: &str,
) -> Result<(), FormError> {
    let Some(validation) = validation else {
        return Ok(());
    };
    if let Some(min) = validation.min {
        if measured < min {
            return Err(invalid(step, &format!("at least {min} {unit} required")));
        }
    }
    if let Some(max) = validation.max {
        if measured > max {
            return Err(invalid(step, &format!("at most {max} {unit} allowed")));
        }
    }
    Ok(())
}

fn invalid(step: &Step, reason: &str) -> FormError {
    FormError::InvalidAnswer {
        step: step.id.clone(),
        reason: reason.to_string(),
    }
}

//! Decoding of role output into a [`RoleUpdate`].
//!
//! Raw text goes through the tolerant parser, is validated against the
//! `role_update` JSON schema, then deserialized.

use jsonschema::Draft;
use serde_json::Value;
use thiserror::Error;

use crate::core::state::RoleUpdate;
use crate::core::tolerant_json::{self, ParseFailure};

const ROLE_UPDATE_SCHEMA: &str = include_str!("../../schemas/role_update.schema.json");

#[derive(Debug, Error)]
pub enum RoleOutputError {
    #[error("role output could not be parsed ({0})")]
    Parse(#[from] ParseFailure),
    #[error("role output failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("role output has unexpected shape: {0}")]
    Shape(String),
}

/// Parse, validate and deserialize role output.
pub fn parse_role_update(raw: &str) -> Result<RoleUpdate, RoleOutputError> {
    let mut value = tolerant_json::parse(raw)?;
    normalize_next(&mut value);
    validate_role_update(&value)?;
    serde_json::from_value(value).map_err(|err| RoleOutputError::Shape(err.to_string()))
}

/// Lower-case and trim the routing directive so `"Coder "` routes like `"coder"`.
fn normalize_next(value: &mut Value) {
    if let Some(next) = value.get_mut("next")
        && let Some(text) = next.as_str()
    {
        *next = Value::String(text.trim().to_ascii_lowercase());
    }
}

pub fn validate_role_update(instance: &Value) -> Result<(), RoleOutputError> {
    let schema: Value = serde_json::from_str(ROLE_UPDATE_SCHEMA)
        .map_err(|err| RoleOutputError::Schema(vec![format!("parse schema: {err}")]))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| RoleOutputError::Schema(vec![format!("compile schema: {err}")]))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(RoleOutputError::Schema(messages));
    }
    Ok(())
}

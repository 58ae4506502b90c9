//! Tagged request envelope.
//!
//! Platform-invoked calls arrive wrapped: the typed request sits under
//! `FunctionArgument` next to the caller's entity profile and title auth
//! context. Local callers post the bare request. The wrapper is detected
//! structurally by the presence of the `FunctionArgument` member and each
//! shape takes its own typed parse path.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Boundary failures resolved before the pipeline runs. Deterministic for a
/// given body; never retried.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },
    #[error("missing entity authorization")]
    MissingAuth,
}

impl ServiceError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
        }
    }
}

/// Platform wrapper around the typed request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionEnvelope {
    pub function_argument: Value,
    #[serde(default)]
    pub caller_entity_profile: Option<CallerEntityProfile>,
    #[serde(default)]
    pub title_authentication_context: Option<TitleAuthenticationContext>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerEntityProfile {
    #[serde(default)]
    pub lineage: Option<Lineage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Lineage {
    #[serde(default)]
    pub title_player_account_id: Option<String>,
    #[serde(default)]
    pub master_player_account_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleAuthenticationContext {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub entity_token: Option<String>,
}

/// Caller identity extracted from the envelope, when complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub player_id: String,
    pub entity_token: String,
}

/// A decoded request plus whatever identity the envelope carried.
#[derive(Debug, Clone)]
pub struct ParsedRequest<T> {
    pub request: T,
    pub caller: Option<CallerIdentity>,
}

/// Decode a request body, accepting either the platform envelope or the
/// bare request shape.
///
/// # Errors
///
/// Returns [`ServiceError::MalformedRequest`] when the body is not JSON or
/// neither shape decodes into `T`.
pub fn parse_request<T: DeserializeOwned>(body: &str) -> Result<ParsedRequest<T>, ServiceError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| ServiceError::malformed(format!("invalid json: {error}")))?;

    if value.get("FunctionArgument").is_some() {
        let envelope: FunctionEnvelope = serde_json::from_value(value)
            .map_err(|error| ServiceError::malformed(format!("invalid envelope: {error}")))?;
        let caller = extract_identity(&envelope);
        let request: T = serde_json::from_value(envelope.function_argument)
            .map_err(|error| ServiceError::malformed(format!("invalid argument: {error}")))?;
        if caller.is_none() {
            log::warn!("envelope carried no complete caller identity");
        }
        Ok(ParsedRequest { request, caller })
    } else {
        let request: T = serde_json::from_value(value)
            .map_err(|error| ServiceError::malformed(format!("invalid request: {error}")))?;
        Ok(ParsedRequest {
            request,
            caller: None,
        })
    }
}

fn extract_identity(envelope: &FunctionEnvelope) -> Option<CallerIdentity> {
    let player_id = envelope
        .caller_entity_profile
        .as_ref()?
        .lineage
        .as_ref()?
        .title_player_account_id
        .clone()?;
    let entity_token = envelope
        .title_authentication_context
        .as_ref()?
        .entity_token
        .clone()?;
    Some(CallerIdentity {
        player_id,
        entity_token,
    })
}

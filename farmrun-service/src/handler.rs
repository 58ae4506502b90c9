//! Handlers wiring wire DTOs to the core pipeline.
//!
//! Transport adapters hand these functions a raw body string and (for
//! end-run) a dispatch budget; every outcome maps to a response object so
//! callers always receive a well-formed `{ok, ...}` body.

use farmrun_core::{
    DispatchBudget, EndRunError, LedgerAuth, LedgerClient, RunPipeline, SessionStore,
};

use crate::dto::{
    EndRunRequest, EndRunResponse, RewardItemDto, StartRunRequest, StartRunResponse,
};
use crate::envelope::{ParsedRequest, ServiceError, parse_request};

/// Handle a start-run call.
///
/// Never fails from the transport's point of view; store outages and
/// malformed bodies come back as `{ok:false, message}`.
pub fn handle_start_run<S: SessionStore, L: LedgerClient>(
    pipeline: &RunPipeline<S, L>,
    body: &str,
) -> StartRunResponse {
    let parsed: ParsedRequest<StartRunRequest> = match parse_request(body) {
        Ok(parsed) => parsed,
        Err(error) => return start_failure(error.to_string()),
    };

    match pipeline.start_run(parsed.request.dungeon_id) {
        Ok(session) => StartRunResponse {
            ok: true,
            run_id: Some(session.run_id),
            seed: session.seed,
            server_time: session.started_at.timestamp_millis(),
            message: None,
            dungeon_id: Some(session.dungeon_id),
            run_duration_sec: session.duration_sec,
        },
        Err(error) => start_failure(error.to_string()),
    }
}

/// Handle an end-run call.
///
/// The entity auth comes from the envelope's caller identity when present,
/// otherwise from `fallback_auth` (local testing). The reward list in a
/// failure response is the full computed set; `applied_count` says how much
/// of it actually landed.
pub fn handle_end_run<S: SessionStore, L: LedgerClient>(
    pipeline: &RunPipeline<S, L>,
    body: &str,
    fallback_auth: Option<&LedgerAuth>,
    budget: &DispatchBudget,
) -> EndRunResponse {
    let parsed: ParsedRequest<EndRunRequest> = match parse_request(body) {
        Ok(parsed) => parsed,
        Err(error) => return end_failure(error.to_string()),
    };
    if parsed.request.run_id.trim().is_empty() {
        return end_failure(
            ServiceError::MalformedRequest {
                reason: "runId is required".to_string(),
            }
            .to_string(),
        );
    }

    let auth = match parsed
        .caller
        .as_ref()
        .map(|caller| LedgerAuth::new(caller.player_id.clone(), caller.entity_token.clone()))
        .or_else(|| fallback_auth.cloned())
    {
        Some(auth) => auth,
        None => return end_failure(ServiceError::MissingAuth.to_string()),
    };

    let request = farmrun_core::EndRunRequest {
        run_id: parsed.request.run_id,
        success: parsed.request.success,
        clear_time_sec: parsed.request.clear_time_sec,
        looted_items: parsed
            .request
            .looted_items
            .into_iter()
            .map(Into::into)
            .collect(),
    };

    match pipeline.end_run(&request, &auth, budget) {
        Ok(outcome) => EndRunResponse {
            ok: true,
            message: Some(if outcome.success {
                "Dungeon cleared!".to_string()
            } else {
                "Dungeon failed".to_string()
            }),
            applied_count: outcome.applied_ops,
            rewards: outcome.rewards.into_iter().map(RewardItemDto::from).collect(),
        },
        Err(EndRunError::GrantIncomplete {
            rewards,
            applied_ops,
            outcome,
        }) => EndRunResponse {
            ok: false,
            message: Some(format!(
                "reward grant incomplete ({applied_ops} operations applied): {outcome:?}"
            )),
            applied_count: applied_ops,
            rewards: rewards.into_iter().map(RewardItemDto::from).collect(),
        },
        Err(error) => end_failure(error.to_string()),
    }
}

fn start_failure(message: String) -> StartRunResponse {
    log::warn!("start-run rejected: {message}");
    StartRunResponse {
        ok: false,
        message: Some(message),
        ..StartRunResponse::default()
    }
}

fn end_failure(message: String) -> EndRunResponse {
    log::warn!("end-run rejected: {message}");
    EndRunResponse {
        ok: false,
        message: Some(message),
        ..EndRunResponse::default()
    }
}

//! Farmrun Service
//!
//! Transport-agnostic caller contract for the Farmrun backend: wire DTOs,
//! the tagged platform request envelope, and handler functions that drive
//! the core pipeline. An HTTP (or any other) adapter only needs to hand
//! these handlers a body string and serialize the response they return.

pub mod dto;
pub mod envelope;
pub mod handler;

pub use dto::{
    EndRunRequest, EndRunResponse, LootedItemDto, RewardItemDto, StartRunRequest, StartRunResponse,
};
pub use envelope::{
    CallerIdentity, FunctionEnvelope, ParsedRequest, ServiceError, parse_request,
};
pub use handler::{handle_end_run, handle_start_run};

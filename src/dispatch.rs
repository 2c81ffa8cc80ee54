//! Outbound job dispatch: webhook calls and GitHub workflow dispatches.

pub mod client;
pub mod executor;

pub use client::{build_http_client, HTTP_TIMEOUT};
pub use executor::{
    execute_job, trigger_job_manually, DispatchContext, JobSnapshot, TriggerOverrides,
};

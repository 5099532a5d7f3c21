//! A generation service that answers from outputs recorded by the caller.
//!
//! The HTTP surface does not reach generation backends itself. Clients run
//! the services, post the raw outputs with the turn, and the engine replays
//! them in call order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::service::{GenerationService, ServiceResponse, ServiceSettings};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Recorded outputs keyed by service, consumed front to back.
pub type RecordedOutputs = HashMap<ServiceKey, Vec<ServiceResponse>>;

/// Replays recorded service outputs.
///
/// Each invocation pops the next output recorded for its service. A service
/// with nothing left answers with an empty response, as a backend that
/// produced no commands would.
#[derive(Debug, Default)]
pub struct ReplayGenerationService {
    queued: Mutex<HashMap<ServiceKey, VecDeque<ServiceResponse>>>,
}

impl ReplayGenerationService {
    /// Wraps the outputs a client posted.
    #[must_use]
    pub fn new(outputs: RecordedOutputs) -> Self {
        let queued = outputs
            .into_iter()
            .map(|(service, responses)| (service, VecDeque::from(responses)))
            .collect();
        Self {
            queued: Mutex::new(queued),
        }
    }

    /// Outputs that were never asked for.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queued
            .lock()
            .map(|queued| queued.values().map(VecDeque::len).sum())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerationService for ReplayGenerationService {
    async fn invoke(
        &self,
        service: ServiceKey,
        _input: &str,
        _snapshot: &Value,
        _settings: &ServiceSettings,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, DomainError> {
        if cancel.is_cancelled() {
            return Err(DomainError::Aborted);
        }
        let next = self
            .queued
            .lock()
            .map_err(|_| DomainError::Infrastructure("replay queue poisoned".to_owned()))?
            .get_mut(&service)
            .and_then(VecDeque::pop_front);
        if next.is_none() {
            debug!(%service, "no recorded output left, replying empty");
        }
        Ok(next.unwrap_or_default())
    }
}

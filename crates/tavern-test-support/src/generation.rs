//! Scripted generation service for orchestrator and session tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::service::{GenerationService, ServiceResponse, ServiceSettings};
use tokio_util::sync::CancellationToken;

type Handler = Arc<dyn Fn(&str) -> Result<ServiceResponse, DomainError> + Send + Sync>;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedCall {
    /// Service invoked.
    pub service: ServiceKey,
    /// Input handed to it.
    pub input: String,
}

/// A generation service answering from per-service scripts.
///
/// Each invocation pops the next queued reply for its service. When the
/// queue is empty the service's handler answers, and without a handler an
/// empty response is returned. Services marked with [`Self::hanging`] wait
/// for cancellation and return `DomainError::Aborted`.
#[derive(Default)]
pub struct ScriptedGenerationService {
    queued: Mutex<HashMap<ServiceKey, VecDeque<Result<ServiceResponse, DomainError>>>>,
    handlers: HashMap<ServiceKey, Handler>,
    hanging: HashSet<ServiceKey>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedGenerationService {
    /// A service with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn with_reply(
        self,
        service: ServiceKey,
        reply: Result<ServiceResponse, DomainError>,
    ) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(service)
            .or_default()
            .push_back(reply);
        self
    }

    /// Queues a successful reply carrying raw commands.
    #[must_use]
    pub fn with_commands(self, service: ServiceKey, commands: Vec<Value>) -> Self {
        self.with_reply(
            service,
            Ok(ServiceResponse {
                commands,
                ..ServiceResponse::default()
            }),
        )
    }

    /// Queues a successful reply carrying only raw text.
    #[must_use]
    pub fn with_raw_text(self, service: ServiceKey, raw_text: impl Into<String>) -> Self {
        self.with_reply(
            service,
            Ok(ServiceResponse {
                raw_text: raw_text.into(),
                ..ServiceResponse::default()
            }),
        )
    }

    /// Answers a service from its input once its queue is drained.
    #[must_use]
    pub fn with_handler(
        mut self,
        service: ServiceKey,
        handler: impl Fn(&str) -> Result<ServiceResponse, DomainError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(service, Arc::new(handler));
        self
    }

    /// Makes a service block until its call is cancelled.
    #[must_use]
    pub fn hanging(mut self, service: ServiceKey) -> Self {
        self.hanging.insert(service);
        self
    }

    /// Every invocation so far, in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations of one service.
    pub fn calls_to(&self, service: ServiceKey) -> Vec<ScriptedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.service == service)
            .collect()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerationService {
    async fn invoke(
        &self,
        service: ServiceKey,
        input: &str,
        _snapshot: &Value,
        _settings: &ServiceSettings,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, DomainError> {
        self.calls.lock().unwrap().push(ScriptedCall {
            service,
            input: input.to_owned(),
        });
        if cancel.is_cancelled() {
            return Err(DomainError::Aborted);
        }
        if self.hanging.contains(&service) {
            cancel.cancelled().await;
            return Err(DomainError::Aborted);
        }
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&service)
            .and_then(VecDeque::pop_front);
        match (queued, self.handlers.get(&service)) {
            (Some(reply), _) => reply,
            (None, Some(handler)) => handler(input),
            (None, None) => Ok(ServiceResponse::default()),
        }
    }
}

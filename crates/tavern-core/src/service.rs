//! Generation-service call contract.
//!
//! The engine never looks inside a generation service. It hands over an
//! input string, a state snapshot, and settings, and gets back raw commands
//! plus the text they were extracted from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::command::ServiceKey;
use crate::error::DomainError;
use crate::sheet::SheetId;

/// How the memory service is asked to fill its tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMode {
    /// One combined request for every table.
    #[default]
    #[serde(rename = "single")]
    Single,
    /// One request per target table, run concurrently.
    #[serde(rename = "async-batch")]
    AsyncBatch,
}

/// Task descriptor bounding which sheets a service invocation may fill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillTask {
    /// Sheets the invocation is expected to write.
    #[serde(default)]
    pub required_sheets: Vec<SheetId>,
    /// The single sheet of a fan-out request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sheet: Option<SheetId>,
    /// Fill mode.
    #[serde(default)]
    pub mode: FillMode,
    /// Upper bound on concurrently filled sheets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_sheets: Option<usize>,
    /// Upper bound on concurrent batches per sheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_batches: Option<usize>,
}

impl FillTask {
    /// A task covering several sheets in a single request.
    #[must_use]
    pub fn single(required_sheets: Vec<SheetId>) -> Self {
        Self {
            required_sheets,
            ..Self::default()
        }
    }

    /// A fan-out task constrained to one sheet.
    #[must_use]
    pub fn targeted(sheet: SheetId, max_concurrent_sheets: usize) -> Self {
        Self {
            required_sheets: vec![sheet.clone()],
            target_sheet: Some(sheet),
            mode: FillMode::AsyncBatch,
            max_concurrent_sheets: Some(max_concurrent_sheets),
            max_concurrent_batches: Some(1),
        }
    }
}

/// Per-invocation settings handed to a generation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    /// Request timeout in milliseconds, if the caller wants one enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque service-specific settings.
    #[serde(default)]
    pub extra: Value,
}

/// What a generation service returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    /// Raw, not yet normalized command payloads.
    #[serde(default)]
    pub commands: Vec<Value>,
    /// Raw response text.
    #[serde(default)]
    pub raw_text: String,
    /// Human-readable note describing any repair applied to the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_note: Option<String>,
}

/// The external generation collaborator.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Invokes one service. Implementations must return
    /// `DomainError::Aborted` promptly once `cancel` fires.
    async fn invoke(
        &self,
        service: ServiceKey,
        input: &str,
        snapshot: &Value,
        settings: &ServiceSettings,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fill_task_reads_camel_case_descriptor() {
        let task: FillTask = serde_json::from_value(json!({
            "requiredSheets": ["LOG_Summary", "LOG_Outline"],
            "mode": "async-batch",
            "maxConcurrentSheets": 2
        }))
        .unwrap();

        assert_eq!(
            task.required_sheets,
            vec![SheetId::LogSummary, SheetId::LogOutline]
        );
        assert_eq!(task.mode, FillMode::AsyncBatch);
        assert_eq!(task.max_concurrent_sheets, Some(2));
        assert_eq!(task.target_sheet, None);
    }

    #[test]
    fn test_targeted_task_requires_only_its_sheet() {
        let task = FillTask::targeted(SheetId::LogOutline, 3);

        assert_eq!(task.required_sheets, vec![SheetId::LogOutline]);
        assert_eq!(task.target_sheet, Some(SheetId::LogOutline));
        assert_eq!(task.mode, FillMode::AsyncBatch);
    }
}

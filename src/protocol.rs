//! Wire contract with analysis workers.
//!
//! One JSON text frame out, one JSON text frame back, over a WebSocket at
//! `ws(s)://<endpoint>/<serviceType>`. Field names are the compatibility
//! boundary; everything inside `findings` is opaque to the core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request sent to a worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub target_model: String,
    pub target_app_number: u32,
    pub tools: Vec<String>,
}

/// Worker-reported outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Error,
    Partial,
    Timeout,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Partial => "partial",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis results attached to a worker response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    #[serde(default)]
    pub findings: Vec<serde_json::Value>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub severity_breakdown: HashMap<String, u64>,
}

/// Response frame from a worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerStatus,
    #[serde(default)]
    pub analysis: Option<AnalysisPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

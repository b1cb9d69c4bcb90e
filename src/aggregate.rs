//! Merging per-service analysis results into one consolidated record.
//!
//! Subtasks fail independently; the aggregator only ever sees snapshots for
//! the services that actually produced a result. Absent services contribute
//! nothing. The output is always a well-formed document: an analysis where
//! every worker failed yields an empty report with `failed` status, not an
//! error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{ServiceType, TaskStatus};
use crate::protocol::{WorkerResponse, WorkerStatus};

/// Result snapshot from one worker service. Persisted verbatim on the
/// subtask row so a later re-aggregation (e.g. after a retry) can rebuild
/// the consolidated report without re-running sibling services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service: ServiceType,
    pub status: WorkerStatus,
    pub findings: Vec<serde_json::Value>,
    pub tools_used: Vec<String>,
    pub severity_breakdown: HashMap<String, u64>,
}

impl ServiceSnapshot {
    pub fn from_response(service: ServiceType, response: &WorkerResponse) -> Self {
        let analysis = response.analysis.clone().unwrap_or_default();
        Self {
            service,
            status: response.status,
            findings: analysis.findings,
            tools_used: analysis.tools_used,
            severity_breakdown: analysis.severity_breakdown,
        }
    }
}

/// The consolidated analysis document, consumed by the reporting layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedReport {
    pub status: TaskStatus,
    pub services_executed: Vec<String>,
    pub findings: Vec<serde_json::Value>,
    pub severity_breakdown: HashMap<String, u64>,
    pub tools_executed: usize,
}

impl ConsolidatedReport {
    /// Short human-readable line for task records.
    pub fn summary_line(&self) -> String {
        format!(
            "{} services, {} tools, {} findings",
            self.services_executed.len(),
            self.tools_executed,
            self.findings.len()
        )
    }
}

/// Merge the snapshots that survived out of `requested_services` dispatches.
pub fn aggregate(requested_services: usize, snapshots: &[ServiceSnapshot]) -> ConsolidatedReport {
    let mut services_executed = Vec::with_capacity(snapshots.len());
    let mut findings = Vec::new();
    let mut severity_breakdown: HashMap<String, u64> = HashMap::new();
    let mut tools_executed = 0;

    for snapshot in snapshots {
        services_executed.push(snapshot.service.as_str().to_string());
        findings.extend(snapshot.findings.iter().cloned());
        for (severity, count) in &snapshot.severity_breakdown {
            *severity_breakdown.entry(severity.clone()).or_insert(0) += count;
        }
        tools_executed += snapshot.tools_used.len();
    }

    let status = if snapshots.is_empty() {
        TaskStatus::Failed
    } else if snapshots.len() == requested_services
        && snapshots.iter().all(|s| s.status == WorkerStatus::Success)
    {
        TaskStatus::Completed
    } else {
        TaskStatus::PartialSuccess
    };

    ConsolidatedReport {
        status,
        services_executed,
        findings,
        severity_breakdown,
        tools_executed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(service: ServiceType, status: WorkerStatus) -> ServiceSnapshot {
        ServiceSnapshot {
            service,
            status,
            findings: vec![json!({"severity": "high"})],
            tools_used: vec!["tool_a".into()],
            severity_breakdown: HashMap::from([("high".to_string(), 1)]),
        }
    }

    #[test]
    fn test_all_services_present_and_successful() {
        let snapshots = vec![
            snapshot(ServiceType::StaticAnalysis, WorkerStatus::Success),
            snapshot(ServiceType::AiReview, WorkerStatus::Success),
        ];
        let report = aggregate(2, &snapshots);
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.services_executed.len(), 2);
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.severity_breakdown.get("high"), Some(&2));
        assert_eq!(report.tools_executed, 2);
    }

    #[test]
    fn test_missing_service_degrades_to_partial() {
        let snapshots = vec![snapshot(ServiceType::StaticAnalysis, WorkerStatus::Success)];
        let report = aggregate(2, &snapshots);
        assert_eq!(report.status, TaskStatus::PartialSuccess);
        assert_eq!(report.services_executed, vec!["static_analysis"]);
        assert_eq!(report.findings.len(), 1);
    }

    #[test]
    fn test_partial_worker_status_degrades_to_partial() {
        let snapshots = vec![
            snapshot(ServiceType::StaticAnalysis, WorkerStatus::Success),
            snapshot(ServiceType::DynamicAnalysis, WorkerStatus::Partial),
        ];
        let report = aggregate(2, &snapshots);
        assert_eq!(report.status, TaskStatus::PartialSuccess);
    }

    #[test]
    fn test_everything_absent_is_failed_but_well_formed() {
        let report = aggregate(3, &[]);
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.services_executed.is_empty());
        assert!(report.findings.is_empty());
        assert!(report.severity_breakdown.is_empty());
        assert_eq!(report.tools_executed, 0);
    }

    #[test]
    fn test_severity_breakdown_sums_across_services() {
        let mut a = snapshot(ServiceType::StaticAnalysis, WorkerStatus::Success);
        a.severity_breakdown = HashMap::from([("high".into(), 2), ("low".into(), 1)]);
        let mut b = snapshot(ServiceType::Performance, WorkerStatus::Success);
        b.severity_breakdown = HashMap::from([("high".into(), 1), ("medium".into(), 4)]);

        let report = aggregate(2, &[a, b]);
        assert_eq!(report.severity_breakdown.get("high"), Some(&3));
        assert_eq!(report.severity_breakdown.get("medium"), Some(&4));
        assert_eq!(report.severity_breakdown.get("low"), Some(&1));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = aggregate(0, &[]);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("servicesExecuted").is_some());
        assert!(json.get("severityBreakdown").is_some());
        assert!(json.get("toolsExecuted").is_some());
    }

    #[test]
    fn test_summary_line() {
        let snapshots = vec![snapshot(ServiceType::AiReview, WorkerStatus::Success)];
        let report = aggregate(1, &snapshots);
        assert_eq!(report.summary_line(), "1 services, 1 tools, 1 findings");
    }
}

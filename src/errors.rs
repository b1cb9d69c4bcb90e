//! Typed error hierarchy for the orchestration core.
//!
//! Three top-level enums cover the three subsystems:
//! - `ReservationError` — slot allocation and version lineage failures
//! - `DispatchError` — remote worker selection and dispatch failures
//! - `OrchestrationError` — scheduler and task-orchestrator control path

use thiserror::Error;

use crate::models::{ServiceType, TaskStatus};

/// Errors from the reservation store.
///
/// Ordinary allocation contention is NOT represented here; the store retries
/// unique-constraint conflicts internally and callers never observe them.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("No free app number for model {model} after {attempts} attempts")]
    Exhausted { model: String, attempts: u32 },

    #[error("Slot {slot_id} is not found")]
    SlotNotFound { slot_id: i64 },

    #[error("App number {app_number} is already allocated for model {model}")]
    NumberTaken { model: String, app_number: u32 },

    #[error(
        "Slot {slot_id} is version {version}, but the latest version for \
         {model}/app{app_number} is {latest}; lineages are linear"
    )]
    StaleParent {
        slot_id: i64,
        model: String,
        app_number: u32,
        version: u32,
        latest: u32,
    },

    #[error("Timed out acquiring lock '{name}' after {seconds}s")]
    LockTimeout { name: String, seconds: u64 },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from dispatching work to remote analysis workers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No healthy {service} endpoint available")]
    CapacityExhausted { service: ServiceType },

    #[error("{service} worker failed: {message}")]
    Remote {
        service: ServiceType,
        message: String,
    },

    #[error("{service} worker did not respond within {seconds}s")]
    Timeout { service: ServiceType, seconds: u64 },

    #[error("Malformed worker frame: {message}")]
    Protocol { message: String },
}

impl DispatchError {
    /// Whether a caller-driven retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Protocol { .. })
    }
}

/// Errors from the scheduler and task orchestrator control path.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Pipeline run {id} not found")]
    RunNotFound { id: u64 },

    #[error("Analysis task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Task {task_id} exhausted its retry budget ({max_retries})")]
    RetriesExhausted { task_id: i64, max_retries: u32 },

    #[error("Task {task_id} is {status}, only failed tasks can be retried")]
    NotRetryable { task_id: i64, status: TaskStatus },

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_capacity_exhaustion_is_retryable() {
        let err = DispatchError::CapacityExhausted {
            service: ServiceType::Performance,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("performance"));
    }

    #[test]
    fn dispatch_timeout_is_retryable() {
        let err = DispatchError::Timeout {
            service: ServiceType::StaticAnalysis,
            seconds: 120,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn dispatch_protocol_error_is_not_retryable() {
        let err = DispatchError::Protocol {
            message: "binary frame".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn stale_parent_carries_lineage_context() {
        let err = ReservationError::StaleParent {
            slot_id: 12,
            model: "gpt_mini".into(),
            app_number: 3,
            version: 1,
            latest: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("gpt_mini"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn orchestration_error_converts_from_reservation() {
        let inner = ReservationError::SlotNotFound { slot_id: 9 };
        let err: OrchestrationError = inner.into();
        assert!(matches!(
            err,
            OrchestrationError::Reservation(ReservationError::SlotNotFound { slot_id: 9 })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ReservationError::SlotNotFound { slot_id: 1 });
        assert_std_error(&DispatchError::Protocol {
            message: "x".into(),
        });
        assert_std_error(&OrchestrationError::RunNotFound { id: 1 });
    }
}

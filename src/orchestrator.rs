//! Task orchestration: one analysis request, decomposed per worker service.
//!
//! A main task owns one subtask per worker-service type touched by the
//! requested tool set. Subtasks dispatch through the endpoint pool and fail
//! independently; the main task's status is always recomputed from its
//! subtasks, never set directly by a dispatch path. A request touching a
//! single service degrades to a main task with no subtasks, same contract,
//! one less row.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::aggregate::{self, ConsolidatedReport, ServiceSnapshot};
use crate::db::DbHandle;
use crate::dispatch::AnalysisTransport;
use crate::errors::{DispatchError, OrchestrationError};
use crate::models::{AnalysisTask, ServiceType, TaskStatus, rollup_status, tool_service};
use crate::pool::EndpointPool;
use crate::protocol::{WorkerRequest, WorkerStatus};

/// Terminal result of one analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub task: AnalysisTask,
    pub report: ConsolidatedReport,
}

pub struct TaskOrchestrator {
    db: DbHandle,
    pool: Arc<EndpointPool>,
    transport: Arc<dyn AnalysisTransport>,
    max_retries: u32,
}

impl TaskOrchestrator {
    pub fn new(
        db: DbHandle,
        pool: Arc<EndpointPool>,
        transport: Arc<dyn AnalysisTransport>,
        max_retries: u32,
    ) -> Self {
        Self {
            db,
            pool,
            transport,
            max_retries,
        }
    }

    /// Analyze one generated application with the given tool selection.
    ///
    /// Creates the main task (and subtasks), dispatches every touched
    /// service, aggregates whatever came back, and returns the terminal main
    /// task with its consolidated report. Worker failures surface in the
    /// report and the task statuses, never as an `Err` from this method.
    pub async fn analyze(
        &self,
        model: &str,
        app_number: u32,
        tools: &[String],
    ) -> Result<AnalysisOutcome, OrchestrationError> {
        let partitions = partition_tools(tools);

        if partitions.is_empty() {
            let task = self
                .db
                .call({
                    let model = model.to_string();
                    let tools = tools.to_vec();
                    let max_retries = self.max_retries;
                    move |db| {
                        let task =
                            db.create_task(None, &model, app_number, None, &tools, max_retries)?;
                        db.finish_task(
                            task.id,
                            TaskStatus::Failed,
                            None,
                            Some("No requested tool maps to a known worker service"),
                        )
                    }
                })
                .await?;
            return Ok(AnalysisOutcome {
                task,
                report: aggregate::aggregate(0, &[]),
            });
        }

        // Single touched service: degrade to a main task with no subtasks.
        if partitions.len() == 1 {
            let (service, service_tools) = partitions.into_iter().next().expect("len checked");
            return self
                .analyze_single(model, app_number, service, service_tools)
                .await;
        }

        let main = self
            .create_main_with_subtasks(model, app_number, tools, &partitions)
            .await?;

        let subtasks = self
            .db
            .call({
                let main_id = main.id;
                move |db| db.list_subtasks(main_id)
            })
            .await?;

        // Dispatch every subtask concurrently; each terminates its own row
        // and refreshes the parent rollup as it lands.
        let dispatches = subtasks.iter().map(|subtask| {
            let service = subtask
                .service
                .expect("subtasks are created with a service");
            let subtask_tools = subtask.tools.clone();
            self.run_subtask(main.id, subtask.id, service, model, app_number, subtask_tools)
        });
        let snapshots: Vec<ServiceSnapshot> =
            join_all(dispatches).await.into_iter().flatten().collect();

        let report = aggregate::aggregate(subtasks.len(), &snapshots);
        let task = self.finish_main(main.id, &report).await?;
        info!(
            task_id = task.id,
            model,
            app_number,
            status = %task.status,
            "analysis finished: {}",
            report.summary_line()
        );
        Ok(AnalysisOutcome { task, report })
    }

    /// Caller-driven retry of a failed subtask, bounded by the task's retry
    /// budget. Refreshes the parent rollup afterwards.
    pub async fn retry_subtask(
        &self,
        subtask_id: i64,
    ) -> Result<AnalysisTask, OrchestrationError> {
        let task = self
            .db
            .call(move |db| db.get_task(subtask_id))
            .await?
            .ok_or(OrchestrationError::TaskNotFound { id: subtask_id })?;

        if task.status != TaskStatus::Failed {
            return Err(OrchestrationError::NotRetryable {
                task_id: task.id,
                status: task.status,
            });
        }
        if task.retry_count >= task.max_retries {
            return Err(OrchestrationError::RetriesExhausted {
                task_id: task.id,
                max_retries: task.max_retries,
            });
        }
        let Some(service) = task.service else {
            return Err(OrchestrationError::NotRetryable {
                task_id: task.id,
                status: task.status,
            });
        };

        self.db
            .call(move |db| db.restart_task_for_retry(subtask_id))
            .await?;

        // The dispatch persists its snapshot (or failure) on the row itself.
        let _ = self
            .dispatch_to_service(
                subtask_id,
                service,
                &task.target_model,
                task.target_app_number,
                task.tools.clone(),
            )
            .await;

        if let Some(parent_id) = task.parent_id {
            // Fold the retried result back into the parent's record by
            // re-aggregating the snapshots persisted on the sibling rows.
            let subtasks = self
                .db
                .call(move |db| db.list_subtasks(parent_id))
                .await?;
            let snapshots: Vec<ServiceSnapshot> = subtasks
                .iter()
                .filter_map(|t| t.result_summary.as_deref())
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect();
            let statuses: Vec<TaskStatus> = subtasks.iter().map(|t| t.status).collect();
            let rolled = rollup_status(&statuses);
            let progress = subtask_progress(&subtasks);
            let requested = subtasks.len();
            self.db
                .call(move |db| {
                    db.update_task_progress(parent_id, progress)?;
                    if rolled.is_terminal() {
                        let report = aggregate::aggregate(requested, &snapshots);
                        let summary = serde_json::to_string(&report)
                            .unwrap_or_else(|_| report.summary_line());
                        db.finish_task(parent_id, report.status, Some(&summary), None)?;
                    }
                    Ok(())
                })
                .await?;
        }

        self.db
            .call(move |db| db.get_task(subtask_id))
            .await?
            .ok_or(OrchestrationError::TaskNotFound { id: subtask_id })
    }

    async fn analyze_single(
        &self,
        model: &str,
        app_number: u32,
        service: ServiceType,
        tools: Vec<String>,
    ) -> Result<AnalysisOutcome, OrchestrationError> {
        let main = self
            .db
            .call({
                let model = model.to_string();
                let tools = tools.clone();
                let max_retries = self.max_retries;
                move |db| {
                    let task = db.create_task(
                        None,
                        &model,
                        app_number,
                        Some(service),
                        &tools,
                        max_retries,
                    )?;
                    db.mark_task_running(task.id)
                }
            })
            .await?;

        let snapshot = self
            .dispatch_to_service(main.id, service, model, app_number, tools)
            .await;
        let snapshots: Vec<ServiceSnapshot> = snapshot.into_iter().collect();
        let report = aggregate::aggregate(1, &snapshots);
        let task = self
            .db
            .call({
                let main_id = main.id;
                move |db| db.get_task(main_id)
            })
            .await?
            .ok_or(OrchestrationError::TaskNotFound { id: main.id })?;
        Ok(AnalysisOutcome { task, report })
    }

    async fn create_main_with_subtasks(
        &self,
        model: &str,
        app_number: u32,
        tools: &[String],
        partitions: &BTreeMap<ServiceType, Vec<String>>,
    ) -> Result<AnalysisTask, OrchestrationError> {
        let model = model.to_string();
        let tools = tools.to_vec();
        let partitions = partitions.clone();
        let max_retries = self.max_retries;
        let main = self
            .db
            .call(move |db| {
                let main = db.create_task(None, &model, app_number, None, &tools, max_retries)?;
                for (service, service_tools) in &partitions {
                    db.create_task(
                        Some(main.id),
                        &model,
                        app_number,
                        Some(*service),
                        service_tools,
                        max_retries,
                    )?;
                }
                db.mark_task_running(main.id)
            })
            .await?;
        Ok(main)
    }

    /// Dispatch one subtask (or degraded main task) to its worker service and
    /// terminate the row accordingly. Returns the snapshot when the worker
    /// produced a usable result.
    async fn run_subtask(
        &self,
        main_id: i64,
        subtask_id: i64,
        service: ServiceType,
        model: &str,
        app_number: u32,
        tools: Vec<String>,
    ) -> Option<ServiceSnapshot> {
        self.db
            .call(move |db| db.mark_task_running(subtask_id))
            .await
            .ok()?;
        let snapshot = self
            .dispatch_to_service(subtask_id, service, model, app_number, tools)
            .await;
        if let Err(e) = self.refresh_rollup(main_id).await {
            warn!(main_id, "failed to refresh task rollup: {:#}", e);
        }
        snapshot
    }

    /// The actual remote call. Terminates `task_id` per the outcome:
    /// capacity exhaustion and transport errors mark it failed (and the
    /// endpoint unhealthy where one was involved); a well-formed worker
    /// response maps its status onto the task row.
    async fn dispatch_to_service(
        &self,
        task_id: i64,
        service: ServiceType,
        model: &str,
        app_number: u32,
        tools: Vec<String>,
    ) -> Option<ServiceSnapshot> {
        let Some(selection) = self.pool.select(service).await else {
            let err = DispatchError::CapacityExhausted { service };
            warn!(task_id, service = %service, "{}", err);
            self.fail_task(task_id, &err.to_string()).await;
            return None;
        };

        let request = WorkerRequest {
            target_model: model.to_string(),
            target_app_number: app_number,
            tools,
        };

        let started = std::time::Instant::now();
        match self.transport.dispatch(&selection.url, service, &request).await {
            Ok(response) => {
                // The endpoint answered; it stays healthy even if the worker
                // reports a tool-level failure.
                self.pool
                    .report_success(service, &selection.url, started.elapsed())
                    .await;
                match response.status {
                    WorkerStatus::Success | WorkerStatus::Partial => {
                        let snapshot = ServiceSnapshot::from_response(service, &response);
                        let status = if response.status == WorkerStatus::Success {
                            TaskStatus::Completed
                        } else {
                            TaskStatus::PartialSuccess
                        };
                        // Persist the snapshot itself so the report can be
                        // rebuilt from rows alone.
                        let summary = serde_json::to_string(&snapshot).unwrap_or_else(|_| {
                            format!("{} findings from {}", snapshot.findings.len(), service)
                        });
                        let _ = self
                            .db
                            .call(move |db| {
                                db.update_task_progress(task_id, 100.0)?;
                                db.finish_task(task_id, status, Some(&summary), None)
                            })
                            .await;
                        Some(snapshot)
                    }
                    WorkerStatus::Error | WorkerStatus::Timeout => {
                        let message = response
                            .error
                            .unwrap_or_else(|| format!("worker reported {}", response.status));
                        self.fail_task(task_id, &message).await;
                        None
                    }
                }
            }
            Err(e) => {
                self.pool.report_failure(service, &selection.url).await;
                warn!(task_id, service = %service, url = %selection.url, "dispatch failed: {}", e);
                self.fail_task(task_id, &e.to_string()).await;
                None
            }
        }
    }

    async fn fail_task(&self, task_id: i64, error: &str) {
        let error = error.to_string();
        let _ = self
            .db
            .call(move |db| db.finish_task(task_id, TaskStatus::Failed, None, Some(&error)))
            .await;
    }

    /// Recompute the main task's progress and status from the current
    /// subtask rows. Runs every time a subtask terminates; the summary and
    /// error fields are left to whichever path owns them.
    async fn refresh_rollup(&self, main_id: i64) -> anyhow::Result<()> {
        let subtasks = self.db.call(move |db| db.list_subtasks(main_id)).await?;
        let statuses: Vec<TaskStatus> = subtasks.iter().map(|t| t.status).collect();
        let rolled = rollup_status(&statuses);
        let progress = subtask_progress(&subtasks);
        self.db
            .call(move |db| {
                db.update_task_progress(main_id, progress)?;
                db.set_task_status(main_id, rolled)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn finish_main(
        &self,
        main_id: i64,
        report: &ConsolidatedReport,
    ) -> Result<AnalysisTask, OrchestrationError> {
        let status = report.status;
        let summary =
            serde_json::to_string(report).unwrap_or_else(|_| report.summary_line());
        let error = if status == TaskStatus::Failed {
            Some("All worker services failed".to_string())
        } else {
            None
        };
        let task = self
            .db
            .call(move |db| {
                db.update_task_progress(main_id, 100.0)?;
                db.finish_task(main_id, status, Some(&summary), error.as_deref())
            })
            .await?;
        Ok(task)
    }
}

/// Split a tool selection by owning worker service, preserving request order
/// within each partition. Unknown tools are dropped with a warning.
fn partition_tools(tools: &[String]) -> BTreeMap<ServiceType, Vec<String>> {
    let mut partitions: BTreeMap<ServiceType, Vec<String>> = BTreeMap::new();
    for tool in tools {
        match tool_service(tool) {
            Some(service) => partitions.entry(service).or_default().push(tool.clone()),
            None => warn!(tool, "unknown tool, skipping"),
        }
    }
    partitions
}

fn subtask_progress(subtasks: &[AnalysisTask]) -> f64 {
    if subtasks.is_empty() {
        return 0.0;
    }
    let completed = subtasks
        .iter()
        .filter(|t| t.status.is_success())
        .count();
    completed as f64 / subtasks.len() as f64 * 100.0
}

//! Pipeline scheduler: fans a declarative definition out into bounded
//! generation and analysis jobs.
//!
//! Each run expands to `models × templates` generation jobs; when the
//! analysis stage is enabled, every successful generation gates exactly one
//! analysis job. Two semaphores bound the stages independently. An in-flight
//! set keyed by (run id, job key) guards against double submission: a job
//! the polling loop observes mid-flight is never submitted again. Counters
//! advance exactly once per job, driven by completion messages, never by
//! re-scanning job lists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{info, warn};

use crate::errors::OrchestrationError;
use crate::generation::GenerationBackend;
use crate::models::{PipelineConfig, PipelineRun, PipelineStatus, TaskStatus};
use crate::orchestrator::TaskOrchestrator;
use crate::reservation::ReservationStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrent generation jobs, across the whole process.
    pub max_concurrent_generation: usize,
    /// Upper bound on concurrent analysis jobs, across the whole process.
    pub max_concurrent_analysis: usize,
    /// How long the polling loop waits for a completion before re-checking
    /// cancellation and submission capacity.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_generation: 2,
            max_concurrent_analysis: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Progress events emitted while a run executes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: u64,
        generation_total: u32,
        analysis_total: u32,
    },
    GenerationCompleted {
        run_id: u64,
        model: String,
        template: String,
        app_number: u32,
    },
    GenerationFailed {
        run_id: u64,
        model: String,
        template: String,
        error: String,
    },
    AnalysisCompleted {
        run_id: u64,
        model: String,
        app_number: u32,
        task_id: i64,
    },
    AnalysisFailed {
        run_id: u64,
        model: String,
        app_number: u32,
        error: String,
    },
    RunFinished {
        run_id: u64,
        status: PipelineStatus,
    },
}

#[derive(Debug, Clone)]
struct GenJob {
    model: String,
    template: String,
}

enum JobOutcome {
    Generation {
        key: String,
        model: String,
        template: String,
        result: Result<u32, String>,
    },
    Analysis {
        key: String,
        model: String,
        app_number: u32,
        result: Result<(i64, TaskStatus), String>,
    },
}

pub struct JobScheduler {
    config: SchedulerConfig,
    reservations: ReservationStore,
    generator: Arc<dyn GenerationBackend>,
    orchestrator: Arc<TaskOrchestrator>,
    runs: Mutex<HashMap<u64, PipelineRun>>,
    in_flight: Mutex<HashSet<(u64, String)>>,
    next_run_id: AtomicU64,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        reservations: ReservationStore,
        generator: Arc<dyn GenerationBackend>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Self {
        Self {
            config,
            reservations,
            generator,
            orchestrator,
            runs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            next_run_id: AtomicU64::new(1),
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register a pipeline definition. The run starts `pending`; `execute`
    /// drives it to a terminal status.
    pub async fn submit(&self, config: PipelineConfig) -> Result<u64, OrchestrationError> {
        if config.generation.models.is_empty() {
            return Err(OrchestrationError::InvalidPipeline(
                "generation.models is empty".into(),
            ));
        }
        if config.generation.templates.is_empty() {
            return Err(OrchestrationError::InvalidPipeline(
                "generation.templates is empty".into(),
            ));
        }
        if config.analysis.enabled && config.analysis.tools.is_empty() {
            return Err(OrchestrationError::InvalidPipeline(
                "analysis is enabled but analysis.tools is empty".into(),
            ));
        }
        // Duplicate entries would collide on the in-flight job key and the
        // second copy could never run; reject them up front.
        let distinct_models: HashSet<&String> = config.generation.models.iter().collect();
        if distinct_models.len() != config.generation.models.len() {
            return Err(OrchestrationError::InvalidPipeline(
                "generation.models contains duplicates".into(),
            ));
        }
        let distinct_templates: HashSet<&String> = config.generation.templates.iter().collect();
        if distinct_templates.len() != config.generation.templates.len() {
            return Err(OrchestrationError::InvalidPipeline(
                "generation.templates contains duplicates".into(),
            ));
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let run = PipelineRun::new(run_id, config);
        self.runs.lock().await.insert(run_id, run);
        Ok(run_id)
    }

    /// Snapshot of a run's current state.
    pub async fn run_status(&self, run_id: u64) -> Option<PipelineRun> {
        self.runs.lock().await.get(&run_id).cloned()
    }

    /// Cooperative cancellation: no new submissions; in-flight jobs drain
    /// and their results are recorded without advancing completion counts.
    pub async fn cancel(&self, run_id: u64) -> Result<(), OrchestrationError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(OrchestrationError::RunNotFound { id: run_id })?;
        if !run.status.is_terminal() {
            run.status = PipelineStatus::Cancelled;
            info!(run_id, "pipeline cancelled");
        }
        Ok(())
    }

    /// Claim a (run, job key) pair for submission. Returns false if the job
    /// is already in flight; the caller must not submit it again.
    pub async fn try_claim(&self, run_id: u64, job_key: &str) -> bool {
        self.in_flight
            .lock()
            .await
            .insert((run_id, job_key.to_string()))
    }

    async fn release(&self, run_id: u64, job_key: &str) {
        self.in_flight
            .lock()
            .await
            .remove(&(run_id, job_key.to_string()));
    }

    async fn is_cancelled(&self, run_id: u64) -> bool {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .map(|r| r.status == PipelineStatus::Cancelled)
            .unwrap_or(true)
    }

    /// Drive one run to a terminal status.
    pub async fn execute(&self, run_id: u64) -> Result<PipelineRun, OrchestrationError> {
        let config = {
            let mut runs = self.runs.lock().await;
            let run = runs
                .get_mut(&run_id)
                .ok_or(OrchestrationError::RunNotFound { id: run_id })?;
            if run.status == PipelineStatus::Cancelled {
                // Cancelled before it ever started; nothing to drive.
                return Ok(run.clone());
            }
            if run.status != PipelineStatus::Pending {
                return Err(OrchestrationError::InvalidPipeline(format!(
                    "run {} is {}, only pending runs can execute",
                    run_id, run.status
                )));
            }
            run.status = PipelineStatus::Running;
            run.started_at = Some(Utc::now());
            run.config.clone()
        };

        self.emit(PipelineEvent::RunStarted {
            run_id,
            generation_total: config.generation_total(),
            analysis_total: config.analysis_total(),
        })
        .await;

        let gen_limit = stage_limit(
            &config.generation.options,
            self.config.max_concurrent_generation,
        );
        let analysis_limit = stage_limit(
            &config.analysis.options,
            self.config.max_concurrent_analysis,
        );
        let gen_sem = Arc::new(Semaphore::new(gen_limit));
        let analysis_sem = Arc::new(Semaphore::new(analysis_limit));

        let mut gen_queue: VecDeque<GenJob> = VecDeque::new();
        for model in &config.generation.models {
            for template in &config.generation.templates {
                gen_queue.push_back(GenJob {
                    model: model.clone(),
                    template: template.clone(),
                });
            }
        }
        let mut analysis_queue: VecDeque<(String, u32)> = VecDeque::new();
        let analysis_enabled = config.analysis.enabled;
        let tools = Arc::new(config.analysis.tools.clone());

        let (tx, mut rx) = mpsc::channel::<JobOutcome>(64);

        loop {
            let cancelled = self.is_cancelled(run_id).await;
            if cancelled {
                gen_queue.clear();
                analysis_queue.clear();
            }

            // Submit generation jobs while there is capacity.
            while !gen_queue.is_empty() {
                let Ok(permit) = Arc::clone(&gen_sem).try_acquire_owned() else {
                    break;
                };
                let job = gen_queue.pop_front().expect("queue checked non-empty");
                let key = format!("gen:{}:{}", job.model, job.template);
                if !self.try_claim(run_id, &key).await {
                    // Observed mid-flight on a previous tick; never resubmit.
                    continue;
                }
                self.bump_in_flight(run_id, Stage::Generation, 1).await;
                let reservations = self.reservations.clone();
                let generator = Arc::clone(&self.generator);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = async {
                        let slot = reservations
                            .allocate(&job.model, None)
                            .await
                            .map_err(|e| e.to_string())?;
                        generator
                            .generate(&job.model, &job.template, slot.app_number)
                            .await
                            .map_err(|e| format!("{:#}", e))?;
                        Ok(slot.app_number)
                    }
                    .await;
                    let _ = tx
                        .send(JobOutcome::Generation {
                            key,
                            model: job.model,
                            template: job.template,
                            result,
                        })
                        .await;
                });
            }

            // Submit analysis jobs gated on completed generations.
            while !analysis_queue.is_empty() {
                let Ok(permit) = Arc::clone(&analysis_sem).try_acquire_owned() else {
                    break;
                };
                let (model, app_number) =
                    analysis_queue.pop_front().expect("queue checked non-empty");
                let key = format!("analysis:{}:{}", model, app_number);
                if !self.try_claim(run_id, &key).await {
                    continue;
                }
                self.bump_in_flight(run_id, Stage::Analysis, 1).await;
                let orchestrator = Arc::clone(&self.orchestrator);
                let tools = Arc::clone(&tools);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = match orchestrator.analyze(&model, app_number, &tools).await {
                        Ok(outcome) => Ok((outcome.task.id, outcome.task.status)),
                        Err(e) => Err(format!("{:#}", e)),
                    };
                    let _ = tx
                        .send(JobOutcome::Analysis {
                            key,
                            model,
                            app_number,
                            result,
                        })
                        .await;
                });
            }

            // Wait briefly for a completion; a timeout is just a poll tick.
            match tokio::time::timeout(self.config.poll_interval, rx.recv()).await {
                Ok(Some(outcome)) => {
                    let events = self
                        .record_outcome(run_id, outcome, &mut analysis_queue, analysis_enabled)
                        .await;
                    for event in events {
                        self.emit(event).await;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }

            if self.is_run_drained(run_id, &gen_queue, &analysis_queue).await {
                break;
            }
        }

        let run = self.finalize(run_id).await?;
        self.emit(PipelineEvent::RunFinished {
            run_id,
            status: run.status,
        })
        .await;
        Ok(run)
    }

    /// Record one job completion. Counters move exactly once per job, here
    /// and nowhere else. After cancellation the result is still recorded
    /// (event, in-flight release) but completion counts stay frozen.
    async fn record_outcome(
        &self,
        run_id: u64,
        outcome: JobOutcome,
        analysis_queue: &mut VecDeque<(String, u32)>,
        analysis_enabled: bool,
    ) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        match outcome {
            JobOutcome::Generation {
                key,
                model,
                template,
                result,
            } => {
                self.release(run_id, &key).await;
                let mut runs = self.runs.lock().await;
                let Some(run) = runs.get_mut(&run_id) else {
                    return events;
                };
                let cancelled = run.status == PipelineStatus::Cancelled;
                run.generation.in_flight = run.generation.in_flight.saturating_sub(1);
                match result {
                    Ok(app_number) => {
                        if !cancelled {
                            run.generation.completed += 1;
                            if analysis_enabled {
                                analysis_queue.push_back((model.clone(), app_number));
                            }
                        }
                        events.push(PipelineEvent::GenerationCompleted {
                            run_id,
                            model,
                            template,
                            app_number,
                        });
                    }
                    Err(error) => {
                        warn!(run_id, model = %model, template = %template, "generation failed: {}", error);
                        if !cancelled {
                            run.generation.failed += 1;
                            if analysis_enabled {
                                // The gated analysis job can never become
                                // eligible; account for it now.
                                run.analysis.failed += 1;
                            }
                        }
                        events.push(PipelineEvent::GenerationFailed {
                            run_id,
                            model,
                            template,
                            error,
                        });
                    }
                }
            }
            JobOutcome::Analysis {
                key,
                model,
                app_number,
                result,
            } => {
                self.release(run_id, &key).await;
                let mut runs = self.runs.lock().await;
                let Some(run) = runs.get_mut(&run_id) else {
                    return events;
                };
                let cancelled = run.status == PipelineStatus::Cancelled;
                run.analysis.in_flight = run.analysis.in_flight.saturating_sub(1);
                match result {
                    Ok((task_id, status)) if status.is_success() => {
                        if !cancelled {
                            run.analysis.completed += 1;
                        }
                        events.push(PipelineEvent::AnalysisCompleted {
                            run_id,
                            model,
                            app_number,
                            task_id,
                        });
                    }
                    Ok((task_id, status)) => {
                        if !cancelled {
                            run.analysis.failed += 1;
                        }
                        events.push(PipelineEvent::AnalysisFailed {
                            run_id,
                            model,
                            app_number,
                            error: format!("analysis task {} finished {}", task_id, status),
                        });
                    }
                    Err(error) => {
                        warn!(run_id, model = %model, app_number, "analysis failed: {}", error);
                        if !cancelled {
                            run.analysis.failed += 1;
                        }
                        events.push(PipelineEvent::AnalysisFailed {
                            run_id,
                            model,
                            app_number,
                            error,
                        });
                    }
                }
            }
        }
        events
    }

    async fn is_run_drained(
        &self,
        run_id: u64,
        gen_queue: &VecDeque<GenJob>,
        analysis_queue: &VecDeque<(String, u32)>,
    ) -> bool {
        let runs = self.runs.lock().await;
        let Some(run) = runs.get(&run_id) else {
            return true;
        };
        let nothing_in_flight = run.generation.in_flight == 0 && run.analysis.in_flight == 0;
        if run.status == PipelineStatus::Cancelled {
            return nothing_in_flight;
        }
        nothing_in_flight
            && gen_queue.is_empty()
            && analysis_queue.is_empty()
            && run.generation.is_drained()
            && (!run.config.analysis.enabled || run.analysis.is_drained())
    }

    /// Resolve the terminal status. Any success at all keeps the run out of
    /// `failed`; `failed` is reserved for runs where nothing could complete.
    async fn finalize(&self, run_id: u64) -> Result<PipelineRun, OrchestrationError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(OrchestrationError::RunNotFound { id: run_id })?;
        if run.status != PipelineStatus::Cancelled {
            let successes = run.generation.completed + run.analysis.completed;
            let failures = run.generation.failed + run.analysis.failed;
            run.status = if failures == 0 {
                PipelineStatus::Completed
            } else if successes == 0 {
                PipelineStatus::Failed
            } else {
                PipelineStatus::PartialSuccess
            };
        }
        run.completed_at = Some(Utc::now());
        info!(run_id, status = %run.status, "pipeline finished");
        Ok(run.clone())
    }

    async fn bump_in_flight(&self, run_id: u64, stage: Stage, delta: u32) {
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get_mut(&run_id) {
            match stage {
                Stage::Generation => run.generation.in_flight += delta,
                Stage::Analysis => run.analysis.in_flight += delta,
            }
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Generation,
    Analysis,
}

/// Effective concurrency for one stage: the pipeline's own option, clamped
/// by the scheduler-wide cap; serial when `parallel` is off.
fn stage_limit(options: &crate::models::StageOptions, cap: usize) -> usize {
    if !options.parallel {
        return 1;
    }
    options.max_concurrent_tasks.min(cap).max(1)
}

//! Crucible — orchestration core for a model-generation research platform.
//!
//! ## Overview
//!
//! The platform asks language models to generate small applications, then
//! pushes each one through a battery of analysis workers (static analysis,
//! dynamic analysis, performance, AI review). This crate is the part that
//! coordinates all of it: pipeline fan-out, slot allocation, worker-pool
//! health, result aggregation, and stuck-task reclamation.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────┐  PipelineConfig  ┌────────────────────────────────────────────┐
//! │ Caller  │ ───────────────> │ scheduler.rs (JobScheduler, PipelineEvent) │
//! │ (CLI)   │ <─ PipelineRun ─ │   │ allocate slot     │ submit analysis    │
//! └─────────┘                  │   v                   v                    │
//!                              │ reservation.rs      orchestrator.rs        │
//!                              │ (ReservationStore)  (TaskOrchestrator)     │
//!                              │   │                   │ select()           │
//!                              │   v                   v                    │
//!                              │ db.rs (DbHandle)    pool.rs (EndpointPool) │
//!                              │   │ NamedLock          │ dispatch()        │
//!                              │   v                    v                   │
//!                              │ lock.rs             dispatch.rs (ws)       │
//!                              └────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | Domain types: `ServiceType`, statuses, `PipelineConfig` |
//! | `protocol`   | Wire contract with workers (`WorkerRequest`/`Response`) |
//! | `aggregate`  | Merge per-service snapshots into one report             |
//! | `generation` | Model-gateway client behind `GenerationBackend`         |
//! | `sweep`      | Timer-driven reclamation of orphaned tasks              |
//! | `config`     | TOML + environment settings, read once at startup       |
//! | `errors`     | Typed error hierarchy per subsystem                     |

pub mod aggregate;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod generation;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod reservation;
pub mod scheduler;
pub mod sweep;

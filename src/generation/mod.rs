//! Generation pipeline — asynchronous AI code-generation back-end.
//!
//! ## Overview
//!
//! A user request ("build me a todo app") becomes an immutable `Request`
//! plus a `Job`. A trigger hands the job to the `GenerationPipeline`,
//! which admits it against a per-principal quota ledger, leases a fresh
//! sandbox, drives a bounded agent step loop against the model, and
//! writes exactly one `GenerationResult` when the job terminates.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! └──────────┘          │    └─ api.rs  (route handlers, AppState)         │
//!                       │         │                                        │
//!                       │         │ GenerationPipeline::run(TriggerEvent)  │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (job state machine)            │
//!                       │    │          │              │                   │
//!                       │    │ admit    │ lease        │ step loop         │
//!                       │    v          v              v                   │
//!                       │  quota.rs   sandbox.rs     agent.rs              │
//!                       │  (ledger)   (LeaseManager, (StepRunner,          │
//!                       │              ToolExecutor)  reply parsing)       │
//!                       │                  │                               │
//!                       │                  v                               │
//!                       │  provider.rs  (HTTP sandbox provider)            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                        |
//! |----------------|-------------------------------------------------------|
//! | `models`       | Shared types: `Job`, `JobStatus`, `StepRecord`, ...   |
//! | `db`           | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)   |
//!
//! ## Job Lifecycle
//!
//! 1. `POST /api/requests` → `Request` + `Job` in `pending`.
//! 2. `POST /api/jobs/{id}/run` → a trigger is delivered (at-least-once)
//!    and the pipeline task starts.
//! 3. Admission: the `pending → admitted` transition elects one owner
//!    among duplicate deliveries, and the owner consumes one quota
//!    point atomically; denial fails the job with `quota_exhausted`
//!    before any sandbox is touched.
//! 4. A fresh sandbox lease is acquired (bounded retries with backoff)
//!    and swapped onto the job row, moving it `admitted → running`;
//!    a lease that loses the swap, or whose run errors out, is
//!    released on the spot.
//! 5. The step loop asks the `StepRunner` for the next action, executes
//!    tool calls inside the lease with a per-call timeout, and appends
//!    every step to the persisted trace. Budget and lease ttl are
//!    checked before each step.
//! 6. Terminal transition and `GenerationResult` land in a single
//!    transaction; duplicate triggers can never produce a second result.
//!    The lease is released afterwards, off the critical path.

pub mod agent;
pub mod api;
pub mod db;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod sandbox;
pub mod server;

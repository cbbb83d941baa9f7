//! # Overseer
//!
//! Executes natural-language desktop and workspace requests as a verified
//! todo list.
//!
//! ## Architecture
//!
//! ```text
//!   request ──▶ Planner ──▶ TodoList ──▶ Executor ──▶ ExecutionReport
//!                  ▲                       │    ▲
//!                  │ replan                │    │ verdict
//!                  └────── Adjuster ◀──────┘    │
//!                                          VerificationService
//!                                         ┌─────┴──────┐
//!                                  VisionVerifier  ProbeVerifier
//!                                         │              │
//!                               CapabilityClient    ToolInvoker
//!                                         │
//!                                 RequestThrottler
//! ```
//!
//! ## Modules
//! - `todo`: Items, attempts, verification results and the list state machine
//! - `agents`: Planner, Executor and Adjuster
//! - `verify`: Strategy selection, vision and probe verification
//! - `llm`: Provider clients and the tiered capability client
//! - `throttle`: Adaptive request throttling for model calls
//! - `tools`: Tool providers and the invocation seam
//! - `capture`: Screen observation
//! - `notify`: Progress notifications

pub mod agents;
pub mod capture;
pub mod config;
pub mod llm;
pub mod notify;
pub mod throttle;
pub mod todo;
pub mod tools;
pub mod verify;

pub use agents::{Adjuster, Executor, Planner};
pub use config::Config;
pub use todo::{ExecutionReport, TodoItem, TodoList};

//! Agents module - planning, execution and adjustment.
//!
//! # Agent Types
//! - **Planner**: Turns a request into a dependency-ordered todo list, and
//!   proposes replacement steps when an item runs out of attempts
//! - **Executor**: Runs ready items, verifies each attempt and applies the
//!   adjuster's decision
//! - **Adjuster**: Classifies a failed attempt and picks retry, rewrite,
//!   replan or failure
//!
//! # Design Principles
//! - An item only completes on independent verification of its criterion
//! - A failed tool call never reaches the verifier
//! - Replans are bounded per request

mod adjuster;
mod executor;
mod planner;

pub use adjuster::{Adjuster, Adjustment, FailureMode};
pub use executor::Executor;
pub use planner::{parse_plan, PlanError, Planner};

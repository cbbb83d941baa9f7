//! Todo module - plans, items, attempts and verification results.
//!
//! This module is designed with provability in mind:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced in constructors and transitions
//! - Pure state lives here; IO happens in `agents` and `verify`

mod item;
mod list;
mod report;
mod verification;

pub use item::{Action, Attempt, ExecutionResult, TodoItem, TodoStatus, ToolCallSpec};
pub use list::{validate_items, TodoList};
pub use report::{ExecutionReport, ItemReport, StatusCounts};
pub use verification::{
    Evidence, ParseOutcome, ProgrammaticCheck, VerificationMethod, VerificationResult,
};

/// Errors from todo list construction and item transitions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TodoError {
    #[error("Invalid transition for item {item}: {from} -> {to}")]
    InvalidTransition {
        item: String,
        from: TodoStatus,
        to: TodoStatus,
    },

    #[error("Item {item} has used all {max_attempts} attempts")]
    AttemptsExhausted { item: String, max_attempts: u32 },

    #[error("Item {0} is not being verified")]
    NotVerifying(String),

    #[error("Todo list cannot be empty")]
    EmptyList,

    #[error("Field {0} cannot be empty")]
    EmptyField(String),

    #[error("Duplicate item id {0}")]
    DuplicateId(String),

    #[error("Item {0} depends on itself")]
    SelfDependency(String),

    #[error("Item {item} depends on later item {dependency}")]
    ForwardDependency { item: String, dependency: String },

    #[error("Item {item} depends on unknown item {dependency}")]
    UnknownDependency { item: String, dependency: String },

    #[error("No item with id {0}")]
    UnknownItem(String),
}

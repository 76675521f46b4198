//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the metadata store contract used by the coordinator and services.
//! - Isolate SQLite query details from orchestration code.
//!
//! # Invariants
//! - Repository writes call the model's `validate()` before persistence.
//! - Repository APIs return semantic errors (`NotFound`,
//!   `ConstraintViolation`) in addition to DB transport errors.

pub mod metadata_store;
pub mod task_repo;

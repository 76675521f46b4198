//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate store and collaborator calls into use-case level APIs.
//! - Keep callers decoupled from storage details.
//!
//! Layering, leaves first: `locks` → `coordinator` → `curator` / `recall` /
//! `repair` → `memory_service`. `task_service` sits beside them on the task
//! repository.

pub mod coordinator;
pub mod curator;
pub mod locks;
pub mod memory_service;
pub mod recall;
pub mod repair;
pub mod task_service;

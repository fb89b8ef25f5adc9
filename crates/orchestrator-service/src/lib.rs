//! Service wrapper for the orchestrator.
//!
//! This crate provides the HTTP API and command-line interface used by the
//! `orchestrator` binary.
//!
//! # Components
//!
//! - `api`: endpoints for submitting work, raising events and inspecting
//!   instances
//! - `cli`: command-line arguments

pub mod api;
pub mod cli;

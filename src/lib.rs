//! Atelier — an AI code-generation service.
//!
//! Users submit a natural-language request; the service admits it
//! against a per-plan quota, leases an isolated sandbox, lets a model
//! drive a small set of tools against that sandbox, and persists a
//! single result per job. See [`generation`] for the pipeline itself.

pub mod config;
pub mod errors;
pub mod generation;

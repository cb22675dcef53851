//! Core of the forum automation bot: quotas, retries and recurring jobs.
//!
//! This crate is framework-agnostic. The persistent store, the forum API and the
//! completion service live behind ports (traits) implemented in adapter crates.

pub mod activity;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod maintenance;
pub mod ports;
pub mod quota;
pub mod service;
pub mod steps;
pub mod store;

pub use errors::{Error, Result};

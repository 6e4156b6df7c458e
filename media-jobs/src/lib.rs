//! media-jobs library crate.
//!
//! A durable job engine for resumable media pipelines: a SQLite-backed
//! queue with claim, lock and retry, a bounded-concurrency worker, and
//! checkpointed video acquisition and dubbing pipelines.

pub mod cli;
pub mod config;
pub mod database;
pub mod domain;
pub mod download;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};

//! # Ferro Station engine (ferro-station)
//!
//! Acquisition and classification core of the inspection station: reads
//! line-oriented measurement frames from the test fixture, classifies each
//! shot against session thresholds, and drives the per-part test lifecycle
//! (pass, error, retest, crack) over a persistence gateway.
//!
//! **Architecture:** one reader task producing onto a bounded frame channel,
//! one consumer task owning the ledger (single-writer), broadcast events out
//! to presentation.

pub mod classify;
pub mod config;
pub mod ledger;
pub mod lifecycle;
pub mod parser;
pub mod pipeline;
pub mod reader;

pub use ferro_common::{Error, Result};
pub use pipeline::{IngestionPipeline, StationHandle};

//! `bi-utils` - data plumbing for BI workflows
//!
//! This library moves tables between local CSV files, S3 and a Redshift
//! warehouse, builds SQL text, checks data quality and ships exports from a
//! background queue. Small statistical transformers and regression metrics
//! round it out.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod aws;
pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod files;
pub mod frame;
pub mod logging;
pub mod metrics;
pub mod qa;
pub mod recipes;
pub mod retry;
pub mod sql;
pub mod system;
pub mod transformers;

pub use aws::Warehouse;
pub use config::Config;
pub use error::{Error, Result};
pub use exporter::{ExportTarget, QueueExporter};
pub use frame::{DType, Frame, Value};
pub use logging::init_logging;

//! Core types and utilities for the shardgate replicating S3 proxy.
//!
//! This crate provides the building blocks shared by every other crate:
//! - Configuration management (TOML)
//! - Error types
//! - Hybrid logical clock and the object versions derived from it
//! - Consistency levels and S3 request-shape helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hlc;
pub mod types;
pub mod version;

pub use config::{
    BackendConfig, Config, ConfigValidationError, FeederConfig, LogFormat, LoggingConfig,
    RegionConfig, RepairConfig, ServerConfig, WatchdogConfig,
};
pub use error::{error_document, Error, Result, S3ErrorCode};
pub use hlc::{ClockError, HlcClock, HlcTimestamp, MAX_CLOCK_SKEW_MS};
pub use types::{ConsistencyLevel, ParseConsistencyLevelError, RequestShape, RingProps};
pub use version::{ObjectVersion, ParseObjectVersionError};

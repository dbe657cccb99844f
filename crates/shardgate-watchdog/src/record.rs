// Copyright 2024 The Shardgate Authors
// SPDX-License-Identifier: Apache-2.0

//! Consistency records.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardgate_core::ObjectVersion;

/// The mutation a record asks the repair pipeline to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordMethod {
    /// The object should exist on every backend.
    Put,
    /// The object should exist on no backend.
    Delete,
}

impl RecordMethod {
    /// Returns the HTTP method name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RecordMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RecordMethod {
    type Err = ParseRecordMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUT" | "POST" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseRecordMethodError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid record method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRecordMethodError(String);

impl fmt::Display for ParseRecordMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid record method: {}", self.0)
    }
}

impl std::error::Error for ParseRecordMethodError {}

/// A record about to be inserted.
///
/// Without an explicit `version` the ledger stamps the record from its
/// clock; with one (read-repair, multipart completion echo) the record keeps
/// it and the clock is advanced past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    /// Correlation id of the originating request.
    pub request_id: String,
    /// `bucket/key`.
    pub object_id: String,
    /// Mutation to converge.
    pub method: RecordMethod,
    /// Domain the request was addressed to.
    pub domain: String,
    /// Access key of the originating request.
    pub access_key: String,
    /// Time to wait before the record becomes due.
    pub execution_delay: Duration,
    /// Explicit version, if already known.
    pub version: Option<ObjectVersion>,
}

impl NewRecord {
    /// Creates a record stamped by the ledger.
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
        method: RecordMethod,
        execution_delay: Duration,
    ) -> Self {
        Self {
            request_id: String::new(),
            object_id: object_id.into(),
            method,
            domain: domain.into(),
            access_key: String::new(),
            execution_delay,
            version: None,
        }
    }

    /// Sets the request correlation id.
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Sets the access key.
    #[must_use]
    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = key.into();
        self
    }

    /// Stamps the record with an explicit version.
    #[must_use]
    pub fn version(mut self, version: ObjectVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// A durable record of a mutation that may need repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyRecord {
    /// Correlation id of the originating request.
    pub request_id: String,
    /// `bucket/key`.
    pub object_id: String,
    /// Mutation to converge.
    pub method: RecordMethod,
    /// Domain the request was addressed to.
    pub domain: String,
    /// Access key of the originating request.
    pub access_key: String,
    /// Version stamped at insertion. Never renumbered.
    pub object_version: ObjectVersion,
    /// Time after `updated_at` at which the record becomes due.
    pub execution_delay: Duration,
    /// Last repair failure, if any.
    pub error: Option<String>,
    /// Insertion time; anchor for `execution_delay`.
    pub updated_at: DateTime<Utc>,
}

impl ConsistencyRecord {
    /// Returns the time at which the record becomes visible to the feeder.
    pub fn due_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.execution_delay)
            .ok()
            .and_then(|delay| self.updated_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true once `updated_at + execution_delay` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at() < now
    }

    /// Returns the bucket part of the object id.
    pub fn bucket(&self) -> &str {
        self.object_id.split_once('/').map_or(self.object_id.as_str(), |(bucket, _)| bucket)
    }

    /// Returns the key part of the object id.
    pub fn key(&self) -> &str {
        self.object_id.split_once('/').map_or("", |(_, key)| key)
    }

    /// Returns the marker that compacts this record and every older one for
    /// the same object.
    pub fn marker(&self) -> DeleteMarker {
        DeleteMarker {
            domain: self.domain.clone(),
            object_id: self.object_id.clone(),
            version: self.object_version,
            request_id: self.request_id.clone(),
        }
    }
}

/// Handle returned by an insert.
///
/// Deleting by marker removes every record of `(domain, object_id)` with a
/// version at or below `version`. `request_id` pins the exact record for
/// in-place updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteMarker {
    /// Domain of the record.
    pub domain: String,
    /// `bucket/key`.
    pub object_id: String,
    /// Version of the record.
    pub version: ObjectVersion,
    /// Correlation id of the record.
    pub request_id: String,
}

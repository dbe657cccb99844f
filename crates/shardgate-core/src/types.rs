// Copyright 2024 The Shardgate Authors
// SPDX-License-Identifier: Apache-2.0

//! Consistency levels and the request-shape rules used to route S3 calls.

use std::borrow::Cow;

use http::{Method, Uri};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// How strictly a region records replicated writes.
///
/// ```text
/// Level  | Ledger insert failure     | Records written
/// -------|---------------------------|----------------
/// none   | n/a                       | never
/// weak   | logged, request proceeds  | yes
/// strong | request fails with 503    | yes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// Nothing is recorded for repair.
    None,
    /// Records are best-effort.
    #[default]
    Weak,
    /// A write is only attempted once its record is durable.
    Strong,
}

impl ConsistencyLevel {
    /// Returns true if requests at this level are recorded in the ledger.
    #[inline]
    pub fn records(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns the name of this consistency level.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Weak => "weak",
            Self::Strong => "strong",
        }
    }
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = ParseConsistencyLevelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "weak" => Ok(Self::Weak),
            "strong" => Ok(Self::Strong),
            _ => Err(ParseConsistencyLevelError(s.to_string())),
        }
    }
}

/// Error parsing a consistency level string.
#[derive(Debug, Clone)]
pub struct ParseConsistencyLevelError(String);

impl std::fmt::Display for ParseConsistencyLevelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid consistency level '{}': expected 'none', 'weak', or 'strong'", self.0)
    }
}

impl std::error::Error for ParseConsistencyLevelError {}

/// Per-domain properties of a shard ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RingProps {
    /// Consistency level for writes in this domain.
    pub consistency_level: ConsistencyLevel,
    /// Whether reads may request a read-repair record.
    pub read_repair: bool,
}

/// Query parameters accepted by bucket listings. Anything else on a bucket
/// GET is a subresource (`?acl`, `?uploads`, ...).
const LISTING_PARAMS: &[&str] = &[
    "prefix",
    "delimiter",
    "marker",
    "max-keys",
    "list-type",
    "continuation-token",
    "start-after",
    "encoding-type",
    "fetch-owner",
];

/// The routing-relevant shape of an S3 request: method, path segments and
/// query keys.
#[derive(Debug, Clone)]
pub struct RequestShape {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
}

impl RequestShape {
    /// Classifies a request from its method and URI.
    pub fn new(method: &Method, uri: &Uri) -> Self {
        let path = uri.path().trim_matches('/').to_string();
        let query = uri.query().map(parse_query).unwrap_or_default();
        Self { method: method.clone(), path, query }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    fn segment_count(&self) -> usize {
        self.path.split('/').filter(|s| !s.is_empty()).count()
    }

    /// True if the path names an object: at least two non-empty segments.
    pub fn is_object_path(&self) -> bool {
        self.segment_count() >= 2
    }

    /// True if the path names a bucket: exactly one non-empty segment.
    pub fn is_bucket_path(&self) -> bool {
        self.segment_count() == 1
    }

    /// Returns `bucket/key` for object paths.
    pub fn object_id(&self) -> Option<&str> {
        self.is_object_path().then_some(self.path.as_str())
    }

    /// Returns the first path segment.
    pub fn bucket(&self) -> Option<&str> {
        self.path.split('/').find(|s| !s.is_empty())
    }

    /// True if the query string carries `key`, with or without a value.
    pub fn has_query(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    /// Returns the decoded value of query parameter `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// POST with `uploads`: starts a multipart upload.
    pub fn is_initiate_multipart(&self) -> bool {
        self.method == Method::POST && self.has_query("uploads")
    }

    /// POST with `uploadId`: assembles a multipart upload.
    pub fn is_complete_multipart(&self) -> bool {
        self.method == Method::POST && self.has_query("uploadId")
    }

    /// PUT with `uploadId`: uploads one part.
    pub fn is_part_upload(&self) -> bool {
        self.method == Method::PUT && self.has_query("uploadId")
    }

    /// DELETE with `uploadId`: aborts a multipart upload.
    pub fn is_abort_multipart(&self) -> bool {
        self.method == Method::DELETE && self.has_query("uploadId")
    }

    /// Any request that belongs to a multipart upload.
    pub fn is_multipart(&self) -> bool {
        self.has_query("uploads") || self.has_query("uploadId")
    }

    /// GET on a bucket path without subresources.
    pub fn is_listing(&self) -> bool {
        self.method == Method::GET
            && self.is_bucket_path()
            && self.query.iter().all(|(k, _)| LISTING_PARAMS.contains(&k.as_str()))
    }

    /// DELETE of an object (not a multipart abort).
    pub fn is_object_delete(&self) -> bool {
        self.method == Method::DELETE && self.is_object_path() && !self.has_query("uploadId")
    }
}

fn decode(s: &str) -> String {
    let plus_free: Cow<'_, str> =
        if s.contains('+') { Cow::Owned(s.replace('+', " ")) } else { Cow::Borrowed(s) };
    percent_decode_str(&plus_free).decode_utf8_lossy().into_owned()
}

/// Splits and decodes a raw query string.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

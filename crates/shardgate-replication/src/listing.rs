//! Merging of `ListBucketResult` documents from several backends.
//!
//! Each backend lists its own copy of the bucket. The merged page is the
//! union of all entries, de-duplicated by key, sorted, and re-truncated to
//! the requested page size. Keys and common prefixes share one page budget,
//! as in S3.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Default page size for S3 listings.
pub const DEFAULT_MAX_KEYS: usize = 1000;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// One `<Contents>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Object key.
    #[serde(rename = "Key")]
    pub key: String,
    /// Last modification time as sent by the backend.
    #[serde(rename = "LastModified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Entity tag.
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Object size.
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Storage class.
    #[serde(rename = "StorageClass", default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Object owner.
    #[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
}

/// Owner of a listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Canonical user id.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Display name.
    #[serde(rename = "DisplayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One `<CommonPrefixes>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonPrefix {
    /// The rolled-up prefix.
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

/// A `ListBucketResult` document (ListObjects v1 or v2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketResult {
    /// XML namespace.
    #[serde(rename = "@xmlns", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,
    /// Bucket name.
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Requested prefix.
    #[serde(rename = "Prefix", default)]
    pub prefix: String,
    /// v1 start marker.
    #[serde(rename = "Marker", default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// v1 continuation marker.
    #[serde(rename = "NextMarker", default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
    /// v2 request continuation token.
    #[serde(rename = "ContinuationToken", default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    /// v2 continuation token.
    #[serde(rename = "NextContinuationToken", default, skip_serializing_if = "Option::is_none")]
    pub next_continuation_token: Option<String>,
    /// v2 start-after key.
    #[serde(rename = "StartAfter", default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<String>,
    /// v2 number of returned entries.
    #[serde(rename = "KeyCount", default, skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
    /// Page size.
    #[serde(rename = "MaxKeys", default, skip_serializing_if = "Option::is_none")]
    pub max_keys: Option<usize>,
    /// Delimiter.
    #[serde(rename = "Delimiter", default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    /// Encoding type.
    #[serde(rename = "EncodingType", default, skip_serializing_if = "Option::is_none")]
    pub encoding_type: Option<String>,
    /// More entries follow.
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    /// Objects.
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListEntry>,
    /// Common prefixes.
    #[serde(rename = "CommonPrefixes", default)]
    pub common_prefixes: Vec<CommonPrefix>,
}

impl ListBucketResult {
    /// Parses a listing body.
    pub fn parse(body: &[u8]) -> Result<Self, quick_xml::de::DeError> {
        let text =
            std::str::from_utf8(body).map_err(|e| quick_xml::de::DeError::Custom(e.to_string()))?;
        quick_xml::de::from_str(text)
    }

    /// Serializes the listing with an XML declaration.
    pub fn to_xml(&self) -> Result<String, quick_xml::se::SeError> {
        let mut out = String::from(XML_DECLARATION);
        quick_xml::se::to_writer(&mut out, self)?;
        Ok(out)
    }

    fn key_set(&self) -> BTreeSet<&str> {
        self.contents
            .iter()
            .map(|e| e.key.as_str())
            .chain(self.common_prefixes.iter().map(|p| p.prefix.as_str()))
            .collect()
    }
}

/// Parameters of the listing request being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListParams {
    /// Requested page size.
    pub max_keys: usize,
    /// ListObjectsV2 (`list-type=2`).
    pub v2: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        Self { max_keys: DEFAULT_MAX_KEYS, v2: false }
    }
}

/// The merged page.
#[derive(Debug, Clone)]
pub struct MergedListing {
    /// The page to return to the client.
    pub result: ListBucketResult,
    /// True if the backends did not all list the same entries.
    pub mismatch: bool,
}

enum Item {
    Key(ListEntry),
    Prefix(String),
}

impl Item {
    fn name(&self) -> &str {
        match self {
            Self::Key(entry) => &entry.key,
            Self::Prefix(prefix) => prefix,
        }
    }
}

/// Merges the listings of several backends into one page.
///
/// Returns `None` when `listings` is empty.
pub fn merge_listings(
    listings: Vec<ListBucketResult>,
    params: ListParams,
) -> Option<MergedListing> {
    let mut iter = listings.into_iter();
    let first = iter.next()?;
    let rest: Vec<ListBucketResult> = iter.collect();

    let first_keys: BTreeSet<String> = first.key_set().into_iter().map(str::to_owned).collect();
    let mismatch = rest.iter().any(|l| {
        let keys = l.key_set();
        keys.len() != first_keys.len() || keys.iter().any(|k| !first_keys.contains(*k))
    });

    let mut any_truncated = first.is_truncated;
    let mut items: BTreeMap<String, Item> = BTreeMap::new();
    let mut template = first;
    let contents = std::mem::take(&mut template.contents);
    let prefixes = std::mem::take(&mut template.common_prefixes);
    absorb(&mut items, contents, prefixes);
    for listing in rest {
        any_truncated |= listing.is_truncated;
        absorb(&mut items, listing.contents, listing.common_prefixes);
    }

    let max_keys = params.max_keys;
    let total = items.len();
    let page: Vec<Item> = items.into_values().take(max_keys).collect();
    let truncated = any_truncated || total > max_keys;
    let last = if truncated { page.last().map(|item| item.name().to_string()) } else { None };

    let mut result = template;
    result.is_truncated = truncated;
    result.max_keys = Some(max_keys);
    for item in page {
        match item {
            Item::Key(entry) => result.contents.push(entry),
            Item::Prefix(prefix) => result.common_prefixes.push(CommonPrefix { prefix }),
        }
    }
    if params.v2 {
        result.key_count = Some(result.contents.len() + result.common_prefixes.len());
        result.next_continuation_token = last;
        result.next_marker = None;
    } else {
        result.next_marker = last;
        result.next_continuation_token = None;
    }

    Some(MergedListing { result, mismatch })
}

fn absorb(
    items: &mut BTreeMap<String, Item>,
    contents: Vec<ListEntry>,
    prefixes: Vec<CommonPrefix>,
) {
    for entry in contents {
        items.entry(entry.key.clone()).or_insert(Item::Key(entry));
    }
    for p in prefixes {
        items.entry(p.prefix.clone()).or_insert(Item::Prefix(p.prefix));
    }
}

//! Image usage data models
//!
//! `ImageUsageEvent` is the append-only fact recorded for every container of a
//! pod, once when the pod is observed running and once when it is removed.
//! The JSON representation is the wire format served by the query endpoint.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an event records the start or the removal of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Container observed running (`deletedAt` empty)
    Added,
    /// Pod removed (`deletedAt` populated)
    Deleted,
}

impl EventKind {
    /// Stable name used in the dedup column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container image usage fact.
///
/// Field order matches the JSON schema so serialized records are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUsageEvent {
    pub pod: String,
    pub container: String,
    pub image: String,
    #[serde(rename = "imageID")]
    pub image_id: String,
    pub namespace: String,
    #[serde(with = "rfc3339")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "rfc3339_or_empty", default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ImageUsageEvent {
    /// Kind of the event, derived from `deleted_at`.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        if self.deleted_at.is_some() {
            EventKind::Deleted
        } else {
            EventKind::Added
        }
    }

    /// Key under which at most one record may be stored.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            container: self.container.clone(),
            started_at: format_timestamp(&self.started_at),
            kind: self.kind(),
        }
    }
}

/// Identity of a logical event: `(namespace, pod, container, startedAt, kind)`.
///
/// `deletedAt` is not part of the key: a redelivered delete maps to the same
/// key as the first one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub started_at: String,
    pub kind: EventKind,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}#{}",
            self.namespace, self.pod, self.container, self.started_at, self.kind
        )
    }
}

/// Format a timestamp as RFC3339 with second precision and a `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

/// Current wall clock, truncated to whole seconds.
#[must_use]
pub fn now_truncated() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

mod rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

mod rfc3339_or_empty {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&super::format_timestamp(ts)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw.is_empty() {
            return Ok(None);
        }
        super::parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

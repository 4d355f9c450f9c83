//! Bucket notification records.
//!
//! Records follow the familiar S3 event shape (`eventName`, `eventTime`,
//! `s3.bucket`, `s3.object`) so existing consumers can parse the SSE payload
//! without a custom schema. Nothing here is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::object::Object;

/// Event classes a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ObjectCreated,
    ObjectRemoved,
}

impl EventType {
    /// Prefix shared by every concrete event name of this class.
    pub fn prefix(self) -> &'static str {
        match self {
            EventType::ObjectCreated => "s3:ObjectCreated:",
            EventType::ObjectRemoved => "s3:ObjectRemoved:",
        }
    }

    pub fn matches(self, event_name: &str) -> bool {
        event_name.starts_with(self.prefix())
    }
}

/// One object mutation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    pub s3: EventEntity,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntity {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(rename = "eTag", skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl EventRecord {
    /// `s3:ObjectCreated:Put` record for a freshly written object.
    pub fn created(bucket: &str, object: &Object) -> Self {
        Self {
            event_name: format!("{}Put", EventType::ObjectCreated.prefix()),
            event_time: object.last_modified,
            s3: EventEntity {
                bucket: BucketEntity {
                    name: bucket.to_string(),
                },
                object: ObjectEntity {
                    key: object.key.clone(),
                    size: Some(object.size_bytes),
                    e_tag: Some(object.etag.clone()),
                    content_type: object.content_type.clone(),
                },
            },
        }
    }

    /// `s3:ObjectRemoved:Delete` record; removed objects carry only their key.
    pub fn removed(bucket: &str, key: &str) -> Self {
        Self {
            event_name: format!("{}Delete", EventType::ObjectRemoved.prefix()),
            event_time: Utc::now(),
            s3: EventEntity {
                bucket: BucketEntity {
                    name: bucket.to_string(),
                },
                object: ObjectEntity {
                    key: key.to_string(),
                    size: None,
                    e_tag: None,
                    content_type: None,
                },
            },
        }
    }
}

/// A record set delivered by the backend as one unit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    pub records: Vec<EventRecord>,
}

impl Notification {
    pub fn single(record: EventRecord) -> Self {
        Self {
            records: vec![record],
        }
    }

    /// Keep only the records whose class is in `events`; `None` when nothing
    /// is left for this subscriber.
    pub fn retain_types(mut self, events: &[EventType]) -> Option<Self> {
        self.records
            .retain(|record| events.iter().any(|ty| ty.matches(&record.event_name)));
        if self.records.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

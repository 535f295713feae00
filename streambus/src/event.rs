use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;

use crate::broker::Record;
use crate::retry::RetryPayload;

/// Well-known record header carrying the route key used for dispatch.
pub const ROUTE_HEADER: &str = "x-stream-route";

/// One consumed record plus its routing metadata: the unit of dispatch.
///
/// An envelope is owned exclusively by its single in-flight dispatch and is
/// discarded after the commit/retry decision. The attribute map is
/// single-writer under that ownership, so it needs no lock: middleware and
/// handlers mutate it through `&mut` as the chain runs.
///
/// Besides the JSON attribute map there is a typed extension slot per type,
/// for decoded values that have no JSON representation (e.g. protobuf
/// messages).
pub struct Envelope {
    pub key: Bytes,
    pub value: Bytes,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Route key read from the [`ROUTE_HEADER`] header. Empty when the record
    /// carried none; the router sends those to its not-found handler.
    pub route: String,
    pub timestamp: Option<OffsetDateTime>,
    attributes: HashMap<String, Value>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Envelope {
    pub fn from_record(record: &Record) -> Self {
        let route = record
            .headers
            .get(ROUTE_HEADER)
            .cloned()
            .unwrap_or_default();
        Self {
            key: record.key.clone().map(Bytes::from).unwrap_or_default(),
            value: record.value.clone().map(Bytes::from).unwrap_or_default(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            route,
            timestamp: record.timestamp_ms.and_then(|ms| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
            }),
            attributes: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Build an envelope for a replayed dead-letter payload. Replayed
    /// envelopes carry no broker coordinates: handlers must key off the
    /// route, not topic/partition/offset.
    pub fn from_retry(payload: &RetryPayload) -> Self {
        Self {
            key: payload.key.clone(),
            value: payload.value.clone(),
            topic: String::new(),
            partition: -1,
            offset: -1,
            route: payload.route.clone(),
            timestamp: None,
            attributes: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn clear_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// The extension of type `T`, if one was set during this dispatch.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Store a typed extension, replacing any previous value of the same
    /// type.
    pub fn set_extension<T: Any + Send + Sync>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Remove the extension of type `T`. Returns whether one was present.
    pub fn clear_extension<T: Any + Send + Sync>(&mut self) -> bool {
        self.extensions.remove(&TypeId::of::<T>()).is_some()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("route", &self.route)
            .field("timestamp", &self.timestamp)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

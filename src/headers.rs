// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers
//!
//! Reserved header names used by the dispatcher, the transport-independent `HeaderValue`
//! type and the conversions between `Headers` and lapin's `FieldTable`.
//!
//! Every reserved header lives under the `x-message-dispatcher-` prefix. Broker values
//! without a scalar form (arrays, nested tables such as `x-death`, byte arrays) are kept
//! opaque so republished messages carry them unchanged.

use chrono::{SecondsFormat, Utc};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use tracing::debug;

/// Prefix shared by every reserved header
pub const HEADER_PREFIX: &str = "x-message-dispatcher-";
/// Semantic kind of the message (COMMAND, QUERY, NOTIFICATION, EVENT)
pub const HANDLER_TYPE: &str = "x-message-dispatcher-handler-type";
/// Short name of the payload type, used to select the handler
pub const BODY_TYPE: &str = "x-message-dispatcher-body-type";
/// Producer send time
pub const TIMESTAMP: &str = "x-message-dispatcher-timestamp";
/// Producer application identifier
pub const REMOTE_SERVICE: &str = "x-message-dispatcher-remoteService";
/// Application that produced a reply
pub const RESPONSE_FROM: &str = "x-message-dispatcher-response-from";
/// Time a reply was produced
pub const RESPONSE_TIMESTAMP: &str = "x-message-dispatcher-response-timestamp";
/// Root cause message, set when a message is dead-lettered
pub const EXCEPTION_MESSAGE: &str = "x-message-dispatcher-exception-message";
/// Root cause short type name, set when a message is dead-lettered
pub const EXCEPTION_ROOT_CAUSE: &str = "x-message-dispatcher-exception-root-cause";
/// Time a message was dead-lettered
pub const FAILED_AT: &str = "x-message-dispatcher-failed-at";
/// Number of processing attempts
pub const RETRY_COUNT: &str = "x-message-dispatcher-retry-count";

/// Codec discriminator that producers must never leak to consumers
pub const TYPE_ID: &str = "__TypeId__";

/// Ordered header map carried by every envelope.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Broker value without a scalar form, passed through as received.
    #[serde(skip)]
    Raw(AMQPValue),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Integer view of the value; numeric strings are accepted since some producers
    /// stamp counters as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Str(value) => value.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(value) => write!(f, "{value}"),
            HeaderValue::Int(value) => write!(f, "{value}"),
            HeaderValue::Float(value) => write!(f, "{value}"),
            HeaderValue::Str(value) => f.write_str(value),
            HeaderValue::Raw(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Current UTC time formatted the way every timestamp header is written.
pub fn now_timestamp() -> HeaderValue {
    HeaderValue::Str(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Converts dispatcher headers into the AMQP field table sent on the wire.
///
/// # Parameters
/// * `headers` - Headers to convert
///
/// # Returns
/// A FieldTable holding one AMQP value per header
pub fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Raw(v) => v.clone(),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table received from the broker into dispatcher headers.
///
/// Values without a scalar representation (arrays, nested tables such as `x-death`)
/// are kept as `HeaderValue::Raw`.
///
/// # Parameters
/// * `table` - The field table of an inbound message
///
/// # Returns
/// The headers the router and handlers see
pub fn from_field_table(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();

    for (key, value) in table.inner() {
        let converted = match value {
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            AMQPValue::ShortString(v) => HeaderValue::Str(v.as_str().to_owned()),
            AMQPValue::LongString(v) => {
                HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            other => {
                debug!(header = key.as_str(), "keeping non scalar header as is");
                HeaderValue::Raw(other.clone())
            }
        };

        headers.insert(key.as_str().to_owned(), converted);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers_share_the_prefix() {
        for name in [
            HANDLER_TYPE,
            BODY_TYPE,
            TIMESTAMP,
            REMOTE_SERVICE,
            RESPONSE_FROM,
            RESPONSE_TIMESTAMP,
            EXCEPTION_MESSAGE,
            EXCEPTION_ROOT_CAUSE,
            FAILED_AT,
            RETRY_COUNT,
        ] {
            assert!(name.starts_with(HEADER_PREFIX), "{name}");
        }
    }

    #[test]
    fn field_table_keeps_scalar_values() {
        let mut headers = Headers::new();
        headers.insert(BODY_TYPE.to_owned(), "Charge".into());
        headers.insert(RETRY_COUNT.to_owned(), 2i64.into());
        headers.insert("X-Flag".to_owned(), true.into());

        let back = from_field_table(&to_field_table(&headers));

        assert_eq!(back, headers);
    }

    #[test]
    fn nested_tables_survive_a_republish() {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from("app.inbox")),
        );
        let x_death = AMQPValue::FieldArray(vec![AMQPValue::FieldTable(FieldTable::from(death))].into());

        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("x-death"), x_death.clone());
        btree.insert(
            ShortString::from("X-Tenant"),
            AMQPValue::ShortString(ShortString::from("t1")),
        );

        let headers = from_field_table(&FieldTable::from(btree));
        assert_eq!(headers["X-Tenant"].as_str(), Some("t1"));
        assert_eq!(headers["x-death"], HeaderValue::Raw(x_death.clone()));

        let republished = to_field_table(&headers);
        assert_eq!(
            republished.inner().get(&ShortString::from("x-death")),
            Some(&x_death)
        );
    }

    #[test]
    fn retry_count_parses_text() {
        assert_eq!(HeaderValue::from("3").as_i64(), Some(3));
        assert_eq!(HeaderValue::from(true).as_i64(), None);
    }
}

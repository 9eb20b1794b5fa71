// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit moving through the broker: an opaque body, the header map and the
//! out-of-band transport properties used for request-reply.

use crate::{
    errors::DispatchError,
    handler::HandlerError,
    headers::{HeaderValue, Headers, BODY_TYPE, HANDLER_TYPE},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Semantic category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Mutates state; may reply.
    Command,
    /// Read-only; always replies.
    Query,
    /// Intra-domain, fire-and-forget.
    Notification,
    /// A fact that already happened; fire-and-forget, may fan out.
    Event,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Command,
        MessageKind::Query,
        MessageKind::Notification,
        MessageKind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "COMMAND",
            MessageKind::Query => "QUERY",
            MessageKind::Notification => "NOTIFICATION",
            MessageKind::Event => "EVENT",
        }
    }

    /// Commands and queries are the only kinds a caller can await a reply for.
    pub fn supports_reply(&self) -> bool {
        matches!(self, MessageKind::Command | MessageKind::Query)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| value.to_owned())
    }
}

/// Stable short name of a payload type: the last path segment without generics.
///
/// This is the name stamped into `body-type` and the name the registry keys on.
pub fn payload_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A message as it travels through the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Envelope {
            body: body.into(),
            ..Envelope::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(HeaderValue::as_str)
    }

    /// The `body-type` header, if present.
    pub fn body_type(&self) -> Option<&str> {
        self.header_str(BODY_TYPE)
    }

    /// Parses the `handler-type` header.
    ///
    /// # Returns
    /// * `Ok(None)` when the header is absent
    /// * `Err(DispatchError::InvalidHeader)` when it names no known kind
    pub fn kind(&self) -> Result<Option<MessageKind>, DispatchError> {
        match self.header(HANDLER_TYPE) {
            None => Ok(None),
            Some(value) => {
                let text = value.to_string();
                text.parse()
                    .map(Some)
                    .map_err(|_| DispatchError::InvalidHeader {
                        header: HANDLER_TYPE.to_owned(),
                        value: text,
                    })
            }
        }
    }

    /// A reply is expected whenever the producer supplied a non-blank `reply-to`.
    pub fn requires_reply(&self) -> bool {
        self.reply_to
            .as_deref()
            .is_some_and(|queue| !queue.trim().is_empty())
    }
}

/// Payload of every reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInvocationResult {
    /// Handler return value on success.
    pub value: Option<Value>,
    /// Failure description on failure.
    pub exception: Option<String>,
    /// Short type name of the original failure.
    pub exception_type: Option<String>,
    /// Application that produced the reply.
    pub remote_service: Option<String>,
}

impl RemoteInvocationResult {
    pub fn success(value: Option<Value>, remote_service: &str) -> Self {
        RemoteInvocationResult {
            value,
            exception: None,
            exception_type: None,
            remote_service: Some(remote_service.to_owned()),
        }
    }

    pub fn failure(error: &HandlerError, remote_service: &str) -> Self {
        RemoteInvocationResult {
            value: None,
            exception: Some(error.message().to_owned()),
            exception_type: Some(error.type_name().to_owned()),
            remote_service: Some(remote_service.to_owned()),
        }
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Charge;
    #[allow(dead_code)]
    struct Page<T>(T);

    #[test]
    fn payload_type_name_is_short() {
        assert_eq!(payload_type_name::<Charge>(), "Charge");
        assert_eq!(payload_type_name::<Page<Charge>>(), "Page");
        assert_eq!(payload_type_name::<String>(), "String");
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("command".parse::<MessageKind>(), Ok(MessageKind::Command));
        assert_eq!(" QUERY ".parse::<MessageKind>(), Ok(MessageKind::Query));
        assert!("RPC".parse::<MessageKind>().is_err());
    }

    #[test]
    fn invalid_handler_type_is_reported() {
        let envelope = Envelope::new(b"{}".to_vec()).with_header(HANDLER_TYPE, "RPC");
        assert_eq!(
            envelope.kind(),
            Err(DispatchError::InvalidHeader {
                header: HANDLER_TYPE.to_owned(),
                value: "RPC".to_owned(),
            })
        );
        assert_eq!(Envelope::default().kind(), Ok(None));
    }

    #[test]
    fn blank_reply_to_requires_no_reply() {
        assert!(!Envelope::default().with_reply_to("  ").requires_reply());
        assert!(Envelope::default().with_reply_to("rq1").requires_reply());
    }

    #[test]
    fn remote_result_uses_camel_case_on_the_wire() {
        let result = RemoteInvocationResult::failure(
            &HandlerError::new("InvalidArgumentError", "bad id"),
            "svc-B",
        );
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["exceptionType"], "InvalidArgumentError");
        assert_eq!(json["exception"], "bad id");
        assert_eq!(json["remoteService"], "svc-B");
        assert!(json["value"].is_null());
        assert!(result.has_exception());
    }
}

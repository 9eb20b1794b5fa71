// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # JSON Codec
//!
//! Payloads travel as JSON. The consumer side never trusts producer type hints:
//! the target type is chosen by the registry from `body-type` and the handler signature.

use crate::headers::{Headers, TYPE_ID};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failure to encode payload: {0}")]
    Encode(String),

    #[error("failure to decode payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|err| CodecError::Encode(err.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }

    /// Removes codec-specific discriminators before a message leaves the producer.
    pub fn strip_type_hints(&self, headers: &mut Headers) {
        headers.remove(TYPE_ID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Charge {
        amount: u32,
    }

    #[test]
    fn decodes_into_the_requested_type() {
        let codec = JsonCodec;
        let charge: Charge = codec.decode(br#"{"amount":10}"#).unwrap();
        assert_eq!(charge, Charge { amount: 10 });
    }

    #[test]
    fn decode_failure_is_reported() {
        let result = JsonCodec.decode::<Charge>(br#"{"amount":"ten"}"#);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn strips_type_id() {
        let mut headers = Headers::new();
        headers.insert(TYPE_ID.to_owned(), "com.acme.Charge".into());
        headers.insert("X-Tenant".to_owned(), "t1".into());

        JsonCodec.strip_type_hints(&mut headers);

        assert!(!headers.contains_key(TYPE_ID));
        assert!(headers.contains_key("X-Tenant"));
    }
}

//! Validation of xAPI statements sent by the players.
//!
//! Library-only: the statement endpoint lives in the user-facing API behind
//! JWT authentication, which this service does not serve. No route here
//! calls [`XapiStatement::from_slice`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum XapiError {
    #[error("invalid statement: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("verb id must be an absolute http(s) URL: {0:?}")]
    InvalidVerbId(String),

    #[error("statement id is not a UUID: {0:?}")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    pub id: String,
    pub display: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    pub extensions: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStatement {
    verb: Verb,
    context: Extensions,
    #[serde(default)]
    result: Option<Extensions>,
    #[serde(default)]
    id: Option<String>,
    timestamp: DateTime<Utc>,
}

/// A validated xAPI statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XapiStatement {
    pub id: Uuid,
    pub verb: Verb,
    pub context: Extensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Extensions>,
    pub timestamp: DateTime<Utc>,
}

impl XapiStatement {
    /// Validate a statement.
    ///
    /// A statement without id gets a fresh one.
    pub fn from_slice(body: &[u8]) -> Result<Self, XapiError> {
        let raw: RawStatement = serde_json::from_slice(body)?;

        match Url::parse(&raw.verb.id) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => return Err(XapiError::InvalidVerbId(raw.verb.id)),
        }

        let id = match raw.id {
            Some(id) => Uuid::parse_str(&id).map_err(|_| XapiError::InvalidId(id))?,
            None => Uuid::new_v4(),
        };

        Ok(Self {
            id,
            verb: raw.verb,
            context: raw.context,
            result: raw.result,
            timestamp: raw.timestamp,
        })
    }
}

//! Object keys delivered in upload policies.
//!
//! A key has the form
//! `{owner_id}/{model}/{object_id}/{stamp}[_{language}_{mode}][.{extension}]`
//! where `stamp` is the 10-digit Unix timestamp of the upload.

use crate::models::UploadableModel;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const UUID_PATTERN: &str =
    "[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}";

#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("object key does not match the upload key grammar: {0:?}")]
    Malformed(String),
}

/// Fields encoded in an object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub owner_id: Uuid,
    pub model: UploadableModel,
    pub object_id: Uuid,
    /// Unix timestamp of the upload
    pub stamp: i64,
    pub language: Option<String>,
    pub mode: Option<String>,
    pub extension: Option<String>,
}

impl ObjectKey {
    /// Upload time embedded in the key
    pub fn uploaded_on(&self) -> DateTime<Utc> {
        // stamps are at most ten digits, always within chrono's range
        DateTime::from_timestamp(self.stamp, 0).unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{:010}",
            self.owner_id, self.model, self.object_id, self.stamp
        )?;
        if let (Some(language), Some(mode)) = (&self.language, &self.mode) {
            write!(f, "_{language}_{mode}")?;
        }
        if let Some(extension) = &self.extension {
            write!(f, ".{extension}")?;
        }
        Ok(())
    }
}

/// Parser for object keys, compiled once from the configured track modes
#[derive(Debug, Clone)]
pub struct KeyParser {
    regex: Regex,
}

impl KeyParser {
    pub fn new<S: AsRef<str>>(track_modes: &[S]) -> Result<Self, regex::Error> {
        let models = UploadableModel::ALL
            .iter()
            .map(|m| m.s3_identifier())
            .collect::<Vec<_>>()
            .join("|");
        let modes = track_modes
            .iter()
            .map(|m| regex::escape(m.as_ref()))
            .collect::<Vec<_>>()
            .join("|");

        let pattern = format!(
            "^(?P<owner_id>{uuid})/(?P<model>{models})/(?P<object_id>{uuid})/(?P<stamp>[0-9]{{10}})\
             (?:_(?P<language>[a-z-]{{2,10}})_(?P<mode>{modes}))?\
             (?:\\.(?P<extension>[0-9a-z]{{1,10}}))?$",
            uuid = UUID_PATTERN,
        );

        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// Parse an object key, rejecting anything outside the grammar
    pub fn parse(&self, key: &str) -> Result<ObjectKey, KeyError> {
        let malformed = || KeyError::Malformed(key.to_string());
        let captures = self.regex.captures(key).ok_or_else(malformed)?;

        let uuid = |name: &str| {
            Uuid::parse_str(&captures[name]).map_err(|_| malformed())
        };

        Ok(ObjectKey {
            owner_id: uuid("owner_id")?,
            model: UploadableModel::from_s3_identifier(&captures["model"]).ok_or_else(malformed)?,
            object_id: uuid("object_id")?,
            stamp: captures["stamp"].parse().map_err(|_| malformed())?,
            language: captures.name("language").map(|m| m.as_str().to_string()),
            mode: captures.name("mode").map(|m| m.as_str().to_string()),
            extension: captures.name("extension").map(|m| m.as_str().to_string()),
        })
    }
}

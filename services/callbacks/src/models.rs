use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of an asset's binary payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Upload policy issued, nothing received yet
    Pending,
    /// Payload received, being converted
    Processing,
    /// Payload available
    Ready,
    /// Conversion failed
    Error,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Processing => "processing",
            UploadState::Ready => "ready",
            UploadState::Error => "error",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown upload state: {0}")]
pub struct UnknownUploadState(pub String);

impl FromStr for UploadState {
    type Err = UnknownUploadState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadState::Pending),
            "processing" => Ok(UploadState::Processing),
            "ready" => Ok(UploadState::Ready),
            "error" => Ok(UploadState::Error),
            other => Err(UnknownUploadState(other.to_string())),
        }
    }
}

/// The closed set of models whose payload lives in object storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadableModel {
    Video,
    Thumbnail,
    TimedTextTrack,
    Document,
}

impl UploadableModel {
    pub const ALL: [UploadableModel; 4] = [
        UploadableModel::Video,
        UploadableModel::Thumbnail,
        UploadableModel::TimedTextTrack,
        UploadableModel::Document,
    ];

    /// Name of the model as it appears in object keys
    pub fn s3_identifier(&self) -> &'static str {
        match self {
            UploadableModel::Video => "video",
            UploadableModel::Thumbnail => "thumbnail",
            UploadableModel::TimedTextTrack => "timedtexttrack",
            UploadableModel::Document => "document",
        }
    }

    pub fn from_s3_identifier(identifier: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|model| model.s3_identifier() == identifier)
    }

    /// Database table holding rows of this model
    pub fn table(&self) -> &'static str {
        match self {
            UploadableModel::Video => "video",
            UploadableModel::Thumbnail => "thumbnail",
            UploadableModel::TimedTextTrack => "timed_text_track",
            UploadableModel::Document => "document",
        }
    }

    /// Whether rows of this model record the extension of the uploaded file
    pub fn tracks_extension(&self) -> bool {
        matches!(self, UploadableModel::Document)
    }

    /// Validate the extra parameters sent along a callback for this model.
    ///
    /// Only the attributes the model actually stores are accepted, so a
    /// callback can never write an unrelated column.
    pub fn parse_attributes(
        &self,
        extra: &Map<String, Value>,
    ) -> Result<UploadAttributes, AttributeError> {
        let mut attributes = UploadAttributes::default();

        for (name, value) in extra {
            match (self, name.as_str()) {
                (UploadableModel::Video, "resolutions") => {
                    attributes.resolutions = Some(parse_resolutions(value)?);
                }
                (UploadableModel::Video, "duration") => {
                    let duration = value
                        .as_f64()
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .ok_or_else(|| AttributeError::Invalid {
                            name: name.clone(),
                            reason: "expected a non-negative number of seconds".to_string(),
                        })?;
                    attributes.duration = Some(duration);
                }
                (UploadableModel::Document, "extension") => {
                    // An explicit null falls back to the extension carried by the key
                    if !value.is_null() {
                        attributes.extension = Some(parse_extension(value)?);
                    }
                }
                _ => {
                    return Err(AttributeError::Unknown {
                        model: *self,
                        name: name.clone(),
                    })
                }
            }
        }

        Ok(attributes)
    }
}

impl fmt::Display for UploadableModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.s3_identifier())
    }
}

/// Errors raised while validating callback extra parameters
#[derive(Debug, Error, PartialEq)]
pub enum AttributeError {
    #[error("{model} does not accept the attribute {name:?}")]
    Unknown { model: UploadableModel, name: String },

    #[error("invalid value for {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Type-specific attributes applied together with an upload state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadAttributes {
    /// Video resolutions found by the transcoding pipeline
    pub resolutions: Option<Vec<i32>>,
    /// Video duration in seconds
    pub duration: Option<f64>,
    /// Extension of an uploaded document
    pub extension: Option<String>,
}

fn parse_resolutions(value: &Value) -> Result<Vec<i32>, AttributeError> {
    let invalid = || AttributeError::Invalid {
        name: "resolutions".to_string(),
        reason: "expected an array of positive integers".to_string(),
    };

    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|r| {
            r.as_i64()
                .filter(|r| *r > 0)
                .and_then(|r| i32::try_from(r).ok())
                .ok_or_else(invalid)
        })
        .collect()
}

fn parse_extension(value: &Value) -> Result<String, AttributeError> {
    value
        .as_str()
        .filter(|ext| {
            (1..=10).contains(&ext.len())
                && ext
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
        .map(str::to_string)
        .ok_or_else(|| AttributeError::Invalid {
            name: "extension".to_string(),
            reason: "expected 1 to 10 lowercase alphanumeric characters".to_string(),
        })
}

/// Result of applying an upload state to a persisted row
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub previous: UploadState,
    pub current: UploadState,
    pub uploaded_on: Option<DateTime<Utc>>,
    pub extension: Option<String>,
}

impl StateTransition {
    /// True when this transition completes an upload: the row was not READY
    /// before and is READY now. Redelivering READY is not a completion.
    pub fn completes_upload(&self) -> bool {
        self.previous != UploadState::Ready && self.current == UploadState::Ready
    }
}

/// Harvest status of a live recording slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestStatus {
    #[default]
    Pending,
    Harvested,
}

/// A slice of a live recording, stored in the video's `recording_slices` column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSlice {
    /// Unix timestamp at which the slice started
    pub start: i64,
    /// Unix timestamp at which the slice stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(default)]
    pub status: HarvestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_key: Option<String>,
}

impl RecordingSlice {
    /// Record the manifest produced by a harvest job.
    ///
    /// Returns true when the slice belongs to `harvest_job_id`.
    pub fn set_manifest_key(&mut self, harvest_job_id: &str, manifest_key: &str) -> bool {
        if self.harvest_job_id.as_deref() != Some(harvest_job_id) {
            return false;
        }
        self.manifest_key = Some(manifest_key.to_string());
        self.status = HarvestStatus::Harvested;
        true
    }
}

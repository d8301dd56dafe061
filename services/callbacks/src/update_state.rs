use crate::error::ApiError;
use crate::models::{StateTransition, UploadState};
use crate::notifier::{EventSender, UploadEvent};
use crate::object_key::KeyParser;
use crate::store::{UploadStateChange, UploadStore};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Payload of an update-state callback
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStateRequest {
    /// Object key as delivered in the upload policy
    pub key: String,
    /// New upload state
    pub state: UploadState,
    /// Type-specific attributes computed by the pipeline
    #[serde(rename = "extraParameters", default)]
    pub extra_parameters: Map<String, Value>,
}

/// Applies authenticated upload-state callbacks to persisted objects
pub struct UploadStateUpdater {
    parser: KeyParser,
    store: Arc<dyn UploadStore>,
    events: EventSender,
}

impl UploadStateUpdater {
    pub fn new(parser: KeyParser, store: Arc<dyn UploadStore>, events: EventSender) -> Self {
        Self {
            parser,
            store,
            events,
        }
    }

    /// Apply a callback and emit an event if it completes the upload.
    ///
    /// Nothing is written unless the key, state and extra parameters are all
    /// valid for the targeted model.
    #[instrument(skip(self, request), fields(key = %request.key, state = %request.state))]
    pub async fn apply(&self, request: UpdateStateRequest) -> Result<StateTransition, ApiError> {
        if request.state == UploadState::Pending {
            return Err(ApiError::Validation(
                "state must be one of processing, ready or error".to_string(),
            ));
        }

        let key = self
            .parser
            .parse(&request.key)
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        let mut attributes = key
            .model
            .parse_attributes(&request.extra_parameters)
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        let is_ready = request.state == UploadState::Ready;
        if is_ready && key.model.tracks_extension() && attributes.extension.is_none() {
            attributes.extension = key.extension.clone();
        }

        let change = UploadStateChange {
            state: request.state,
            uploaded_on: is_ready.then(|| key.uploaded_on()),
            attributes,
        };

        let transition = self
            .store
            .apply_upload_state(key.model, key.object_id, &change)
            .await?
            .ok_or(ApiError::NotFound)?;

        metrics::counter!(
            "callbacks.update_state.applied",
            "model" => key.model.s3_identifier(),
            "state" => request.state.as_str()
        )
        .increment(1);

        if transition.completes_upload() {
            info!(
                model = %key.model,
                object_id = %key.object_id,
                "Upload completed"
            );
            self.events.publish(UploadEvent::ObjectUploaded {
                model: key.model,
                object_id: key.object_id,
                uploaded_on: transition.uploaded_on,
                extension: transition.extension.clone(),
            });
        } else {
            debug!(
                model = %key.model,
                object_id = %key.object_id,
                previous = %transition.previous,
                current = %transition.current,
                "Upload state applied"
            );
        }

        Ok(transition)
    }
}

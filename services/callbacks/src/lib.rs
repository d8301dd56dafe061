//! Marsha Callbacks Service
//!
//! Receives the signed callbacks sent by the Marsha upload pipeline once an
//! object dropped in the source bucket has been processed, and applies them
//! to the persisted videos, thumbnails, timed text tracks and documents.
//!
//! ## Features
//!
//! - **Signed Callbacks**: every payload is authenticated with an HMAC-SHA256
//!   signature checked against a rotating list of shared secrets
//! - **Object Key Grammar**: keys of the form
//!   `{owner}/{model}/{object}/{stamp}[_{lang}_{mode}][.{ext}]` identify the
//!   targeted object and its upload time
//! - **Upload State Machine**: `pending → processing → ready`, and
//!   `pending|processing → error`, applied under a row lock
//! - **Object Uploaded Events**: exactly one event per completed upload,
//!   fanned out to subscribers (Kafka, logs)
//! - **Recording Slices**: manifest bookkeeping for live recording harvests
//!
//! ## Architecture
//!
//! ```text
//! Upload pipeline            Callbacks API              PostgreSQL
//! ┌──────────────┐  signed   ┌──────────────┐          ┌──────────────┐
//! │ Lambda       │──────────▶│ Signature    │          │ video        │
//! │ callbacks    │  POST     │ Validator    │          │ thumbnail    │
//! └──────────────┘           └──────────────┘          │ document     │
//!                                   │                  └──────────────┘
//!                                   ▼                         ▲
//!                            ┌──────────────┐                 │
//!                            │ Key Parser + │─────────────────┘
//!                            │ State Updater│
//!                            └──────────────┘
//!                                   │ ObjectUploaded
//!                                   ▼
//!                            ┌──────────────┐           ┌──────────────┐
//!                            │ Event        │──────────▶│ Kafka        │
//!                            │ Dispatcher   │           │ topic        │
//!                            └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod notifier;
pub mod object_key;
pub mod signature;
pub mod store;
pub mod update_state;
pub mod xapi;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::ApiError;
pub use models::{RecordingSlice, StateTransition, UploadState, UploadableModel};
pub use notifier::{EventDispatcher, EventSender, UploadEvent, UploadSubscriber};
pub use object_key::{KeyParser, ObjectKey};
pub use signature::SignatureValidator;
pub use store::{PgUploadStore, UploadStore};
pub use update_state::{UpdateStateRequest, UploadStateUpdater};
pub use xapi::XapiStatement;

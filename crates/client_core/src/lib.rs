//! Client side of the commute calculation workflow.
//!
//! [`UploadController`] validates the address and file inputs, posts one
//! calculation at a time to the compute service, relays pushed progress to a
//! [`View`] and exposes the result either as a server-side download or as a
//! locally held blob, depending on the configured [`DeliveryMode`].

pub mod blobs;
pub mod config;
pub mod controller;
pub mod error;
pub mod notices;
pub mod progress;
pub mod progress_channel;
pub mod transport;
pub mod types;
pub mod view;

pub use config::{load_settings, ClientSettings};
pub use controller::{SessionSnapshot, UploadController, DEFAULT_RESULT_FILENAME};
pub use error::ControllerError;
pub use progress_channel::{LocalProgressChannel, ProgressChannel, WsProgressChannel};
pub use shared::domain::{DeliveryMode, SessionStatus, Severity};
pub use transport::{ComputeReply, ComputeService, Endpoints, HttpComputeService};
pub use types::{BlobDownload, CalculationUpload, Notice, ResultHandle, SelectedFile, ValidationInputs};
pub use view::View;

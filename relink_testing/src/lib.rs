//! In-memory collaborators and fixtures for exercising `relink` in tests.
//!
//! Every fake records the calls it receives and can be scripted ahead of time,
//! so a test can drive an incident end to end without a messaging client.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use relink::{CollaboratorError, HealthMonitor};
//! use relink_testing::{FakeDirectory, FakeSessionControl, RecordingNotifier, RecordingSender};
//!
//! let control = Arc::new(FakeSessionControl::new());
//! control.script_reconnects([Err(CollaboratorError::Unavailable("down".into()))]);
//! let monitor = HealthMonitor::builder()
//!     .session_control(control.clone())
//!     .message_sender(Arc::new(RecordingSender::new()))
//!     .operator_notifier(Arc::new(RecordingNotifier::new()))
//!     .directory(Arc::new(FakeDirectory::new()))
//!     .build()
//!     .expect("valid monitor");
//! # drop(monitor);
//! ```

pub mod fakes;
pub mod logging;
pub mod metrics;

pub use fakes::{ControlCall, FakeDirectory, FakeSessionControl, RecordingNotifier, RecordingSender};
pub use logging::{LoggerHandle, logger};
pub use metrics::{counter_value, gauge_value};

use relink::{ErrorCategory, OutboundMessage, ProtocolError};

/// Message addressed to `peer` with a fixed body.
#[must_use]
pub fn message(id: &str, peer: &str) -> OutboundMessage { OutboundMessage::new(id, peer, &b"payload"[..]) }

/// A protocol error the classifier treats as session corruption.
#[must_use]
pub fn corrupt_session_error() -> ProtocolError {
    ProtocolError::new(ErrorCategory::MacVerification, "Bad MAC")
}

/// A protocol error the classifier ignores.
#[must_use]
pub fn transient_error() -> ProtocolError {
    ProtocolError::new(ErrorCategory::Transport, "Connection Closed")
}

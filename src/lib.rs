#![doc(html_root_url = "https://docs.rs/relink/latest")]
//! Connection-health detection and recovery for cryptographically stateful
//! messaging sessions.
//!
//! Protocol errors are classified, counted per connection inside a fixed
//! observation window and, once a threshold is crossed, trigger a single
//! recovery procedure that tears the session down and rebuilds it. Outbound
//! messages that failed while the session was broken wait in a retry queue and
//! are resent once the connection verifies healthy. A periodic scan feeds the
//! same pipeline from recorded error signals.
//!
//! [`HealthMonitor`] wires everything together; the individual components are
//! public for embedders that need finer control.

pub mod classifier;
pub mod config;
pub mod error;
pub mod incident;
pub mod metrics;
pub mod monitor;
pub mod panic;
pub mod ports;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use classifier::{ErrorCategory, ProtocolError, classify};
pub use config::HealthConfig;
pub use error::{BuildError, CollaboratorError, ConfigError, RecoveryStep, StepError};
pub use incident::{
    ConnectionIncident,
    IncidentDecision,
    IncidentSummary,
    IncidentTracker,
    RecoveryState,
};
pub use monitor::{HealthMonitor, HealthMonitorBuilder, SweepReport};
pub use ports::{ConnectionDirectory, MessageSender, OperatorNotifier, SessionControl};
pub use recovery::{RecoveryOrchestrator, RecoveryOutcome, RecoveryPorts};
pub use retry::{
    DrainReport,
    EnqueueOutcome,
    OutboundMessage,
    PendingOutboundMessage,
    PendingRetryQueue,
    RetryStats,
};
pub use scheduler::{HealthCheckScheduler, ScanReport, SchedulerState};
pub use session::{ConnectionId, ConnectionStatus, TenantId};

//! Recognition of cryptographic-session corruption.
//!
//! The messaging integration tags every failure with an [`ErrorCategory`].
//! [`classify`] answers whether that failure is consistent with a corrupted
//! session (key mismatch, MAC failure, replay or ordering failure, missing
//! session) rather than a transport or application problem.
//!
//! Failures the integration cannot tag arrive as
//! [`ErrorCategory::Unclassified`]; those fall back to matching the message,
//! type tag and stack signature against [`CORRUPTION_PATTERNS`]. The matcher
//! is conservative: any [`TRANSPORT_PATTERNS`] marker vetoes a match, because
//! a false positive tears down a working session.

use serde::{Deserialize, Serialize};

/// Lower-case fragments that indicate session corruption in free text.
///
/// Keep this list reviewable: every entry should name a failure that only a
/// damaged session state can produce.
pub const CORRUPTION_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("bad mac", ErrorCategory::MacVerification),
    ("mac verification failed", ErrorCategory::MacVerification),
    ("mac mismatch", ErrorCategory::MacVerification),
    ("no matching sessions", ErrorCategory::MissingSession),
    ("no session record", ErrorCategory::MissingSession),
    ("no open session", ErrorCategory::MissingSession),
    ("session not found", ErrorCategory::MissingSession),
    ("key used already", ErrorCategory::ReplayOrOrdering),
    ("messagecountererror", ErrorCategory::ReplayOrOrdering),
    ("messages into the future", ErrorCategory::ReplayOrOrdering),
    ("duplicate message", ErrorCategory::ReplayOrOrdering),
    ("invalid prekey", ErrorCategory::KeyMismatch),
    ("untrusted identity", ErrorCategory::KeyMismatch),
    ("identity key changed", ErrorCategory::KeyMismatch),
    ("key mismatch", ErrorCategory::KeyMismatch),
];

/// Lower-case fragments that mark an error as transport-level.
pub const TRANSPORT_PATTERNS: &[&str] = &[
    "connection closed",
    "connection reset",
    "connection refused",
    "timed out",
    "timeout",
    "stream errored",
    "rate limit",
    "econnreset",
];

/// Closed set of failure categories reported by the messaging integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Identity or pre-key material does not match the peer's.
    KeyMismatch,
    /// Message authentication failed.
    MacVerification,
    /// Counter reuse, replay, or messages far out of order.
    ReplayOrOrdering,
    /// No usable session exists for the peer.
    MissingSession,
    /// Socket or stream failure.
    Transport,
    /// An operation exceeded its deadline.
    Timeout,
    /// The network throttled the client.
    RateLimited,
    /// A failure in helpdesk application logic.
    Application,
    /// The integration could not categorise the failure.
    Unclassified,
}

impl ErrorCategory {
    /// Returns true for categories that signal session corruption.
    #[must_use]
    pub const fn is_corruption(self) -> bool {
        matches!(
            self,
            Self::KeyMismatch | Self::MacVerification | Self::ReplayOrOrdering | Self::MissingSession
        )
    }

    /// Stable label used in logs, metrics and statistics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeyMismatch => "key_mismatch",
            Self::MacVerification => "mac_verification",
            Self::ReplayOrOrdering => "replay_or_ordering",
            Self::MissingSession => "missing_session",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Application => "application",
            Self::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// A failure raised by a receive, decrypt or send operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    category: ErrorCategory,
    message: String,
    type_tag: Option<String>,
    stack_signature: Option<String>,
}

impl ProtocolError {
    /// Create an error with an explicit category.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            type_tag: None,
            stack_signature: None,
        }
    }

    /// Create an error the integration could not categorise.
    #[must_use]
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unclassified, message)
    }

    /// Attach the originating error type name.
    #[must_use]
    pub fn with_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    /// Attach a condensed stack signature.
    #[must_use]
    pub fn with_stack_signature(mut self, signature: impl Into<String>) -> Self {
        self.stack_signature = Some(signature.into());
        self
    }

    /// Category reported by the integration.
    #[must_use]
    pub fn category(&self) -> ErrorCategory { self.category }

    /// Human-readable error text.
    #[must_use]
    pub fn message(&self) -> &str { &self.message }

    /// Originating error type name, if known.
    #[must_use]
    pub fn type_tag(&self) -> Option<&str> { self.type_tag.as_deref() }

    /// Condensed stack signature, if known.
    #[must_use]
    pub fn stack_signature(&self) -> Option<&str> { self.stack_signature.as_deref() }

    /// The reported category, refined by the text matcher when unclassified.
    ///
    /// An unclassified error matching no corruption pattern is refined to
    /// [`ErrorCategory::Transport`] if it carries a transport marker and stays
    /// unclassified otherwise.
    #[must_use]
    pub fn effective_category(&self) -> ErrorCategory {
        if self.category != ErrorCategory::Unclassified {
            return self.category;
        }
        let haystack = self.haystack();
        if has_transport_marker(&haystack) {
            return ErrorCategory::Transport;
        }
        match_corruption_pattern(&haystack).unwrap_or(ErrorCategory::Unclassified)
    }

    fn haystack(&self) -> String {
        let mut text = self.message.to_lowercase();
        for extra in [self.type_tag.as_deref(), self.stack_signature.as_deref()]
            .into_iter()
            .flatten()
        {
            text.push('\n');
            text.push_str(&extra.to_lowercase());
        }
        text
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for ProtocolError {}

fn has_transport_marker(haystack: &str) -> bool {
    TRANSPORT_PATTERNS.iter().any(|p| haystack.contains(p))
}

fn match_corruption_pattern(haystack: &str) -> Option<ErrorCategory> {
    CORRUPTION_PATTERNS
        .iter()
        .find(|(pattern, _)| haystack.contains(pattern))
        .map(|(_, category)| *category)
}

/// Returns true iff `error` is consistent with session corruption.
///
/// # Examples
///
/// ```
/// use relink::classifier::{ErrorCategory, ProtocolError, classify};
///
/// assert!(classify(&ProtocolError::new(ErrorCategory::MacVerification, "Bad MAC")));
/// assert!(!classify(&ProtocolError::new(ErrorCategory::Timeout, "Bad MAC")));
/// assert!(classify(&ProtocolError::unclassified("No matching sessions found for message")));
/// assert!(!classify(&ProtocolError::unclassified("Bad MAC after connection reset")));
/// ```
#[must_use]
pub fn classify(error: &ProtocolError) -> bool { error.effective_category().is_corruption() }

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ErrorCategory::KeyMismatch, true)]
    #[case(ErrorCategory::MacVerification, true)]
    #[case(ErrorCategory::ReplayOrOrdering, true)]
    #[case(ErrorCategory::MissingSession, true)]
    #[case(ErrorCategory::Transport, false)]
    #[case(ErrorCategory::Timeout, false)]
    #[case(ErrorCategory::RateLimited, false)]
    #[case(ErrorCategory::Application, false)]
    fn explicit_categories_ignore_text(#[case] category: ErrorCategory, #[case] expected: bool) {
        // The text would match a corruption pattern; the tag must win.
        let err = ProtocolError::new(category, "Bad MAC");
        assert_eq!(classify(&err), expected);
    }

    #[rstest]
    #[case("Bad MAC", ErrorCategory::MacVerification)]
    #[case("SessionError: No matching sessions found for message", ErrorCategory::MissingSession)]
    #[case("MessageCounterError: Key used already or never filled", ErrorCategory::ReplayOrOrdering)]
    #[case("Over 2000 messages into the future!", ErrorCategory::ReplayOrOrdering)]
    #[case("Invalid PreKey ID", ErrorCategory::KeyMismatch)]
    fn fallback_matches_corruption_text(#[case] text: &str, #[case] expected: ErrorCategory) {
        let err = ProtocolError::unclassified(text);
        assert_eq!(err.effective_category(), expected);
        assert!(classify(&err));
    }

    #[rstest]
    #[case("Connection Closed")]
    #[case("Bad MAC: request timed out")]
    #[case("ECONNRESET while reading frame")]
    fn transport_markers_veto(#[case] text: &str) {
        let err = ProtocolError::unclassified(text);
        assert_eq!(err.effective_category(), ErrorCategory::Transport);
        assert!(!classify(&err));
    }

    #[test]
    fn unknown_text_stays_unclassified() {
        let err = ProtocolError::unclassified("contact list is empty");
        assert_eq!(err.effective_category(), ErrorCategory::Unclassified);
        assert!(!classify(&err));
    }

    #[test]
    fn type_tag_and_stack_take_part_in_matching() {
        let tagged = ProtocolError::unclassified("decrypt failed").with_type_tag("SessionNotFound");
        assert!(!classify(&ProtocolError::unclassified("decrypt failed")));
        // "sessionnotfound" does not contain "session not found"; the stack does.
        let stacked = tagged.with_stack_signature("at decryptWhisperMessage: Session not found");
        assert_eq!(stacked.effective_category(), ErrorCategory::MissingSession);
        assert_eq!(stacked.type_tag(), Some("SessionNotFound"));
    }
}

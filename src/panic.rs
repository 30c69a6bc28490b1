//! Panic payload formatting for task supervision.

use std::{any::Any, fmt};

/// Display adapter for a payload caught with `catch_unwind`.
///
/// `panic!` payloads are almost always `&'static str` or `String`; anything
/// else is rendered with its `Debug` representation.
///
/// ```
/// use relink::panic::PanicMessage;
///
/// assert_eq!(PanicMessage::new(Box::new("reconnect blew up")).to_string(), "reconnect blew up");
/// assert_eq!(PanicMessage::new(Box::new(String::from("oops"))).to_string(), "oops");
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl PanicMessage {
    /// Wrap a caught payload.
    pub fn new(payload: Box<dyn Any + Send>) -> Self { Self(payload) }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.0.downcast_ref::<&'static str>(),
            self.0.downcast_ref::<String>(),
        ) {
            (Some(text), _) => f.write_str(text),
            (None, Some(text)) => f.write_str(text),
            (None, None) => write!(f, "{:?}", self.0),
        }
    }
}

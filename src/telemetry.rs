//! Violation reporting and per-session logging.
//!
//! Internal invariants that break at runtime are reported through
//! [`report_violation!`](crate::report_violation). The macro builds a [`Violation`] and
//! forwards it to `tracing` at a level matching its [`ViolationSeverity`]. Nothing here
//! panics; a violation is a diagnostic, and the caller decides how to recover.
//!
//! Each session additionally owns a [`SessionLogger`]. The session manager runs every
//! call into a session inside that logger's dispatcher, so two sessions in one process
//! can write to two different subscribers without any global hook.

use std::fmt;

use tracing::{Dispatch, Subscriber};

use crate::Frame;

/// Target used for text the host logs through a session.
pub const HOST_LOG_TARGET: &str = "rollback_session::host";

/// Serializes `Option<Frame>` as a plain integer or `null`.
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if !f.is_null() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// Severity of a reported violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; a fallback was used.
    Warning,
    /// Degraded behavior is possible.
    Error,
    /// Internal state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a lowercase label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem in which a violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Frame counters disagree with each other.
    FrameSync,
    /// The per-player input ring broke its ordering rules.
    InputQueue,
    /// A snapshot was missing, stale or from the wrong frame.
    StateManagement,
    /// A peer sent something the protocol could not use.
    NetworkProtocol,
    /// Handshake took unusually long or needed many retries.
    Synchronization,
    /// A configuration value was out of range.
    Configuration,
    /// A structural invariant check failed.
    Invariant,
    /// Anything that points at a bug in this crate.
    InternalError,
}

impl ViolationKind {
    /// Returns a snake_case label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputQueue => "input_queue",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::Synchronization => "synchronization",
            Self::Configuration => "configuration",
            Self::Invariant => "invariant",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reported violation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it happened.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// Source location (`file:line`) of the report.
    pub location: &'static str,
    /// Frame at which the violation was noticed, if known.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
}

impl Violation {
    /// Creates a violation without a frame.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
        }
    }

    /// Attaches the frame at which the violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Serializes this violation to JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Writes the violation to the current `tracing` dispatcher.
    pub fn emit(&self) {
        let severity = self.severity.as_str();
        let kind = self.kind.as_str();
        let location = self.location;
        let frame = self
            .frame
            .filter(|f| !f.is_null())
            .map_or_else(|| "null".to_owned(), |f| f.as_i32().to_string());

        match self.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, frame = %frame, "{}", self.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, frame = %frame, "{}", self.message);
            },
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} ({})",
            self.severity, self.kind, self.message, self.location
        )
    }
}

/// Reports a violation through `tracing`.
///
/// ```ignore
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::InputQueue,
///     "dropping input for frame {}",
///     frame
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .emit();
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
        .emit();
    }};
}

/// A broken structural invariant, as returned by [`InvariantChecker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Type whose invariant broke.
    pub type_name: &'static str,
    /// The invariant that does not hold.
    pub invariant: String,
    /// Extra diagnostics.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types that can verify their own internal consistency.
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports
/// failures as critical violations.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports
/// failures as critical violations.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        let _ = &$expr;
    }};
}

/// Logging sink owned by a single session.
///
/// Every façade call on a session runs with this logger's dispatcher installed as the
/// thread default. Without a dispatcher the process-wide subscriber applies, which is
/// what most hosts want.
#[derive(Clone, Default)]
pub struct SessionLogger {
    dispatch: Option<Dispatch>,
}

impl SessionLogger {
    /// Logs to whatever subscriber is globally installed.
    #[must_use]
    pub fn global() -> Self {
        Self::default()
    }

    /// Logs to the given dispatcher.
    #[must_use]
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }

    /// Logs to the given subscriber.
    #[must_use]
    pub fn from_subscriber<S>(subscriber: S) -> Self
    where
        S: Subscriber + Send + Sync + 'static,
    {
        Self::new(Dispatch::new(subscriber))
    }

    /// Runs `f` with this logger's dispatcher as the thread default.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    /// Writes a line of host-provided text.
    pub fn log(&self, text: &str) {
        self.in_scope(|| tracing::info!(target: HOST_LOG_TARGET, "{}", text));
    }
}

impl fmt::Debug for SessionLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLogger")
            .field("scoped", &self.dispatch.is_some())
            .finish()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn logger_into(buffer: &Buffer) -> SessionLogger {
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        SessionLogger::from_subscriber(subscriber)
    }

    #[test]
    fn host_text_goes_to_the_scoped_subscriber() {
        let buffer = Buffer::default();
        let logger = logger_into(&buffer);

        logger.log("round 1 started");

        let out = buffer.contents();
        assert!(out.contains("round 1 started"));
        assert!(out.contains(HOST_LOG_TARGET));
    }

    #[test]
    fn two_loggers_do_not_share_output() {
        let first = Buffer::default();
        let second = Buffer::default();
        let a = logger_into(&first);
        let b = logger_into(&second);

        a.log("from a");
        b.log("from b");

        assert!(first.contents().contains("from a"));
        assert!(!first.contents().contains("from b"));
        assert!(second.contents().contains("from b"));
        assert!(!second.contents().contains("from a"));
    }

    #[test]
    fn violations_are_logged_inside_scope() {
        let buffer = Buffer::default();
        let logger = logger_into(&buffer);

        logger.in_scope(|| {
            crate::report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputQueue,
                "dropped input for frame {}",
                12
            );
        });

        let out = buffer.contents();
        assert!(out.contains("dropped input for frame 12"));
        assert!(out.contains("input_queue"));
    }

    #[test]
    fn severity_orders_from_warning_to_critical() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn violation_display_includes_location() {
        let violation = Violation::new(
            ViolationSeverity::Error,
            ViolationKind::StateManagement,
            "no snapshot",
            "state_store.rs:10",
        )
        .with_frame(Frame::new(3));
        let text = violation.to_string();
        assert!(text.contains("error/state_management"));
        assert!(text.contains("state_store.rs:10"));
        assert_eq!(violation.frame, Some(Frame::new(3)));
    }

    #[test]
    fn invariant_violation_display() {
        let v = InvariantViolation::new("InputQueue", "length exceeds capacity")
            .with_details("length=200");
        assert_eq!(
            v.to_string(),
            "InputQueue: length exceeds capacity (length=200)"
        );
    }
}

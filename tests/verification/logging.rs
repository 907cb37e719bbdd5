//! Log routing: per-session loggers, host text and violation reports.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::io;
use std::sync::Arc;

use crate::common::stubs::GameStub;
use parking_lot::Mutex;
use rollback_session::network::compression;
use rollback_session::telemetry::HOST_LOG_TARGET;
use rollback_session::{PlayerType, SessionBuilder, SessionLogger, SessionManager};
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log lines in memory.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    fn logger(&self) -> SessionLogger {
        SessionLogger::from_subscriber(self.subscriber())
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn synctest_builder(logger: SessionLogger) -> SessionBuilder {
    SessionBuilder::new("stub-game")
        .with_num_players(1)
        .unwrap()
        .with_logger(logger)
}

#[test]
fn test_host_text_uses_the_host_target() {
    let capture = Capture::default();
    let mut manager = SessionManager::new();
    let session = manager
        .start_synctest(synctest_builder(capture.logger()), GameStub::new().callbacks(), 2)
        .unwrap();

    manager.log(session, "round two, fight").unwrap();

    let text = capture.text();
    let line = text
        .lines()
        .find(|line| line.contains("round two, fight"))
        .expect("host text missing");
    assert!(line.contains(HOST_LOG_TARGET), "line: {line}");
    assert!(line.contains("INFO"), "line: {line}");
}

#[test]
fn test_each_session_logs_to_its_own_logger() {
    let first = Capture::default();
    let second = Capture::default();
    let mut manager = SessionManager::new();
    let a = manager
        .start_synctest(synctest_builder(first.logger()), GameStub::new().callbacks(), 2)
        .unwrap();
    let b = manager
        .start_synctest(synctest_builder(second.logger()), GameStub::new().callbacks(), 3)
        .unwrap();

    assert!(first.text().contains("check distance 2"));
    assert!(second.text().contains("check distance 3"));
    assert!(!first.text().contains("check distance 3"));

    manager.add_player(a, PlayerType::Local, 0).unwrap();
    manager.close_session(a).unwrap();
    assert!(first.text().contains("sync test closed"));
    assert!(!second.text().contains("sync test closed"));

    manager.log(b, "only here").unwrap();
    assert!(second.text().contains("only here"));
    assert!(!first.text().contains("only here"));
}

#[test]
fn test_global_logger_follows_the_thread_default() {
    let capture = Capture::default();
    tracing::subscriber::with_default(capture.subscriber(), || {
        let mut manager = SessionManager::new();
        let session = manager
            .start_synctest(
                synctest_builder(SessionLogger::global()),
                GameStub::new().callbacks(),
                1,
            )
            .unwrap();
        manager.log(session, "to whoever listens").unwrap();
    });

    let text = capture.text();
    assert!(text.contains("to whoever listens"));
    assert!(text.contains("starting sync test for stub-game"));
}

#[test]
fn test_violations_carry_kind_and_location() {
    let capture = Capture::default();
    let reference = [0u8; 8];
    let short = [1u8; 4];

    let encoded = tracing::subscriber::with_default(capture.subscriber(), || {
        compression::encode(&reference, [&short[..], &reference[..]].into_iter())
    });

    // the malformed record is skipped, the good one kept
    let decoded = compression::decode(&reference, &encoded).unwrap();
    assert_eq!(decoded, vec![reference.to_vec()]);

    let text = capture.text();
    let line = text
        .lines()
        .find(|line| line.contains("does not match reference"))
        .expect("violation missing");
    assert!(line.contains("WARN"), "line: {line}");
    assert!(line.contains("kind=\"network_protocol\""), "line: {line}");
    assert!(line.contains("compression.rs"), "line: {line}");
}

#[cfg(feature = "json")]
#[test]
fn test_violation_serializes_to_json() {
    use rollback_session::telemetry::{Violation, ViolationKind, ViolationSeverity};

    let violation = Violation::new(
        ViolationSeverity::Error,
        ViolationKind::NetworkProtocol,
        "bad packet",
        "somewhere.rs:1",
    );
    let json = violation.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["severity"], "error");
    assert_eq!(value["kind"], "network_protocol");
    assert_eq!(value["message"], "bad packet");
}

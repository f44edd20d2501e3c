//! JSON-lines audit trail for wsproxy.
//!
//! Every accepted, rejected and closed tunnel connection is recorded as one
//! newline-terminated JSON object. Producers hold a cheap [`AuditSink`]
//! handle; a single background task owns the file and batches flushes.
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEvent, AuditPeer, AuditSink};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _writer) = AuditSink::start("/var/log/wsproxy/audit.jsonl").await?;
//! sink.log(AuditEntry::new(
//!     AuditEvent::ProcessStarted,
//!     AuditPeer::new("wsproxy"),
//!     serde_json::json!({ "port": 5999 }),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEvent, AuditPeer};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};

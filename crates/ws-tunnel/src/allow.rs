use std::collections::HashSet;

use async_trait::async_trait;

use crate::pipeline::{ConnectionInfo, VerifyHook};
use crate::target::decode_identifier;

/// Verify hook admitting only configured targets.
///
/// Entries are compared against the decoded identifier string exactly as
/// the client sent it (`"host:8080"`), not against a resolved host/port
/// pair. An empty list admits everything.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// Parse a comma-separated list such as `"db:5432,cache:6379"`.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn allows_all(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decide for a raw (base64) identifier.
    pub fn permits(&self, raw: &str) -> bool {
        if self.allows_all() {
            return true;
        }
        match decode_identifier(raw) {
            Ok(plain) => self.entries.contains(&plain),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl VerifyHook for AllowList {
    fn name(&self) -> &str {
        "allow-list"
    }

    async fn verify(&self, info: &ConnectionInfo) -> bool {
        if self.permits(&info.requested_target_raw) {
            return true;
        }
        let requested = decode_identifier(&info.requested_target_raw)
            .unwrap_or_else(|_| info.requested_target_raw.clone());
        tracing::info!(
            remote_addr = %info.remote_address,
            target = %requested,
            "Reject requested connection from '{}' to '{}'",
            info.remote_address,
            requested
        );
        false
    }
}

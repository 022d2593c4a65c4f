// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`ClientRegistry`](crate::registry::ClientRegistry).
///
/// Host servers typically deserialize this from their own configuration
/// file; all fields have working defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// How long a client may sit idle before it is invalidated. A zero
    /// duration disables idle timeout entirely.
    ///
    /// A client is not considered idle while it holds an open connection to
    /// the server: a parked long poll, a registered push handler, a connected
    /// push session, or a blocked wait poll all suppress the timeout.
    pub idle_timeout: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
        }
    }
}

impl OutboxSettings {
    /// Whether idle timeout is enabled.
    #[must_use]
    pub fn idle_timeout_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }
}

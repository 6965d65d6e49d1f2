/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{DataSender, SendFailure};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Delivers items straight into a `LoopbackReceiver` without a pipeline in between. Used for dry
/// runs of a scenario and for exercising the orchestration in tests.
///
/// Construct it with `crate::datareceivers::loopback::loopback_pair`.
pub struct LoopbackSender {
    delivered: Arc<AtomicU64>,
    deliver_at_most: Option<u64>,
    sent: u64,
}
impl LoopbackSender {
    pub(crate) fn new(delivered: Arc<AtomicU64>) -> Self {
        Self {
            delivered,
            deliver_at_most: None,
            sent: 0,
        }
    }

    /// Silently drops every item past the first `limit`, simulating a pipeline that loses data.
    pub fn with_delivery_cap(mut self, limit: u64) -> Self {
        self.deliver_at_most = Some(limit);
        self
    }
}

#[async_trait]
impl DataSender for LoopbackSender {
    fn name(&self) -> &str {
        "loopback"
    }

    fn receiver_config_fragment(&self) -> String {
        "nop:\n".to_string()
    }

    async fn start(&mut self) -> Result<(), SendFailure> {
        Ok(())
    }

    async fn send(&mut self, count: u64) -> Result<(), SendFailure> {
        let deliverable = match self.deliver_at_most {
            Some(limit) => count.min(limit.saturating_sub(self.sent)),
            None => count,
        };
        self.sent += count;
        self.delivered.fetch_add(deliverable, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SendFailure> {
        Ok(())
    }
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{DataReceiver, ReceiverFault};
use crate::datasenders::loopback::LoopbackSender;
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Creates a sender and receiver connected back to back.
pub fn loopback_pair() -> (LoopbackSender, LoopbackReceiver) {
    let delivered = Arc::new(AtomicU64::new(0));
    (
        LoopbackSender::new(delivered.clone()),
        LoopbackReceiver { delivered },
    )
}

pub struct LoopbackReceiver {
    delivered: Arc<AtomicU64>,
}

#[async_trait]
impl DataReceiver for LoopbackReceiver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn exporter_config_fragment(&self) -> String {
        "nop:\n".to_string()
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn received_count(&self) -> Result<u64, ReceiverFault> {
        Ok(self.delivered.load(Ordering::Relaxed))
    }

    async fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasenders::DataSender;

    #[tokio::test]
    async fn everything_sent_is_received() -> anyhow::Result<()> {
        let (mut sender, receiver) = loopback_pair();

        sender.send(40).await?;
        sender.send(60).await?;
        assert_eq!(receiver.received_count()?, 100);
        Ok(())
    }

    #[tokio::test]
    async fn delivery_cap_drops_the_excess() -> anyhow::Result<()> {
        let (sender, receiver) = loopback_pair();
        let mut sender = sender.with_delivery_cap(90);

        sender.send(50).await?;
        sender.send(50).await?;
        sender.send(50).await?;
        assert_eq!(receiver.received_count()?, 90);
        Ok(())
    }
}

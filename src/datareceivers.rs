/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod loopback;
pub mod tcp_lines;

use async_trait::async_trait;
use thiserror::Error;

/// The receiver saw something it could not interpret, i.e. the data path itself broke.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct ReceiverFault(pub String);

/// Accepts the telemetry the pipeline exports and counts it.
#[async_trait]
pub trait DataReceiver: Send + Sync {
    fn name(&self) -> &str;

    /// The exporter section the pipeline needs in order to deliver to this receiver. Only valid
    /// once the receiver has been started, as the listening port may be assigned on start.
    fn exporter_config_fragment(&self) -> String;

    async fn start(&mut self) -> anyhow::Result<()>;

    /// Number of items received so far. Never decreases between two successful calls.
    fn received_count(&self) -> Result<u64, ReceiverFault>;

    /// Stops accepting data. Must be safe to call on a receiver that was never started.
    async fn stop(&mut self);
}

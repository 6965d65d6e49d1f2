/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    datareceivers::{DataReceiver, ReceiverFault},
    errors::ScenarioError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How the received count is compared with the sent count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Every item must arrive exactly once. More items than were sent is a failure.
    #[default]
    ExactlyOnce,

    /// Every item must arrive, duplicates are tolerated.
    AtLeastOnce,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}
impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub items_received: u64,
    pub waited: Duration,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("expected {expected} item(s), received {actual}")]
    CountMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Receiver(#[from] ReceiverFault),
}
impl ReconcileError {
    /// Last count observed before giving up, if the receiver could be read at all.
    pub fn items_received(&self) -> Option<u64> {
        match self {
            ReconcileError::CountMismatch { actual, .. } => Some(*actual),
            ReconcileError::Receiver(_) => None,
        }
    }
}
impl From<ReconcileError> for ScenarioError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::CountMismatch { expected, actual } => {
                ScenarioError::CountMismatch { expected, actual }
            }
            ReconcileError::Receiver(fault) => ScenarioError::ReceiverFault { message: fault.0 },
        }
    }
}

/// Waits for `receiver` to account for the `expected` items.
///
/// The receiver is polled every `options.poll_interval` until its count converges or
/// `options.timeout` has passed since the first poll. Under `ExactlyOnce` a count above `expected`
/// fails straight away, as waiting cannot bring it back down.
pub async fn reconcile(
    receiver: &dyn DataReceiver,
    expected: u64,
    delivery: DeliveryGuarantee,
    options: &ReconcileOptions,
) -> Result<Reconciliation, ReconcileError> {
    let started = Instant::now();
    let deadline = started + options.timeout;
    let mut polls = 0;

    loop {
        polls += 1;
        let actual = receiver.received_count()?;
        trace!("Poll {}: received {} of {}", polls, actual, expected);

        let converged = match delivery {
            DeliveryGuarantee::ExactlyOnce if actual > expected => {
                return Err(ReconcileError::CountMismatch { expected, actual });
            }
            DeliveryGuarantee::ExactlyOnce => actual == expected,
            DeliveryGuarantee::AtLeastOnce => actual >= expected,
        };

        if converged {
            let waited = started.elapsed();
            debug!(
                "Reconciled {} item(s) after {:?} ({} polls)",
                actual, waited, polls
            );
            return Ok(Reconciliation {
                items_received: actual,
                waited,
                polls,
            });
        }

        if Instant::now() >= deadline {
            return Err(ReconcileError::CountMismatch { expected, actual });
        }
        tokio::time::sleep_until((Instant::now() + options.poll_interval).min(deadline)).await;
    }
}

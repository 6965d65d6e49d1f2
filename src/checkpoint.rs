/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod database;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Sender,
    Receiver,
    Processor,
    Exporter,
    Extension,
}
impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ComponentKind::Sender => "sender",
            ComponentKind::Receiver => "receiver",
            ComponentKind::Processor => "processor",
            ComponentKind::Exporter => "exporter",
            ComponentKind::Extension => "extension",
        };
        write!(f, "{kind}")
    }
}

/// Key-value access to the checkpointed state of a single component.
///
/// Errors are only returned when something actually went wrong: a missing key is `Ok(None)`.
/// Every call has completed, and for durable stores committed, by the time it returns.
#[async_trait]
pub trait CheckpointClient: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Hands out checkpoint clients scoped to one component, so two components never see each other's
/// keys.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn client(
        &self,
        kind: ComponentKind,
        name: &str,
    ) -> anyhow::Result<Box<dyn CheckpointClient>>;
}

fn scope(kind: ComponentKind, name: &str) -> String {
    format!("{kind}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_namespaced_by_kind() {
        assert_eq!(scope(ComponentKind::Sender, "filelog"), "sender/filelog");
        assert_ne!(
            scope(ComponentKind::Sender, "filelog"),
            scope(ComponentKind::Receiver, "filelog")
        );
    }
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{scope, CheckpointClient, CheckpointStorage, ComponentKind};
use anyhow::anyhow;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

type Entries = Arc<Mutex<HashMap<(String, String), Vec<u8>>>>;

/// Checkpoint storage that lives as long as the process. Clients created from the same storage
/// share its entries, so a client can be dropped and recreated without losing state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Entries,
}
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStorage for MemoryStorage {
    async fn client(
        &self,
        kind: ComponentKind,
        name: &str,
    ) -> anyhow::Result<Box<dyn CheckpointClient>> {
        Ok(Box::new(MemoryClient {
            scope: scope(kind, name),
            entries: self.entries.clone(),
        }))
    }
}

pub struct MemoryClient {
    scope: String,
    entries: Entries,
}
impl MemoryClient {
    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<(String, String), Vec<u8>>) -> T,
    ) -> anyhow::Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Checkpoint entries lock was poisoned"))?;
        Ok(f(&mut entries))
    }

    fn entry_key(&self, key: &str) -> (String, String) {
        (self.scope.clone(), key.to_string())
    }
}

#[async_trait]
impl CheckpointClient for MemoryClient {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let entry_key = self.entry_key(key);
        self.with_entries(|entries| entries.get(&entry_key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let entry_key = self.entry_key(key);
        self.with_entries(|entries| {
            entries.insert(entry_key, value.to_vec());
        })
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let entry_key = self.entry_key(key);
        self.with_entries(|entries| {
            entries.remove(&entry_key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_on_unset_key_is_absent_not_an_error() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let client = storage.client(ComponentKind::Receiver, "tcp").await?;

        assert_eq!(client.get("offset").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let client = storage.client(ComponentKind::Sender, "filelog").await?;

        client.set("offset", b"1024").await?;
        assert_eq!(client.get("offset").await?, Some(b"1024".to_vec()));

        client.set("offset", b"2048").await?;
        assert_eq!(client.get("offset").await?, Some(b"2048".to_vec()));

        client.delete("offset").await?;
        assert_eq!(client.get("offset").await?, None);

        // deleting twice is fine
        client.delete("offset").await?;
        Ok(())
    }

    #[tokio::test]
    async fn state_survives_recreating_the_client() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        {
            let client = storage.client(ComponentKind::Sender, "filelog").await?;
            client.set("offset", b"1024").await?;
        }

        let client = storage.client(ComponentKind::Sender, "filelog").await?;
        assert_eq!(client.get("offset").await?, Some(b"1024".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn clients_do_not_share_keys_across_components() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let sender = storage.client(ComponentKind::Sender, "filelog").await?;
        let receiver = storage.client(ComponentKind::Receiver, "filelog").await?;

        sender.set("offset", b"1").await?;
        assert_eq!(receiver.get("offset").await?, None);
        Ok(())
    }
}

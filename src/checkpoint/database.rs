/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{scope, CheckpointClient, CheckpointStorage, ComponentKind};
use crate::entities::checkpoint;
use anyhow::Context;
use async_trait::async_trait;
use sea_orm::{
    sea_query::OnConflict, ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};

/// Durable checkpoint storage backed by the testbed database. Writes are single-statement upserts,
/// so a checkpoint is either fully written or not written at all.
#[derive(Debug, Clone)]
pub struct DatabaseStorage {
    db: DatabaseConnection,
}
impl DatabaseStorage {
    /// `db` must already be migrated, see `crate::db_migrate`.
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStorage for DatabaseStorage {
    async fn client(
        &self,
        kind: ComponentKind,
        name: &str,
    ) -> anyhow::Result<Box<dyn CheckpointClient>> {
        Ok(Box::new(DatabaseClient {
            scope: scope(kind, name),
            db: self.db.clone(),
        }))
    }
}

pub struct DatabaseClient {
    scope: String,
    db: DatabaseConnection,
}

#[async_trait]
impl CheckpointClient for DatabaseClient {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        checkpoint::Entity::find()
            .filter(checkpoint::Column::Scope.eq(self.scope.as_str()))
            .filter(checkpoint::Column::Key.eq(key))
            .one(&self.db)
            .await
            .map(|row| row.map(|row| row.value))
            .context(format!(
                "Error fetching checkpoint {} for {}",
                key, self.scope
            ))
    }

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let row = checkpoint::ActiveModel {
            scope: ActiveValue::Set(self.scope.clone()),
            key: ActiveValue::Set(key.to_string()),
            value: ActiveValue::Set(value.to_vec()),
        };

        checkpoint::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([checkpoint::Column::Scope, checkpoint::Column::Key])
                    .update_column(checkpoint::Column::Value)
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map(|_| ())
            .context(format!(
                "Error writing checkpoint {} for {}",
                key, self.scope
            ))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        checkpoint::Entity::delete_many()
            .filter(checkpoint::Column::Scope.eq(self.scope.as_str()))
            .filter(checkpoint::Column::Key.eq(key))
            .exec(&self.db)
            .await
            .map(|_| ())
            .context(format!(
                "Error deleting checkpoint {} for {}",
                key, self.scope
            ))
    }
}

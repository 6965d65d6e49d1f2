/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::ResultsSink;
use crate::{entities::performance_result, scenario::PerformanceResult};
use anyhow::Context;
use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, ActiveValue, DatabaseConnection};
use tracing::debug;

/// Stores every result in the `performance_result` table so runs can be compared over time.
#[derive(Debug, Clone)]
pub struct DatabaseSink {
    db: DatabaseConnection,
}
impl DatabaseSink {
    /// `db` must already be migrated, see `crate::db_migrate`.
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResultsSink for DatabaseSink {
    async fn record(&mut self, result: &PerformanceResult) -> anyhow::Result<()> {
        let row = performance_result::ActiveModel {
            id: ActiveValue::NotSet,
            run_id: ActiveValue::Set(result.run_id.clone()),
            scenario_name: ActiveValue::Set(result.scenario_name.clone()),
            started_at: ActiveValue::Set(result.started_at.timestamp_millis()),
            elapsed_ms: ActiveValue::Set(result.elapsed.as_millis() as i64),
            items_sent: ActiveValue::Set(result.items_sent as i64),
            items_received: ActiveValue::Set(result.items_received as i64),
            max_cpu: ActiveValue::Set(result.observed_max_cpu),
            avg_cpu: ActiveValue::Set(result.observed_avg_cpu),
            max_ram: ActiveValue::Set(result.observed_max_ram),
            avg_ram: ActiveValue::Set(result.observed_avg_ram),
            passed: ActiveValue::Set(result.passed),
            failure_kind: ActiveValue::Set(
                result.failure_reason.as_ref().map(|err| err.kind().to_string()),
            ),
            failure_reason: ActiveValue::Set(
                result.failure_reason.as_ref().map(|err| err.to_string()),
            ),
        };

        let row = row
            .insert(&self.db)
            .await
            .context(format!("Error saving result of {}", result.scenario_name))?;
        debug!("Saved result {} of {}", row.id, row.scenario_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db_connect, db_migrate, errors::ScenarioError};
    use chrono::Utc;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

    #[tokio::test]
    async fn results_are_stored_with_their_failure_kind() -> anyhow::Result<()> {
        let db = db_connect("sqlite::memory:").await?;
        db_migrate(&db).await?;

        let mut sink = DatabaseSink::new(db.clone());
        sink.record(&PerformanceResult::failed(
            "abcde",
            "filelog",
            Utc::now(),
            ScenarioError::CountMismatch {
                expected: 100,
                actual: 99,
            },
        ))
        .await?;

        let rows = performance_result::Entity::find()
            .filter(performance_result::Column::RunId.eq("abcde"))
            .all(&db)
            .await?;
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].passed);
        assert_eq!(rows[0].failure_kind.as_deref(), Some("CountMismatchError"));
        assert_eq!(
            rows[0].failure_reason.as_deref(),
            Some("CountMismatchError: expected 100 item(s), received 99")
        );
        Ok(())
    }
}

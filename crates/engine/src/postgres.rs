use sqlx::{PgPool, Row};

use serde_json::Value;

use loom_common::error::IndexerError;
use loom_common::types::DynamicContract;

use crate::durable::{CommitBatch, DurableStore};

/// PostgreSQL-backed durable store.
///
/// Entity rows live in one generic `entities(entity_type, id, data jsonb)`
/// table; the per-entity tables a generator would emit are its concern,
/// not the core's. All writes of one batch run in a single transaction,
/// deletes before upserts per namespace, and the checkpoint upsert is
/// `GREATEST`-guarded so it can never regress.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DurableStore for PgStore {
    async fn batch_read(&self, entity: &str, ids: &[String]) -> Result<Vec<Value>, IndexerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT data FROM entities WHERE entity_type = $1 AND id = ANY($2)")
            .bind(entity)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<Value, _>("data"))
            .collect())
    }

    async fn apply(&self, batch: &CommitBatch) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await?;

        for (entity, ids) in &batch.entity_deletes {
            sqlx::query("DELETE FROM entities WHERE entity_type = $1 AND id = ANY($2)")
                .bind(entity)
                .bind(ids)
                .execute(&mut *tx)
                .await?;
        }

        for (entity, rows) in &batch.entity_upserts {
            let ids: Vec<String> = rows.iter().map(|(id, _)| id.clone()).collect();
            let payloads: Vec<String> = rows.iter().map(|(_, value)| value.to_string()).collect();
            sqlx::query(
                r#"
                INSERT INTO entities (entity_type, id, data)
                SELECT $1, u.id, u.data::jsonb
                FROM UNNEST($2::text[], $3::text[]) AS u(id, data)
                ON CONFLICT (entity_type, id)
                DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
                "#,
            )
            .bind(entity)
            .bind(&ids)
            .bind(&payloads)
            .execute(&mut *tx)
            .await?;
        }

        for (chain_id, event_id) in &batch.raw_event_deletes {
            sqlx::query("DELETE FROM raw_events WHERE chain_id = $1 AND event_id = $2")
                .bind(*chain_id as i64)
                .bind(*event_id as i64)
                .execute(&mut *tx)
                .await?;
        }

        if !batch.raw_events.is_empty() {
            let chain_ids: Vec<i64> = batch.raw_events.iter().map(|r| r.chain_id as i64).collect();
            let event_ids: Vec<i64> = batch.raw_events.iter().map(|r| r.event_id as i64).collect();
            let block_numbers: Vec<i64> =
                batch.raw_events.iter().map(|r| r.block_number as i64).collect();
            let payloads: Vec<String> = batch.raw_events.iter().map(|r| r.data.to_string()).collect();
            sqlx::query(
                r#"
                INSERT INTO raw_events (chain_id, event_id, block_number, data)
                SELECT u.chain_id, u.event_id, u.block_number, u.data::jsonb
                FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::text[])
                    AS u(chain_id, event_id, block_number, data)
                ON CONFLICT (chain_id, event_id) DO UPDATE SET data = EXCLUDED.data
                "#,
            )
            .bind(&chain_ids)
            .bind(&event_ids)
            .bind(&block_numbers)
            .bind(&payloads)
            .execute(&mut *tx)
            .await?;
        }

        for (chain_id, address) in &batch.dynamic_contract_deletes {
            sqlx::query("DELETE FROM dynamic_contracts WHERE chain_id = $1 AND address = $2")
                .bind(*chain_id as i64)
                .bind(address)
                .execute(&mut *tx)
                .await?;
        }

        if !batch.dynamic_contracts.is_empty() {
            let chain_ids: Vec<i64> = batch
                .dynamic_contracts
                .iter()
                .map(|c| c.chain_id as i64)
                .collect();
            let addresses: Vec<String> = batch
                .dynamic_contracts
                .iter()
                .map(|c| c.address.clone())
                .collect();
            let contract_types: Vec<String> = batch
                .dynamic_contracts
                .iter()
                .map(|c| c.contract_type.clone())
                .collect();
            let registering: Vec<i64> = batch
                .dynamic_contracts
                .iter()
                .map(|c| c.registering_event_id as i64)
                .collect();
            sqlx::query(
                r#"
                INSERT INTO dynamic_contracts (chain_id, address, contract_type, registering_event_id)
                SELECT u.chain_id, u.address, u.contract_type, u.registering_event_id
                FROM UNNEST($1::bigint[], $2::text[], $3::text[], $4::bigint[])
                    AS u(chain_id, address, contract_type, registering_event_id)
                ON CONFLICT (chain_id, address)
                DO UPDATE SET contract_type = EXCLUDED.contract_type,
                              registering_event_id = EXCLUDED.registering_event_id
                "#,
            )
            .bind(&chain_ids)
            .bind(&addresses)
            .bind(&contract_types)
            .bind(&registering)
            .execute(&mut *tx)
            .await?;
        }

        for (chain_id, to_block) in &batch.checkpoints {
            sqlx::query(
                r#"
                INSERT INTO indexer_state (chain_id, last_block)
                VALUES ($1, $2)
                ON CONFLICT (chain_id)
                DO UPDATE SET last_block = GREATEST(indexer_state.last_block, EXCLUDED.last_block),
                              updated_at = NOW()
                "#,
            )
            .bind(*chain_id as i64)
            .bind(*to_block as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, IndexerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_block FROM indexer_state WHERE chain_id = $1")
                .bind(chain_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(block,)| block as u64))
    }

    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContract>, IndexerError> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT chain_id, address, contract_type, registering_event_id FROM dynamic_contracts ORDER BY chain_id, address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(chain_id, address, contract_type, registering_event_id)| DynamicContract {
                chain_id: chain_id as u64,
                address,
                contract_type,
                registering_event_id: registering_event_id as u64,
            })
            .collect())
    }
}

//! Postgres-backed run store (feature `postgres`).
//!
//! The conditional write is a single `UPDATE ... WHERE version = $2`. The two
//! atomic procedures are short transactions that take the row lock with
//! `SELECT ... FOR UPDATE`, merge in Rust with the same functions the CAS
//! fallback uses, and write back before committing.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use super::schema::{sql, CREATE_TABLES};
use super::store::{merge_round, merge_step, RunStore, StepMerge, StoreError, StoreResult};
use super::types::{
    AppendOutcome, DebateMerge, DebateSide, Message, RunPayload, StepChange, StepUpdate,
    VersionToken, VersionedRun,
};
use crate::phases::PhaseId;

/// Run store over a single Postgres connection.
///
/// Transactions need exclusive access to the client, so calls are serialized
/// through a mutex.
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connect and drive the connection on a background task.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres connection closed");
            }
        });
        info!("Connected to Postgres run store");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        self.client.lock().await.batch_execute(CREATE_TABLES).await?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn version_from(raw: i64) -> VersionToken {
    VersionToken(u64::try_from(raw).unwrap_or_default())
}

fn version_param(version: VersionToken) -> StoreResult<i64> {
    i64::try_from(version.0)
        .map_err(|_| StoreError::Serialization(format!("version {version} out of range")))
}

fn decode_run(row: &Row) -> StoreResult<(RunPayload, VersionToken)> {
    let raw: serde_json::Value = row.try_get(0)?;
    let version: i64 = row.try_get(1)?;
    let payload =
        serde_json::from_value(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok((payload, version_from(version)))
}

fn map_insert_error(run_id: &str, e: tokio_postgres::Error) -> StoreError {
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
            StoreError::AlreadyExists(run_id.to_string())
        }
        Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
            StoreError::NotFound(run_id.to_string())
        }
        _ => StoreError::Postgres(e),
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn insert_run(&self, run_id: &str, payload: &RunPayload) -> StoreResult<VersionToken> {
        let json = to_json(payload)?;
        let client = self.client.lock().await;
        client
            .execute(sql::INSERT_RUN, &[&run_id, &json])
            .await
            .map_err(|e| map_insert_error(run_id, e))?;
        Ok(VersionToken::initial())
    }

    async fn read_run(&self, run_id: &str) -> StoreResult<VersionedRun> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(sql::SELECT_RUN, &[&run_id])
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let (payload, version) = decode_run(&row)?;
        Ok(VersionedRun {
            run_id: run_id.to_string(),
            payload,
            version,
        })
    }

    async fn conditional_write(
        &self,
        run_id: &str,
        payload: &RunPayload,
        expected: VersionToken,
    ) -> StoreResult<u64> {
        let json = to_json(payload)?;
        let expected = version_param(expected)?;
        let client = self.client.lock().await;
        let rows = client
            .execute(sql::CONDITIONAL_WRITE, &[&run_id, &expected, &json])
            .await?;
        Ok(rows)
    }

    async fn atomic_merge_step_status(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        update: &StepUpdate,
    ) -> StoreResult<StepMerge> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(sql::SELECT_RUN_FOR_UPDATE, &[&run_id])
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let (mut payload, version) = decode_run(&row)?;

        let change = merge_step(&mut payload, phase, agent, update, Utc::now())?;
        if change != StepChange::Applied {
            tx.rollback().await?;
            return Ok(StepMerge { change, version });
        }

        let json = to_json(&payload)?;
        let row = tx.query_one(sql::LOCKED_WRITE, &[&run_id, &json]).await?;
        let version = version_from(row.try_get(0)?);
        tx.commit().await?;
        debug!(run_id, %phase, agent, status = %update.status, %version, "Merged step status");
        Ok(StepMerge { change, version })
    }

    async fn atomic_merge_debate_round(
        &self,
        run_id: &str,
        round: u32,
        side: DebateSide,
        text: &str,
        points: &[String],
    ) -> StoreResult<DebateMerge> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(sql::SELECT_RUN_FOR_UPDATE, &[&run_id])
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let (mut payload, _) = decode_run(&row)?;

        let merged = merge_round(&mut payload, round, side, text, points, Utc::now());
        if !merged.applied {
            tx.rollback().await?;
            return Ok(merged);
        }
        let json = to_json(&payload)?;
        tx.execute(sql::LOCKED_WRITE, &[&run_id, &json]).await?;
        tx.commit().await?;
        debug!(run_id, round, %side, "Merged debate round");
        Ok(merged)
    }

    async fn append_message(&self, run_id: &str, message: &Message) -> StoreResult<AppendOutcome> {
        let json = to_json(message)?;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let inserted = tx
            .query_opt(
                sql::INSERT_MESSAGE,
                &[&run_id, &message.fingerprint, &json],
            )
            .await
            .map_err(|e| map_insert_error(run_id, e))?;
        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(AppendOutcome::Duplicate);
        };
        let seq: i64 = row.try_get(0)?;
        tx.execute(sql::BUMP_VERSION, &[&run_id]).await?;
        tx.commit().await?;
        Ok(AppendOutcome::Appended {
            seq: u64::try_from(seq).unwrap_or_default(),
        })
    }

    async fn read_messages(&self, run_id: &str) -> StoreResult<Vec<Message>> {
        let client = self.client.lock().await;
        let rows = client.query(sql::SELECT_MESSAGES, &[&run_id]).await?;
        rows.iter()
            .map(|row| {
                let raw: serde_json::Value = row.try_get(0)?;
                serde_json::from_value(raw).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    InvocationClaim, InvocationKey, InvocationOutcome, InvocationRecord, Lease, Result, SagaId, SagaInstance,
    SagaQuery, SagaStatus, StepDefinition, StepFailure, StepLogError, StepRecord, StepState,
    record::expiry_from,
    store::{InvocationStore, LeaseStore, StepLog, validate_steps},
};

/// PostgreSQL-backed step log implementation.
#[derive(Clone)]
pub struct PostgresStepLog {
    pool: PgPool,
}

impl PostgresStepLog {
    /// Creates a new PostgreSQL step log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_step(row: &PgRow) -> Result<StepRecord> {
        let state: String = row.try_get("state")?;
        Ok(StepRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            sequence_no: row.try_get::<i32, _>("sequence_no")? as u32,
            action_name: row.try_get("action_name")?,
            payload: row.try_get("payload")?,
            state: state.parse()?,
            attempt: row.try_get::<i32, _>("attempt")? as u32,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_saga(row: &PgRow, steps: Vec<StepRecord>) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;
        Ok(SagaInstance {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            status: status.parse()?,
            steps,
            failure: failure.map(serde_json::from_value).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_lease(row: &PgRow) -> Result<Lease> {
        Ok(Lease {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            owner: row.try_get("owner")?,
            token: row.try_get("token")?,
            expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        })
    }

    async fn load_steps(&self, saga_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<StepRecord>>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, sequence_no, action_name, payload, state, attempt, updated_at
            FROM saga_steps
            WHERE saga_id = ANY($1)
            ORDER BY saga_id, sequence_no ASC
            "#,
        )
        .bind(saga_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_saga: HashMap<Uuid, Vec<StepRecord>> = HashMap::new();
        for row in &rows {
            let step = Self::row_to_step(row)?;
            by_saga
                .entry(step.saga_id.as_uuid())
                .or_default()
                .push(step);
        }
        Ok(by_saga)
    }
}

#[async_trait]
impl StepLog for PostgresStepLog {
    async fn create_saga(&self, steps: Vec<StepDefinition>) -> Result<SagaInstance> {
        validate_steps(&steps).map_err(StepLogError::InvalidSaga)?;

        let saga = SagaInstance::new(SagaId::new(), steps);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sagas (id, status, failure, created_at, updated_at)
            VALUES ($1, $2, NULL, $3, $4)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.status.as_str())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in &saga.steps {
            sqlx::query(
                r#"
                INSERT INTO saga_steps (saga_id, sequence_no, action_name, payload, state, attempt, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(step.saga_id.as_uuid())
            .bind(step.sequence_no as i32)
            .bind(&step.action_name)
            .bind(&step.payload)
            .bind(step.state.as_str())
            .bind(step.attempt as i32)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(saga_id = %saga.id, steps = saga.step_count(), "saga created");
        Ok(saga)
    }

    async fn load_saga(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, status, failure, created_at, updated_at
            FROM sagas
            WHERE id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut steps = self.load_steps(&[saga_id.as_uuid()]).await?;
                let steps = steps.remove(&saga_id.as_uuid()).unwrap_or_default();
                Ok(Some(Self::row_to_saga(&row, steps)?))
            }
            None => Ok(None),
        }
    }

    async fn update_step_state(
        &self,
        saga_id: SagaId,
        sequence_no: u32,
        expected: StepState,
        new: StepState,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // The prior-state check and the ordering rule are part of the same
        // conditional update, so a lost race changes no rows.
        let updated = sqlx::query(
            r#"
            UPDATE saga_steps
            SET state = $4, updated_at = $5
            WHERE saga_id = $1 AND sequence_no = $2 AND state = $3
              AND ($4 <> 'ForwardDone' OR NOT EXISTS (
                  SELECT 1 FROM saga_steps earlier
                  WHERE earlier.saga_id = $1
                    AND earlier.sequence_no < $2
                    AND earlier.state <> 'ForwardDone'
              ))
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(sequence_no as i32)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let saga = self
                .load_saga(saga_id)
                .await?
                .ok_or(StepLogError::SagaNotFound(saga_id))?;
            saga.check_step_transition(sequence_no, expected, new)?;
            // Another writer moved the step first; this transaction changed nothing.
            metrics::counter!("step_log_conflicts_total", "backend" => "postgres").increment(1);
            return Err(StepLogError::ConcurrentModification {
                saga_id,
                sequence_no,
                expected,
                actual: saga
                    .step(sequence_no)
                    .map(|s| s.state)
                    .unwrap_or(expected),
            });
        }

        sqlx::query("UPDATE sagas SET updated_at = $2 WHERE id = $1")
            .bind(saga_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_attempt(&self, saga_id: SagaId, sequence_no: u32) -> Result<u32> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let attempt: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE saga_steps
            SET attempt = attempt + 1, updated_at = $3
            WHERE saga_id = $1 AND sequence_no = $2
            RETURNING attempt
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(sequence_no as i32)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempt) = attempt else {
            tx.rollback().await?;
            return match self.load_saga(saga_id).await? {
                Some(_) => Err(StepLogError::StepNotFound {
                    saga_id,
                    sequence_no,
                }),
                None => Err(StepLogError::SagaNotFound(saga_id)),
            };
        };

        sqlx::query("UPDATE sagas SET updated_at = $2 WHERE id = $1")
            .bind(saga_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(attempt as u32)
    }

    async fn update_saga_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        failure: Option<StepFailure>,
    ) -> Result<()> {
        let failure_json = failure.as_ref().map(serde_json::to_value).transpose()?;
        let allowed_from: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $2, failure = COALESCE($3, failure), updated_at = $4
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(status.as_str())
        .bind(failure_json)
        .bind(Utc::now())
        .bind(&allowed_from)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM sagas WHERE id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;

            return match current {
                Some(current) => Err(StepLogError::InvalidStatusTransition {
                    saga_id,
                    from: current.parse()?,
                    to: status,
                }),
                None => Err(StepLogError::SagaNotFound(saga_id)),
            };
        }

        Ok(())
    }

    async fn list_sagas(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        let mut sql = String::from(
            "SELECT id, status, failure, created_at, updated_at FROM sagas WHERE 1=1",
        );
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.status_names() {
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(before) = query.updated_before {
            sqlx_query = sqlx_query.bind(before);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        let ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<_, _>>()?;
        let mut steps = self.load_steps(&ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| Self::row_to_saga(row, steps.remove(&id).unwrap_or_default()))
            .collect()
    }
}

#[async_trait]
impl InvocationStore for PostgresStepLog {
    async fn get_invocation(&self, key: InvocationKey) -> Result<Option<InvocationRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT outcome, completed_at
            FROM saga_invocations
            WHERE saga_id = $1 AND sequence_no = $2 AND phase = $3
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(key.sequence_no as i32)
        .bind(key.phase.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let outcome: serde_json::Value = row.try_get("outcome")?;
                let outcome: InvocationOutcome = serde_json::from_value(outcome)?;
                Ok(Some(InvocationRecord {
                    key,
                    outcome,
                    completed_at: row.try_get("completed_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_invocation(&self, record: InvocationRecord) -> Result<InvocationRecord> {
        let outcome = serde_json::to_value(&record.outcome)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO saga_invocations (saga_id, sequence_no, phase, outcome, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id, sequence_no, phase) DO NOTHING
            "#,
        )
        .bind(record.key.saga_id.as_uuid())
        .bind(record.key.sequence_no as i32)
        .bind(record.key.phase.as_str())
        .bind(outcome)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(record);
        }

        self.get_invocation(record.key)
            .await?
            .ok_or_else(|| StepLogError::Corrupt(format!("invocation {} vanished", record.key)))
    }

    async fn claim_invocation(
        &self,
        key: InvocationKey,
        holder: &str,
        takeover: bool,
    ) -> Result<InvocationClaim> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO saga_invocation_claims (saga_id, sequence_no, phase, holder, claimed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id, sequence_no, phase) DO UPDATE SET
                holder = EXCLUDED.holder,
                claimed_at = EXCLUDED.claimed_at
            WHERE saga_invocation_claims.holder = EXCLUDED.holder OR $6::boolean
            RETURNING holder
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(key.sequence_no as i32)
        .bind(key.phase.as_str())
        .bind(holder)
        .bind(Utc::now())
        .bind(takeover)
        .fetch_optional(&self.pool)
        .await?;

        // Checked after the claim so an outcome written concurrently is seen.
        if let Some(record) = self.get_invocation(key).await? {
            return Ok(InvocationClaim::Completed(record));
        }
        if claimed.is_some() {
            return Ok(InvocationClaim::Granted);
        }

        let current: String = sqlx::query_scalar(
            r#"
            SELECT holder
            FROM saga_invocation_claims
            WHERE saga_id = $1 AND sequence_no = $2 AND phase = $3
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(key.sequence_no as i32)
        .bind(key.phase.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StepLogError::Corrupt(format!("claim on {key} vanished")))?;
        Ok(InvocationClaim::HeldBy(current))
    }
}

#[async_trait]
impl LeaseStore for PostgresStepLog {
    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();

        let row: Option<PgRow> = sqlx::query(
            r#"
            INSERT INTO saga_leases (saga_id, owner, token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (saga_id) DO UPDATE SET
                owner = EXCLUDED.owner,
                token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE saga_leases.expires_at <= $5
            RETURNING saga_id, owner, token, expires_at
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(Uuid::new_v4())
        .bind(expiry_from(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = Utc::now();

        let row: Option<PgRow> = sqlx::query(
            r#"
            UPDATE saga_leases
            SET expires_at = $3
            WHERE saga_id = $1 AND token = $2 AND expires_at > $4
            RETURNING saga_id, owner, token, expires_at
            "#,
        )
        .bind(lease.saga_id.as_uuid())
        .bind(lease.token)
        .bind(expiry_from(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_lease(&row),
            None => Err(StepLogError::LeaseExpired(lease.saga_id)),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        sqlx::query("DELETE FROM saga_leases WHERE saga_id = $1 AND token = $2")
            .bind(lease.saga_id.as_uuid())
            .bind(lease.token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

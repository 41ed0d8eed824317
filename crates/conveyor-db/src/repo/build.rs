//! Build-scoped store operations: the scheduling lease, status
//! transitions, and preparation records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use conveyor_core::preparation::{BuildPreparation, PreparationStatus};
use conveyor_core::{BuildId, BuildStatus, Error};

use crate::{DbError, DbResult};

/// Time-limited exclusive token over a build's scheduling work.
///
/// Released on every exit path of the scheduling procedure. An unreleased
/// lease is survivable: it dies at its TTL and the store is then free to
/// issue a new one.
#[async_trait]
pub trait SchedulingLease: Send + Sync {
    fn build_id(&self) -> BuildId;

    /// Give the lease up early. Failures are logged, not surfaced.
    async fn release(&self);
}

/// Build-scoped store surface consumed by the scheduler.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Acquire the exclusive scheduling lease for a build. `None` when
    /// another holder is live.
    async fn lease_build_scheduling(
        &self,
        build_id: BuildId,
        ttl: Duration,
    ) -> DbResult<Option<Box<dyn SchedulingLease>>>;

    /// Mark the build errored and record a build event. Only meaningful
    /// once the build has been scheduled; earlier failures use
    /// [`BuildRepo::finish_build`] so no dangling event is written.
    async fn error_build(&self, build_id: BuildId, error: &Error) -> DbResult<()>;

    /// Transition the build's status without recording a build event.
    async fn finish_build(&self, build_id: BuildId, status: BuildStatus) -> DbResult<()>;

    async fn get_build_preparation(
        &self,
        build_id: BuildId,
    ) -> DbResult<Option<BuildPreparation>>;

    /// Persist one coherent preparation snapshot.
    async fn update_build_preparation(&self, preparation: &BuildPreparation) -> DbResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct PreparationRecord {
    build_id: Uuid,
    paused_pipeline: String,
    paused_job: String,
    max_running_builds: String,
    inputs: serde_json::Value,
    inputs_satisfied: String,
}

impl PreparationRecord {
    fn into_preparation(self) -> DbResult<BuildPreparation> {
        Ok(BuildPreparation {
            build_id: BuildId::from_uuid(self.build_id),
            paused_pipeline: parse_status(&self.paused_pipeline)?,
            paused_job: parse_status(&self.paused_job)?,
            max_running_builds: parse_status(&self.max_running_builds)?,
            inputs: serde_json::from_value(self.inputs)
                .map_err(|e| DbError::Malformed(e.to_string()))?,
            inputs_satisfied: parse_status(&self.inputs_satisfied)?,
        })
    }
}

fn parse_status(raw: &str) -> DbResult<PreparationStatus> {
    PreparationStatus::parse(raw)
        .ok_or_else(|| DbError::Malformed(format!("unknown preparation status: {raw}")))
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn lease_build_scheduling(
        &self,
        build_id: BuildId,
        ttl: Duration,
    ) -> DbResult<Option<Box<dyn SchedulingLease>>> {
        let lease_id = Uuid::now_v7();
        let expires_in = chrono::Duration::milliseconds(ttl.as_millis() as i64);

        // Steals only rows whose holder let the TTL lapse.
        let result = sqlx::query(
            r#"
            INSERT INTO build_scheduling_leases (build_id, lease_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (build_id) DO UPDATE
            SET lease_id = EXCLUDED.lease_id, expires_at = EXCLUDED.expires_at
            WHERE build_scheduling_leases.expires_at <= NOW()
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(lease_id)
        .bind(Utc::now() + expires_in)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let renewal = tokio::spawn(renew_lease(self.pool.clone(), build_id, lease_id, ttl));

        Ok(Some(Box::new(PgSchedulingLease {
            pool: self.pool.clone(),
            build_id,
            lease_id,
            renewal,
        })))
    }

    async fn error_build(&self, build_id: BuildId, error: &Error) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE builds SET status = 'errored' WHERE id = $1")
            .bind(build_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::Missing(format!("build {build_id}")));
        }

        sqlx::query(
            r#"
            INSERT INTO build_events (id, build_id, event, payload, created_at)
            VALUES ($1, $2, 'error', $3, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(build_id.as_uuid())
        .bind(serde_json::json!({ "message": error.to_string() }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finish_build(&self, build_id: BuildId, status: BuildStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE builds SET status = $2 WHERE id = $1")
            .bind(build_id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::Missing(format!("build {build_id}")));
        }
        Ok(())
    }

    async fn get_build_preparation(
        &self,
        build_id: BuildId,
    ) -> DbResult<Option<BuildPreparation>> {
        let record = sqlx::query_as::<_, PreparationRecord>(
            r#"
            SELECT build_id, paused_pipeline, paused_job, max_running_builds,
                   inputs, inputs_satisfied
            FROM build_preparation
            WHERE build_id = $1
            "#,
        )
        .bind(build_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(record.into_preparation()?)),
            None => Ok(None),
        }
    }

    async fn update_build_preparation(&self, preparation: &BuildPreparation) -> DbResult<()> {
        let inputs = serde_json::to_value(&preparation.inputs)
            .map_err(|e| DbError::Malformed(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE build_preparation
            SET paused_pipeline = $2, paused_job = $3, max_running_builds = $4,
                inputs = $5, inputs_satisfied = $6
            WHERE build_id = $1
            "#,
        )
        .bind(preparation.build_id.as_uuid())
        .bind(preparation.paused_pipeline.as_str())
        .bind(preparation.paused_job.as_str())
        .bind(preparation.max_running_builds.as_str())
        .bind(inputs)
        .bind(preparation.inputs_satisfied.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Missing(format!(
                "preparation for build {}",
                preparation.build_id
            )));
        }
        Ok(())
    }
}

struct PgSchedulingLease {
    pool: PgPool,
    build_id: BuildId,
    lease_id: Uuid,
    renewal: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl SchedulingLease for PgSchedulingLease {
    fn build_id(&self) -> BuildId {
        self.build_id
    }

    async fn release(&self) {
        self.renewal.abort();

        let result =
            sqlx::query("DELETE FROM build_scheduling_leases WHERE build_id = $1 AND lease_id = $2")
                .bind(self.build_id.as_uuid())
                .bind(self.lease_id)
                .execute(&self.pool)
                .await;
        if let Err(error) = result {
            warn!(build = %self.build_id, %error, "failed to release scheduling lease");
        }
    }
}

/// Extends the lease at half-TTL intervals until it is released or lost.
async fn renew_lease(pool: PgPool, build_id: BuildId, lease_id: Uuid, ttl: Duration) {
    let expires_in = chrono::Duration::milliseconds(ttl.as_millis() as i64);

    loop {
        tokio::time::sleep(ttl / 2).await;

        let result = sqlx::query(
            "UPDATE build_scheduling_leases SET expires_at = $3 WHERE build_id = $1 AND lease_id = $2",
        )
        .bind(build_id.as_uuid())
        .bind(lease_id)
        .bind(Utc::now() + expires_in)
        .execute(&pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => break,
            Ok(_) => {}
            Err(error) => {
                warn!(build = %build_id, %error, "failed to renew scheduling lease");
                break;
            }
        }
    }
}

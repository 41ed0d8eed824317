//! Job-scoped store operations: build creation, scheduling policy,
//! version snapshots, input resolution, and input commits.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conveyor_core::config::{JobConfig, JobInput, ResourceConfig, VersionConstraint};
use conveyor_core::version::{BuildInput, Version, VersionIndex};
use conveyor_core::{Build, BuildId, BuildStatus};

use crate::{DbError, DbResult};

/// Job-scoped store surface consumed by the scheduler. Every operation is
/// atomic on the store side; the scheduler never retries within a tick.
#[async_trait]
pub trait PipelineRepo: Send + Sync {
    /// Unconditionally create a new pending build for the job.
    async fn create_job_build(&self, job_name: &str) -> DbResult<Build>;

    /// Create a pending build for candidate-input discovery, unless one
    /// already exists for this job. `false` means another replica owns the
    /// discovery work; the returned build is then the existing one.
    async fn create_job_build_for_candidate_inputs(
        &self,
        job_name: &str,
    ) -> DbResult<(Build, bool)>;

    /// Mark the build runnable iff policy permits: job not paused,
    /// concurrency caps respected, serial groups clear. Idempotent; a
    /// second call on an already-scheduled build returns `false`.
    async fn schedule_build(&self, build_id: BuildId, job: &JobConfig) -> DbResult<bool>;

    /// Find a build of the job whose committed inputs exactly match.
    async fn get_job_build_for_inputs(
        &self,
        job_name: &str,
        inputs: &[BuildInput],
    ) -> DbResult<Option<Build>>;

    /// Oldest pending build of the job.
    async fn get_next_pending_build(&self, job_name: &str) -> DbResult<Option<Build>>;

    /// Snapshot every known resource version.
    async fn load_version_index(&self) -> DbResult<VersionIndex>;

    /// Resolve the declared inputs to concrete versions against a
    /// snapshot, in declaration order. `None` when any input cannot be
    /// satisfied.
    async fn latest_input_versions(
        &self,
        index: &VersionIndex,
        job_name: &str,
        inputs: &[JobInput],
    ) -> DbResult<Option<Vec<BuildInput>>>;

    /// Record versions discovered for a resource.
    async fn save_resource_versions(
        &self,
        resource: &ResourceConfig,
        versions: &[Version],
    ) -> DbResult<()>;

    /// Commit the build's inputs. At most once per build; a second commit
    /// is rejected as a duplicate.
    async fn use_inputs_for_build(&self, build_id: BuildId, inputs: &[BuildInput])
        -> DbResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRecord {
    id: Uuid,
    job_name: String,
    number: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl BuildRecord {
    fn into_build(self) -> DbResult<Build> {
        let status = BuildStatus::parse(&self.status)
            .ok_or_else(|| DbError::Malformed(format!("unknown build status: {}", self.status)))?;
        Ok(Build {
            id: BuildId::from_uuid(self.id),
            job_name: self.job_name,
            number: self.number,
            status,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildInputRecord {
    build_id: Uuid,
    name: String,
    resource: String,
    version: serde_json::Value,
}

/// PostgreSQL implementation of PipelineRepo.
pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn create_job_build(&self, job_name: &str) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (id, job_name, number, status, created_at)
            VALUES (
                $1, $2,
                (SELECT COALESCE(MAX(number), 0) + 1 FROM builds WHERE job_name = $2),
                'pending', NOW()
            )
            RETURNING id, job_name, number, status, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_name)
        .fetch_one(&mut *tx)
        .await?;

        insert_preparation(&mut tx, record.id).await?;
        tx.commit().await?;
        record.into_build()
    }

    async fn create_job_build_for_candidate_inputs(
        &self,
        job_name: &str,
    ) -> DbResult<(Build, bool)> {
        let mut tx = self.pool.begin().await?;

        // The partial unique index on pending discovery builds makes this
        // a single atomic claim across replicas.
        let created = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (id, job_name, number, status, for_candidate_inputs, created_at)
            VALUES (
                $1, $2,
                (SELECT COALESCE(MAX(number), 0) + 1 FROM builds WHERE job_name = $2),
                'pending', TRUE, NOW()
            )
            ON CONFLICT (job_name) WHERE status = 'pending' AND for_candidate_inputs
            DO NOTHING
            RETURNING id, job_name, number, status, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(record) = created {
            insert_preparation(&mut tx, record.id).await?;
            tx.commit().await?;
            return Ok((record.into_build()?, true));
        }
        tx.rollback().await?;

        let existing = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT id, job_name, number, status, created_at
            FROM builds
            WHERE job_name = $1 AND status = 'pending' AND for_candidate_inputs
            ORDER BY number
            LIMIT 1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::Missing(format!("pending discovery build for {job_name}")))?;

        Ok((existing.into_build()?, false))
    }

    async fn schedule_build(&self, build_id: BuildId, job: &JobConfig) -> DbResult<bool> {
        if job.paused {
            return Ok(false);
        }

        // Serial groups imply at most one running build of the job.
        let max_in_flight: Option<i64> = if job.serial_groups.is_empty() {
            job.max_in_flight.map(i64::from)
        } else {
            Some(1)
        };

        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = 'scheduled', serial_groups = $4
            WHERE id = $1
              AND status = 'pending'
              AND ($2::bigint IS NULL OR (
                  SELECT COUNT(*) FROM builds
                  WHERE job_name = $3 AND status IN ('scheduled', 'started')
              ) < $2)
              AND (cardinality($4::text[]) = 0 OR NOT EXISTS (
                  SELECT 1 FROM builds
                  WHERE id <> $1
                    AND status IN ('scheduled', 'started')
                    AND serial_groups && $4
              ))
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(max_in_flight)
        .bind(&job.name)
        .bind(&job.serial_groups)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_job_build_for_inputs(
        &self,
        job_name: &str,
        inputs: &[BuildInput],
    ) -> DbResult<Option<Build>> {
        let rows = sqlx::query_as::<_, BuildInputRecord>(
            r#"
            SELECT bi.build_id, bi.name, bi.resource, bi.version
            FROM build_inputs bi
            JOIN builds b ON b.id = bi.build_id
            WHERE b.job_name = $1
            ORDER BY bi.build_id, bi.ordinal
            "#,
        )
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?;

        let mut by_build: HashMap<Uuid, Vec<BuildInput>> = HashMap::new();
        for row in rows {
            let version = serde_json::from_value(row.version)
                .map_err(|e| DbError::Malformed(e.to_string()))?;
            by_build.entry(row.build_id).or_default().push(BuildInput {
                name: row.name,
                resource: row.resource,
                version,
            });
        }

        // Committed sets are small; exact-match semantics are clearer here
        // than in SQL.
        let mut matched = None;
        for (candidate, committed) in &by_build {
            if committed_set_matches(committed, inputs) {
                matched = Some(*candidate);
                break;
            }
        }

        let Some(build_id) = matched else {
            return Ok(None);
        };

        let record = sqlx::query_as::<_, BuildRecord>(
            "SELECT id, job_name, number, status, created_at FROM builds WHERE id = $1",
        )
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(record.into_build()?)),
            None => Ok(None),
        }
    }

    async fn get_next_pending_build(&self, job_name: &str) -> DbResult<Option<Build>> {
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT id, job_name, number, status, created_at
            FROM builds
            WHERE job_name = $1 AND status = 'pending'
            ORDER BY number
            LIMIT 1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(record.into_build()?)),
            None => Ok(None),
        }
    }

    async fn load_version_index(&self) -> DbResult<VersionIndex> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            r#"
            SELECT resource_name, version
            FROM resource_versions
            ORDER BY resource_name, discovered_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut index = VersionIndex::default();
        for (resource_name, version) in rows {
            let version =
                serde_json::from_value(version).map_err(|e| DbError::Malformed(e.to_string()))?;
            index
                .resource_versions
                .entry(resource_name)
                .or_default()
                .push(version);
        }
        Ok(index)
    }

    async fn latest_input_versions(
        &self,
        index: &VersionIndex,
        _job_name: &str,
        inputs: &[JobInput],
    ) -> DbResult<Option<Vec<BuildInput>>> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let version = match &input.version {
                Some(VersionConstraint::Pinned(version)) => {
                    if index.contains(&input.resource, version) {
                        Some(version.clone())
                    } else {
                        None
                    }
                }
                _ => index.latest(&input.resource).cloned(),
            };

            let Some(version) = version else {
                return Ok(None);
            };
            resolved.push(BuildInput {
                name: input.name.clone(),
                resource: input.resource.clone(),
                version,
            });
        }
        Ok(Some(resolved))
    }

    async fn save_resource_versions(
        &self,
        resource: &ResourceConfig,
        versions: &[Version],
    ) -> DbResult<()> {
        for version in versions {
            let version =
                serde_json::to_value(version).map_err(|e| DbError::Malformed(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO resource_versions (id, resource_name, version, discovered_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (resource_name, version) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&resource.name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn use_inputs_for_build(
        &self,
        build_id: BuildId,
        inputs: &[BuildInput],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let committed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM build_inputs WHERE build_id = $1",
        )
        .bind(build_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if committed > 0 {
            return Err(DbError::AlreadyRecorded(format!(
                "inputs already committed for build {build_id}"
            )));
        }

        for (ordinal, input) in inputs.iter().enumerate() {
            let version = serde_json::to_value(&input.version)
                .map_err(|e| DbError::Malformed(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO build_inputs (build_id, ordinal, name, resource, version)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(build_id.as_uuid())
            .bind(ordinal as i32)
            .bind(&input.name)
            .bind(&input.resource)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// True when every requested input was committed at the same version.
///
/// A build commits all of its declared inputs, while callers may ask
/// about only the triggering subset, so the committed set is matched on
/// the requested names and the rest of it is ignored.
fn committed_set_matches(committed: &[BuildInput], wanted: &[BuildInput]) -> bool {
    let mut relevant: Vec<&BuildInput> = committed
        .iter()
        .filter(|c| wanted.iter().any(|w| w.name == c.name))
        .collect();
    let mut wanted: Vec<&BuildInput> = wanted.iter().collect();
    relevant.sort_by(|x, y| x.name.cmp(&y.name));
    wanted.sort_by(|x, y| x.name.cmp(&y.name));

    relevant.len() == wanted.len() && relevant.iter().zip(&wanted).all(|(c, w)| c == w)
}

async fn insert_preparation(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    build_id: Uuid,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO build_preparation
            (build_id, paused_pipeline, paused_job, max_running_builds, inputs, inputs_satisfied)
        VALUES ($1, 'unknown', 'unknown', 'unknown', '{}'::jsonb, 'unknown')
        "#,
    )
    .bind(build_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_record_maps_to_domain() {
        let record = BuildRecord {
            id: Uuid::now_v7(),
            job_name: "compile".to_string(),
            number: 7,
            status: "scheduled".to_string(),
            created_at: Utc::now(),
        };

        let build = record.into_build().unwrap();
        assert_eq!(build.job_name, "compile");
        assert_eq!(build.number, 7);
        assert_eq!(build.status, BuildStatus::Scheduled);
    }

    #[test]
    fn build_record_rejects_unknown_status() {
        let record = BuildRecord {
            id: Uuid::now_v7(),
            job_name: "compile".to_string(),
            number: 1,
            status: "mystery".to_string(),
            created_at: Utc::now(),
        };

        assert!(matches!(record.into_build(), Err(DbError::Malformed(_))));
    }

    fn input(name: &str, resource: &str, reference: &str) -> BuildInput {
        BuildInput {
            name: name.to_string(),
            resource: resource.to_string(),
            version: [("ref".to_string(), reference.to_string())]
                .into_iter()
                .collect(),
        }
    }

    // A build commits every declared input; the trigger check asks about
    // the triggering subset only. Here "deps" plays the non-triggering
    // input that must not defeat the match.
    fn committed() -> Vec<BuildInput> {
        vec![
            input("src", "repo", "abc123"),
            input("image", "registry", "v4"),
            input("deps", "dep-cache", "2024-11"),
        ]
    }

    #[test]
    fn matches_the_triggering_subset_of_a_wider_committed_set() {
        let wanted = vec![
            input("src", "repo", "abc123"),
            input("image", "registry", "v4"),
        ];

        assert!(committed_set_matches(&committed(), &wanted));
    }

    #[test]
    fn rejects_a_version_mismatch_on_a_requested_input() {
        let wanted = vec![input("src", "repo", "def456")];

        assert!(!committed_set_matches(&committed(), &wanted));
    }

    #[test]
    fn rejects_a_requested_input_that_was_never_committed() {
        let wanted = vec![
            input("src", "repo", "abc123"),
            input("notes", "wiki", "1"),
        ];

        assert!(!committed_set_matches(&committed(), &wanted));
    }

    #[test]
    fn ignores_request_order() {
        let wanted = vec![
            input("image", "registry", "v4"),
            input("src", "repo", "abc123"),
        ];

        assert!(committed_set_matches(&committed(), &wanted));
    }
}

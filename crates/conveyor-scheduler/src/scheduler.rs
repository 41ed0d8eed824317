//! The per-tick scheduling procedure and its entry points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use conveyor_core::build::{Build, BuildStatus};
use conveyor_core::config::{JobConfig, ResourceConfig};
use conveyor_core::engine::{Engine, EngineBuild};
use conveyor_core::plan::PlanFactory;
use conveyor_core::preparation::PreparationStatus;
use conveyor_core::scanner::Scanner;
use conveyor_core::version::{BuildInput, VersionIndex};
use conveyor_core::{Error, Result};
use conveyor_db::{BuildRepo, PipelineRepo};

/// How long one attempt may exclusively own a build's scheduling work.
/// Must cover a scan of every declared input plus plan construction.
const SCHEDULING_LEASE_TTL: Duration = Duration::from_secs(10);

/// Where input versions come from for one scheduling attempt.
#[derive(Clone)]
pub enum VersionSource {
    /// Resolve against a snapshot the caller already loaded this tick.
    Cached(Arc<VersionIndex>),
    /// Scan every declared input's resource first, then load a fresh
    /// snapshot. Used for user triggers, which must not settle for stale
    /// cached versions.
    FreshScan,
}

/// Completion of a background scheduling attempt.
///
/// Resolves once the attempt has handed its build to the engine or exited.
/// The engine's own resume task is deliberately out of scope: waiting for
/// tick quiescence must not wait for build execution.
pub struct CompletionHandle(JoinHandle<()>);

impl CompletionHandle {
    pub async fn wait(self) {
        // The attempt swallows its own failures; a join error can only
        // mean the task was cancelled.
        let _ = self.0.await;
    }
}

/// Per-tick decision engine for a single job.
///
/// Holds no state of its own and takes no locks; exclusivity across
/// scheduler replicas comes from the store's lease and atomic creates.
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Arc<dyn PipelineRepo>,
    builds: Arc<dyn BuildRepo>,
    factory: Arc<dyn PlanFactory>,
    engine: Arc<dyn Engine>,
    scanner: Arc<dyn Scanner>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<dyn PipelineRepo>,
        builds: Arc<dyn BuildRepo>,
        factory: Arc<dyn PlanFactory>,
        engine: Arc<dyn Engine>,
        scanner: Arc<dyn Scanner>,
    ) -> Self {
        Self {
            pipeline,
            builds,
            factory,
            engine,
            scanner,
        }
    }

    /// Create and schedule a build for the newest triggering input
    /// versions, unless one already exists for them.
    ///
    /// Runs the scheduling procedure synchronously: within a tick this is
    /// the mutual-exclusion boundary that keeps replicas from repeating
    /// the same input-discovery work.
    pub async fn build_latest_inputs(
        &self,
        versions: Arc<VersionIndex>,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> Result<()> {
        let span = info_span!("build-latest", job = %job.name);
        async move {
            if job.inputs.is_empty() {
                // manual-only job; nothing to react to
                return Ok(());
            }

            let latest = match self
                .pipeline
                .latest_input_versions(&versions, &job.name, &job.inputs)
                .await
            {
                Ok(latest) => latest,
                Err(error) => {
                    error!(%error, "failed to get latest input versions");
                    return Err(Error::Store(error.to_string()));
                }
            };

            let Some(latest) = latest else {
                debug!("no input versions available");
                return Ok(());
            };

            let triggering: Vec<BuildInput> = latest
                .into_iter()
                .filter(|input| {
                    job.inputs
                        .iter()
                        .any(|declared| declared.name == input.name && declared.trigger)
                })
                .collect();

            if triggering.is_empty() {
                debug!("no triggering input versions");
                return Ok(());
            }

            match self
                .pipeline
                .get_job_build_for_inputs(&job.name, &triggering)
                .await
            {
                Ok(Some(existing)) => {
                    debug!(existing_build = %existing.id, "build already exists for inputs");
                    return Ok(());
                }
                Ok(None) => {}
                Err(error) => {
                    error!(%error, "could not determine if inputs are already used");
                    return Err(Error::Store(error.to_string()));
                }
            }

            let (build, created) = match self
                .pipeline
                .create_job_build_for_candidate_inputs(&job.name)
                .await
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    error!(%error, "failed to create build");
                    return Err(Error::Store(error.to_string()));
                }
            };

            if !created {
                debug!(existing_build = %build.id, "waiting for existing build to determine inputs");
                return Ok(());
            }

            debug!(build = %build.id, "created build");

            self.schedule_and_resume(
                build,
                VersionSource::Cached(versions),
                job.clone(),
                resources.to_vec(),
            )
            .await;

            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Schedule the oldest pending build of the job, if any, on a
    /// background task. Within one job the store's lease serializes
    /// attempts; across jobs they run freely in parallel.
    pub fn try_next_pending_build(
        &self,
        versions: Arc<VersionIndex>,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> CompletionHandle {
        let span = info_span!("try-next-pending", job = %job.name);
        let scheduler = self.clone();
        let job = job.clone();
        let resources = resources.to_vec();

        let task = tokio::spawn(
            async move {
                let build = match scheduler.pipeline.get_next_pending_build(&job.name).await {
                    Ok(Some(build)) => build,
                    Ok(None) => return,
                    Err(error) => {
                        error!(%error, "failed to get next pending build");
                        return;
                    }
                };

                scheduler
                    .schedule_and_resume(build, VersionSource::Cached(versions), job, resources)
                    .await;
            }
            .instrument(span),
        );

        CompletionHandle(task)
    }

    /// Create a build right now and schedule it in the background.
    ///
    /// The attempt starts from [`VersionSource::FreshScan`] so the build
    /// sees the newest version of every input rather than whatever a
    /// previous tick cached. Returns as soon as the build exists, letting
    /// an HTTP caller answer with the build id without waiting on scans.
    pub async fn trigger_immediately(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> Result<(Build, CompletionHandle)> {
        let span = info_span!("trigger-immediately", job = %job.name);

        let build = match self.pipeline.create_job_build(&job.name).await {
            Ok(build) => build,
            Err(error) => {
                span.in_scope(|| error!(%error, "failed to create build"));
                return Err(Error::Store(error.to_string()));
            }
        };

        let scheduler = self.clone();
        let job = job.clone();
        let resources = resources.to_vec();
        let pending = build.clone();
        let task = tokio::spawn(
            async move {
                scheduler
                    .schedule_and_resume(pending, VersionSource::FreshScan, job, resources)
                    .await;
            }
            .instrument(span),
        );

        Ok((build, CompletionHandle(task)))
    }

    /// The common scheduling procedure: lease, schedule, discover inputs,
    /// commit them, build a plan, hand off to the engine. The lease is
    /// released on every exit path.
    async fn schedule_and_resume(
        &self,
        build: Build,
        versions: VersionSource,
        job: JobConfig,
        resources: Vec<ResourceConfig>,
    ) -> Option<Arc<dyn EngineBuild>> {
        let lease = match self
            .builds
            .lease_build_scheduling(build.id, SCHEDULING_LEASE_TTL)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => return None,
            Err(error) => {
                error!(%error, build = %build.id, "failed to acquire scheduling lease");
                return None;
            }
        };

        let span = info_span!("schedule-build", build = %build.id);
        let engine_build = self
            .prepare_and_start(&build, versions, &job, &resources)
            .instrument(span)
            .await;

        lease.release().await;

        engine_build
    }

    async fn prepare_and_start(
        &self,
        build: &Build,
        versions: VersionSource,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> Option<Arc<dyn EngineBuild>> {
        match self.pipeline.schedule_build(build.id, job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("build could not be scheduled");
                return None;
            }
            Err(error) => {
                error!(%error, "failed to schedule build");
                return None;
            }
        }

        let mut preparation = match self.builds.get_build_preparation(build.id).await {
            Ok(Some(preparation)) => preparation,
            Ok(None) => {
                debug!("build preparation is missing");
                return None;
            }
            Err(error) => {
                error!(%error, "failed to get build preparation");
                return None;
            }
        };

        let index = match versions {
            VersionSource::Cached(index) => {
                for input in &job.inputs {
                    preparation
                        .inputs
                        .insert(input.name.clone(), PreparationStatus::NotBlocking);
                }
                preparation.inputs_satisfied = PreparationStatus::Blocking;
                if let Err(error) = self.builds.update_build_preparation(&preparation).await {
                    error!(%error, "failed to update preparation with discovered inputs");
                    return None;
                }
                index
            }
            VersionSource::FreshScan => {
                for input in &job.inputs {
                    preparation
                        .inputs
                        .insert(input.name.clone(), PreparationStatus::Unknown);
                }
                preparation.inputs_satisfied = PreparationStatus::Blocking;
                if let Err(error) = self.builds.update_build_preparation(&preparation).await {
                    error!(%error, "failed to update preparation before scanning");
                    return None;
                }

                for input in &job.inputs {
                    let scan_span =
                        info_span!("scan", input = %input.name, resource = %input.resource);

                    preparation
                        .inputs
                        .insert(input.name.clone(), PreparationStatus::Blocking);
                    if let Err(error) = self.builds.update_build_preparation(&preparation).await {
                        error!(%error, "failed to update preparation with blocking input");
                        return None;
                    }

                    let scanned = self
                        .scanner
                        .scan(&input.resource)
                        .instrument(scan_span.clone())
                        .await;
                    if let Err(error) = scanned {
                        scan_span.in_scope(|| error!(%error, "failed to scan"));
                        if let Err(store_error) = self.builds.error_build(build.id, &error).await {
                            error!(error = %store_error, "failed to mark build as errored");
                        }
                        return None;
                    }

                    preparation
                        .inputs
                        .insert(input.name.clone(), PreparationStatus::NotBlocking);
                    if let Err(error) = self.builds.update_build_preparation(&preparation).await {
                        error!(%error, "failed to update preparation with not-blocking input");
                        return None;
                    }

                    scan_span.in_scope(|| info!("done"));
                }

                let load_start = Instant::now();
                let index = match self.pipeline.load_version_index().await {
                    Ok(index) => Arc::new(index),
                    Err(error) => {
                        error!(%error, "failed to load version index");
                        return None;
                    }
                };
                info!(took = ?load_start.elapsed(), "loaded version index");
                index
            }
        };

        let resolved = match self
            .pipeline
            .latest_input_versions(&index, &job.name, &job.inputs)
            .await
        {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                debug!("no input versions available");
                return None;
            }
            Err(error) => {
                error!(%error, "failed to get latest input versions");
                return None;
            }
        };

        // Satisfied flips before the commit so observers never see
        // committed inputs on a build still reported as blocked.
        preparation.inputs_satisfied = PreparationStatus::NotBlocking;
        if let Err(error) = self.builds.update_build_preparation(&preparation).await {
            error!(%error, "failed to update preparation with inputs satisfied");
            return None;
        }

        if let Err(error) = self.pipeline.use_inputs_for_build(build.id, &resolved).await {
            error!(%error, "failed to use inputs for build");
            return None;
        }

        let plan = match self.factory.create(job, resources, &resolved).await {
            Ok(plan) => plan,
            Err(error) => {
                // Not error_build: that records a build event, and this
                // build never started.
                error!(%error, "failed to create plan");
                if let Err(store_error) =
                    self.builds.finish_build(build.id, BuildStatus::Errored).await
                {
                    error!(error = %store_error, "failed to mark build as errored");
                }
                return None;
            }
        };

        let engine_build = match self.engine.create_build(build, plan).await {
            Ok(engine_build) => engine_build,
            Err(error) => {
                // The build stays scheduled but orphaned; recovery belongs
                // to the surrounding reaper.
                error!(%error, "failed to hand build to engine");
                return None;
            }
        };

        info!("building");

        let resume = engine_build.clone();
        let resume_span = info_span!("resume", build = %build.id);
        tokio::spawn(async move { resume.resume().await }.instrument(resume_span));

        Some(engine_build)
    }
}

//! Project orchestrator: owns project rows, drives lifecycle transitions,
//! reserves ports, and invokes the container driver.

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use hub_db::models::{Project, ProjectStatus};
use hub_db::queries::projects as db;

use crate::driver::{ContainerDriver, StackSpec};
use crate::events::EventService;

use super::lock::ProjectLocks;
use super::ports::{self, PortRanges};
use super::state::ProjectStateMachine;

/// Errors the orchestrator raises that the Control-Plane API maps onto
/// the public error taxonomy (`CONFLICT`, `NOT_FOUND`, ...).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("project {0} not found")]
    NotFound(Uuid),
    #[error("another lifecycle operation is already in progress for project {0}")]
    AlreadyInProgress(Uuid),
    #[error("project {project_id} has status {current}, expected {expected}")]
    Conflict {
        project_id: Uuid,
        current: ProjectStatus,
        expected: ProjectStatus,
    },
    #[error("no free ports available in configured ranges")]
    PortsInUse,
    #[error("container driver failure: {0}")]
    DriverFailure(#[from] anyhow::Error),
}

/// Outcome of accepting a `Start`/`Stop`/`Restart` call. Final status is
/// observed via [`ProjectOrchestrator::get_status`] or the event bus,
/// never returned directly -- the call only reports whether the
/// transition into the in-flight state was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
}

/// Drives project lifecycle operations against a [`ContainerDriver`].
pub struct ProjectOrchestrator {
    driver: Arc<dyn ContainerDriver>,
    locks: Arc<ProjectLocks>,
    ranges: PortRanges,
    events: Arc<EventService>,
}

impl ProjectOrchestrator {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        locks: Arc<ProjectLocks>,
        ranges: PortRanges,
        events: Arc<EventService>,
    ) -> Self {
        Self {
            driver,
            locks,
            ranges,
            events,
        }
    }

    /// Publish `hub.<slug>.project.<state>`, logging (not failing the
    /// caller) on a publish error -- lifecycle traces are best-effort
    /// observability, not part of the state machine's correctness.
    async fn publish_lifecycle_event(&self, slug: &str, project_id: Uuid, state: &str) {
        let subject = format!("hub.{slug}.project.{state}");
        if let Err(e) = self
            .events
            .publish(&subject, &serde_json::json!({"project_id": project_id}), "project-orchestrator", None)
            .await
        {
            tracing::warn!(project_id = %project_id, subject, error = %e, "failed to publish project lifecycle event");
        }
    }

    async fn require_project(pool: &PgPool, project_id: Uuid) -> Result<Project, OrchestratorError> {
        db::get_project(pool, project_id)
            .await
            .map_err(OrchestratorError::DriverFailure)?
            .ok_or(OrchestratorError::NotFound(project_id))
    }

    /// `Start(projectId)`. Accepts synchronously (after validating state,
    /// lock, and port availability) and completes the rest of the
    /// transition in the background; the caller polls [`Self::get_status`]
    /// or subscribes to `hub.<slug>.project.started` / `.failed`.
    pub async fn start(self: &Arc<Self>, pool: PgPool, project_id: Uuid) -> Result<StartOutcome, OrchestratorError> {
        let guard = self
            .locks
            .try_acquire(project_id)
            .ok_or(OrchestratorError::AlreadyInProgress(project_id))?;

        let project = Self::require_project(&pool, project_id).await?;
        if project.status != ProjectStatus::Stopped {
            return Err(OrchestratorError::Conflict {
                project_id,
                current: project.status,
                expected: ProjectStatus::Stopped,
            });
        }

        let designated = match (
            project.designated_backend_port,
            project.designated_frontend_port,
            project.designated_db_port,
            project.designated_cache_port,
        ) {
            (Some(backend_port), Some(frontend_port), Some(db_port), Some(cache_port)) => Some(ports::PortReservation {
                backend_port,
                frontend_port,
                db_port,
                cache_port,
            }),
            _ => None,
        };

        let reservation = ports::reserve(&pool, &self.ranges, designated, None)
            .await
            .map_err(|_| OrchestratorError::PortsInUse)?;

        ProjectStateMachine::transition(
            &pool,
            project_id,
            ProjectStatus::Stopped,
            ProjectStatus::Starting,
            Some((
                reservation.backend_port,
                reservation.frontend_port,
                reservation.db_port,
                reservation.cache_port,
            )),
            false,
            None,
            None,
        )
        .await
        .map_err(OrchestratorError::DriverFailure)?;

        self.publish_lifecycle_event(&project.slug, project_id, "starting").await;

        let this = Arc::clone(self);
        let slug = project.slug.clone();
        let fs_path = project.fs_path.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.finish_start(pool, project_id, slug, fs_path, reservation).await;
        });

        Ok(StartOutcome::Accepted)
    }

    async fn finish_start(
        &self,
        pool: PgPool,
        project_id: Uuid,
        slug: String,
        fs_path: String,
        reservation: ports::PortReservation,
    ) {
        let spec = StackSpec {
            project_slug: slug.clone(),
            fs_path,
            backend_port: reservation.backend_port,
            frontend_port: reservation.frontend_port,
            db_port: reservation.db_port,
            cache_port: reservation.cache_port,
        };

        match self.driver.start_stack(&spec).await {
            Ok(handle) => {
                if let Err(e) = ProjectStateMachine::transition(
                    &pool,
                    project_id,
                    ProjectStatus::Starting,
                    ProjectStatus::Running,
                    None,
                    false,
                    Some(&handle),
                    None,
                )
                .await
                {
                    tracing::error!(project_id = %project_id, error = %e, "failed to persist running transition after successful start_stack");
                }
                tracing::info!(project_id = %project_id, slug = %slug, "project started");
                self.publish_lifecycle_event(&slug, project_id, "started").await;
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, slug = %slug, error = %e, "start_stack failed");
                let _ = ProjectStateMachine::transition(
                    &pool,
                    project_id,
                    ProjectStatus::Starting,
                    ProjectStatus::Error,
                    None,
                    true,
                    None,
                    Some(&e.to_string()),
                )
                .await;
                self.publish_lifecycle_event(&slug, project_id, "failed").await;
            }
        }
    }

    /// `Stop(projectId)`. Same accept-then-complete shape as [`Self::start`].
    pub async fn stop(self: &Arc<Self>, pool: PgPool, project_id: Uuid) -> Result<StartOutcome, OrchestratorError> {
        let guard = self
            .locks
            .try_acquire(project_id)
            .ok_or(OrchestratorError::AlreadyInProgress(project_id))?;

        let project = Self::require_project(&pool, project_id).await?;
        if project.status != ProjectStatus::Running && project.status != ProjectStatus::Error {
            return Err(OrchestratorError::Conflict {
                project_id,
                current: project.status,
                expected: ProjectStatus::Running,
            });
        }

        let from = project.status;
        if from == ProjectStatus::Error {
            // ERROR -> STOPPED directly: no driver call, nothing to tear down
            // beyond what the failed start already rolled back.
            ProjectStateMachine::transition(
                &pool,
                project_id,
                ProjectStatus::Error,
                ProjectStatus::Stopped,
                None,
                true,
                None,
                None,
            )
            .await
            .map_err(OrchestratorError::DriverFailure)?;
            self.publish_lifecycle_event(&project.slug, project_id, "stopped").await;
            drop(guard);
            return Ok(StartOutcome::Accepted);
        }

        ProjectStateMachine::transition(
            &pool,
            project_id,
            ProjectStatus::Running,
            ProjectStatus::Stopping,
            None,
            false,
            None,
            None,
        )
        .await
        .map_err(OrchestratorError::DriverFailure)?;

        self.publish_lifecycle_event(&project.slug, project_id, "stopping").await;

        let this = Arc::clone(self);
        let driver_handle = project.driver_handle.clone();
        let slug = project.slug.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.finish_stop(pool, project_id, slug, driver_handle).await;
        });

        Ok(StartOutcome::Accepted)
    }

    async fn finish_stop(&self, pool: PgPool, project_id: Uuid, slug: String, driver_handle: Option<String>) {
        let Some(handle) = driver_handle else {
            tracing::error!(project_id = %project_id, "stopping project with no driver_handle recorded");
            let _ = ProjectStateMachine::transition(
                &pool,
                project_id,
                ProjectStatus::Stopping,
                ProjectStatus::Error,
                None,
                true,
                None,
                Some("no driver handle recorded"),
            )
            .await;
            self.publish_lifecycle_event(&slug, project_id, "failed").await;
            return;
        };

        match self.driver.stop_stack(&handle).await {
            Ok(()) => {
                let _ = ProjectStateMachine::transition(
                    &pool,
                    project_id,
                    ProjectStatus::Stopping,
                    ProjectStatus::Stopped,
                    None,
                    true,
                    None,
                    None,
                )
                .await;
                tracing::info!(project_id = %project_id, "project stopped");
                self.publish_lifecycle_event(&slug, project_id, "stopped").await;
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "stop_stack failed");
                let _ = ProjectStateMachine::transition(
                    &pool,
                    project_id,
                    ProjectStatus::Stopping,
                    ProjectStatus::Error,
                    None,
                    true,
                    None,
                    Some(&e.to_string()),
                )
                .await;
                self.publish_lifecycle_event(&slug, project_id, "failed").await;
            }
        }
    }

    /// `Restart(projectId)`. Sequential stop then start; the caller is
    /// expected to wait for the stop to reach STOPPED (via polling or the
    /// event bus) before invoking start, matching the spec's "sequential"
    /// wording. This method performs that wait internally.
    pub async fn restart(self: &Arc<Self>, pool: PgPool, project_id: Uuid) -> Result<StartOutcome, OrchestratorError> {
        self.stop(pool.clone(), project_id).await?;

        loop {
            let project = Self::require_project(&pool, project_id).await?;
            match project.status {
                ProjectStatus::Stopped => break,
                ProjectStatus::Error => {
                    return Err(OrchestratorError::Conflict {
                        project_id,
                        current: ProjectStatus::Error,
                        expected: ProjectStatus::Stopped,
                    });
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            }
        }

        self.start(pool, project_id).await
    }

    /// `GetStatus(projectId)`. Pure read.
    pub async fn get_status(&self, pool: &PgPool, project_id: Uuid) -> Result<Project, OrchestratorError> {
        Self::require_project(pool, project_id).await
    }

    /// `Delete(projectId, deleteFiles)`. Only permitted while STOPPED.
    pub async fn delete(&self, pool: &PgPool, project_id: Uuid, delete_files: bool) -> Result<(), OrchestratorError> {
        let project = Self::require_project(pool, project_id).await?;
        if project.status != ProjectStatus::Stopped {
            return Err(OrchestratorError::Conflict {
                project_id,
                current: project.status,
                expected: ProjectStatus::Stopped,
            });
        }

        let rows = db::delete_stopped_project(pool, project_id)
            .await
            .map_err(OrchestratorError::DriverFailure)?;

        if rows == 0 {
            return Err(OrchestratorError::Conflict {
                project_id,
                current: project.status,
                expected: ProjectStatus::Stopped,
            });
        }

        if delete_files {
            if let Err(e) = tokio::fs::remove_dir_all(&project.fs_path).await {
                tracing::warn!(project_id = %project_id, path = %project.fs_path, error = %e, "failed to remove project files (non-fatal)");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_error_display() {
        let id = Uuid::nil();
        let e = OrchestratorError::AlreadyInProgress(id);
        assert!(e.to_string().contains("already in progress"));

        let e = OrchestratorError::Conflict {
            project_id: id,
            current: ProjectStatus::Running,
            expected: ProjectStatus::Stopped,
        };
        assert!(e.to_string().contains("running"));
    }
}

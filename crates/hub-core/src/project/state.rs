//! Project status state machine transitions.
//!
//! Validates and executes status transitions for projects, enforcing the
//! allowed transition graph and optimistic locking at the database layer.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use hub_db::models::ProjectStatus;
use hub_db::queries::projects as db;

/// The project status state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// stopped  -> starting
/// starting -> running
/// starting -> error
/// running  -> stopping
/// running  -> error
/// stopping -> stopped
/// stopping -> error
/// error    -> stopped   (force-stop / cleanup)
/// ```
pub struct ProjectStateMachine;

impl ProjectStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (from, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Stopped)
        )
    }

    /// Execute a validated status transition with optimistic locking.
    ///
    /// `ports` and `clear_ports` control the four reserved port columns;
    /// see [`hub_db::queries::projects::transition_project_status`].
    /// Returns an error if the transition is not a legal edge, the project
    /// does not exist, or the current status does not match `from`
    /// (optimistic lock failure -- reported as a conflict to the caller).
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        pool: &PgPool,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        ports: Option<(i32, i32, i32, i32)>,
        clear_ports: bool,
        driver_handle: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid project state transition: {from} -> {to} for project {project_id}");
        }

        let rows = db::transition_project_status(
            pool,
            project_id,
            from,
            to,
            ports,
            clear_ports,
            driver_handle,
            last_error,
        )
        .await
        .with_context(|| format!("failed to transition project {project_id} from {from} to {to}"))?;

        if rows == 0 {
            let project = db::get_project(pool, project_id).await?;
            match project {
                None => bail!("project {project_id} not found"),
                Some(p) => bail!(
                    "optimistic lock failed: project {project_id} has status {}, expected {from}",
                    p.status
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProjectStatus::*;

    #[test]
    fn valid_transitions_follow_spec_graph() {
        assert!(ProjectStateMachine::is_valid_transition(Stopped, Starting));
        assert!(ProjectStateMachine::is_valid_transition(Starting, Running));
        assert!(ProjectStateMachine::is_valid_transition(Starting, Error));
        assert!(ProjectStateMachine::is_valid_transition(Running, Stopping));
        assert!(ProjectStateMachine::is_valid_transition(Running, Error));
        assert!(ProjectStateMachine::is_valid_transition(Stopping, Stopped));
        assert!(ProjectStateMachine::is_valid_transition(Stopping, Error));
        assert!(ProjectStateMachine::is_valid_transition(Error, Stopped));
    }

    #[test]
    fn invalid_transitions_rejected() {
        assert!(!ProjectStateMachine::is_valid_transition(Stopped, Running));
        assert!(!ProjectStateMachine::is_valid_transition(Running, Starting));
        assert!(!ProjectStateMachine::is_valid_transition(Stopped, Stopping));
        assert!(!ProjectStateMachine::is_valid_transition(Error, Running));
        assert!(!ProjectStateMachine::is_valid_transition(Error, Starting));
    }
}

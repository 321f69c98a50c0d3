//! Port reservation for project stacks.
//!
//! Each project stack needs four ports (backend, frontend, db, cache).
//! A port is reservable for a project when it is free at the OS level
//! *and* not already held by another non-STOPPED project in the
//! database. Both checks are advisory: the authoritative invariant is
//! the partial unique index on the `projects` table, which rejects the
//! transition if another row wins the race.

use std::net::TcpListener;

use anyhow::Result;
use sqlx::PgPool;

use hub_db::queries::projects as db;

/// Inclusive port ranges to allocate from, configured via
/// `PORT_RANGE_BACKEND`, `PORT_RANGE_FRONTEND`, `PORT_RANGE_DB`, and
/// `PORT_RANGE_CACHE`.
#[derive(Debug, Clone)]
pub struct PortRanges {
    pub backend: (u16, u16),
    pub frontend: (u16, u16),
    pub db: (u16, u16),
    pub cache: (u16, u16),
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            backend: (8000, 8999),
            frontend: (3000, 3999),
            db: (5500, 5999),
            cache: (6400, 6799),
        }
    }
}

/// A set of four ports reserved for one project's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReservation {
    pub backend_port: i32,
    pub frontend_port: i32,
    pub db_port: i32,
    pub cache_port: i32,
}

/// Returns `true` when a TCP port is free to bind on all interfaces.
fn os_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Find the first port in `range` that is free at the OS level and not
/// already occupied by `taken`.
fn first_free(range: (u16, u16), taken: &[i32]) -> Option<u16> {
    (range.0..=range.1).find(|p| !taken.contains(&(*p as i32)) && os_port_free(*p))
}

/// Allocate a fresh set of four ports, preferring the given ranges, that
/// are free both at the OS level and in the database.
///
/// `excluding_project_id` lets `Restart` try to keep the project's
/// current ports before falling back to a new allocation.
pub async fn allocate(
    pool: &PgPool,
    ranges: &PortRanges,
    excluding_project_id: Option<uuid::Uuid>,
) -> Result<PortReservation> {
    // Try each range independently; on most systems with the default
    // ranges this terminates on the first candidate. Ports rejected by a
    // prior iteration's DB check are carried forward in `taken_*` so each
    // attempt advances past them instead of re-proposing the same
    // quadruple.
    let mut taken_backend = Vec::new();
    let mut taken_frontend = Vec::new();
    let mut taken_db = Vec::new();
    let mut taken_cache = Vec::new();

    for _attempt in 0..64 {
        let backend = match first_free(ranges.backend, &taken_backend) {
            Some(p) => p,
            None => break,
        };
        let frontend = match first_free(ranges.frontend, &taken_frontend) {
            Some(p) => p,
            None => break,
        };
        let db_port = match first_free(ranges.db, &taken_db) {
            Some(p) => p,
            None => break,
        };
        let cache = match first_free(ranges.cache, &taken_cache) {
            Some(p) => p,
            None => break,
        };

        let in_use = db::ports_in_use(
            pool,
            backend as i32,
            frontend as i32,
            db_port as i32,
            cache as i32,
            excluding_project_id,
        )
        .await?;

        if !in_use {
            return Ok(PortReservation {
                backend_port: backend as i32,
                frontend_port: frontend as i32,
                db_port: db_port as i32,
                cache_port: cache as i32,
            });
        }

        // Another project holds one of these ports in the database even
        // though the OS reports them free right now (it released the
        // listening socket between operations) -- exclude this quadruple
        // and retry with the next free candidate in each range.
        taken_backend.push(backend as i32);
        taken_frontend.push(frontend as i32);
        taken_db.push(db_port as i32);
        taken_cache.push(cache as i32);
    }

    anyhow::bail!("no free port quadruple available in configured ranges")
}

/// Reserve ports for a project start. When `designated` is `Some`, the
/// caller requested specific ports at creation time: honor them exactly,
/// failing if any is bound at the OS level or held by another non-stopped
/// project, rather than silently substituting a different free quadruple.
/// When `designated` is `None`, fall back to [`allocate`].
pub async fn reserve(
    pool: &PgPool,
    ranges: &PortRanges,
    designated: Option<PortReservation>,
    excluding_project_id: Option<uuid::Uuid>,
) -> Result<PortReservation> {
    let Some(wanted) = designated else {
        return allocate(pool, ranges, excluding_project_id).await;
    };

    for (label, port) in [
        ("backend", wanted.backend_port),
        ("frontend", wanted.frontend_port),
        ("db", wanted.db_port),
        ("cache", wanted.cache_port),
    ] {
        if !os_port_free(port as u16) {
            anyhow::bail!("designated {label} port {port} is already bound");
        }
    }

    let in_use = db::ports_in_use(
        pool,
        wanted.backend_port,
        wanted.frontend_port,
        wanted.db_port,
        wanted.cache_port,
        excluding_project_id,
    )
    .await?;

    if in_use {
        anyhow::bail!("designated port quadruple is already held by another project");
    }

    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ranges_are_disjoint() {
        let r = PortRanges::default();
        assert!(r.backend.1 < r.frontend.0 || r.frontend.1 < r.backend.0);
        assert!(r.db.1 < r.cache.0 || r.cache.1 < r.db.0);
    }

    #[test]
    fn first_free_skips_taken_ports() {
        // Use a narrow, almost-certainly-free high range for the test.
        let range = (41000, 41005);
        let port = first_free(range, &[41000, 41001]).expect("a free port should exist");
        assert!(port >= 41002);
    }

    #[test]
    fn first_free_advances_past_each_rejected_candidate() {
        // Simulates what `allocate`'s retry loop must do: once a port is
        // pushed into `taken`, the next call must skip it rather than
        // proposing it again.
        let range = (41010, 41015);
        let mut taken = Vec::new();
        let first = first_free(range, &taken).unwrap();
        taken.push(first as i32);
        let second = first_free(range, &taken).unwrap();
        assert_ne!(first, second);
        assert!(!taken.contains(&(second as i32)));
    }
}

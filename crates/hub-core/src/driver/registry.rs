//! Driver selection -- builds the configured [`ContainerDriver`] from the
//! `CONTAINER_DRIVER` setting.

use std::sync::Arc;

use anyhow::{Result, bail};

use super::docker::DockerDriver;
use super::trait_def::ContainerDriver;

/// Build a driver from a mode string and the root directory under which
/// per-project compose files live.
pub fn create_driver(mode: &str, compose_root: &std::path::Path) -> Result<Arc<dyn ContainerDriver>> {
    match mode {
        "docker-compose" | "docker" => Ok(Arc::new(DockerDriver::new(compose_root.to_path_buf()))),
        other => bail!("unknown container driver: {other:?} (expected \"docker-compose\")"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_driver_constructs() {
        let driver = create_driver("docker-compose", std::path::Path::new("/tmp")).unwrap();
        assert_eq!(driver.name(), "docker-compose");
    }

    #[test]
    fn unknown_driver_errors() {
        let result = create_driver("kubernetes", std::path::Path::new("/tmp"));
        assert!(result.is_err());
    }
}

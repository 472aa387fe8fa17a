//! Broker: binds the registration directory to the well-known pipe path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use pipebus_core::remove_pipe;
use pipebus_protocol::{Doubler, RequestHandler};

use crate::config::BrokerConfig;
use crate::registry::{RegistrationDirectory, RegistryError, Shutdown};
use crate::session::SessionView;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to prepare pipe directory {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Composition root of the daemon.
///
/// Construction replaces any stale registration pipe left by a crashed
/// broker. `stop()` removes it again.
pub struct Broker {
    config: BrokerConfig,
    directory: RegistrationDirectory,
    running: bool,
}

impl Broker {
    pub fn new(config: BrokerConfig, handler: Arc<dyn RequestHandler>) -> Result<Self, BrokerError> {
        std::fs::create_dir_all(&config.pipe_dir).map_err(|source| BrokerError::Setup {
            path: config.pipe_dir.clone(),
            source,
        })?;

        let directory =
            RegistrationDirectory::new(config.paths(), config.session_settings(), handler)?
                .with_max_sessions(config.max_sessions);

        Ok(Self {
            config,
            directory,
            running: false,
        })
    }

    /// Broker answering every request with its double.
    pub fn with_doubler(config: BrokerConfig) -> Result<Self, BrokerError> {
        Self::new(config, Arc::new(Doubler))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registration_path(&self) -> &Path {
        self.directory.paths().registration()
    }

    pub fn directory(&self) -> &RegistrationDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.directory.sessions()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) -> Result<(), BrokerError> {
        self.directory.start()?;
        self.running = true;
        info!(
            pipe_dir = %self.config.pipe_dir.display(),
            registration = %self.registration_path().display(),
            "Broker started"
        );
        Ok(())
    }

    /// Stops registration, applies `shutdown` to live sessions and removes
    /// the registration pipe.
    pub fn stop(&mut self, shutdown: Shutdown) {
        self.directory.stop(shutdown);
        if let Err(e) = remove_pipe(self.registration_path()) {
            warn!(error = %e, "Failed to remove registration pipe");
        }
        self.running = false;
        info!(?shutdown, "Broker stopped");
    }

    /// Runs for `lifetime`, then stops.
    pub fn run_for(&mut self, lifetime: Duration, shutdown: Shutdown) -> Result<(), BrokerError> {
        self.start()?;
        thread::sleep(lifetime);
        self.stop(shutdown);
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.running {
            self.stop(self.config.shutdown);
        }
    }
}

//! Shared application state and component wiring.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::auth::Authenticator;
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::orchestrator::Orchestrator;
use crate::ports::PortAllocator;
use crate::provisioner::Provisioner;
use crate::reaper::Reaper;
use crate::runtime::Runtime;

/// State handed to HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Fully wired orchestrator and reaper sharing one ledger.
pub struct Warden {
    pub orchestrator: Arc<Orchestrator>,
    pub reaper: Arc<Reaper>,
}

impl Warden {
    /// Seed the ledger with `catalog` and build every component around it.
    pub fn new(
        config: &Config,
        catalog: Catalog,
        ledger: Ledger,
        auth: Arc<dyn Authenticator>,
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        ledger.seed_templates(&catalog)?;
        let catalog = Arc::new(catalog);

        let admission = AdmissionController::new(auth, catalog, ledger.clone());
        let ports = PortAllocator::new(
            ledger.clone(),
            config.ports.clone(),
            config.max_port_attempts,
        );
        let provisioner = Provisioner::new(
            ledger.clone(),
            ports,
            Arc::clone(&runtime),
            Arc::clone(&clock),
            config.provision.clone(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            admission,
            provisioner,
            ledger.clone(),
            Arc::clone(&runtime),
            config.reaper.stop_timeout,
        ));
        let reaper = Arc::new(Reaper::new(
            ledger,
            runtime,
            clock,
            config.reaper.clone(),
        ));

        Ok(Self {
            orchestrator,
            reaper,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(Arc::clone(&self.orchestrator))
    }
}

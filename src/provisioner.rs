//! Starts admitted instances and records them in the ledger.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::admission::AdmissionTicket;
use crate::clock::Clock;
use crate::error::{ProvisionError, RuntimeError};
use crate::ledger::Ledger;
use crate::model::{Access, Instance};
use crate::ports::PortAllocator;
use crate::runtime::Runtime;

/// Settings for spawning instances.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Host reported to callers in the access descriptor.
    pub public_host: String,
    /// Port the challenge listens on inside its container.
    pub internal_port: u16,
    pub spawn_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            public_host: "127.0.0.1".to_string(),
            internal_port: 8000,
            spawn_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Provisioner {
    ledger: Ledger,
    ports: PortAllocator,
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    config: ProvisionConfig,
}

impl Provisioner {
    pub fn new(
        ledger: Ledger,
        ports: PortAllocator,
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            ledger,
            ports,
            runtime,
            clock,
            config,
        }
    }

    pub fn access(&self, instance: &Instance) -> Access {
        Access::new(&self.config.public_host, instance.port)
    }

    /// Spawn an instance for the ticket's owner and persist it.
    ///
    /// Nothing is written to the ledger unless the runtime reports success,
    /// and the caller only sees the instance once the row is stored. A spawn
    /// that times out, or whose request is dropped midway, is stopped by name.
    #[instrument(level = "debug", skip(self, ticket), fields(owner = %ticket.owner, template = %ticket.template.template_id))]
    pub async fn provision(&self, ticket: AdmissionTicket) -> Result<Instance, ProvisionError> {
        let lease = self.ports.allocate()?;
        let port = lease.port();
        let template_id = ticket.template.template_id.as_str();
        let name = format!("warden-{}", uuid::Uuid::new_v4());
        let pending = PendingSpawn::new(self.ledger.clone(), Arc::clone(&self.runtime), name.clone());

        let spawned = tokio::time::timeout(
            self.config.spawn_timeout,
            self.runtime
                .spawn(&name, template_id, port, self.config.internal_port),
        )
        .await;

        let instance_id = match spawned {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                pending.disarm();
                error!(port, error = %e, "spawn failed");
                return Err(ProvisionError::SpawnFailed(e.to_string()));
            }
            Err(_) => {
                let timeout = RuntimeError::Timeout(self.config.spawn_timeout);
                error!(port, name = %name, error = %timeout, "spawn timed out, stopping it");
                let stopped = match pending.stop().await {
                    Ok(()) => "stopped",
                    Err(e) => {
                        warn!(name = %name, error = %e, "timed out instance could not be stopped");
                        "stop failed"
                    }
                };
                return Err(ProvisionError::SpawnFailed(format!(
                    "{}; {} {}",
                    timeout, stopped, name
                )));
            }
        };
        pending.disarm();

        let instance = Instance {
            instance_id,
            template_id: template_id.to_string(),
            port,
            start_time: self.clock.now(),
            owner: ticket.owner.clone(),
            terminated: false,
        };

        if let Err(e) = self.ledger.insert_instance(&instance) {
            error!(instance_id = %instance.instance_id, error = %e, "failed to record instance, stopping it");
            if let Err(stop_err) = self.runtime.stop(&instance.instance_id).await {
                warn!(instance_id = %instance.instance_id, error = %stop_err, "orphaned instance could not be stopped");
            }
            return Err(e.into());
        }

        info!(
            instance_id = %instance.instance_id,
            port,
            "instance provisioned"
        );
        drop(lease);
        drop(ticket);
        Ok(instance)
    }
}

/// A spawn the runtime has not confirmed yet. Dropped while armed, it stops
/// the container in the background and logs the abandoned request.
struct PendingSpawn {
    ledger: Ledger,
    runtime: Arc<dyn Runtime>,
    name: Option<String>,
}

impl PendingSpawn {
    fn new(ledger: Ledger, runtime: Arc<dyn Runtime>, name: String) -> Self {
        Self {
            ledger,
            runtime,
            name: Some(name),
        }
    }

    fn disarm(mut self) {
        self.name = None;
    }

    async fn stop(mut self) -> Result<(), RuntimeError> {
        match self.name.take() {
            Some(name) => self.runtime.stop(&name).await,
            None => Ok(()),
        }
    }
}

impl Drop for PendingSpawn {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(name = %name, "no runtime to stop abandoned instance");
            return;
        };
        let ledger = self.ledger.clone();
        let runtime = Arc::clone(&self.runtime);
        handle.spawn(async move {
            let outcome = match runtime.stop(&name).await {
                Ok(()) => "stopped".to_string(),
                Err(e) => {
                    warn!(name = %name, error = %e, "abandoned instance could not be stopped");
                    format!("stop failed: {}", e)
                }
            };
            ledger.record(&format!("[-] request abandoned while starting {}, {}", name, outcome));
        });
    }
}

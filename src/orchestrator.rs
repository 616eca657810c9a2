//! Entry point for spawn and stop requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::admission::{Admission, AdmissionController};
use crate::error::ProvisionError;
use crate::ledger::Ledger;
use crate::model::{seconds, Access, Instance};
use crate::provisioner::Provisioner;
use crate::reaper::reclaim;
use crate::runtime::Runtime;

/// A successful spawn request.
#[derive(Debug, Clone, Serialize)]
pub struct Grant {
    pub instance: Instance,
    pub access: Access,
    /// When the reaper will consider the instance expired.
    pub expires_at: Option<DateTime<Utc>>,
    /// `false` when an existing live instance was handed back.
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyTerminated,
}

pub struct Orchestrator {
    admission: AdmissionController,
    provisioner: Provisioner,
    ledger: Ledger,
    runtime: Arc<dyn Runtime>,
    stop_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        admission: AdmissionController,
        provisioner: Provisioner,
        ledger: Ledger,
        runtime: Arc<dyn Runtime>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            provisioner,
            ledger,
            runtime,
            stop_timeout,
        }
    }

    /// Hand the caller an instance of `template_id`, starting one if it has none running.
    #[instrument(level = "debug", skip(self, credential))]
    pub async fn request(&self, credential: &str, template_id: &str) -> Result<Grant, ProvisionError> {
        let ticket = match self.admission.admit(credential, template_id).await {
            Ok(Admission::Duplicate(instance)) => {
                return Ok(self.grant(instance, false));
            }
            Ok(Admission::Admitted(ticket)) => ticket,
            Err(e) => {
                warn!(template_id, error = %e, "request rejected");
                self.ledger
                    .record(&format!("[-] request for {} rejected: {}", template_id, e));
                return Err(e);
            }
        };

        let owner = ticket.owner.clone();
        match self.provisioner.provision(ticket).await {
            Ok(instance) => {
                self.ledger.record(&format!(
                    "[+] instance {} of {} started on port {} for {}",
                    instance.instance_id, instance.template_id, instance.port, owner
                ));
                Ok(self.grant(instance, true))
            }
            Err(e) => {
                error!(template_id, owner = %owner, error = %e, "could not provision");
                self.ledger.record(&format!(
                    "[-] provision of {} for {} failed: {}",
                    template_id, owner, e
                ));
                Err(e)
            }
        }
    }

    fn grant(&self, instance: Instance, fresh: bool) -> Grant {
        let expires_at = self
            .admission
            .catalog()
            .lookup(&instance.template_id)
            .map(|t| instance.start_time + seconds(t.lifetime_seconds));
        Grant {
            access: self.provisioner.access(&instance),
            instance,
            expires_at,
            fresh,
        }
    }

    /// Stop an instance on behalf of its owner.
    #[instrument(level = "debug", skip(self, credential))]
    pub async fn stop(&self, credential: &str, instance_id: &str) -> Result<StopOutcome, ProvisionError> {
        let result = self.stop_owned(credential, instance_id).await;
        if let Err(e) = &result {
            warn!(instance_id, error = %e, "stop rejected");
            self.ledger
                .record(&format!("[-] stop of {} rejected: {}", instance_id, e));
        }
        result
    }

    async fn stop_owned(&self, credential: &str, instance_id: &str) -> Result<StopOutcome, ProvisionError> {
        let owner = self.admission.authenticate(credential).await?;
        let instance = self
            .ledger
            .instance(instance_id)?
            .ok_or_else(|| ProvisionError::NotFound(instance_id.to_string()))?;
        if instance.owner != owner {
            return Err(ProvisionError::Forbidden(instance_id.to_string()));
        }
        if instance.terminated {
            return Ok(StopOutcome::AlreadyTerminated);
        }

        reclaim(&self.ledger, self.runtime.as_ref(), instance_id, self.stop_timeout)
            .await
            .map_err(|e| ProvisionError::Persistence(e.source))?;
        info!(instance_id, "instance stopped on request");
        Ok(StopOutcome::Stopped)
    }

    /// Non-terminated instances, oldest first.
    pub fn live_instances(&self) -> Result<Vec<(Instance, Access)>, ProvisionError> {
        Ok(self
            .ledger
            .live_instances()?
            .into_iter()
            .map(|l| {
                let access = self.provisioner.access(&l.instance);
                (l.instance, access)
            })
            .collect())
    }
}

//! Request admission: authentication, template resolution and duplicate
//! suppression.
//!
//! The duplicate check and the following insert run under a per
//! `(owner, template_id)` lock held by the [`AdmissionTicket`], so two
//! concurrent requests for the same key are serialized while different keys
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::auth::{AuthStatus, Authenticator};
use crate::catalog::Catalog;
use crate::error::ProvisionError;
use crate::ledger::Ledger;
use crate::model::{Instance, Template};

type Key = (String, String);

/// Per-key async locks. Entries nobody holds are pruned on the next lock.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: Key) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|k, l| k == &key || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Permission to provision one instance for `owner`.
///
/// Holds the key lock until dropped; the provisioner drops it after the
/// ledger insert.
pub struct AdmissionTicket {
    pub owner: String,
    pub template: Template,
    _guard: OwnedMutexGuard<()>,
}

pub enum Admission {
    Admitted(AdmissionTicket),
    /// A live instance already exists for this owner and template.
    Duplicate(Instance),
}

pub struct AdmissionController {
    auth: Arc<dyn Authenticator>,
    catalog: Arc<Catalog>,
    ledger: Ledger,
    locks: KeyLocks,
}

impl AdmissionController {
    pub fn new(auth: Arc<dyn Authenticator>, catalog: Arc<Catalog>, ledger: Ledger) -> Self {
        Self {
            auth,
            catalog,
            ledger,
            locks: KeyLocks::default(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Resolve `credential` to an owner. Auth transport failures count as
    /// unauthenticated.
    pub async fn authenticate(&self, credential: &str) -> Result<String, ProvisionError> {
        match self.auth.authenticate(credential).await {
            Ok(AuthStatus::Authenticated { owner }) => Ok(owner),
            Ok(AuthStatus::Unauthenticated) => Err(ProvisionError::Unauthenticated),
            Err(e) => {
                warn!(error = %e, "auth service unreachable");
                Err(ProvisionError::Unauthenticated)
            }
        }
    }

    pub async fn admit(
        &self,
        credential: &str,
        template_id: &str,
    ) -> Result<Admission, ProvisionError> {
        let owner = self.authenticate(credential).await?;
        let template = self
            .catalog
            .lookup(template_id)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownTemplate(template_id.to_string()))?;

        let guard = self
            .locks
            .lock((owner.clone(), template.template_id.clone()))
            .await;

        if let Some(existing) = self.ledger.find_live(&owner, &template.template_id)? {
            debug!(owner = %owner, instance_id = %existing.instance_id, "duplicate request");
            return Ok(Admission::Duplicate(existing));
        }

        Ok(Admission::Admitted(AdmissionTicket {
            owner,
            template,
            _guard: guard,
        }))
    }
}

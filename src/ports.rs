//! Host port allocation for new instances.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::ledger::Ledger;

/// Draws random free ports from a fixed range.
///
/// A port is busy while a non-terminated instance in the ledger holds it or
/// while an in-flight provision holds a [`PortLease`] on it.
pub struct PortAllocator {
    ledger: Ledger,
    range: Range<u16>,
    max_attempts: u32,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(ledger: Ledger, range: Range<u16>, max_attempts: u32) -> Self {
        Self {
            ledger,
            range,
            max_attempts: max_attempts.max(1),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn allocate(&self) -> Result<PortLease, ProvisionError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let live = self.ledger.live_ports()?;

        let busy = live
            .union(&reserved)
            .filter(|p| self.range.contains(*p))
            .count();
        if self.range.is_empty() || busy >= self.range.len() {
            warn!(range = ?self.range, busy, "port pool is full");
            return Err(ProvisionError::PoolExhausted { attempts: 0 });
        }

        let mut rng = rand::thread_rng();
        for attempt in 1..=self.max_attempts {
            let port = rng.gen_range(self.range.clone());
            if live.contains(&port) || reserved.contains(&port) {
                debug!(port, attempt, "port collision, redrawing");
                continue;
            }
            reserved.insert(port);
            return Ok(PortLease {
                port,
                reserved: Arc::clone(&self.reserved),
            });
        }

        warn!(attempts = self.max_attempts, "no free port found");
        Err(ProvisionError::PoolExhausted {
            attempts: self.max_attempts,
        })
    }
}

/// A port held for an in-flight provision. Released on drop; by then the
/// ledger row (if any) keeps it busy.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.port);
    }
}

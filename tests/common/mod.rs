//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use warden::auth::{AuthStatus, Authenticator};
use warden::clock::ManualClock;
use warden::error::{AuthError, RuntimeError};
use warden::runtime::Runtime;
use warden::{Catalog, Config, Ledger, Template, Warden};

pub const WEB: &str = "web01";
pub const PWN: &str = "pwn01";

/// Accepts `session=<owner>` cookies.
pub struct CookieAuth;

#[async_trait]
impl Authenticator for CookieAuth {
    async fn authenticate(&self, credential: &str) -> Result<AuthStatus, AuthError> {
        Ok(match credential.strip_prefix("session=") {
            Some(owner) if !owner.is_empty() => AuthStatus::Authenticated {
                owner: owner.to_string(),
            },
            _ => AuthStatus::Unauthenticated,
        })
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub next_id: AtomicUsize,
    /// Names passed to every spawn, recorded before any delay.
    pub names: Mutex<Vec<String>>,
    pub spawned: Mutex<Vec<(String, u16, u16)>>,
    pub stopped: Mutex<Vec<String>>,
    /// Make every spawn fail.
    pub fail_spawn: bool,
    /// Delay before a spawn answers.
    pub spawn_delay: Option<Duration>,
    /// Return this id for every spawn instead of a fresh one.
    pub fixed_id: Option<String>,
}

impl FakeRuntime {
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn spawn(
        &self,
        name: &str,
        template_id: &str,
        host_port: u16,
        internal_port: u16,
    ) -> Result<String, RuntimeError> {
        self.names.lock().unwrap().push(name.to_string());
        if let Some(delay) = self.spawn_delay {
            tokio::time::sleep(delay).await;
        }
        self.spawned
            .lock()
            .unwrap()
            .push((template_id.to_string(), host_port, internal_port));
        if self.fail_spawn {
            return Err(RuntimeError::NonZeroExit {
                code: Some(125),
                stderr: "Unable to find image".to_string(),
            });
        }
        if let Some(id) = &self.fixed_id {
            return Ok(id.clone());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container-{}", n))
    }

    async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.stopped.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

pub fn templates() -> Catalog {
    Catalog::new(vec![
        Template {
            template_id: WEB.to_string(),
            tag: "web_01:latest".to_string(),
            challenge_id: 1,
            challenge_name: "TEST_Challenge".to_string(),
            lifetime_seconds: 60,
        },
        Template {
            template_id: PWN.to_string(),
            tag: "pwn_01:latest".to_string(),
            challenge_id: 2,
            challenge_name: "PWN".to_string(),
            lifetime_seconds: 300,
        },
    ])
    .unwrap()
}

pub struct Harness {
    pub warden: Warden,
    pub runtime: Arc<FakeRuntime>,
    pub clock: Arc<ManualClock>,
    pub ledger: Ledger,
}

impl Harness {
    pub fn new(runtime: FakeRuntime) -> Self {
        Self::with_config(runtime, Config::default())
    }

    pub fn with_config(runtime: FakeRuntime, config: Config) -> Self {
        let runtime = Arc::new(runtime);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Ledger::open_in_memory().unwrap();
        let warden = Warden::new(
            &config,
            templates(),
            ledger.clone(),
            Arc::new(CookieAuth),
            runtime.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            warden,
            runtime,
            clock,
            ledger,
        }
    }

    pub fn live_for(&self, owner: &str, template_id: &str) -> usize {
        self.ledger
            .instances()
            .unwrap()
            .iter()
            .filter(|i| i.owner == owner && i.template_id == template_id && !i.terminated)
            .count()
    }
}

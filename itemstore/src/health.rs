//! Liveness and readiness reporting

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Item;
use crate::repository::Repository;

/// Overall or per-check state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

/// Result of one dependency check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub status: Status,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness or readiness report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: Status,

    /// Time since the checker was created, liveness only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckStatus>,
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        self.status == Status::Up
    }
}

/// A dependency the service needs in order to take traffic
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `Err` carries the message shown in the readiness report
    async fn check(&self) -> Result<(), String>;
}

/// Readiness check backed by a repository's `ping`
pub struct RepositoryCheck {
    repository: Arc<dyn Repository<Item>>,
}

impl RepositoryCheck {
    pub fn new(repository: Arc<dyn Repository<Item>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl HealthCheck for RepositoryCheck {
    async fn check(&self) -> Result<(), String> {
        self.repository.ping().await.map_err(|e| e.to_string())
    }
}

/// Tracks readiness and runs registered dependency checks
pub struct HealthChecker {
    started: Instant,
    ready: AtomicBool,
    checks: RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>,
}

impl HealthChecker {
    /// A checker that reports not ready until [`set_ready`](Self::set_ready)
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: AtomicBool::new(false),
            checks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register or replace a named check
    pub fn add_check(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), check);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// The process is running
    pub fn liveness(&self) -> HealthStatus {
        HealthStatus {
            status: Status::Up,
            uptime: Some(format_uptime(self.uptime())),
            checks: BTreeMap::new(),
        }
    }

    /// Ready when marked ready and every registered check passes
    pub async fn readiness(&self) -> HealthStatus {
        if !self.ready.load(Ordering::SeqCst) {
            let mut checks = BTreeMap::new();
            checks.insert(
                "ready".to_string(),
                CheckStatus {
                    status: Status::Down,
                    message: Some("Service is not ready".to_string()),
                },
            );
            return HealthStatus {
                status: Status::Down,
                uptime: None,
                checks,
            };
        }

        let registered: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();

        let outcomes = futures::future::join_all(registered.iter().map(|(_, check)| check.check())).await;

        let mut status = Status::Up;
        let mut checks = BTreeMap::new();
        for ((name, _), outcome) in registered.into_iter().zip(outcomes) {
            let check = match outcome {
                Ok(()) => CheckStatus {
                    status: Status::Up,
                    message: None,
                },
                Err(message) => {
                    tracing::warn!(check = %name, error = %message, "Readiness check failed");
                    status = Status::Down;
                    CheckStatus {
                        status: Status::Down,
                        message: Some(message),
                    }
                }
            };
            checks.insert(name, check);
        }

        HealthStatus {
            status,
            uptime: None,
            checks,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, uptime.subsec_millis())
    }
}

// src/core/backends/mod.rs

//! Pluggable backends held by the controller.
//!
//! Each backend is a capability set the core calls through; the concrete
//! implementation is chosen by name from the configuration at startup.
//! A backend *name* change across reconfigure is a soft error: the old
//! instance keeps running and the operator is told a restart is required.

pub mod accounting;
pub mod auth;
pub mod cred;

use crate::config::Config;
use crate::core::ControllerError;
use crate::core::sched::select::{SelectBackend, create_select};
use crate::core::sched::{SchedulerBackend, create_scheduler};
use accounting::{AccountingBackend, create_accounting};
use auth::{AuthBackend, create_auth};
use cred::CredSigner;
use parking_lot::Mutex;

/// One instance of every backend plus the names they were created under.
pub struct BackendSet {
    pub auth: Box<dyn AuthBackend>,
    pub cred: CredSigner,
    pub sched: Mutex<Box<dyn SchedulerBackend>>,
    pub select: Box<dyn SelectBackend>,
    pub accounting: Box<dyn AccountingBackend>,
    auth_name: String,
    sched_name: String,
    select_name: String,
    accounting_name: String,
}

impl BackendSet {
    pub fn create(config: &Config) -> Result<Self, ControllerError> {
        Ok(Self {
            auth: create_auth(config)?,
            cred: CredSigner::from_key_file(&config.cred_key_path)?,
            sched: Mutex::new(create_scheduler(config)?),
            select: create_select(config)?,
            accounting: create_accounting(config)?,
            auth_name: config.auth_type.clone(),
            sched_name: config.sched_type.clone(),
            select_name: config.select_type.clone(),
            accounting_name: config.accounting_type.clone(),
        })
    }

    /// Compares the backend names in a freshly parsed configuration against
    /// the running instances. Returns one soft error per changed name; the
    /// running backends are untouched either way.
    pub fn detect_backend_changes(&self, new: &Config) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        if new.auth_type != self.auth_name {
            errors.push(ControllerError::InvalidAuthTypeChange);
        }
        if new.sched_type != self.sched_name {
            errors.push(ControllerError::InvalidSchedulerChange);
        }
        if new.select_type != self.select_name {
            errors.push(ControllerError::InvalidSelectChange);
        }
        if new.accounting_type != self.accounting_name {
            tracing::warn!(
                old = %self.accounting_name,
                new = %new.accounting_type,
                "accounting backend change ignored until restart"
            );
        }
        errors
    }

    /// Propagates a successful reconfigure into every backend.
    pub fn reconfigure(&self, config: &Config) -> Result<(), ControllerError> {
        self.auth.reconfigure(config)?;
        self.cred.update_key(&config.cred_key_path)?;
        self.sched.lock().reconfigure(config);
        self.select.reconfigure(config);
        self.accounting.reconfigure(config);
        Ok(())
    }
}

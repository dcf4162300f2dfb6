// src/core/backends/cred.rs

//! Step-credential signing.
//!
//! `job-step-create` replies carry a signed record that worker daemons
//! verify before launching tasks. The record binds the step to its job,
//! user, memory bound, node list and the exact cores of the allocation
//! (core bitmap indexed by the job's allocation, not the cluster). Signing
//! is HMAC-SHA256 with the configured credential key; the controller
//! re-reads the key on SIGHUP.

use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use crate::core::protocol::pack::{Packer, Unpacker};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 32;

/// The payload a step credential attests to.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCredential {
    pub job_id: u32,
    pub step_id: u32,
    pub user_id: u32,
    pub mem_per_task: u64,
    pub node_list: String,
    pub core_bitmap: Bitmap,
}

impl StepCredential {
    fn pack(&self, p: &mut Packer) {
        p.u32(self.job_id);
        p.u32(self.step_id);
        p.u32(self.user_id);
        p.u64(self.mem_per_task);
        p.str(&self.node_list);
        p.bitmap(&self.core_bitmap);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            job_id: u.u32()?,
            step_id: u.u32()?,
            user_id: u.u32()?,
            mem_per_task: u.u64()?,
            node_list: u.str()?,
            core_bitmap: u.bitmap()?,
        })
    }
}

/// The crypto backend holding the signing key.
pub struct CredSigner {
    key: RwLock<Vec<u8>>,
}

impl CredSigner {
    pub fn from_key_file(path: &str) -> Result<Self, ControllerError> {
        let key = std::fs::read(path).map_err(|e| {
            ControllerError::Internal(format!("cannot read credential key file '{path}': {e}"))
        })?;
        Ok(Self {
            key: RwLock::new(key),
        })
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key: RwLock::new(key),
        }
    }

    /// Re-reads the signing key; called from the SIGHUP path after the new
    /// configuration lands.
    pub fn update_key(&self, path: &str) -> Result<(), ControllerError> {
        let key = std::fs::read(path).map_err(|e| {
            ControllerError::Internal(format!("cannot re-read credential key file '{path}': {e}"))
        })?;
        *self.key.write() = key;
        info!("credential signing key reloaded");
        Ok(())
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        let key = self.key.read();
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Serialises and signs a credential into the opaque wire blob.
    pub fn sign_step(&self, cred: &StepCredential) -> Bytes {
        let mut p = Packer::new();
        cred.pack(&mut p);
        let payload = p.into_bytes();
        let mac = self.mac(&payload);
        let mut blob = Packer::new();
        blob.bytes(&payload);
        blob.bytes(&mac);
        blob.into_bytes()
    }

    /// Verifies a blob and returns the attested credential.
    pub fn verify_step(&self, blob: &[u8]) -> Result<StepCredential, ControllerError> {
        let mut u = Unpacker::new(Bytes::copy_from_slice(blob));
        let payload = u.bytes()?;
        let mac = u.bytes()?;
        if mac.len() != MAC_LEN || self.mac(&payload) != mac {
            return Err(ControllerError::InvalidCredential);
        }
        StepCredential::unpack(&mut Unpacker::new(payload))
    }
}

// src/core/backends/auth.rs

//! Authentication backends.
//!
//! Every inbound RPC carries an opaque credential in its header; the auth
//! backend turns it into a verified `(uid, gid)` pair or rejects it. The
//! built-in `shared-key` backend signs `uid | gid | timestamp` with
//! HMAC-SHA256 over a key file shared by the whole cluster, with a clock
//! window to stop replays. The `none` backend trusts the caller's claims
//! and exists for tests and single-user sandboxes.

use crate::config::Config;
use crate::core::ControllerError;
use crate::core::protocol::pack::{Packer, Unpacker};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// Seconds of clock skew tolerated between signer and verifier.
const CRED_TIME_WINDOW_SECS: i64 = 300;

const MAC_LEN: usize = 32;

/// The verified identity of an RPC caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthInfo {
    pub uid: u32,
    pub gid: u32,
}

impl AuthInfo {
    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

/// Capability set every authentication backend provides.
pub trait AuthBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mints a credential for this process's outbound RPCs.
    fn sign(&self, uid: u32, gid: u32) -> Result<Bytes, ControllerError>;

    /// Verifies an inbound credential.
    fn verify(&self, cred: &[u8]) -> Result<AuthInfo, ControllerError>;

    /// Re-reads backend material (e.g. the key file) after a reconfigure.
    fn reconfigure(&self, _config: &Config) -> Result<(), ControllerError> {
        Ok(())
    }
}

/// Instantiates the backend named in the configuration.
pub fn create_auth(config: &Config) -> Result<Box<dyn AuthBackend>, ControllerError> {
    match config.auth_type.as_str() {
        "shared-key" => Ok(Box::new(SharedKeyAuth::from_key_file(
            &config.cred_key_path,
        )?)),
        "none" => Ok(Box::new(NullAuth)),
        other => Err(ControllerError::Internal(format!(
            "unknown auth backend '{other}'"
        ))),
    }
}

/// HMAC-SHA256 over a cluster-wide shared key.
pub struct SharedKeyAuth {
    key: RwLock<Vec<u8>>,
}

impl SharedKeyAuth {
    pub fn from_key_file(path: &str) -> Result<Self, ControllerError> {
        let key = std::fs::read(path).map_err(|e| {
            ControllerError::Internal(format!("cannot read auth key file '{path}': {e}"))
        })?;
        if key.len() < 16 {
            return Err(ControllerError::Internal(format!(
                "auth key file '{path}' is too short ({} bytes)",
                key.len()
            )));
        }
        Ok(Self {
            key: RwLock::new(key),
        })
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key: RwLock::new(key),
        }
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        let key = self.key.read();
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl AuthBackend for SharedKeyAuth {
    fn name(&self) -> &'static str {
        "shared-key"
    }

    fn sign(&self, uid: u32, gid: u32) -> Result<Bytes, ControllerError> {
        let mut p = Packer::new();
        p.u32(uid);
        p.u32(gid);
        p.time(crate::core::state::ops::epoch_now());
        let payload = p.into_bytes();
        let mac = self.mac(&payload);
        let mut out = Vec::with_capacity(payload.len() + mac.len());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&mac);
        Ok(Bytes::from(out))
    }

    fn verify(&self, cred: &[u8]) -> Result<AuthInfo, ControllerError> {
        const PAYLOAD_LEN: usize = 16;
        if cred.len() != PAYLOAD_LEN + MAC_LEN {
            return Err(ControllerError::InvalidCredential);
        }
        let (payload, mac) = cred.split_at(PAYLOAD_LEN);
        let expected = self.mac(payload);
        // Constant-time enough for our purposes: compare full digests.
        if expected.as_slice() != mac {
            return Err(ControllerError::InvalidCredential);
        }
        let mut u = Unpacker::new(Bytes::copy_from_slice(payload));
        let uid = u.u32()?;
        let gid = u.u32()?;
        let ts = u.time()?;
        let now = crate::core::state::ops::epoch_now();
        if (now - ts).abs() > CRED_TIME_WINDOW_SECS {
            return Err(ControllerError::InvalidCredential);
        }
        Ok(AuthInfo { uid, gid })
    }

    fn reconfigure(&self, config: &Config) -> Result<(), ControllerError> {
        let key = std::fs::read(&config.cred_key_path).map_err(|e| {
            ControllerError::Internal(format!(
                "cannot re-read auth key file '{}': {e}",
                config.cred_key_path
            ))
        })?;
        *self.key.write() = key;
        info!("auth key material reloaded");
        Ok(())
    }
}

/// Trusts the caller's claimed identity. Test use only.
pub struct NullAuth;

impl AuthBackend for NullAuth {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(&self, uid: u32, gid: u32) -> Result<Bytes, ControllerError> {
        let mut p = Packer::new();
        p.u32(uid);
        p.u32(gid);
        Ok(p.into_bytes())
    }

    fn verify(&self, cred: &[u8]) -> Result<AuthInfo, ControllerError> {
        if cred.is_empty() {
            return Ok(AuthInfo { uid: 0, gid: 0 });
        }
        let mut u = Unpacker::new(Bytes::copy_from_slice(cred));
        Ok(AuthInfo {
            uid: u.u32()?,
            gid: u.u32()?,
        })
    }
}

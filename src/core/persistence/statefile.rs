// src/core/persistence/statefile.rs

//! Atomic state-file I/O.
//!
//! Every state file is framed as `u64` timestamp, `u32` format version,
//! payload, trailing `u32` CRC-32 over everything before it. Writes go
//! through the write-old-rename dance so a reader never observes a torn
//! file: write `<name>.new`, fsync, drop `<name>.old`, hard-link the
//! current file to `<name>.old`, then move `<name>.new` into place.

use crate::core::ControllerError;
use crate::core::protocol::pack::{Packer, Unpacker};
use bytes::Bytes;
use crc::{CRC_32_ISO_HDLC, Crc};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Bumped when any record layout changes incompatibly.
pub const STATE_FORMAT_VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Writes `payload` to `dir/name` atomically, stamped with `timestamp`.
pub fn write_state_file(
    dir: &Path,
    name: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<(), ControllerError> {
    fs::create_dir_all(dir)?;

    let mut framed = Packer::new();
    framed.time(timestamp);
    framed.u32(STATE_FORMAT_VERSION);
    let mut bytes = framed.into_bytes().to_vec();
    bytes.extend_from_slice(payload);
    let crc = CRC32.checksum(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());

    let target = dir.join(name);
    let new_path = dir.join(format!("{name}.new"));
    let old_path = dir.join(format!("{name}.old"));

    let mut file = fs::File::create(&new_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    // Rotate: <name>.old is dropped, the live file becomes <name>.old,
    // and the fresh <name>.new becomes the live file.
    let _ = fs::remove_file(&old_path);
    if target.exists() {
        fs::hard_link(&target, &old_path)?;
        fs::remove_file(&target)?;
    }
    fs::hard_link(&new_path, &target)?;
    fs::remove_file(&new_path)?;
    Ok(())
}

/// Reads and validates `dir/name`. Returns the timestamp and payload, or
/// `None` when the file is absent or unusable — a partial file is treated
/// as "no saved state", never as an error to propagate.
pub fn read_state_file(dir: &Path, name: &str) -> Option<(i64, Bytes)> {
    let path = dir.join(name);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot read state file");
            return None;
        }
    };
    // timestamp + version + crc is the minimum sensible size.
    if bytes.len() < 8 + 4 + 4 {
        warn!(file = %path.display(), "state file too short; ignoring");
        return None;
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
    if CRC32.checksum(body) != stored_crc {
        warn!(file = %path.display(), "state file checksum mismatch; ignoring");
        return None;
    }
    let mut u = Unpacker::new(Bytes::copy_from_slice(body));
    let timestamp = u.time().ok()?;
    let version = u.u32().ok()?;
    if version != STATE_FORMAT_VERSION {
        warn!(
            file = %path.display(),
            version,
            "state file format version unsupported; ignoring"
        );
        return None;
    }
    let payload = Bytes::copy_from_slice(&body[12..]);
    Some((timestamp, payload))
}

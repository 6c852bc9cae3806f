//! The startup sequence file (`startup.cmdbin`): a command list executed
//! when the server comes up. Layout, all little-endian: u32 version (must
//! be 1), u64 nominal length in ns, u32 TTL mask, then the binary
//! command-list payload.

use std::io;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

pub const STARTUP_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 8 + 4;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("unsupported startup file version {0}")]
    BadVersion(u32),
    #[error("startup file shorter than its header")]
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub len_ns: u64,
    pub ttl_mask: u32,
    pub code: Vec<u8>,
}

impl Startup {
    /// Read the startup file; `Ok(None)` when there is none.
    pub fn load(path: &Path) -> Result<Option<Startup>, StartupError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < HEADER_LEN {
            return Err(StartupError::Truncated);
        }
        let version = LittleEndian::read_u32(&bytes[0..4]);
        if version != STARTUP_VERSION {
            return Err(StartupError::BadVersion(version));
        }
        Ok(Some(Startup {
            len_ns: LittleEndian::read_u64(&bytes[4..12]),
            ttl_mask: LittleEndian::read_u32(&bytes[12..16]),
            code: bytes[HEADER_LEN..].to_vec(),
        }))
    }

    pub fn save(&self, path: &Path) -> Result<(), StartupError> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.code.len());
        bytes.extend_from_slice(&STARTUP_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.len_ns.to_le_bytes());
        bytes.extend_from_slice(&self.ttl_mask.to_le_bytes());
        bytes.extend_from_slice(&self.code);
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = std::env::temp_dir().join(format!("pulsebox-startup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("startup.cmdbin");

        assert!(Startup::load(&path).unwrap().is_none());

        let startup = Startup {
            len_ns: 12345678,
            ttl_mask: 0x00ff_0000,
            code: vec![1, 2, 3, 4],
        };
        startup.save(&path).unwrap();
        assert_eq!(Startup::load(&path).unwrap(), Some(startup));

        // A bad version is refused.
        std::fs::write(&path, [2u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            Startup::load(&path),
            Err(StartupError::BadVersion(2))
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }
}

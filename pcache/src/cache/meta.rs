//! Persisted record of a cache entry.
//!
//! On disk the record is a 4-byte little-endian body length followed by the
//! bincode encoded body.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMeta {
    pub offset: u64,
    pub length: u64,
    pub cache_state: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCacheMeta {
    pub file_handle: Vec<u8>,
    pub newly_created: bool,
    pub remote_change_time: u64,
    pub extents: Vec<ExtentMeta>,
}

const LEN_PREFIX: usize = 4;

impl FileCacheMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let len = u32::try_from(body.len())
            .map_err(|_| CacheError::Metadata(format!("record of {} bytes", body.len())))?;
        let mut buf = Vec::with_capacity(LEN_PREFIX + body.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a record, rejecting a declared length beyond the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let prefix: [u8; LEN_PREFIX] = buf
            .get(..LEN_PREFIX)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CacheError::Metadata("missing length prefix".to_string()))?;
        let len = u32::from_le_bytes(prefix) as usize;
        if buf.len() < len + LEN_PREFIX {
            return Err(CacheError::Metadata(format!(
                "declared {} bytes but only {} available",
                len,
                buf.len() - LEN_PREFIX
            )));
        }
        Ok(bincode::deserialize(&buf[LEN_PREFIX..LEN_PREFIX + len])?)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let buf = self.encode()?;
        let mut file = fs::File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let buf = fs::read(path)?;
        Self::decode(&buf)
    }
}

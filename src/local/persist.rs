//! Disk I/O for [`DurableStore`](super::DurableStore): load a JSON object of
//! strings and write it back atomically.
//!
//! The rename-over approach is close to atomic on most platforms. On FAT32 or
//! network shares there are no hard guarantees.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Read and decode the file at `path`. A missing or empty file is an empty
/// map, not an error.
pub fn load(path: &Path) -> Result<HashMap<String, String>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::Io(e.to_string())),
    };
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Encode `entries` as a JSON object, compact or indented.
pub fn encode(entries: &HashMap<String, String>, pretty: bool) -> Result<Vec<u8>> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(entries)
    } else {
        serde_json::to_vec(entries)
    };
    bytes.map_err(|e| Error::Encode(e.to_string()))
}

/// Write `bytes` to `<path>.tmp` and rename over `path`, so a crash mid-write
/// never leaves a half-written file behind.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let tmp = path.with_extension(format!("{ext}.tmp"));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

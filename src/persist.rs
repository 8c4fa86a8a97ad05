//! Atomic JSON persistence shared by the per-component state files.
//!
//! Each component owns one document and rewrites it wholesale on every
//! mutation. Writes go through a temp file and rename so a crash never
//! leaves a half-written document; no cross-file transaction is attempted.

use crate::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    fs::write(tmp, contents)?;
    fs::rename(tmp, path)?;
    Ok(())
}

/// Load a JSON document, returning `None` when the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

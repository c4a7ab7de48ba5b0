use crate::{HostPathError, HostPathResult};
use serde::de::DeserializeOwned;
use std::path::Path;

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> HostPathResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| HostPathError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| HostPathError::InvalidData(format!("parse {} failed: {}", path.display(), e)))
}

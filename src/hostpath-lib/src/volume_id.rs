use crate::{HostPathError, HostPathResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const VOLUME_ID_VERSION: u16 = 1;
pub const MAX_VOLUME_ID_LEN: usize = 128;

// "vvvv-eeee-llll-" : three 2-byte fields, hex encoded, each followed by '-'
const FIELD_HEX_LEN: usize = 4;
const KNOWN_FIELD_SIZE: usize = 3 * (FIELD_HEX_LEN + 1);

/// Opaque volume key handed out by CreateVolume and used everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn decode(&self) -> HostPathResult<CsiIdentifier> {
        CsiIdentifier::decompose(&self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VolumeId {
    fn from(value: String) -> Self {
        VolumeId(value)
    }
}

impl From<&str> for VolumeId {
    fn from(value: &str) -> Self {
        VolumeId(value.to_string())
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiIdentifier {
    pub version: u16,
    pub ephemeral: bool,
    pub volume_name: String,
}

impl CsiIdentifier {
    pub fn new(volume_name: &str, ephemeral: bool) -> Self {
        Self {
            version: VOLUME_ID_VERSION,
            ephemeral,
            volume_name: volume_name.to_string(),
        }
    }

    pub fn compose(&self) -> HostPathResult<VolumeId> {
        let name_len = self.volume_name.len();
        if KNOWN_FIELD_SIZE + name_len > MAX_VOLUME_ID_LEN {
            return Err(HostPathError::InvalidArgument(format!(
                "volume id overflow: name {} needs {} bytes, max {}",
                self.volume_name,
                KNOWN_FIELD_SIZE + name_len,
                MAX_VOLUME_ID_LEN
            )));
        }

        Ok(VolumeId(format!(
            "{:04x}-{:04x}-{:04x}-{}",
            self.version,
            u16::from(self.ephemeral),
            name_len,
            self.volume_name
        )))
    }

    pub fn decompose(id: &str) -> HostPathResult<Self> {
        if id.len() < KNOWN_FIELD_SIZE {
            return Err(HostPathError::InvalidArgument(format!(
                "volume id underflow: {}",
                id
            )));
        }
        if id.len() > MAX_VOLUME_ID_LEN {
            return Err(HostPathError::InvalidArgument(format!(
                "volume id overflow: {} bytes, max {}",
                id.len(),
                MAX_VOLUME_ID_LEN
            )));
        }

        let version = decode_field(id, 0)?;
        let ephemeral = match decode_field(id, 1)? {
            0 => false,
            1 => true,
            v => {
                return Err(HostPathError::InvalidArgument(format!(
                    "volume id {} has bad ephemeral flag {}",
                    id, v
                )))
            }
        };
        let name_len = decode_field(id, 2)? as usize;

        let name = id.get(KNOWN_FIELD_SIZE..).ok_or_else(|| {
            HostPathError::InvalidArgument(format!("volume id {} has bad name boundary", id))
        })?;
        if name.len() != name_len {
            return Err(HostPathError::InvalidArgument(format!(
                "volume id {} name length {} mismatch, expect {}",
                id,
                name.len(),
                name_len
            )));
        }

        Ok(Self {
            version,
            ephemeral,
            volume_name: name.to_string(),
        })
    }
}

fn decode_field(id: &str, index: usize) -> HostPathResult<u16> {
    let begin = index * (FIELD_HEX_LEN + 1);
    let end = begin + FIELD_HEX_LEN;
    let field = id.get(begin..end).ok_or_else(|| {
        HostPathError::InvalidArgument(format!("volume id {} field {} truncated", id, index))
    })?;
    if id.as_bytes().get(end) != Some(&b'-') {
        return Err(HostPathError::InvalidArgument(format!(
            "volume id {} missing delimiter after field {}",
            id, index
        )));
    }

    let raw = hex::decode(field).map_err(|e| {
        HostPathError::InvalidArgument(format!("volume id {} field {}: {}", id, index, e))
    })?;
    match raw.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(HostPathError::InvalidArgument(format!(
            "volume id {} field {} has bad width",
            id, index
        ))),
    }
}

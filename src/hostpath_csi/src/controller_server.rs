use crate::csi_types::*;
use crate::meta_store::MetaStore;
use hostpath_lib::{
    round_off_bytes, to_i64, CsiIdentifier, HostPathError, HostPathResult, VolumeId, VolumeLocks,
    MIB,
};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_VOLUME_SIZE: u64 = 100 * MIB;
pub const EPHEMERAL_PARAMETER: &str = "ephemeral";

pub struct ControllerServer {
    locks: Arc<VolumeLocks>,
    meta_store: Arc<dyn MetaStore>,
}

fn requested_bytes(range: Option<&CapacityRange>) -> u64 {
    range
        .map(|r| r.required_bytes)
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

fn check_capabilities(caps: &[VolumeCapability]) -> HostPathResult<()> {
    if caps.is_empty() {
        return Err(HostPathError::InvalidArgument(
            "volume capabilities missing in request".to_string(),
        ));
    }
    if caps.iter().any(|c| c.is_block()) {
        return Err(HostPathError::Unimplemented(
            "block access type is not supported".to_string(),
        ));
    }
    Ok(())
}

impl ControllerServer {
    pub fn new(locks: Arc<VolumeLocks>, meta_store: Arc<dyn MetaStore>) -> Self {
        Self { locks, meta_store }
    }

    pub async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> HostPathResult<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(HostPathError::InvalidArgument("name missing in request".to_string()));
        }
        check_capabilities(&req.volume_capabilities)?;

        let _guard = self.locks.lock_or_abort(&req.name)?;

        let mut size = requested_bytes(req.capacity_range.as_ref());
        if size == 0 {
            size = DEFAULT_VOLUME_SIZE;
        }
        let size = round_off_bytes(size);

        let ephemeral = match req.parameters.get(EPHEMERAL_PARAMETER) {
            Some(v) => v.trim().parse::<bool>().map_err(|_| {
                HostPathError::InvalidArgument(format!(
                    "parameter {} must be a bool, got {:?}",
                    EPHEMERAL_PARAMETER, v
                ))
            })?,
            None => false,
        };

        let volume_id = CsiIdentifier::new(&req.name, ephemeral).compose()?;
        self.meta_store.add_meta_info(&volume_id).await?;
        info!(
            "create volume: name={}, id={}, size={}, ephemeral={}",
            req.name, volume_id, size, ephemeral
        );

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes: to_i64(size),
                volume_context: BTreeMap::new(),
            },
        })
    }

    pub async fn delete_volume(&self, req: DeleteVolumeRequest) -> HostPathResult<()> {
        if req.volume_id.is_empty() {
            return Err(HostPathError::InvalidArgument(
                "volume id missing in request".to_string(),
            ));
        }
        let _guard = self.locks.lock_or_abort(&req.volume_id)?;

        self.meta_store
            .unset_meta_info(&VolumeId::from(req.volume_id.as_str()))
            .await?;
        info!("delete volume: id={}", req.volume_id);
        Ok(())
    }

    pub async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> HostPathResult<ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(HostPathError::InvalidArgument(
                "volume id missing in request".to_string(),
            ));
        }
        let range = req.capacity_range.as_ref().ok_or_else(|| {
            HostPathError::InvalidArgument("capacity range missing in request".to_string())
        })?;
        let size = round_off_bytes(requested_bytes(Some(range)));

        let _guard = self.locks.lock_or_abort(&req.volume_id)?;
        info!("controller expand volume: id={}, size={}", req.volume_id, size);
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: to_i64(size),
            node_expansion_required: true,
        })
    }

    pub async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> HostPathResult<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(HostPathError::InvalidArgument(
                "volume id missing in request".to_string(),
            ));
        }
        if req.volume_capabilities.is_empty() {
            return Err(HostPathError::InvalidArgument(
                "volume capabilities missing in request".to_string(),
            ));
        }

        if req.volume_capabilities.iter().any(|c| c.is_block()) {
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "block access type is not supported".to_string(),
            });
        }
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(req.volume_capabilities),
            message: String::new(),
        })
    }
}

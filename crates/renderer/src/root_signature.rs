//! Owned backend root signature.

use std::sync::Arc;

use lumen_rhi::{GpuDevice, RootSignatureDesc, RootSignatureId, RhiError};
use tracing::debug;

use crate::error::RendererResult;

/// A root signature together with the description it was built from.
///
/// The dynamic descriptor heaps read the description to learn table sizes.
pub struct RootSignature {
    device: Arc<dyn GpuDevice>,
    id: RootSignatureId,
    desc: RootSignatureDesc,
}

impl RootSignature {
    pub fn new(device: Arc<dyn GpuDevice>, desc: RootSignatureDesc) -> RendererResult<Self> {
        desc.validate().map_err(RhiError::Unsupported)?;
        let id = device.create_root_signature(&desc)?;
        debug!(
            "Root signature {:?}: {} parameters",
            id,
            desc.parameters.len()
        );
        Ok(Self { device, id, desc })
    }

    #[inline]
    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }
}

impl Drop for RootSignature {
    fn drop(&mut self) {
        self.device.destroy_root_signature(self.id);
    }
}

impl std::fmt::Debug for RootSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSignature")
            .field("id", &self.id)
            .field("parameters", &self.desc.parameters.len())
            .finish()
    }
}

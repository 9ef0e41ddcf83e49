// SPDX-License-Identifier: GPL-3.0-only

//! Frame bridges connect a session's frames to the pipeline's output texture.
//!
//! Two strategies exist:
//!
//! - [`ComputeBridge`]: raw planes are copied off the capture thread and
//!   converted with a compute pass on the render thread.
//! - [`ExternalTextureBridge`]: the camera writes into an external surface and
//!   the render thread blits the newest image.
//!
//! Either way the bridge ends in `FrameProcessed` events and its graphics
//! resources are released by the session's teardown, after the hardware has
//! stopped writing.

mod compute;
mod external;

pub use compute::ComputeBridge;
pub use external::ExternalTextureBridge;

use crate::config::ConversionPath;
use crate::errors::RenderError;
use crate::render::TextureId;
use crate::session::GraphicsTeardown;
use futures::FutureExt;

/// Per-bridge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub processed: u64,
    pub coalesced: u64,
}

/// The bridge a pipeline was built with
#[derive(Clone)]
pub enum FrameBridge {
    Compute(ComputeBridge),
    ExternalTexture(ExternalTextureBridge),
}

impl FrameBridge {
    pub fn path(&self) -> ConversionPath {
        match self {
            FrameBridge::Compute(_) => ConversionPath::Compute,
            FrameBridge::ExternalTexture(_) => ConversionPath::ExternalTexture,
        }
    }

    /// Texture that `FrameProcessed` events refer to
    pub fn output(&self) -> TextureId {
        match self {
            FrameBridge::Compute(bridge) => bridge.output(),
            FrameBridge::ExternalTexture(bridge) => bridge.destination(),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        match self {
            FrameBridge::Compute(bridge) => BridgeStats {
                processed: bridge.processed(),
                coalesced: bridge.coalesced(),
            },
            FrameBridge::ExternalTexture(bridge) => BridgeStats {
                processed: bridge.processed(),
                coalesced: bridge.coalesced(),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            FrameBridge::Compute(bridge) => bridge.is_closed(),
            FrameBridge::ExternalTexture(bridge) => bridge.is_closed(),
        }
    }

    /// Release the bridge's graphics resources. Idempotent.
    pub async fn dispose(&self) -> Result<(), RenderError> {
        match self {
            FrameBridge::Compute(bridge) => bridge.dispose().await,
            FrameBridge::ExternalTexture(bridge) => bridge.dispose().await,
        }
    }

    /// `dispose` packaged for the session's teardown
    pub fn teardown_hook(&self) -> GraphicsTeardown {
        let bridge = self.clone();
        Box::new(move || async move { bridge.dispose().await }.boxed())
    }
}

impl std::fmt::Debug for FrameBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBridge")
            .field("path", &self.path())
            .field("output", &self.output())
            .field("closed", &self.is_closed())
            .finish()
    }
}

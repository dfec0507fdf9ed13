//! Overlay-side swapchain state.
//!
//! The overlay renders into its own shared textures; the real swapchain
//! lives in the main process. This tracks the acquired-index FIFO, the
//! waited flag, and the keyed-mutex hold taken between wait and
//! release, and performs the local halves of the acquire/wait/release
//! choreography. Call-order violations are detected here, before any
//! RPC is issued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::api::SwapchainCreateInfo;
use crate::error::{CallError, ResultCode};
use crate::graphics::{
    GraphicsError, KeyedMutexGuard, ShareHandle, SharedTexture, KEYED_MUTEX_MAIN,
    KEYED_MUTEX_OVERLAY,
};

/// Ceiling for "infinite" image waits so a dead main process cannot
/// park an overlay thread forever.
const WAIT_CEILING: Duration = Duration::from_secs(60);

pub(crate) struct OverlaySwapchain {
    pub info: SwapchainCreateInfo,
    pub textures: Vec<Arc<dyn SharedTexture>>,
    /// Device image ids for enumeration, parallel to `textures`.
    pub image_ids: Vec<u64>,
    acquired: VecDeque<u32>,
    waited: bool,
    hold: Option<KeyedMutexGuard>,
}

impl OverlaySwapchain {
    pub fn new(
        info: SwapchainCreateInfo,
        textures: Vec<Arc<dyn SharedTexture>>,
        image_ids: Vec<u64>,
    ) -> Self {
        OverlaySwapchain {
            info,
            textures,
            image_ids,
            acquired: VecDeque::new(),
            waited: false,
            hold: None,
        }
    }

    pub fn record_acquired(&mut self, index: u32) {
        self.acquired.push_back(index);
    }

    /// The image a wait would target, with its share handle. Fails when
    /// nothing is acquired or a wait is already outstanding.
    pub fn wait_target(&self) -> Result<(u32, ShareHandle), CallError> {
        if self.waited {
            return Err(CallError(ResultCode::CallOrderInvalid));
        }
        let index = *self
            .acquired
            .front()
            .ok_or(CallError(ResultCode::CallOrderInvalid))?;
        let tex = &self.textures[index as usize];
        Ok((index, tex.share_handle()))
    }

    /// Local half of the wait: take the keyed mutex with the OVERLAY key
    /// once the host has dropped its hold.
    pub fn complete_wait(&mut self, index: u32, timeout_ns: i64) -> Result<(), CallError> {
        let timeout = if timeout_ns < 0 {
            WAIT_CEILING
        } else {
            Duration::from_nanos(timeout_ns as u64).min(WAIT_CEILING)
        };
        let tex = self.textures[index as usize].clone();
        let guard = KeyedMutexGuard::acquire(tex, KEYED_MUTEX_OVERLAY, KEYED_MUTEX_MAIN, timeout)
            .map_err(|e| match e {
                GraphicsError::AcquireTimeout => CallError(ResultCode::TimeInvalid),
                _ => CallError(ResultCode::RuntimeFailure),
            })?;
        self.hold = Some(guard);
        self.waited = true;
        Ok(())
    }

    /// Local half of the release: hand the texture to the main side by
    /// releasing with the MAIN key. Returns the index and share handle
    /// for the release RPC.
    pub fn begin_release(&mut self) -> Result<(u32, ShareHandle), CallError> {
        if !self.waited {
            return Err(CallError(ResultCode::CallOrderInvalid));
        }
        let index = *self
            .acquired
            .front()
            .ok_or(CallError(ResultCode::CallOrderInvalid))?;
        let share = self.textures[index as usize].share_handle();
        if let Some(hold) = self.hold.take() {
            hold.release_with(KEYED_MUTEX_MAIN)
                .map_err(|_| CallError(ResultCode::RuntimeFailure))?;
        }
        self.acquired.pop_front();
        self.waited = false;
        Ok((index, share))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SwapchainUsageFlags;
    use crate::graphics::{GraphicsDevice, TextureDesc};
    use crate::soft::SoftDevice;

    fn swapchain(tag: &str) -> OverlaySwapchain {
        let prefix = format!("lamina_osc_{}_{}", std::process::id(), tag);
        let device = SoftDevice::new(1, &prefix);
        let desc = TextureDesc {
            width: 2,
            height: 2,
            format: 28,
            sample_count: 1,
            array_size: 1,
            mip_count: 1,
            usage: SwapchainUsageFlags::COLOR_ATTACHMENT,
        };
        let info = SwapchainCreateInfo {
            usage: SwapchainUsageFlags::COLOR_ATTACHMENT,
            format: 28,
            sample_count: 1,
            width: 2,
            height: 2,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        };
        let textures: Vec<_> = (0..2)
            .map(|_| device.create_shared_texture(&desc).unwrap())
            .collect();
        let ids = textures
            .iter()
            .map(|t| device.register_image(t.clone()))
            .collect();
        OverlaySwapchain::new(info, textures, ids)
    }

    #[test]
    fn wait_without_acquire_fails() {
        let sc = swapchain("noacq");
        assert_eq!(
            sc.wait_target().unwrap_err().code(),
            ResultCode::CallOrderInvalid
        );
    }

    #[test]
    fn release_without_wait_fails() {
        let mut sc = swapchain("nowait");
        sc.record_acquired(0);
        assert_eq!(
            sc.begin_release().unwrap_err().code(),
            ResultCode::CallOrderInvalid
        );
    }

    #[test]
    fn acquire_wait_release_cycle() {
        let mut sc = swapchain("cycle");
        assert_eq!(sc.info.width, 2);
        sc.record_acquired(0);
        let (index, share) = sc.wait_target().unwrap();
        assert_eq!(index, 0);
        assert!(!share.token.is_empty());
        sc.complete_wait(index, 1_000_000_000).unwrap();

        // Double wait is a call-order violation.
        assert_eq!(
            sc.wait_target().unwrap_err().code(),
            ResultCode::CallOrderInvalid
        );

        let (rel_index, _share) = sc.begin_release().unwrap();
        assert_eq!(rel_index, 0);

        // The texture is now acquirable with the MAIN key, as the host
        // side would do for its copy.
        sc.textures[0]
            .acquire_keyed(KEYED_MUTEX_MAIN, Duration::from_millis(100))
            .unwrap();
    }
}

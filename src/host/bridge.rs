//! Host side of the swapchain bridge.
//!
//! One bridge exists per overlay swapchain. It holds the opened runtime
//! swapchain images, a cache of overlay shared textures opened by share
//! token, and the keyed-mutex holds left over from release copies.
//!
//! The choreography per image: the release handler acquires the texture
//! with the MAIN key, copies it into the runtime image at the acquired
//! index, forwards the release to the runtime, and keeps the hold. The
//! next wait for that image drops the hold (releasing with the OVERLAY
//! key) so the overlay's own acquire can proceed. On connection loss
//! every outstanding hold is force-released and the cache evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::graphics::{
    GraphicsDevice, GraphicsError, KeyedMutexGuard, ShareHandle, SharedTexture,
    KEYED_MUTEX_MAIN, KEYED_MUTEX_OVERLAY,
};
use crate::types::SwapchainHandle;

pub struct SwapchainBridge {
    device: Arc<dyn GraphicsDevice>,
    real: SwapchainHandle,
    /// Runtime swapchain images in enumeration order.
    images: Vec<Arc<dyn SharedTexture>>,
    /// Overlay shared textures opened on first sight, by share token.
    opened: Mutex<HashMap<String, Arc<dyn SharedTexture>>>,
    /// MAIN-key holds kept between a release copy and the next wait.
    holds: Mutex<HashMap<String, KeyedMutexGuard>>,
}

impl SwapchainBridge {
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        real: SwapchainHandle,
        image_ids: &[u64],
    ) -> Result<SwapchainBridge, GraphicsError> {
        let mut images = Vec::with_capacity(image_ids.len());
        for &id in image_ids {
            images.push(device.open_image(id)?);
        }
        Ok(SwapchainBridge {
            device,
            real,
            images,
            opened: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
        })
    }

    pub fn real(&self) -> SwapchainHandle {
        self.real
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn opened_texture(&self, share: &ShareHandle) -> Result<Arc<dyn SharedTexture>, GraphicsError> {
        let mut opened = self.opened.lock();
        if let Some(tex) = opened.get(&share.token) {
            return Ok(tex.clone());
        }
        let tex = self.device.open_shared_texture(share)?;
        opened.insert(share.token.clone(), tex.clone());
        Ok(tex)
    }

    /// Wait-op bookkeeping: drop any hold left from the previous release
    /// of this image (the guard releases with the OVERLAY key), and make
    /// sure the texture is opened and cached.
    pub fn on_wait(&self, share: &ShareHandle) -> Result<(), GraphicsError> {
        self.holds.lock().remove(&share.token);
        self.opened_texture(share)?;
        Ok(())
    }

    /// Release-op: take the texture with the MAIN key, copy it into the
    /// runtime image at `index`, and keep the hold until the next wait.
    pub fn on_release(
        &self,
        share: &ShareHandle,
        index: u32,
        timeout: Duration,
    ) -> Result<(), GraphicsError> {
        let tex = self.opened_texture(share)?;
        let dst = self
            .images
            .get(index as usize)
            .ok_or(GraphicsError::NotFound)?
            .clone();
        let guard = KeyedMutexGuard::acquire(
            tex.clone(),
            KEYED_MUTEX_MAIN,
            KEYED_MUTEX_OVERLAY,
            timeout,
        )?;
        self.device.copy_texture(tex.as_ref(), dst.as_ref())?;
        self.holds.lock().insert(share.token.clone(), guard);
        Ok(())
    }

    /// Connection-loss path: force-release every outstanding hold and
    /// evict the opened-texture cache.
    pub fn force_release_all(&self) {
        let count = {
            let mut holds = self.holds.lock();
            let n = holds.len();
            holds.clear();
            n
        };
        if count > 0 {
            warn!(
                swapchain = self.real.as_raw(),
                holds = count,
                "force-released keyed mutex holds after connection loss"
            );
        }
        self.opened.lock().clear();
    }
}

impl Drop for SwapchainBridge {
    fn drop(&mut self) {
        self.force_release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SwapchainUsageFlags;
    use crate::graphics::TextureDesc;
    use crate::soft::SoftDevice;

    fn setup(tag: &str) -> (Arc<SoftDevice>, SwapchainBridge, Arc<dyn SharedTexture>, Vec<u64>) {
        let prefix = format!("lamina_bridge_{}_{}", std::process::id(), tag);
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
        // Runtime-side images.
        let ids: Vec<u64> = (0..2)
            .map(|_| {
                let t = device.create_shared_texture(&desc).unwrap();
                device.register_image(t)
            })
            .collect();
        let bridge =
            SwapchainBridge::new(device.clone(), SwapchainHandle::from_raw(7), &ids).unwrap();
        // Overlay-side texture.
        let overlay_tex = device.create_shared_texture(&desc).unwrap();
        (device, bridge, overlay_tex, ids)
    }

    #[test]
    fn release_copies_into_the_runtime_image() {
        let (device, bridge, overlay_tex, ids) = setup("copy");
        let red = [255u8, 0, 0, 255].repeat(4);
        overlay_tex.write_pixels(&red).unwrap();
        // The overlay has released its waited hold with the MAIN key.
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
        overlay_tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();

        bridge
            .on_release(&overlay_tex.share_handle(), 0, Duration::from_millis(200))
            .unwrap();

        let dst = device.open_image(ids[0]).unwrap();
        assert_eq!(dst.read_pixels().unwrap(), red);
    }

    #[test]
    fn wait_drops_the_previous_hold() {
        let (_device, bridge, overlay_tex, _ids) = setup("hold");
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
        overlay_tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();
        bridge
            .on_release(&overlay_tex.share_handle(), 0, Duration::from_millis(200))
            .unwrap();

        // Bridge still holds the texture: the overlay cannot reacquire.
        assert!(overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(20))
            .is_err());

        bridge.on_wait(&overlay_tex.share_handle()).unwrap();
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn force_release_frees_held_textures() {
        let (_device, bridge, overlay_tex, _ids) = setup("force");
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
        overlay_tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();
        bridge
            .on_release(&overlay_tex.share_handle(), 0, Duration::from_millis(200))
            .unwrap();

        bridge.force_release_all();
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn release_to_unknown_index_fails() {
        let (_device, bridge, overlay_tex, _ids) = setup("index");
        overlay_tex
            .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
        overlay_tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();
        assert!(matches!(
            bridge.on_release(&overlay_tex.share_handle(), 9, Duration::from_millis(100)),
            Err(GraphicsError::NotFound)
        ));
    }
}

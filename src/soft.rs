//! Software reference backend for the graphics seam.
//!
//! Textures are named shared-memory segments: a small header holding the
//! keyed-mutex word, then four bytes per pixel. The keyed mutex is a
//! futex word: `key + 1` when released with `key`, a sentinel while
//! held. This gives the same cross-process semantics a GPU keyed mutex
//! provides, minus the GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::graphics::{
    GraphicsDevice, GraphicsError, ShareHandle, SharedTexture, TextureDesc,
};
use crate::os::futex::{futex_wait, futex_wake};
use crate::os::shm::SharedMemory;

/// Pixel data starts at this offset; the header holds the mutex word.
const PIXEL_OFFSET: usize = 64;

/// Mutex word value while some side holds the mutex.
const HELD: u32 = u32::MAX;

fn segment_len(desc: &TextureDesc) -> usize {
    PIXEL_OFFSET + desc.byte_len()
}

pub struct SoftTexture {
    shm: SharedMemory,
    desc: TextureDesc,
    token: String,
}

impl SoftTexture {
    fn lock_word(&self) -> &AtomicU32 {
        // Safety: the first word of the mapping is reserved for the
        // mutex and the mapping outlives self.
        unsafe { &*(self.shm.as_ptr() as *const AtomicU32) }
    }

    fn pixels_ptr(&self) -> *mut u8 {
        // Safety: the mapping is segment_len(desc) bytes.
        unsafe { self.shm.as_ptr().add(PIXEL_OFFSET) }
    }
}

impl SharedTexture for SoftTexture {
    fn desc(&self) -> TextureDesc {
        self.desc
    }

    fn share_handle(&self) -> ShareHandle {
        ShareHandle {
            token: self.token.clone(),
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format,
        }
    }

    fn acquire_keyed(&self, key: u64, timeout: Duration) -> Result<(), GraphicsError> {
        let want = key as u32 + 1;
        let word = self.lock_word();
        let deadline = Instant::now() + timeout;
        loop {
            match word.compare_exchange(want, HELD, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(observed) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GraphicsError::AcquireTimeout);
                    }
                    futex_wait(word, observed, Some(deadline - now));
                }
            }
        }
    }

    fn release_keyed(&self, key: u64) -> Result<(), GraphicsError> {
        let word = self.lock_word();
        word.store(key as u32 + 1, Ordering::Release);
        futex_wake(word, u32::MAX);
        Ok(())
    }

    fn read_pixels(&self) -> Result<Vec<u8>, GraphicsError> {
        let len = self.desc.byte_len();
        let mut out = vec![0u8; len];
        // Safety: mapping covers PIXEL_OFFSET + len bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.pixels_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn write_pixels(&self, data: &[u8]) -> Result<(), GraphicsError> {
        let len = self.desc.byte_len();
        if data.len() != len {
            return Err(GraphicsError::CopyMismatch);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.pixels_ptr(), len);
        }
        Ok(())
    }
}

/// The in-tree software device.
pub struct SoftDevice {
    device_id: u64,
    name_prefix: String,
    next_texture: AtomicU64,
    /// Runtime swapchain images by id, so `open_image` can resolve what
    /// the mock runtime reports from enumeration.
    images: Mutex<HashMap<u64, Arc<dyn SharedTexture>>>,
}

impl SoftDevice {
    pub fn new(device_id: u64, name_prefix: &str) -> Arc<SoftDevice> {
        Arc::new(SoftDevice {
            device_id,
            name_prefix: name_prefix.to_string(),
            next_texture: AtomicU64::new(1),
            images: Mutex::new(HashMap::new()),
        })
    }

    fn texture_name(&self) -> String {
        let n = self.next_texture.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}_tex_{}_{}",
            self.name_prefix,
            std::process::id(),
            n
        )
    }
}

impl GraphicsDevice for SoftDevice {
    fn device_id(&self) -> u64 {
        self.device_id
    }

    fn create_shared_texture(
        &self,
        desc: &TextureDesc,
    ) -> Result<Arc<dyn SharedTexture>, GraphicsError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::BadDescriptor);
        }
        let token = self.texture_name();
        let shm = SharedMemory::create(&token, segment_len(desc))?;
        let tex = SoftTexture {
            shm,
            desc: *desc,
            token,
        };
        // A fresh texture starts released with the overlay key, like a
        // newly created keyed-mutex texture starts released with key 0.
        tex.lock_word().store(
            crate::graphics::KEYED_MUTEX_OVERLAY as u32 + 1,
            Ordering::Release,
        );
        Ok(Arc::new(tex))
    }

    fn open_shared_texture(
        &self,
        handle: &ShareHandle,
    ) -> Result<Arc<dyn SharedTexture>, GraphicsError> {
        let desc = TextureDesc {
            width: handle.width,
            height: handle.height,
            format: handle.format,
            sample_count: 1,
            array_size: 1,
            mip_count: 1,
            usage: crate::api::SwapchainUsageFlags::empty(),
        };
        let shm = SharedMemory::open(&handle.token, segment_len(&desc))
            .map_err(|_| GraphicsError::NotFound)?;
        Ok(Arc::new(SoftTexture {
            shm,
            desc,
            token: handle.token.clone(),
        }))
    }

    fn register_image(&self, texture: Arc<dyn SharedTexture>) -> u64 {
        let id = self.next_texture.fetch_add(1, Ordering::Relaxed);
        self.images.lock().insert(id, texture);
        id
    }

    fn open_image(&self, image_id: u64) -> Result<Arc<dyn SharedTexture>, GraphicsError> {
        self.images
            .lock()
            .get(&image_id)
            .cloned()
            .ok_or(GraphicsError::NotFound)
    }

    fn copy_texture(
        &self,
        src: &dyn SharedTexture,
        dst: &dyn SharedTexture,
    ) -> Result<(), GraphicsError> {
        let s = src.desc();
        let d = dst.desc();
        if s.width != d.width || s.height != d.height {
            return Err(GraphicsError::CopyMismatch);
        }
        let pixels = src.read_pixels()?;
        dst.write_pixels(&pixels)
    }

    fn set_multithread_protected(&self) {
        // The soft device is already internally synchronized.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SwapchainUsageFlags;
    use crate::graphics::{KeyedMutexGuard, KEYED_MUTEX_MAIN, KEYED_MUTEX_OVERLAY};

    fn test_device(tag: &str) -> Arc<SoftDevice> {
        let prefix = format!("lamina_soft_{}_{}", std::process::id(), tag);
        SoftDevice::new(1, &prefix)
    }

    fn desc() -> TextureDesc {
        TextureDesc {
            width: 4,
            height: 4,
            format: 28,
            sample_count: 1,
            array_size: 1,
            mip_count: 1,
            usage: SwapchainUsageFlags::COLOR_ATTACHMENT,
        }
    }

    #[test]
    fn pixels_are_visible_through_the_share_handle() {
        let dev = test_device("pix");
        let tex = dev.create_shared_texture(&desc()).unwrap();
        let red: Vec<u8> = [255u8, 0, 0, 255].repeat(16);
        tex.write_pixels(&red).unwrap();

        let opened = dev.open_shared_texture(&tex.share_handle()).unwrap();
        assert_eq!(opened.read_pixels().unwrap(), red);
    }

    #[test]
    fn keyed_mutex_alternates_between_keys() {
        let dev = test_device("keys");
        let tex = dev.create_shared_texture(&desc()).unwrap();

        // Fresh texture: acquirable with the overlay key, not the main
        // key.
        assert!(matches!(
            tex.acquire_keyed(KEYED_MUTEX_MAIN, Duration::from_millis(20)),
            Err(GraphicsError::AcquireTimeout)
        ));
        tex.acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();
        tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();
        tex.acquire_keyed(KEYED_MUTEX_MAIN, Duration::from_millis(100))
            .unwrap();
        tex.release_keyed(KEYED_MUTEX_OVERLAY).unwrap();
    }

    #[test]
    fn keyed_mutex_unblocks_cross_thread() {
        let dev = test_device("cross");
        let tex = dev.create_shared_texture(&desc()).unwrap();
        tex.acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(100))
            .unwrap();

        let tex2 = dev.open_shared_texture(&tex.share_handle()).unwrap();
        let waiter = std::thread::spawn(move || {
            tex2.acquire_keyed(KEYED_MUTEX_MAIN, Duration::from_secs(2))
                .is_ok()
        });
        std::thread::sleep(Duration::from_millis(20));
        tex.release_keyed(KEYED_MUTEX_MAIN).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn guard_releases_on_drop() {
        let dev = test_device("guard");
        let tex = dev.create_shared_texture(&desc()).unwrap();
        {
            let _guard = KeyedMutexGuard::acquire(
                tex.clone(),
                KEYED_MUTEX_OVERLAY,
                KEYED_MUTEX_MAIN,
                Duration::from_millis(100),
            )
            .unwrap();
            // Held: nobody can take it now.
            assert!(tex
                .acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(10))
                .is_err());
        }
        // Dropped: released with the main key.
        tex.acquire_keyed(KEYED_MUTEX_MAIN, Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn copy_requires_matching_shapes() {
        let dev = test_device("copy");
        let a = dev.create_shared_texture(&desc()).unwrap();
        let mut other = desc();
        other.width = 8;
        let b = dev.create_shared_texture(&other).unwrap();
        assert!(matches!(
            dev.copy_texture(a.as_ref(), b.as_ref()),
            Err(GraphicsError::CopyMismatch)
        ));
    }
}

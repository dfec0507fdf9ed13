//! The graphics device seam.
//!
//! The layer never talks to a GPU directly; it needs exactly four things
//! from a backend: create a texture that can be shared with another
//! process, open such a texture from a share handle, synchronize access
//! with a keyed mutex, and copy one texture into another. Real backends
//! live outside this crate; [`soft`](crate::soft) is the in-tree
//! reference backend used by the mock runtime and the tests.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::api::SwapchainUsageFlags;

/// Keyed-mutex key held by the overlay side while it renders.
pub const KEYED_MUTEX_OVERLAY: u64 = 0;
/// Keyed-mutex key held by the main side while it copies.
pub const KEYED_MUTEX_MAIN: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: i64,
    pub sample_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub usage: SwapchainUsageFlags,
}

impl TextureDesc {
    /// Byte size of one pixel plane (the soft backend stores 4 bytes per
    /// pixel regardless of format).
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Token that lets another process open the same texture. The descriptor
/// rides along so the opener can size its mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareHandle {
    pub token: String,
    pub width: u32,
    pub height: u32,
    pub format: i64,
}

#[derive(Debug)]
pub enum GraphicsError {
    /// No texture behind the given handle or image id.
    NotFound,
    /// Keyed-mutex acquire did not complete within the bound.
    AcquireTimeout,
    /// Source and destination shapes differ.
    CopyMismatch,
    /// The backend rejected the descriptor.
    BadDescriptor,
    Os(io::Error),
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no texture behind handle"),
            Self::AcquireTimeout => write!(f, "keyed mutex acquire timed out"),
            Self::CopyMismatch => write!(f, "texture copy shape mismatch"),
            Self::BadDescriptor => write!(f, "texture descriptor rejected"),
            Self::Os(e) => write!(f, "graphics OS error: {}", e),
        }
    }
}

impl std::error::Error for GraphicsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GraphicsError {
    fn from(e: io::Error) -> Self {
        Self::Os(e)
    }
}

/// A GPU texture that can be shared across processes and fenced with a
/// keyed mutex.
pub trait SharedTexture: Send + Sync {
    fn desc(&self) -> TextureDesc;
    fn share_handle(&self) -> ShareHandle;

    /// Block until the mutex is released with `key`, then hold it.
    fn acquire_keyed(&self, key: u64, timeout: Duration) -> Result<(), GraphicsError>;

    /// Release the mutex, making it acquirable with `key`.
    fn release_keyed(&self, key: u64) -> Result<(), GraphicsError>;

    /// Snapshot the pixel contents (copies and tests).
    fn read_pixels(&self) -> Result<Vec<u8>, GraphicsError>;

    /// Overwrite the pixel contents.
    fn write_pixels(&self, data: &[u8]) -> Result<(), GraphicsError>;
}

/// The device contract the layer needs from a backend.
pub trait GraphicsDevice: Send + Sync {
    /// Identity compared against the session's graphics binding.
    fn device_id(&self) -> u64;

    fn create_shared_texture(
        &self,
        desc: &TextureDesc,
    ) -> Result<Arc<dyn SharedTexture>, GraphicsError>;

    fn open_shared_texture(
        &self,
        handle: &ShareHandle,
    ) -> Result<Arc<dyn SharedTexture>, GraphicsError>;

    /// Register a texture under a fresh image id so API callers can
    /// address it through swapchain image enumeration.
    fn register_image(&self, texture: Arc<dyn SharedTexture>) -> u64;

    /// Resolve a swapchain image id back to a texture on this device.
    fn open_image(&self, image_id: u64) -> Result<Arc<dyn SharedTexture>, GraphicsError>;

    fn copy_texture(
        &self,
        src: &dyn SharedTexture,
        dst: &dyn SharedTexture,
    ) -> Result<(), GraphicsError>;

    /// Serialize internal driver access; the overlay side enables this
    /// because layer threads and app threads share the device.
    fn set_multithread_protected(&self);
}

/// Scoped hold of a texture's keyed mutex.
///
/// Acquired with one key, released with another (or the same) on drop,
/// so a panic between wait and release cannot leave the mutex held.
pub struct KeyedMutexGuard {
    texture: Arc<dyn SharedTexture>,
    release_key: u64,
    armed: bool,
}

impl KeyedMutexGuard {
    /// Acquire `texture`'s mutex with `acquire_key`; the guard will
    /// release with `release_key` unless told otherwise.
    pub fn acquire(
        texture: Arc<dyn SharedTexture>,
        acquire_key: u64,
        release_key: u64,
        timeout: Duration,
    ) -> Result<KeyedMutexGuard, GraphicsError> {
        texture.acquire_keyed(acquire_key, timeout)?;
        Ok(KeyedMutexGuard {
            texture,
            release_key,
            armed: true,
        })
    }

    /// Release now with an explicit key instead of the configured one.
    pub fn release_with(mut self, key: u64) -> Result<(), GraphicsError> {
        self.armed = false;
        self.texture.release_keyed(key)
    }

    pub fn texture(&self) -> &Arc<dyn SharedTexture> {
        &self.texture
    }
}

impl Drop for KeyedMutexGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.texture.release_keyed(self.release_key);
        }
    }
}

//! Handle newtypes and small shared value types.
//!
//! Every opaque object in the compositor API is addressed by a 64-bit
//! handle. On the main side these are whatever the downchain runtime
//! returned ("real" handles). On the overlay side the layer hands out
//! identifiers it generated itself ("local" handles); those always have
//! the top bit set so they can never collide with a runtime handle or
//! with null.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raw value shared by every handle kind. Zero is the null handle.
pub type RawHandle = u64;

/// Bit that marks a layer-generated local identifier.
pub const LOCAL_HANDLE_BIT: u64 = 1 << 63;

/// Nanosecond timestamp on the runtime's clock.
pub type DisplayTime = i64;

/// Nanosecond duration on the runtime's clock.
pub type DisplayPeriod = i64;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const NULL: $name = $name(0);

            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// True if this is a layer-generated local identifier rather
            /// than a handle owned by the runtime.
            pub const fn is_local(self) -> bool {
                self.0 & LOCAL_HANDLE_BIT != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

handle_type!(
    /// An instance of the compositor API.
    InstanceHandle
);
handle_type!(
    /// A compositor session (main or overlay).
    SessionHandle
);
handle_type!(
    /// A swapchain of GPU images.
    SwapchainHandle
);
handle_type!(
    /// A reference or action space.
    SpaceHandle
);
handle_type!(
    /// A set of input actions.
    ActionSetHandle
);
handle_type!(
    /// A single input action.
    ActionHandle
);

/// Identifier of the VR system backing an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SystemId(pub u64);

/// Allocator for local handle identifiers.
///
/// Identifiers are never reused within a process lifetime and always
/// carry [`LOCAL_HANDLE_BIT`].
pub struct LocalIdAllocator {
    next: AtomicU64,
}

impl LocalIdAllocator {
    pub const fn new() -> Self {
        LocalIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> RawHandle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        n | LOCAL_HANDLE_BIT
    }
}

impl Default for LocalIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

//! lamina: a cross-process overlay multiplexer for a VR compositor API.
//!
//! One *main* application owns the real compositor session; independent
//! *overlay* applications in other OS processes submit composition
//! layers into it. Overlays program against the same
//! [`CompositorRuntime`](runtime::CompositorRuntime) trait the main
//! application uses; underneath, their calls are marshalled through a
//! shared-memory arena to the main process, executed there against the
//! real session, and the results copied back. GPU surfaces travel
//! zero-copy as shared textures fenced by keyed mutexes.
//!
//! The two entry points:
//!
//! - [`host::MainLayer`] wraps the real runtime in the main process and
//!   accepts overlay connections once the main session exists.
//! - [`overlay::OverlayRuntime::connect`] joins from an overlay process.
//!
//! The IPC substrate (arena with pointer fixups, chain copier,
//! negotiation, RPC transport) lives in the root modules; the in-tree
//! [`mock::MockRuntime`] and [`soft::SoftDevice`] stand in for the real
//! runtime and GPU in tests and bring-up.

pub mod api;
pub mod arena;
pub mod chain;
pub mod config;
pub mod error;
pub mod graphics;
pub mod host;
pub mod marshal;
pub mod mock;
pub mod negotiate;
pub mod opcode;
pub mod os;
pub mod overlay;
pub mod registry;
pub mod runtime;
pub mod soft;
pub mod transport;
pub mod types;

pub use config::LayerConfig;
pub use error::{ApiResult, CallError, ChannelError, ResultCode};
pub use host::MainLayer;
pub use overlay::OverlayRuntime;
pub use runtime::CompositorRuntime;

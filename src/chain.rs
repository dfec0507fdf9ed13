//! Extension chains: typed linked lists of `{kind, next, payload}` nodes.
//!
//! In-process code works with owned tagged variants from
//! [`api`](crate::api); this module defines the `#[repr(C)]` wire nodes
//! those convert to inside the arena, and the chain copier that walks a
//! chain node by node. The copier is a match over [`StructureKind`]: each
//! known kind knows its size and its pointer fields, unknown kinds are
//! dropped from the output chain, so a reader must tolerate chains
//! shorter than what the writer sent.
//!
//! Two copy modes exist: `Everything` for inputs the host will consume,
//! `HeaderOnly` for outputs the host fills in afterwards.

use crate::api::{
    CompositionLayer, CompositionLayerFlags, CompositionLayerProjection, CompositionLayerQuad,
    DepthInfo, Extent2Df, EyeVisibility, Fovf, GraphicsApi, GraphicsBinding,
    OverlaySessionCreateInfo, OverlaySessionFlags, Posef, ProjectionLayerView, Rect2Di,
    SessionCreateInfo, SwapchainSubImage,
};
use crate::arena::Arena;
use crate::error::ArenaError;
use crate::types::{SpaceHandle, SwapchainHandle, SystemId};

/// Wire tag of a chain node. Values are protocol-stable; new kinds may be
/// appended, existing ones never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StructureKind {
    SessionCreateInfo = 1,
    GraphicsBindingSharedTexture = 2,
    OverlaySessionCreateInfo = 3,
    CompositionLayerProjection = 4,
    CompositionLayerQuad = 5,
    ProjectionView = 6,
    DepthInfo = 7,
}

impl StructureKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::SessionCreateInfo,
            2 => Self::GraphicsBindingSharedTexture,
            3 => Self::OverlaySessionCreateInfo,
            4 => Self::CompositionLayerProjection,
            5 => Self::CompositionLayerQuad,
            6 => Self::ProjectionView,
            7 => Self::DepthInfo,
            _ => return None,
        })
    }
}

/// Common prefix of every wire chain node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StructHeader {
    pub kind: u32,
    pub next: *mut StructHeader,
}

impl StructHeader {
    pub fn new(kind: StructureKind) -> Self {
        StructHeader {
            kind: kind as u32,
            next: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireSessionCreateInfo {
    pub header: StructHeader,
    pub system: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireGraphicsBinding {
    pub header: StructHeader,
    pub api: u32,
    pub device_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireOverlaySessionCreateInfo {
    pub header: StructHeader,
    pub flags: u64,
    pub placement: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireSwapchainSubImage {
    pub swapchain: u64,
    pub image_rect: Rect2Di,
    pub image_array_index: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireCompositionLayerProjection {
    pub header: StructHeader,
    pub flags: u64,
    pub space: u64,
    pub view_count: u32,
    pub _reserved: u32,
    /// Contiguous array of `view_count` views; recorded in the fixup
    /// table by the emitter.
    pub views: *mut WireProjectionView,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireProjectionView {
    pub header: StructHeader,
    pub pose: Posef,
    pub fov: Fovf,
    pub sub_image: WireSwapchainSubImage,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireDepthInfo {
    pub header: StructHeader,
    pub sub_image: WireSwapchainSubImage,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireCompositionLayerQuad {
    pub header: StructHeader,
    pub flags: u64,
    pub space: u64,
    pub eye_visibility: i32,
    pub _reserved: u32,
    pub sub_image: WireSwapchainSubImage,
    pub pose: Posef,
    pub size: Extent2Df,
}

const _: () = {
    assert!(std::mem::size_of::<StructHeader>() == 16);
    assert!(std::mem::size_of::<WireSwapchainSubImage>() == 32);
    assert!(std::mem::align_of::<WireCompositionLayerProjection>() == 8);
};

/// Destination for chain copies: the arena (serialization) or the heap
/// (long-lived cached chains).
pub trait ChainAlloc {
    fn alloc(&mut self, len: usize) -> Result<*mut u8, ArenaError>;

    /// Record a pointer-bearing location for later rebasing. A no-op for
    /// heap destinations, which never cross a process boundary.
    ///
    /// # Safety
    /// `location` must point at a pointer-sized field inside memory this
    /// allocator handed out (or, for the arena, inside the arena).
    unsafe fn register(&mut self, location: *mut *mut u8) -> Result<(), ArenaError>;
}

impl<'a> ChainAlloc for Arena<'a> {
    fn alloc(&mut self, len: usize) -> Result<*mut u8, ArenaError> {
        self.alloc_bytes(len).map(|p| p.as_ptr())
    }

    unsafe fn register(&mut self, location: *mut *mut u8) -> Result<(), ArenaError> {
        self.register_pointer(location)
    }
}

/// Heap destination with stable node addresses. Dropping it frees every
/// node, so a chain copied here must not outlive it.
#[derive(Default)]
pub struct HeapChain {
    // u64 blocks keep every node 8-aligned, matching the arena.
    blocks: Vec<Box<[u64]>>,
}

impl HeapChain {
    pub fn new() -> Self {
        HeapChain { blocks: Vec::new() }
    }
}

impl ChainAlloc for HeapChain {
    fn alloc(&mut self, len: usize) -> Result<*mut u8, ArenaError> {
        let words = len / 8 + 1;
        let mut block = vec![0u64; words].into_boxed_slice();
        let p = block.as_mut_ptr() as *mut u8;
        self.blocks.push(block);
        Ok(p)
    }

    unsafe fn register(&mut self, _location: *mut *mut u8) -> Result<(), ArenaError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Copy every payload byte; used for inputs.
    Everything,
    /// Copy only `{kind, next}`, zeroing the payload; used for outputs
    /// the host fills in.
    HeaderOnly,
}

fn node_size(kind: StructureKind) -> usize {
    match kind {
        StructureKind::SessionCreateInfo => std::mem::size_of::<WireSessionCreateInfo>(),
        StructureKind::GraphicsBindingSharedTexture => std::mem::size_of::<WireGraphicsBinding>(),
        StructureKind::OverlaySessionCreateInfo => {
            std::mem::size_of::<WireOverlaySessionCreateInfo>()
        }
        StructureKind::CompositionLayerProjection => {
            std::mem::size_of::<WireCompositionLayerProjection>()
        }
        StructureKind::CompositionLayerQuad => std::mem::size_of::<WireCompositionLayerQuad>(),
        StructureKind::ProjectionView => std::mem::size_of::<WireProjectionView>(),
        StructureKind::DepthInfo => std::mem::size_of::<WireDepthInfo>(),
    }
}

/// Deep-copy a chain into `dst`, skipping unknown node kinds.
///
/// Returns the head of the copied chain, or null if every node was
/// unknown (or `src` was null).
///
/// # Safety
/// `src` must be null or point to a valid chain of wire nodes whose
/// payloads (including nested arrays) are readable.
pub unsafe fn copy_chain(
    dst: &mut dyn ChainAlloc,
    src: *const StructHeader,
    mode: CopyMode,
) -> Result<*mut StructHeader, ArenaError> {
    let mut head: *mut StructHeader = std::ptr::null_mut();
    let mut tail_next: *mut *mut StructHeader = std::ptr::null_mut();
    let mut cur = src;

    while !cur.is_null() {
        let kind_raw = (*cur).kind;
        let next = (*cur).next as *const StructHeader;

        let Some(kind) = StructureKind::from_u32(kind_raw) else {
            // Unknown extension: drop it from the output chain.
            cur = next;
            continue;
        };

        let size = node_size(kind);
        let copy = dst.alloc(size)? as *mut StructHeader;
        match mode {
            CopyMode::Everything => {
                std::ptr::copy_nonoverlapping(cur as *const u8, copy as *mut u8, size);
            }
            CopyMode::HeaderOnly => {
                std::ptr::write_bytes(copy as *mut u8, 0, size);
                (*copy).kind = kind_raw;
            }
        }
        (*copy).next = std::ptr::null_mut();

        // Nested payload pointers need their own deep copy and fixup.
        if mode == CopyMode::Everything && kind == StructureKind::CompositionLayerProjection {
            let proj = copy as *mut WireCompositionLayerProjection;
            let src_proj = cur as *const WireCompositionLayerProjection;
            let count = (*src_proj).view_count as usize;
            if count > 0 && !(*src_proj).views.is_null() {
                let views = dst.alloc(count * std::mem::size_of::<WireProjectionView>())?
                    as *mut WireProjectionView;
                for i in 0..count {
                    let sv = (*src_proj).views.add(i) as *const WireProjectionView;
                    views.add(i).write(sv.read());
                    // Each view may chain a depth node of its own.
                    let depth = copy_chain(dst, (*sv).header.next as *const StructHeader, mode)?;
                    (*views.add(i)).header.next = depth;
                    if !depth.is_null() {
                        dst.register(
                            std::ptr::addr_of_mut!((*views.add(i)).header.next) as *mut *mut u8
                        )?;
                    }
                }
                (*proj).views = views;
                dst.register(std::ptr::addr_of_mut!((*proj).views) as *mut *mut u8)?;
            } else {
                (*proj).views = std::ptr::null_mut();
            }
        }

        if head.is_null() {
            head = copy;
        } else {
            *tail_next = copy;
            dst.register(tail_next as *mut *mut u8)?;
        }
        tail_next = std::ptr::addr_of_mut!((*copy).next);
        cur = next;
    }

    Ok(head)
}

/// Copy payloads from `src` into a caller-provided destination chain.
///
/// The destination was typically allocated with `HeaderOnly` by the other
/// side; because unknown kinds were dropped in transit, the two chains
/// may disagree. Destination nodes whose kind does not match the next
/// known source node are skipped, which keeps both walks aligned under
/// asymmetric extension support.
///
/// # Safety
/// Both chains must be valid; matching nodes must have the layout their
/// kind implies.
pub unsafe fn copy_out_chain(dst: *mut StructHeader, src: *const StructHeader) {
    let mut d = dst;
    let mut s = src;
    while !d.is_null() && !s.is_null() {
        let Some(src_kind) = StructureKind::from_u32((*s).kind) else {
            s = (*s).next;
            continue;
        };
        if (*d).kind != src_kind as u32 {
            d = (*d).next;
            continue;
        }
        let size = node_size(src_kind);
        let d_next = (*d).next;
        std::ptr::copy_nonoverlapping(s as *const u8, d as *mut u8, size);
        (*d).next = d_next;
        d = d_next;
        s = (*s).next;
    }
}

// ---------------------------------------------------------------------------
// Owned <-> wire conversion
// ---------------------------------------------------------------------------

/// Emit a session create info (with its graphics-binding and overlay
/// extension nodes) into `dst`.
pub fn emit_session_create_info(
    dst: &mut dyn ChainAlloc,
    info: &SessionCreateInfo,
) -> Result<*mut StructHeader, ArenaError> {
    let root = alloc_value(
        dst,
        WireSessionCreateInfo {
            header: StructHeader::new(StructureKind::SessionCreateInfo),
            system: info.system.0,
        },
    )?;

    let binding = alloc_value(
        dst,
        WireGraphicsBinding {
            header: StructHeader::new(StructureKind::GraphicsBindingSharedTexture),
            api: info.graphics.api as u32,
            device_id: info.graphics.device_id,
        },
    )?;
    // Safety: both nodes were just allocated from dst.
    unsafe {
        (*root).header.next = binding as *mut StructHeader;
        dst.register(std::ptr::addr_of_mut!((*root).header.next) as *mut *mut u8)?;
    }

    if let Some(overlay) = &info.overlay {
        let node = alloc_value(
            dst,
            WireOverlaySessionCreateInfo {
                header: StructHeader::new(StructureKind::OverlaySessionCreateInfo),
                flags: overlay.flags.bits(),
                placement: overlay.placement,
            },
        )?;
        unsafe {
            (*binding).header.next = node as *mut StructHeader;
            dst.register(std::ptr::addr_of_mut!((*binding).header.next) as *mut *mut u8)?;
        }
    }

    Ok(root as *mut StructHeader)
}

/// Parse a session create info chain back into owned form. Unknown chain
/// nodes are ignored; a missing graphics binding yields `None`.
///
/// # Safety
/// `head` must be null or point to a valid chain.
pub unsafe fn parse_session_create_info(head: *const StructHeader) -> Option<SessionCreateInfo> {
    let mut system = None;
    let mut graphics = None;
    let mut overlay = None;

    let mut cur = head;
    while !cur.is_null() {
        match StructureKind::from_u32((*cur).kind) {
            Some(StructureKind::SessionCreateInfo) => {
                let n = cur as *const WireSessionCreateInfo;
                system = Some(SystemId((*n).system));
            }
            Some(StructureKind::GraphicsBindingSharedTexture) => {
                let n = cur as *const WireGraphicsBinding;
                graphics = Some(GraphicsBinding {
                    api: GraphicsApi::from_u32((*n).api)?,
                    device_id: (*n).device_id,
                });
            }
            Some(StructureKind::OverlaySessionCreateInfo) => {
                let n = cur as *const WireOverlaySessionCreateInfo;
                overlay = Some(OverlaySessionCreateInfo {
                    flags: OverlaySessionFlags::from_bits_truncate((*n).flags),
                    placement: (*n).placement,
                });
            }
            _ => {}
        }
        cur = (*cur).next;
    }

    Some(SessionCreateInfo {
        system: system?,
        graphics: graphics?,
        overlay,
    })
}

fn wire_sub_image(sub: &SwapchainSubImage) -> WireSwapchainSubImage {
    WireSwapchainSubImage {
        swapchain: sub.swapchain.as_raw(),
        image_rect: sub.image_rect,
        image_array_index: sub.image_array_index,
        _reserved: 0,
    }
}

unsafe fn parse_sub_image(sub: &WireSwapchainSubImage) -> SwapchainSubImage {
    SwapchainSubImage {
        swapchain: SwapchainHandle::from_raw(sub.swapchain),
        image_rect: sub.image_rect,
        image_array_index: sub.image_array_index,
    }
}

/// Emit one composition layer as a wire node (plus nested views).
pub fn emit_composition_layer(
    dst: &mut dyn ChainAlloc,
    layer: &CompositionLayer,
) -> Result<*mut StructHeader, ArenaError> {
    match layer {
        CompositionLayer::Projection(p) => {
            let node = alloc_value(
                dst,
                WireCompositionLayerProjection {
                    header: StructHeader::new(StructureKind::CompositionLayerProjection),
                    flags: p.flags.bits(),
                    space: p.space.as_raw(),
                    view_count: p.views.len() as u32,
                    _reserved: 0,
                    views: std::ptr::null_mut(),
                },
            )?;
            if !p.views.is_empty() {
                let views = dst.alloc(p.views.len() * std::mem::size_of::<WireProjectionView>())?
                    as *mut WireProjectionView;
                for (i, view) in p.views.iter().enumerate() {
                    // Safety: views array freshly allocated with room for
                    // every element.
                    unsafe {
                        views.add(i).write(WireProjectionView {
                            header: StructHeader::new(StructureKind::ProjectionView),
                            pose: view.pose,
                            fov: view.fov,
                            sub_image: wire_sub_image(&view.sub_image),
                        });
                        if let Some(depth) = &view.depth {
                            let d = alloc_value(
                                dst,
                                WireDepthInfo {
                                    header: StructHeader::new(StructureKind::DepthInfo),
                                    sub_image: wire_sub_image(&depth.sub_image),
                                    min_depth: depth.min_depth,
                                    max_depth: depth.max_depth,
                                    near_z: depth.near_z,
                                    far_z: depth.far_z,
                                },
                            )?;
                            (*views.add(i)).header.next = d as *mut StructHeader;
                            dst.register(
                                std::ptr::addr_of_mut!((*views.add(i)).header.next)
                                    as *mut *mut u8,
                            )?;
                        }
                    }
                }
                // Safety: node was just allocated from dst.
                unsafe {
                    (*node).views = views;
                    dst.register(std::ptr::addr_of_mut!((*node).views) as *mut *mut u8)?;
                }
            }
            Ok(node as *mut StructHeader)
        }
        CompositionLayer::Quad(q) => {
            let node = alloc_value(
                dst,
                WireCompositionLayerQuad {
                    header: StructHeader::new(StructureKind::CompositionLayerQuad),
                    flags: q.flags.bits(),
                    space: q.space.as_raw(),
                    eye_visibility: q.eye_visibility as i32,
                    _reserved: 0,
                    sub_image: wire_sub_image(&q.sub_image),
                    pose: q.pose,
                    size: q.size,
                },
            )?;
            Ok(node as *mut StructHeader)
        }
    }
}

/// Parse one composition layer node. Returns `None` for kinds that are
/// not composition layers.
///
/// # Safety
/// `node` must point to a valid wire node with readable payload.
pub unsafe fn parse_composition_layer(node: *const StructHeader) -> Option<CompositionLayer> {
    match StructureKind::from_u32((*node).kind)? {
        StructureKind::CompositionLayerProjection => {
            let p = node as *const WireCompositionLayerProjection;
            let count = (*p).view_count as usize;
            let mut views = Vec::with_capacity(count);
            if count > 0 && (*p).views.is_null() {
                return None;
            }
            for i in 0..count {
                let v = (*p).views.add(i) as *const WireProjectionView;
                let mut depth = None;
                let mut ext = (*v).header.next as *const StructHeader;
                while !ext.is_null() {
                    if StructureKind::from_u32((*ext).kind) == Some(StructureKind::DepthInfo) {
                        let d = ext as *const WireDepthInfo;
                        depth = Some(DepthInfo {
                            sub_image: parse_sub_image(&(*d).sub_image),
                            min_depth: (*d).min_depth,
                            max_depth: (*d).max_depth,
                            near_z: (*d).near_z,
                            far_z: (*d).far_z,
                        });
                    }
                    ext = (*ext).next;
                }
                views.push(ProjectionLayerView {
                    pose: (*v).pose,
                    fov: (*v).fov,
                    sub_image: parse_sub_image(&(*v).sub_image),
                    depth,
                });
            }
            Some(CompositionLayer::Projection(CompositionLayerProjection {
                flags: CompositionLayerFlags::from_bits_truncate((*p).flags),
                space: SpaceHandle::from_raw((*p).space),
                views,
            }))
        }
        StructureKind::CompositionLayerQuad => {
            let q = node as *const WireCompositionLayerQuad;
            Some(CompositionLayer::Quad(CompositionLayerQuad {
                flags: CompositionLayerFlags::from_bits_truncate((*q).flags),
                space: SpaceHandle::from_raw((*q).space),
                eye_visibility: EyeVisibility::from_i32((*q).eye_visibility)?,
                sub_image: parse_sub_image(&(*q).sub_image),
                pose: (*q).pose,
                size: (*q).size,
            }))
        }
        _ => None,
    }
}

fn alloc_value<T: Copy>(dst: &mut dyn ChainAlloc, value: T) -> Result<*mut T, ArenaError> {
    let p = dst.alloc(std::mem::size_of::<T>())? as *mut T;
    // Safety: freshly allocated with room for T; ChainAlloc impls hand
    // out 8-aligned blocks.
    unsafe { p.write(value) };
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CompositionLayerFlags, Posef};

    fn sample_session_info(overlay: bool) -> SessionCreateInfo {
        SessionCreateInfo {
            system: SystemId(42),
            graphics: GraphicsBinding {
                api: GraphicsApi::SharedTexture,
                device_id: 7,
            },
            overlay: overlay.then_some(OverlaySessionCreateInfo {
                flags: OverlaySessionFlags::RELAXED_DISPLAY_TIME,
                placement: 3,
            }),
        }
    }

    #[test]
    fn session_create_info_roundtrips_through_heap() {
        let mut heap = HeapChain::new();
        let head = emit_session_create_info(&mut heap, &sample_session_info(true)).unwrap();
        let parsed = unsafe { parse_session_create_info(head) }.unwrap();
        assert_eq!(parsed.system, SystemId(42));
        assert_eq!(parsed.graphics.device_id, 7);
        let overlay = parsed.overlay.unwrap();
        assert_eq!(overlay.placement, 3);
        assert!(overlay.flags.contains(OverlaySessionFlags::RELAXED_DISPLAY_TIME));
    }

    #[test]
    fn copy_chain_skips_unknown_kinds() {
        let mut heap = HeapChain::new();
        let head = emit_session_create_info(&mut heap, &sample_session_info(true)).unwrap();

        // Splice an unknown node between the binding and the overlay info.
        let mut unknown = StructHeader {
            kind: 0xdead_beef,
            next: std::ptr::null_mut(),
        };
        unsafe {
            let binding = (*head).next;
            unknown.next = (*binding).next;
            (*binding).next = &mut unknown;
        }

        let mut dst = HeapChain::new();
        let copied = unsafe { copy_chain(&mut dst, head, CopyMode::Everything) }.unwrap();

        // The copy still parses and the unknown node is gone.
        let parsed = unsafe { parse_session_create_info(copied) }.unwrap();
        assert!(parsed.overlay.is_some());
        let mut kinds = Vec::new();
        let mut cur = copied as *const StructHeader;
        while !cur.is_null() {
            kinds.push(unsafe { (*cur).kind });
            cur = unsafe { (*cur).next };
        }
        assert_eq!(kinds.len(), 3);
        assert!(!kinds.contains(&0xdead_beef));
    }

    #[test]
    fn header_only_copy_zeroes_payload() {
        let mut heap = HeapChain::new();
        let head = emit_session_create_info(&mut heap, &sample_session_info(false)).unwrap();

        let mut dst = HeapChain::new();
        let copied = unsafe { copy_chain(&mut dst, head, CopyMode::HeaderOnly) }.unwrap();
        let root = copied as *const WireSessionCreateInfo;
        unsafe {
            assert_eq!((*root).header.kind, StructureKind::SessionCreateInfo as u32);
            assert_eq!((*root).system, 0);
            assert!(!(*root).header.next.is_null());
        }
    }

    #[test]
    fn copy_out_skips_mismatched_destination_nodes() {
        // Source: just a graphics binding. Destination: create-info then
        // binding (allocated header-only). The create-info node must be
        // skipped, the binding filled.
        let mut src_heap = HeapChain::new();
        let src = alloc_value(
            &mut src_heap,
            WireGraphicsBinding {
                header: StructHeader::new(StructureKind::GraphicsBindingSharedTexture),
                api: GraphicsApi::SharedTexture as u32,
                device_id: 99,
            },
        )
        .unwrap();

        let mut dst_heap = HeapChain::new();
        let d_root = alloc_value(
            &mut dst_heap,
            WireSessionCreateInfo {
                header: StructHeader::new(StructureKind::SessionCreateInfo),
                system: 1,
            },
        )
        .unwrap();
        let d_binding = alloc_value(
            &mut dst_heap,
            WireGraphicsBinding {
                header: StructHeader::new(StructureKind::GraphicsBindingSharedTexture),
                api: 0,
                device_id: 0,
            },
        )
        .unwrap();
        unsafe {
            (*d_root).header.next = d_binding as *mut StructHeader;
            copy_out_chain(
                d_root as *mut StructHeader,
                src as *const StructHeader,
            );
            assert_eq!((*d_root).system, 1, "mismatched node must be untouched");
            assert_eq!((*d_binding).device_id, 99);
            // The destination's own link must survive the payload copy.
            assert_eq!((*d_root).header.next, d_binding as *mut StructHeader);
        }
    }

    #[test]
    fn projection_layer_roundtrips_with_depth() {
        let layer = CompositionLayer::Projection(CompositionLayerProjection {
            flags: CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
            space: SpaceHandle::from_raw(5),
            views: vec![
                ProjectionLayerView {
                    pose: Posef::IDENTITY,
                    fov: Fovf {
                        angle_left: -0.7,
                        angle_right: 0.7,
                        angle_up: 0.7,
                        angle_down: -0.7,
                    },
                    sub_image: SwapchainSubImage {
                        swapchain: SwapchainHandle::from_raw(11),
                        image_rect: Rect2Di::default(),
                        image_array_index: 0,
                    },
                    depth: Some(DepthInfo {
                        sub_image: SwapchainSubImage {
                            swapchain: SwapchainHandle::from_raw(12),
                            image_rect: Rect2Di::default(),
                            image_array_index: 0,
                        },
                        min_depth: 0.0,
                        max_depth: 1.0,
                        near_z: 0.05,
                        far_z: 50.0,
                    }),
                },
                ProjectionLayerView {
                    pose: Posef::IDENTITY,
                    fov: Fovf::default(),
                    sub_image: SwapchainSubImage {
                        swapchain: SwapchainHandle::from_raw(11),
                        image_rect: Rect2Di::default(),
                        image_array_index: 1,
                    },
                    depth: None,
                },
            ],
        });

        let mut heap = HeapChain::new();
        let node = emit_composition_layer(&mut heap, &layer).unwrap();
        let parsed = unsafe { parse_composition_layer(node) }.unwrap();
        assert_eq!(parsed, layer);

        // A deep copy of the emitted node parses identically too.
        let mut dst = HeapChain::new();
        let copied = unsafe { copy_chain(&mut dst, node, CopyMode::Everything) }.unwrap();
        let parsed2 = unsafe { parse_composition_layer(copied) }.unwrap();
        assert_eq!(parsed2, layer);
    }

    #[test]
    fn quad_layer_roundtrips() {
        let layer = CompositionLayer::Quad(CompositionLayerQuad {
            flags: CompositionLayerFlags::empty(),
            space: SpaceHandle::from_raw(8),
            eye_visibility: EyeVisibility::Left,
            sub_image: SwapchainSubImage {
                swapchain: SwapchainHandle::from_raw(21),
                image_rect: Rect2Di::default(),
                image_array_index: 0,
            },
            pose: Posef::IDENTITY,
            size: Extent2Df {
                width: 1.5,
                height: 1.0,
            },
        });
        let mut heap = HeapChain::new();
        let node = emit_composition_layer(&mut heap, &layer).unwrap();
        let parsed = unsafe { parse_composition_layer(node) }.unwrap();
        assert_eq!(parsed, layer);
    }
}

use std::mem;

// ===============================================================================================
// Command Identifiers
// ===============================================================================================

/// Legacy 2D update command: id plus `{x, y, width, height}`.
pub const SVGA_CMD_UPDATE: u32 = 1;
pub const SVGA_CMD_UPDATE_LEN: usize = 5 * 4;

pub const SVGA_3D_CMD_BASE: u32 = 1040;
pub const SVGA_3D_CMD_SURFACE_DEFINE: u32 = 1040;
pub const SVGA_3D_CMD_SURFACE_DESTROY: u32 = 1041;
pub const SVGA_3D_CMD_SURFACE_COPY: u32 = 1042;
pub const SVGA_3D_CMD_SURFACE_STRETCHBLT: u32 = 1043;
pub const SVGA_3D_CMD_SURFACE_DMA: u32 = 1044;
pub const SVGA_3D_CMD_CONTEXT_DEFINE: u32 = 1045;
pub const SVGA_3D_CMD_CONTEXT_DESTROY: u32 = 1046;
pub const SVGA_3D_CMD_SETTRANSFORM: u32 = 1047;
pub const SVGA_3D_CMD_SETZRANGE: u32 = 1048;
pub const SVGA_3D_CMD_SETRENDERSTATE: u32 = 1049;
pub const SVGA_3D_CMD_SETRENDERTARGET: u32 = 1050;
pub const SVGA_3D_CMD_SETTEXTURESTATE: u32 = 1051;
pub const SVGA_3D_CMD_SETMATERIAL: u32 = 1052;
pub const SVGA_3D_CMD_SETLIGHTDATA: u32 = 1053;
pub const SVGA_3D_CMD_SETLIGHTENABLED: u32 = 1054;
pub const SVGA_3D_CMD_SETVIEWPORT: u32 = 1055;
pub const SVGA_3D_CMD_SETCLIPPLANE: u32 = 1056;
pub const SVGA_3D_CMD_CLEAR: u32 = 1057;
pub const SVGA_3D_CMD_PRESENT: u32 = 1058;
pub const SVGA_3D_CMD_SHADER_DEFINE: u32 = 1059;
pub const SVGA_3D_CMD_SHADER_DESTROY: u32 = 1060;
pub const SVGA_3D_CMD_SET_SHADER: u32 = 1061;
pub const SVGA_3D_CMD_SET_SHADER_CONST: u32 = 1062;
pub const SVGA_3D_CMD_DRAW_PRIMITIVES: u32 = 1063;
pub const SVGA_3D_CMD_SETSCISSORRECT: u32 = 1064;
pub const SVGA_3D_CMD_BEGIN_QUERY: u32 = 1065;
pub const SVGA_3D_CMD_END_QUERY: u32 = 1066;
pub const SVGA_3D_CMD_WAIT_FOR_QUERY: u32 = 1067;
pub const SVGA_3D_CMD_PRESENT_READBACK: u32 = 1068;
pub const SVGA_3D_CMD_BLIT_SURFACE_TO_SCREEN: u32 = 1069;
pub const SVGA_3D_CMD_MAX: u32 = 1070;

// ===============================================================================================
// Special Identifiers
// ===============================================================================================

pub const SVGA3D_INVALID_ID: u32 = u32::MAX;

/// Region id telling the device a guest pointer is an offset into VRAM.
pub const SVGA_GMR_FRAMEBUFFER: u32 = 0xFFFF_FFFE;

pub const SVGA3D_TS_BIND_TEXTURE: u32 = 1;

// ===============================================================================================
// Command Layouts
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CmdHeader {
    pub id: u32,
    /// Body size in bytes, header excluded.
    pub size: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GuestPtr {
    pub gmr_id: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SurfaceImageId {
    pub sid: u32,
    pub face: u32,
    pub mipmap: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CidCmd {
    pub cid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetRenderTarget {
    pub cid: u32,
    pub type_: u32,
    pub target: SurfaceImageId,
}

/// Followed by a variable number of copy boxes.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SurfaceCopy {
    pub src: SurfaceImageId,
    pub dest: SurfaceImageId,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SurfaceStretchBlt {
    pub src: SurfaceImageId,
    pub dest: SurfaceImageId,
    pub box_src: [u32; 6],
    pub box_dest: [u32; 6],
    pub mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GuestImage {
    pub ptr: GuestPtr,
    pub pitch: u32,
}

/// Followed by copy boxes and a suffix.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SurfaceDma {
    pub guest: GuestImage,
    pub host: SurfaceImageId,
    pub transfer: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Array3d {
    pub surface_id: u32,
    pub offset: u32,
    pub stride: u32,
}

/// Followed by `num_vertex_decls` [`VertexDecl`]s and `num_ranges` [`PrimitiveRange`]s.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DrawPrimitives {
    pub cid: u32,
    pub num_vertex_decls: u32,
    pub num_ranges: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VertexDecl {
    pub identity: [u32; 4],
    pub array: Array3d,
    pub range_hint: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimitiveRange {
    pub prim_type: u32,
    pub primitive_count: u32,
    pub index_array: Array3d,
    pub index_width: u32,
    pub index_bias: i32,
}

/// Followed by a variable number of [`TextureState`]s.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetTextureState {
    pub cid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct TextureState {
    pub stage: u32,
    pub name: u32,
    pub value: u32,
}

/// Shared by END_QUERY and WAIT_FOR_QUERY.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryResult {
    pub cid: u32,
    pub type_: u32,
    pub guest_result: GuestPtr,
}

/// Followed by a variable number of copy rects.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Present {
    pub sid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct BlitSurfaceToScreen {
    pub src_image: SurfaceImageId,
    pub src_rect: [i32; 4],
    pub dest_screen_id: u32,
    pub dest_rect: [i32; 4],
}

pub const CMD_HEADER_LEN: usize = mem::size_of::<CmdHeader>();

const _: () = assert!(mem::size_of::<CmdHeader>() == 8);
const _: () = assert!(mem::size_of::<GuestPtr>() == 8);
const _: () = assert!(mem::size_of::<VertexDecl>() == 36);
const _: () = assert!(mem::size_of::<PrimitiveRange>() == 28);
const _: () = assert!(mem::size_of::<TextureState>() == 12);
const _: () = assert!(mem::offset_of!(SurfaceDma, host) == 12);

// ===============================================================================================
// Field Offsets (relative to the command body)
// ===============================================================================================

pub const GUEST_PTR_GMR_ID: usize = mem::offset_of!(GuestPtr, gmr_id);
pub const GUEST_PTR_OFFSET: usize = mem::offset_of!(GuestPtr, offset);

pub const CID_OFFSET: usize = mem::offset_of!(CidCmd, cid);

pub const RENDER_TARGET_SID: usize =
    mem::offset_of!(SetRenderTarget, target) + mem::offset_of!(SurfaceImageId, sid);

pub const COPY_SRC_SID: usize = mem::offset_of!(SurfaceCopy, src);
pub const COPY_DEST_SID: usize = mem::offset_of!(SurfaceCopy, dest);
pub const STRETCH_SRC_SID: usize = mem::offset_of!(SurfaceStretchBlt, src);
pub const STRETCH_DEST_SID: usize = mem::offset_of!(SurfaceStretchBlt, dest);

pub const DMA_GUEST_PTR: usize = mem::offset_of!(SurfaceDma, guest);
pub const DMA_HOST_SID: usize = mem::offset_of!(SurfaceDma, host);

pub const QUERY_GUEST_RESULT: usize = mem::offset_of!(QueryResult, guest_result);

pub const DRAW_NUM_DECLS: usize = mem::offset_of!(DrawPrimitives, num_vertex_decls);
pub const DRAW_NUM_RANGES: usize = mem::offset_of!(DrawPrimitives, num_ranges);
pub const DECL_SID: usize = mem::offset_of!(VertexDecl, array);
pub const RANGE_SID: usize = mem::offset_of!(PrimitiveRange, index_array);

pub const TEX_STATE_NAME: usize = mem::offset_of!(TextureState, name);
pub const TEX_STATE_VALUE: usize = mem::offset_of!(TextureState, value);

pub const PRESENT_SID: usize = mem::offset_of!(Present, sid);
pub const BLIT_SCREEN_SID: usize = mem::offset_of!(BlitSurfaceToScreen, src_image);

// ===============================================================================================
// Execbuf Result
// ===============================================================================================

pub const DRM_VMW_FENCE_FLAG_EXEC: u32 = 1 << 0;

/// Fence result handed back to the submitting client.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FenceRep {
    pub handle: u32,
    pub mask: u32,
    pub seqno: u32,
    pub passed_seqno: u32,
    pub pad64: u32,
    pub error: i32,
}

/// Human readable opcode name for diagnostics.
#[must_use]
pub const fn opcode_name(id: u32) -> &'static str {
    match id {
        SVGA_CMD_UPDATE => "UPDATE",
        SVGA_3D_CMD_SURFACE_DEFINE => "SURFACE_DEFINE",
        SVGA_3D_CMD_SURFACE_DESTROY => "SURFACE_DESTROY",
        SVGA_3D_CMD_SURFACE_COPY => "SURFACE_COPY",
        SVGA_3D_CMD_SURFACE_STRETCHBLT => "SURFACE_STRETCHBLT",
        SVGA_3D_CMD_SURFACE_DMA => "SURFACE_DMA",
        SVGA_3D_CMD_CONTEXT_DEFINE => "CONTEXT_DEFINE",
        SVGA_3D_CMD_CONTEXT_DESTROY => "CONTEXT_DESTROY",
        SVGA_3D_CMD_SETTRANSFORM => "SETTRANSFORM",
        SVGA_3D_CMD_SETZRANGE => "SETZRANGE",
        SVGA_3D_CMD_SETRENDERSTATE => "SETRENDERSTATE",
        SVGA_3D_CMD_SETRENDERTARGET => "SETRENDERTARGET",
        SVGA_3D_CMD_SETTEXTURESTATE => "SETTEXTURESTATE",
        SVGA_3D_CMD_SETMATERIAL => "SETMATERIAL",
        SVGA_3D_CMD_SETLIGHTDATA => "SETLIGHTDATA",
        SVGA_3D_CMD_SETLIGHTENABLED => "SETLIGHTENABLED",
        SVGA_3D_CMD_SETVIEWPORT => "SETVIEWPORT",
        SVGA_3D_CMD_SETCLIPPLANE => "SETCLIPPLANE",
        SVGA_3D_CMD_CLEAR => "CLEAR",
        SVGA_3D_CMD_PRESENT => "PRESENT",
        SVGA_3D_CMD_SHADER_DEFINE => "SHADER_DEFINE",
        SVGA_3D_CMD_SHADER_DESTROY => "SHADER_DESTROY",
        SVGA_3D_CMD_SET_SHADER => "SET_SHADER",
        SVGA_3D_CMD_SET_SHADER_CONST => "SET_SHADER_CONST",
        SVGA_3D_CMD_DRAW_PRIMITIVES => "DRAW_PRIMITIVES",
        SVGA_3D_CMD_SETSCISSORRECT => "SETSCISSORRECT",
        SVGA_3D_CMD_BEGIN_QUERY => "BEGIN_QUERY",
        SVGA_3D_CMD_END_QUERY => "END_QUERY",
        SVGA_3D_CMD_WAIT_FOR_QUERY => "WAIT_FOR_QUERY",
        SVGA_3D_CMD_PRESENT_READBACK => "PRESENT_READBACK",
        SVGA_3D_CMD_BLIT_SURFACE_TO_SCREEN => "BLIT_SURFACE_TO_SCREEN",
        _ => "UNKNOWN",
    }
}

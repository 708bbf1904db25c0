use crate::error::{ExecError, ExecResult};
use crate::exec::decoder::decode;
use crate::exec::objects::{ClientFile, ObjectTable};
use crate::exec::reloc::RelocationTable;
use crate::exec::tracker::ValidationList;
use crate::svga::abi::*;
use crate::utils::{read_u32, write_u32};
use std::mem::size_of;
use tracing::{error, trace};

type Handler = fn(&mut SwContext<'_>, &mut [u8]) -> ExecResult<()>;

const HANDLER_COUNT: usize = (SVGA_3D_CMD_MAX - SVGA_3D_CMD_BASE) as usize;

const DRAW_HEADER_LEN: usize = size_of::<DrawPrimitives>();
const DECL_LEN: usize = size_of::<VertexDecl>();
const RANGE_LEN: usize = size_of::<PrimitiveRange>();
const TEX_STATE_LEN: usize = size_of::<TextureState>();

/// Per-submission validation state.
///
/// Holds the single-entry context and surface caches; the list and
/// relocation table are scratch owned by the device and borrowed here.
pub struct SwContext<'a> {
    client: &'a ClientFile,
    objects: &'a ObjectTable,
    list: &'a mut ValidationList,
    relocs: &'a mut RelocationTable,
    last_cid: Option<u32>,
    /// (client handle, device id)
    last_sid: Option<(u32, u32)>,
    opcode: u32,
    cmd_offset: usize,
    body_offset: usize,
}

impl<'a> SwContext<'a> {
    pub fn new(
        client: &'a ClientFile,
        objects: &'a ObjectTable,
        list: &'a mut ValidationList,
        relocs: &'a mut RelocationTable,
    ) -> Self {
        Self {
            client,
            objects,
            list,
            relocs,
            last_cid: None,
            last_sid: None,
            opcode: 0,
            cmd_offset: 0,
            body_offset: 0,
        }
    }

    /// Validates and patches every command in `bytes`.
    ///
    /// Surface handles are rewritten to device ids as they are checked; guest
    /// pointers are only recorded and patched later by the relocation table.
    pub fn check_all(&mut self, bytes: &mut [u8]) -> ExecResult<()> {
        let mut pos = 0;
        while pos < bytes.len() {
            let header = decode(&bytes[pos..], pos).inspect_err(|e| {
                error!("Invalid SVGA3D command stream: {e}");
            })?;

            if header.is_3d() {
                self.opcode = header.opcode;
                self.cmd_offset = pos;
                self.body_offset = pos + header.body_start();
                let body = &mut bytes[self.body_offset..pos + header.len];
                self.dispatch(body).inspect_err(|e| {
                    error!(
                        "Illegal SVGA3D command {} at byte {pos}: {e}",
                        opcode_name(header.opcode)
                    );
                })?;
            }
            pos += header.len;
        }
        Ok(())
    }

    fn dispatch(&mut self, body: &mut [u8]) -> ExecResult<()> {
        let handler = self
            .opcode
            .checked_sub(SVGA_3D_CMD_BASE)
            .and_then(|i| HANDLERS.get(i as usize).copied().flatten())
            .ok_or(ExecError::MalformedStream {
                offset: self.cmd_offset,
                reason: "illegal SVGA3D command id",
            })?;
        trace!(opcode = opcode_name(self.opcode), len = body.len(), "checking command");
        handler(self, body)
    }

    const fn short(&self) -> ExecError {
        ExecError::MalformedStream {
            offset: self.cmd_offset,
            reason: "command body too short",
        }
    }

    fn require(&self, body: &[u8], len: usize) -> ExecResult<()> {
        if body.len() < len {
            return Err(self.short());
        }
        Ok(())
    }

    fn read(&self, body: &[u8], at: usize) -> ExecResult<u32> {
        read_u32(body, at).ok_or_else(|| self.short())
    }

    fn check_cid(&mut self, body: &[u8], at: usize) -> ExecResult<()> {
        let cid = self.read(body, at)?;
        if self.last_cid == Some(cid) {
            return Ok(());
        }
        let res = self.objects.context(self.client, cid)?;
        self.list.track_resource(res)?;
        self.last_cid = Some(cid);
        Ok(())
    }

    fn check_sid(&mut self, body: &mut [u8], at: usize) -> ExecResult<()> {
        let sid = self.read(body, at)?;
        if sid == SVGA3D_INVALID_ID {
            return Ok(());
        }
        let id = match self.last_sid {
            Some((handle, id)) if handle == sid => id,
            _ => {
                let id = self.lookup_sid(sid)?;
                self.last_sid = Some((sid, id));
                id
            }
        };
        write_u32(body, at, id).ok_or_else(|| self.short())
    }

    /// Resolves and tracks a surface without consulting the cache.
    fn lookup_sid(&mut self, sid: u32) -> ExecResult<u32> {
        let res = self.objects.surface(self.client, sid)?;
        let id = res.id;
        self.list.track_resource(res)?;
        Ok(id)
    }

    fn translate_guest_ptr(&mut self, body: &[u8], at: usize) -> ExecResult<()> {
        let handle = self.read(body, at + GUEST_PTR_GMR_ID)?;
        self.read(body, at + GUEST_PTR_OFFSET)?;

        let bo = self.objects.dmabuf(self.client, handle)?;
        if self.relocs.is_full() {
            return Err(ExecError::TooManyRelocations);
        }
        let index = self.list.track_buffer(bo)?;
        self.relocs.add(self.body_offset + at, index)
    }
}

// ===============================================================================================
// Command Handlers
// ===============================================================================================

fn cmd_privileged(ctx: &mut SwContext<'_>, _body: &mut [u8]) -> ExecResult<()> {
    if ctx.client.is_privileged() {
        return Ok(());
    }
    Err(ExecError::ForbiddenCommand { opcode: ctx.opcode })
}

fn cmd_ok(_ctx: &mut SwContext<'_>, _body: &mut [u8]) -> ExecResult<()> {
    Ok(())
}

fn cmd_cid_check(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<CidCmd>())?;
    ctx.check_cid(body, CID_OFFSET)
}

fn cmd_set_render_target(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<SetRenderTarget>())?;
    ctx.check_cid(body, CID_OFFSET)?;
    ctx.check_sid(body, RENDER_TARGET_SID)
}

fn cmd_surface_copy(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<SurfaceCopy>())?;
    ctx.check_sid(body, COPY_SRC_SID)?;
    ctx.check_sid(body, COPY_DEST_SID)
}

fn cmd_stretch_blt(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<SurfaceStretchBlt>())?;
    ctx.check_sid(body, STRETCH_SRC_SID)?;
    ctx.check_sid(body, STRETCH_DEST_SID)
}

fn cmd_dma(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<SurfaceDma>())?;
    ctx.translate_guest_ptr(body, DMA_GUEST_PTR)?;

    let sid = ctx.read(body, DMA_HOST_SID)?;
    let id = ctx.lookup_sid(sid)?;
    write_u32(body, DMA_HOST_SID, id).ok_or_else(|| ctx.short())
}

fn cmd_draw(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, DRAW_HEADER_LEN)?;
    ctx.check_cid(body, CID_OFFSET)?;

    let num_decls = ctx.read(body, DRAW_NUM_DECLS)? as usize;
    let num_ranges = ctx.read(body, DRAW_NUM_RANGES)? as usize;

    let mut pos = DRAW_HEADER_LEN;
    if num_decls > (body.len() - pos) / DECL_LEN {
        return Err(ExecError::MalformedStream {
            offset: ctx.cmd_offset,
            reason: "illegal number of vertex declarations",
        });
    }
    for _ in 0..num_decls {
        ctx.check_sid(body, pos + DECL_SID)?;
        pos += DECL_LEN;
    }

    if num_ranges > (body.len() - pos) / RANGE_LEN {
        return Err(ExecError::MalformedStream {
            offset: ctx.cmd_offset,
            reason: "illegal number of primitive ranges",
        });
    }
    for _ in 0..num_ranges {
        ctx.check_sid(body, pos + RANGE_SID)?;
        pos += RANGE_LEN;
    }
    Ok(())
}

fn cmd_tex_state(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<SetTextureState>())?;
    ctx.check_cid(body, CID_OFFSET)?;

    let states = (body.len() - size_of::<SetTextureState>()) / TEX_STATE_LEN;
    for i in 0..states {
        let state = size_of::<SetTextureState>() + i * TEX_STATE_LEN;
        if ctx.read(body, state + TEX_STATE_NAME)? == SVGA3D_TS_BIND_TEXTURE {
            ctx.check_sid(body, state + TEX_STATE_VALUE)?;
        }
    }
    Ok(())
}

fn cmd_present(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<Present>())?;
    ctx.check_sid(body, PRESENT_SID)
}

fn cmd_query_result(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<QueryResult>())?;
    ctx.check_cid(body, CID_OFFSET)?;
    ctx.translate_guest_ptr(body, QUERY_GUEST_RESULT)
}

fn cmd_blit_to_screen(ctx: &mut SwContext<'_>, body: &mut [u8]) -> ExecResult<()> {
    ctx.require(body, size_of::<BlitSurfaceToScreen>())?;
    ctx.check_sid(body, BLIT_SCREEN_SID)
}

const fn slot(opcode: u32) -> usize {
    (opcode - SVGA_3D_CMD_BASE) as usize
}

static HANDLERS: [Option<Handler>; HANDLER_COUNT] = {
    let mut t: [Option<Handler>; HANDLER_COUNT] = [None; HANDLER_COUNT];
    t[slot(SVGA_3D_CMD_SURFACE_DEFINE)] = Some(cmd_privileged);
    t[slot(SVGA_3D_CMD_SURFACE_DESTROY)] = Some(cmd_privileged);
    t[slot(SVGA_3D_CMD_SURFACE_COPY)] = Some(cmd_surface_copy);
    t[slot(SVGA_3D_CMD_SURFACE_STRETCHBLT)] = Some(cmd_stretch_blt);
    t[slot(SVGA_3D_CMD_SURFACE_DMA)] = Some(cmd_dma);
    t[slot(SVGA_3D_CMD_CONTEXT_DEFINE)] = Some(cmd_privileged);
    t[slot(SVGA_3D_CMD_CONTEXT_DESTROY)] = Some(cmd_privileged);
    t[slot(SVGA_3D_CMD_SETTRANSFORM)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETZRANGE)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETRENDERSTATE)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETRENDERTARGET)] = Some(cmd_set_render_target);
    t[slot(SVGA_3D_CMD_SETTEXTURESTATE)] = Some(cmd_tex_state);
    t[slot(SVGA_3D_CMD_SETMATERIAL)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETLIGHTDATA)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETLIGHTENABLED)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETVIEWPORT)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SETCLIPPLANE)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_CLEAR)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_PRESENT)] = Some(cmd_present);
    t[slot(SVGA_3D_CMD_SHADER_DEFINE)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SHADER_DESTROY)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SET_SHADER)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_SET_SHADER_CONST)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_DRAW_PRIMITIVES)] = Some(cmd_draw);
    t[slot(SVGA_3D_CMD_SETSCISSORRECT)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_BEGIN_QUERY)] = Some(cmd_cid_check);
    t[slot(SVGA_3D_CMD_END_QUERY)] = Some(cmd_query_result);
    t[slot(SVGA_3D_CMD_WAIT_FOR_QUERY)] = Some(cmd_query_result);
    t[slot(SVGA_3D_CMD_PRESENT_READBACK)] = Some(cmd_ok);
    t[slot(SVGA_3D_CMD_BLIT_SURFACE_TO_SCREEN)] = Some(cmd_blit_to_screen);
    t
};

use crate::error::{ExecError, ExecResult};
use crate::svga::abi::{
    CMD_HEADER_LEN, SVGA_3D_CMD_BASE, SVGA_3D_CMD_MAX, SVGA_CMD_UPDATE, SVGA_CMD_UPDATE_LEN,
};
use crate::utils::read_u32;

/// A decoded command header. `len` includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: u32,
    pub len: usize,
}

impl CommandHeader {
    /// Byte range of the body relative to the command start.
    #[must_use]
    pub const fn body_start(&self) -> usize {
        if self.opcode == SVGA_CMD_UPDATE {
            4
        } else {
            CMD_HEADER_LEN
        }
    }

    #[must_use]
    pub const fn is_3d(&self) -> bool {
        self.opcode != SVGA_CMD_UPDATE
    }
}

/// Decodes the command at the start of `remaining`.
///
/// `offset` is only used for error reporting.
pub fn decode(remaining: &[u8], offset: usize) -> ExecResult<CommandHeader> {
    let Some(opcode) = read_u32(remaining, 0) else {
        return Err(ExecError::TruncatedStream {
            remaining: remaining.len(),
        });
    };

    if opcode == SVGA_CMD_UPDATE {
        if remaining.len() < SVGA_CMD_UPDATE_LEN {
            return Err(ExecError::MalformedStream {
                offset,
                reason: "short UPDATE command",
            });
        }
        return Ok(CommandHeader {
            opcode,
            len: SVGA_CMD_UPDATE_LEN,
        });
    }

    let Some(body) = read_u32(remaining, 4) else {
        return Err(ExecError::TruncatedStream {
            remaining: remaining.len(),
        });
    };

    let len = usize::try_from(body)
        .ok()
        .and_then(|body| body.checked_add(CMD_HEADER_LEN))
        .filter(|&len| len <= remaining.len())
        .ok_or(ExecError::MalformedStream {
            offset,
            reason: "command length exceeds remaining bytes",
        })?;

    if !(SVGA_3D_CMD_BASE..SVGA_3D_CMD_MAX).contains(&opcode) {
        return Err(ExecError::MalformedStream {
            offset,
            reason: "illegal SVGA3D command id",
        });
    }

    Ok(CommandHeader { opcode, len })
}

/// Walks a command buffer, yielding `(offset, header)` pairs.
///
/// Iteration stops after the first error; on success the headers cover the
/// buffer exactly.
#[derive(Debug)]
pub struct CommandIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> CommandIter<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }
}

impl Iterator for CommandIter<'_> {
    type Item = ExecResult<(usize, CommandHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        match decode(&self.buf[self.pos..], self.pos) {
            Ok(header) => {
                let offset = self.pos;
                self.pos += header.len;
                Some(Ok((offset, header)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

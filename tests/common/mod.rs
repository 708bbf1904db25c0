#![allow(dead_code)]

use std::sync::Arc;
use svga_execbuf::{DeviceConfig, SoftFifo, SvgaDevice};

pub const FIFO_SIZE: usize = 1 << 20;

/// Routes pipeline logs through the test harness' captured output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn device(config: DeviceConfig) -> (Arc<SoftFifo>, SvgaDevice) {
    init_tracing();
    let fifo = Arc::new(SoftFifo::new(FIFO_SIZE));
    let dev = SvgaDevice::new(config, fifo.clone());
    (fifo, dev)
}

/// Little-endian SVGA3D command stream builder.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    bytes: Vec<u8>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmd(mut self, opcode: u32, body: &[u32]) -> Self {
        self.bytes.extend_from_slice(&opcode.to_le_bytes());
        self.bytes
            .extend_from_slice(&u32::try_from(body.len() * 4).unwrap().to_le_bytes());
        for word in body {
            self.bytes.extend_from_slice(&word.to_le_bytes());
        }
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// DRAW_PRIMITIVES body with one vertex declaration on `decl_sid` and one
/// index range on `range_sid`.
pub fn draw_body(cid: u32, decl_sid: u32, range_sid: u32) -> Vec<u32> {
    let mut body = vec![cid, 1, 1];
    body.extend([0, 0, 0, 0, decl_sid, 0, 0, 0, 0]);
    body.extend([0, 0, range_sid, 0, 0, 0, 0]);
    body
}

use std::sync::Arc;
use std::time::Duration;
use svga_execbuf::exec::decoder::CommandIter;
use svga_execbuf::svga::abi::*;
use svga_execbuf::utils::PAGE_SIZE;
use svga_execbuf::{DeviceConfig, ExecbufArg, SoftFifo, SvgaDevice};

fn push(out: &mut Vec<u8>, opcode: u32, body: &[u32]) {
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(&((body.len() * 4) as u32).to_le_bytes());
    for word in body {
        out.extend_from_slice(&word.to_le_bytes());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("============================================================");
    println!("             SVGA3D Execbuf - Batch Submission              ");
    println!("============================================================");

    // 1. Bring up a device backed by the software ring
    let config = DeviceConfig::new()
        .with_vram_size(4 * PAGE_SIZE)
        .with_gmr_ids(8);
    let fifo = Arc::new(SoftFifo::new(64 * 1024));
    let device = SvgaDevice::new(config, fifo.clone());
    println!("[+] Device ready: {config:?}");

    // 2. Create the objects the batch refers to
    let client = device.open_client(false);
    let objects = device.objects();
    let cid = objects.define_context(&client);
    let target = objects.define_surface(&client, false);
    let texture = objects.define_surface(&client, false);
    let query_buf = objects.alloc_dmabuf(&client, PAGE_SIZE);
    let upload_buf = objects.alloc_dmabuf(&client, 6 * PAGE_SIZE);
    println!("    Context {cid}, surfaces {target}/{texture}, buffers {query_buf}/{upload_buf}");

    // 3. Build the batch
    let mut batch = Vec::new();
    push(&mut batch, SVGA_3D_CMD_SURFACE_DMA, &[upload_buf, 0, 4096, texture, 0, 0, 1]);
    push(&mut batch, SVGA_3D_CMD_SETRENDERTARGET, &[cid, 0, target, 0, 0]);
    push(&mut batch, SVGA_3D_CMD_SETTEXTURESTATE, &[cid, 0, SVGA3D_TS_BIND_TEXTURE, texture]);
    push(&mut batch, SVGA_3D_CMD_BEGIN_QUERY, &[cid, 0]);
    push(&mut batch, SVGA_3D_CMD_END_QUERY, &[cid, 0, query_buf, 0]);
    push(&mut batch, SVGA_3D_CMD_PRESENT, &[target, 0, 0, 0, 0, 64, 64]);

    // 4. Submit and collect the fence
    let mut rep: Option<FenceRep> = None;
    let reply = device.execbuf(&client, ExecbufArg::new(&batch).with_fence_rep(&mut rep))?;
    let rep = rep.ok_or("no fence result")?;
    println!("[+] Submitted seqno {} (handle {})", reply.seqno, rep.handle);

    for (name, handle) in [("query", query_buf), ("upload", upload_buf)] {
        println!("    {name} buffer placed at {:?}", device.placement_of(&client, handle)?);
    }

    for batch in fifo.committed_batches() {
        for cmd in CommandIter::new(&batch) {
            let (offset, header) = cmd?;
            println!("    @{offset:4} {:<20} {} bytes", opcode_name(header.opcode), header.len);
        }
    }

    // 5. Let the device run and wait for completion
    fifo.process_all();
    device.fence_wait(&client, rep.handle, Duration::from_millis(100))?;
    let state = device.fence_signaled(&client, rep.handle)?;
    println!("[+] Fence signaled: {} (passed seqno {})", state.signaled, state.passed_seqno);
    device.fence_unref(&client, rep.handle)?;

    Ok(())
}

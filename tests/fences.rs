mod common;

use common::{Batch, device};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::Duration;
use svga_execbuf::exec::{FenceRepSink, SubmitStatus};
use svga_execbuf::svga::abi::*;
use svga_execbuf::svga::fifo::FIFO_INITIAL_SEQNO;
use svga_execbuf::utils::PAGE_SIZE;
use svga_execbuf::{DeviceConfig, ErrorClass, ExecError, ExecResult, ExecbufArg};

struct BrokenSink;

impl FenceRepSink for BrokenSink {
    fn deliver(&mut self, _rep: &FenceRep) -> ExecResult<()> {
        Err(ExecError::BadCommandBuffer {
            declared: 24,
            available: 0,
        })
    }
}

fn readback() -> Batch {
    Batch::new().cmd(SVGA_3D_CMD_PRESENT_READBACK, &[])
}

#[test]
fn fence_result_is_delivered_and_usable() {
    let (fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);

    let mut rep: Option<FenceRep> = None;
    let batch = readback();
    let reply = dev
        .execbuf(&client, ExecbufArg::new(batch.bytes()).with_fence_rep(&mut rep))
        .unwrap();
    let rep = rep.expect("fence result delivered");

    assert_eq!(rep.error, 0);
    assert_eq!(rep.mask, DRM_VMW_FENCE_FLAG_EXEC);
    assert_eq!(rep.seqno, FIFO_INITIAL_SEQNO.wrapping_add(1));
    assert_eq!(rep.passed_seqno, FIFO_INITIAL_SEQNO);
    assert_eq!(Some(rep.handle), reply.handle);
    assert_ne!(rep.handle, 0);

    let state = dev.fence_signaled(&client, rep.handle).unwrap();
    assert!(!state.signaled);
    assert_eq!(
        dev.fence_wait(&client, rep.handle, Duration::from_millis(2)).unwrap_err(),
        ExecError::FenceTimeout
    );

    fifo.process_all();
    dev.fence_wait(&client, rep.handle, Duration::from_millis(2)).unwrap();
    let state = dev.fence_signaled(&client, rep.handle).unwrap();
    assert!(state.signaled);
    assert_eq!(state.passed_seqno, rep.seqno);

    dev.fence_unref(&client, rep.handle).unwrap();
    assert_eq!(
        dev.fence_unref(&client, rep.handle).unwrap_err(),
        ExecError::UnknownFence(rep.handle)
    );
}

#[test]
fn fence_handles_are_per_client() {
    let (_fifo, dev) = device(DeviceConfig::new());
    let owner = dev.open_client(false);
    let other = dev.open_client(false);

    let mut rep: Option<FenceRep> = None;
    let batch = readback();
    dev.execbuf(&owner, ExecbufArg::new(batch.bytes()).with_fence_rep(&mut rep))
        .unwrap();
    let handle = rep.unwrap().handle;

    assert_eq!(
        dev.fence_signaled(&other, handle).unwrap_err(),
        ExecError::UnknownFence(handle)
    );
}

#[test]
fn undeliverable_result_waits_and_drops_the_handle() {
    let config = DeviceConfig::new().with_fence_wait_timeout(Duration::from_millis(10));
    let (fifo, dev) = device(config);
    let client = dev.open_client(false);

    let mut sink = BrokenSink;
    let batch = readback();
    let err = dev
        .execbuf(&client, ExecbufArg::new(batch.bytes()).with_fence_rep(&mut sink))
        .unwrap_err();

    let ExecError::Delivery { seqno } = err else {
        panic!("expected a delivery failure, got {err}");
    };
    assert_eq!(seqno, FIFO_INITIAL_SEQNO.wrapping_add(1));
    assert_eq!(err.class(), ErrorClass::BestEffort);
    assert!(client.fences().is_empty());
    // The batch itself did reach the device.
    assert_eq!(fifo.bytes_written(), 8);
}

#[test]
fn fence_emission_failure_is_reported_as_synced() {
    let (fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);
    let buf = dev.objects().alloc_dmabuf(&client, PAGE_SIZE);
    let cid = dev.objects().define_context(&client);
    fifo.set_fence_failure(true);

    let mut rep: Option<FenceRep> = None;
    let batch = Batch::new().cmd(SVGA_3D_CMD_END_QUERY, &[cid, 0, buf, 0]);
    let reply = dev
        .execbuf(&client, ExecbufArg::new(batch.bytes()).with_fence_rep(&mut rep))
        .unwrap();

    let SubmitStatus::Synced { seqno, cause } = &reply.status else {
        panic!("expected a synchronous completion");
    };
    assert!(matches!(cause, ExecError::RingFailed(_)));
    assert_eq!(reply.handle, None);

    let rep = rep.unwrap();
    assert_eq!(rep.handle, 0);
    assert_eq!(rep.seqno, *seqno);
    assert_eq!(rep.error, -libc::EIO);
    assert!(fifo.is_idle());
    assert!(dev.fence_manager().passed(*seqno));
    assert!(client.fences().is_empty());

    let bo = dev.objects().dmabuf(&client, buf).unwrap();
    assert!(bo.sync_obj().is_none());
}

#[test]
fn failed_fallback_drain_keeps_the_batch_fenced() {
    let (fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);
    let buf = dev.objects().alloc_dmabuf(&client, PAGE_SIZE);
    let cid = dev.objects().define_context(&client);
    fifo.set_fence_failure(true);
    fifo.set_drain_failure(true);

    let mut rep: Option<FenceRep> = None;
    let batch = Batch::new().cmd(SVGA_3D_CMD_END_QUERY, &[cid, 0, buf, 0]);
    let reply = dev
        .execbuf(&client, ExecbufArg::new(batch.bytes()).with_fence_rep(&mut rep))
        .unwrap();

    let SubmitStatus::Unsynced { fence, cause } = &reply.status else {
        panic!("expected an unsynced completion");
    };
    assert!(matches!(cause, ExecError::RingFailed(_)));
    assert!(!fifo.is_idle());
    assert!(!dev.fence_manager().passed(fence.seqno()));
    assert!(!fence.signaled());

    let rep = rep.unwrap();
    assert_eq!(rep.error, -libc::EIO);
    assert_ne!(rep.handle, 0);
    assert_eq!(Some(rep.handle), reply.handle);
    let bo = dev.objects().dmabuf(&client, buf).unwrap();
    assert!(bo.sync_obj().is_some());

    // The next marker that does reach the device covers the earlier seqno.
    fifo.set_fence_failure(false);
    fifo.set_drain_failure(false);
    dev.execbuf(&client, ExecbufArg::new(readback().bytes())).unwrap();
    fifo.process_all();
    assert!(dev.fence_signaled(&client, rep.handle).unwrap().signaled);
}

#[test]
fn seqnos_wrap_across_submissions() {
    let (fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);
    let batch = readback();

    let mut last = 0;
    for _ in 0..150 {
        let reply = dev.execbuf(&client, ExecbufArg::new(batch.bytes())).unwrap();
        last = reply.seqno;
        fifo.process_all();
    }
    assert_eq!(last, 50);
    assert!(dev.fence_manager().passed(last));
    assert!(dev.fence_manager().passed(FIFO_INITIAL_SEQNO));
    assert!(!dev.fence_manager().passed(last.wrapping_add(1)));
}

#[test]
fn throttle_waits_for_lagging_batches() {
    let (fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);
    let batch = readback();

    dev.execbuf(&client, ExecbufArg::new(batch.bytes())).unwrap();
    thread::sleep(Duration::from_millis(2));
    assert_eq!(dev.fence_manager().outstanding_markers(), 1);

    let device_worker = {
        let fifo = fifo.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fifo.process_all();
        })
    };
    dev.execbuf(&client, ExecbufArg::new(batch.bytes()).with_throttle_us(500))
        .unwrap();
    device_worker.join().unwrap();

    // The first marker had to pass before the second batch went out.
    assert_eq!(fifo.committed_batches().len(), 2);
    assert_eq!(dev.fence_manager().outstanding_markers(), 1);
}

#[test]
fn throttle_is_interruptible() {
    let config = DeviceConfig::new().with_fence_wait_timeout(Duration::from_secs(5));
    let (fifo, dev) = device(config);
    let client = dev.open_client(false);
    let cid = dev.objects().define_context(&client);
    let buf = dev.objects().alloc_dmabuf(&client, PAGE_SIZE);
    let batch = Batch::new().cmd(SVGA_3D_CMD_END_QUERY, &[cid, 0, buf, 0]);

    dev.execbuf(&client, ExecbufArg::new(batch.bytes())).unwrap();
    thread::sleep(Duration::from_millis(2));
    let written = fifo.bytes_written();

    let cancel = client.cancel_token().clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
    });
    let err = dev
        .execbuf(&client, ExecbufArg::new(batch.bytes()).with_throttle_us(100))
        .unwrap_err();
    interrupter.join().unwrap();

    assert_eq!(err, ExecError::Interrupted);
    assert_eq!(err.errno(), -libc::EINTR);
    assert_eq!(fifo.bytes_written(), written);
    assert!(!dev.objects().dmabuf(&client, buf).unwrap().is_reserved());
}

#[test]
fn unknown_fence_handle() {
    let (_fifo, dev) = device(DeviceConfig::new());
    let client = dev.open_client(false);
    assert_eq!(
        dev.fence_wait(&client, 77, Duration::from_millis(1)).unwrap_err(),
        ExecError::UnknownFence(77)
    );
}

use crate::error::{ExecError, ExecResult};
use crate::exec::objects::{CancelToken, Resource, ResourceKind};
use crate::exec::placement::{BufferObject, DevicePlacement};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferIndex(pub usize);

/// A buffer referenced by the submission being validated.
#[derive(Debug)]
pub struct TrackedBuffer {
    pub bo: Arc<BufferObject>,
    pub reserved: bool,
    pub placement: Option<DevicePlacement>,
}

/// Everything one submission references.
///
/// Each context, surface and buffer appears at most once. References are
/// released by [`ValidationList::clear`] or on drop.
#[derive(Debug)]
pub struct ValidationList {
    resources: Vec<Arc<Resource>>,
    resource_index: HashMap<(ResourceKind, u32), ResourceIndex>,
    buffers: Vec<TrackedBuffer>,
    buffer_index: HashMap<u64, BufferIndex>,
    max_resources: usize,
    max_buffers: usize,
}

impl ValidationList {
    #[must_use]
    pub fn new(max_resources: usize, max_buffers: usize) -> Self {
        Self {
            resources: Vec::new(),
            resource_index: HashMap::new(),
            buffers: Vec::new(),
            buffer_index: HashMap::new(),
            max_resources,
            max_buffers,
        }
    }

    /// Adds `res` unless it is already tracked, in which case the passed
    /// reference is dropped and the existing index returned.
    pub fn track_resource(&mut self, res: Arc<Resource>) -> ExecResult<ResourceIndex> {
        let key = (res.kind, res.id);
        if let Some(&index) = self.resource_index.get(&key) {
            return Ok(index);
        }
        if self.resources.len() >= self.max_resources {
            return Err(ExecError::TooManyResources);
        }
        let index = ResourceIndex(self.resources.len());
        trace!(kind = ?res.kind, id = res.id, "tracking resource");
        self.resources.push(res);
        self.resource_index.insert(key, index);
        Ok(index)
    }

    pub fn track_buffer(&mut self, bo: Arc<BufferObject>) -> ExecResult<BufferIndex> {
        if let Some(&index) = self.buffer_index.get(&bo.key()) {
            return Ok(index);
        }
        if self.buffers.len() >= self.max_buffers {
            return Err(ExecError::TooManyBuffers);
        }
        let index = BufferIndex(self.buffers.len());
        self.buffer_index.insert(bo.key(), index);
        self.buffers.push(TrackedBuffer {
            bo,
            reserved: false,
            placement: None,
        });
        Ok(index)
    }

    #[must_use]
    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    #[must_use]
    pub fn buffers(&self) -> &[TrackedBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [TrackedBuffer] {
        &mut self.buffers
    }

    #[must_use]
    pub fn buffer(&self, index: BufferIndex) -> Option<&TrackedBuffer> {
        self.buffers.get(index.0)
    }

    /// Reserves every tracked buffer.
    ///
    /// On contention everything taken so far is released, then the caller
    /// sleeps on the contended buffer and starts over.
    pub fn reserve_all(&mut self, cancel: &CancelToken) -> ExecResult<()> {
        'retry: loop {
            for i in 0..self.buffers.len() {
                let entry = &mut self.buffers[i];
                if entry.reserved {
                    continue;
                }
                if entry.bo.try_reserve() {
                    entry.reserved = true;
                    continue;
                }

                let contended = Arc::clone(&entry.bo);
                self.unreserve_all();
                trace!(handle = contended.handle(), "backing off contended reservation");
                contended.reserve(cancel)?;
                contended.unreserve();
                continue 'retry;
            }
            return Ok(());
        }
    }

    pub fn unreserve_all(&mut self) {
        for entry in &mut self.buffers {
            if entry.reserved {
                entry.bo.unreserve();
                entry.reserved = false;
            }
        }
    }

    /// Drops every reference and reservation.
    pub fn clear(&mut self) {
        self.unreserve_all();
        self.buffers.clear();
        self.buffer_index.clear();
        self.resources.clear();
        self.resource_index.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.buffers.is_empty()
    }
}

impl Drop for ValidationList {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::objects::ObjectTable;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn resources_are_tracked_once() {
        let table = ObjectTable::new();
        let client = table.open_client(false);
        let sid = table.define_surface(&client, false);
        let surface = table.surface(&client, sid).unwrap();

        let mut list = ValidationList::new(4, 4);
        let first = list.track_resource(table.surface(&client, sid).unwrap()).unwrap();
        let second = list.track_resource(table.surface(&client, sid).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(list.resources().len(), 1);
        // table + list + local
        assert_eq!(Arc::strong_count(&surface), 3);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(Arc::strong_count(&surface), 2);
    }

    #[test]
    fn contexts_and_surfaces_do_not_collide() {
        let table = ObjectTable::new();
        let client = table.open_client(false);
        let cid = table.define_context(&client);
        let sid = table.define_surface(&client, false);

        let mut list = ValidationList::new(4, 4);
        list.track_resource(table.context(&client, cid).unwrap()).unwrap();
        list.track_resource(table.surface(&client, sid).unwrap()).unwrap();
        assert_eq!(list.resources().len(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let table = ObjectTable::new();
        let client = table.open_client(false);
        let mut list = ValidationList::new(1, 1);

        let a = table.define_surface(&client, false);
        let b = table.define_surface(&client, false);
        list.track_resource(table.surface(&client, a).unwrap()).unwrap();
        assert_eq!(
            list.track_resource(table.surface(&client, b).unwrap()).unwrap_err(),
            ExecError::TooManyResources
        );

        list.track_buffer(BufferObject::new(1, 1)).unwrap();
        assert_eq!(
            list.track_buffer(BufferObject::new(2, 1)).unwrap_err(),
            ExecError::TooManyBuffers
        );
    }

    #[test]
    fn buffers_dedup_by_object() {
        let bo = BufferObject::new(9, 4096);
        let mut list = ValidationList::new(4, 4);
        let a = list.track_buffer(bo.clone()).unwrap();
        let b = list.track_buffer(bo.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(list.buffers().len(), 1);
        drop(list);
        assert_eq!(Arc::strong_count(&bo), 1);
    }

    #[test]
    fn reserve_all_backs_off_and_retries() {
        let a = BufferObject::new(1, 1);
        let b = BufferObject::new(2, 1);
        assert!(b.try_reserve());

        let mut list = ValidationList::new(4, 4);
        list.track_buffer(a.clone()).unwrap();
        list.track_buffer(b.clone()).unwrap();

        let holder = {
            let b = b.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                b.unreserve();
            })
        };
        list.reserve_all(&CancelToken::new()).unwrap();
        holder.join().unwrap();
        assert!(a.is_reserved() && b.is_reserved());

        drop(list);
        assert!(!a.is_reserved() && !b.is_reserved());
    }

    #[test]
    fn interrupted_reservation_leaves_nothing_reserved() {
        let a = BufferObject::new(1, 1);
        let b = BufferObject::new(2, 1);
        assert!(b.try_reserve());

        let mut list = ValidationList::new(4, 4);
        list.track_buffer(a.clone()).unwrap();
        list.track_buffer(b.clone()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(list.reserve_all(&cancel).unwrap_err(), ExecError::Interrupted);
        assert!(!a.is_reserved());
        b.unreserve();
    }
}

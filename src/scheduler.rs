//! Frame pipelining: bounded frames in flight and per-frame uniform slots.
//!
//! The CPU records frame `k+1` while the device still executes frame `k`. Two
//! things keep that overlap safe:
//!
//! - [`InFlightGate`] is a counting gate with `N` permits. A frame takes a
//!   permit before it is encoded and the device's completion handler returns
//!   it, so at most `N` frames are ever submitted but not retired.
//! - [`UniformRing`] holds `N` uniform slots. Frame `k` writes slot `k mod N`,
//!   which the gate guarantees was last read by a retired frame.
//!
//! ```text
//! frames_in_flight = 3, stride = 256
//!
//! slot 0 @   0: [frame 0] ──► [frame 3] ──► [frame 6]
//! slot 1 @ 256: [frame 1] ──► [frame 4] ──► ...
//! slot 2 @ 512: [frame 2] ──► [frame 5] ──► ...
//! ```
//!
//! Accumulation targets need no extra fencing: frames read the target written
//! by the previous submission, and the device executes submissions in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::{
    BackendError, BackendResult, Binding, BufferDescriptor, BufferUsage, RayTracingBackend,
};
use crate::resources::Buffer;
use crate::shaders::FrameUniforms;

/// Frames the accumulation ping-pong can overlap without an in-order queue.
pub const PING_PONG_DEPTH: u32 = 2;

/// Counting gate bounding the frames submitted but not yet retired.
pub struct InFlightGate {
    available: Mutex<u32>,
    returned: Condvar,
    capacity: u32,
}

impl InFlightGate {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "an in-flight gate needs at least one permit");
        Self {
            available: Mutex::new(capacity),
            returned: Condvar::new(),
            capacity,
        }
    }

    /// Take a permit, blocking while all of them are out.
    pub fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.returned.wait(&mut available);
        }
        *available -= 1;
        log::trace!("InFlightGate: acquired ({} left)", *available);
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();
        while *available == 0 {
            if self.returned.wait_until(&mut available, deadline).timed_out() {
                return false;
            }
        }
        *available -= 1;
        true
    }

    /// Return a permit. Called from completion handlers.
    pub fn release(&self) {
        let mut available = self.available.lock();
        if *available == self.capacity {
            log::warn!("InFlightGate: release without a matching acquire");
            return;
        }
        *available += 1;
        log::trace!("InFlightGate: released ({} left)", *available);
        drop(available);
        self.returned.notify_all();
    }

    /// Block until every permit has been returned.
    pub fn wait_for_idle(&self) {
        let mut available = self.available.lock();
        while *available < self.capacity {
            self.returned.wait(&mut available);
        }
    }

    /// Permits currently taken.
    pub fn in_flight(&self) -> u32 {
        self.capacity - *self.available.lock()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl std::fmt::Debug for InFlightGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGate")
            .field("in_flight", &self.in_flight())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Align a value up to the given alignment.
#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// One buffer of `slot_count` aligned [`FrameUniforms`] slots.
pub struct UniformRing {
    buffer: Arc<Buffer>,
    slot_count: u32,
    stride: u64,
}

impl UniformRing {
    pub fn new(
        backend: &dyn RayTracingBackend,
        slot_count: u32,
        alignment: u64,
    ) -> BackendResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(BackendError::InvalidParameter(format!(
                "uniform alignment must be a power of 2, got {alignment}"
            )));
        }
        if slot_count == 0 {
            return Err(BackendError::InvalidParameter(
                "uniform ring needs at least one slot".into(),
            ));
        }

        let stride = Self::stride_for(alignment);
        let desc = BufferDescriptor::new(
            stride * slot_count as u64,
            BufferUsage::UNIFORM | BufferUsage::MAP_WRITE,
        )
        .with_label("frame_uniforms_ring");
        let buffer = backend.create_buffer(&desc)?;

        Ok(Self {
            buffer,
            slot_count,
            stride,
        })
    }

    /// Slot stride for a device's uniform offset alignment.
    pub fn stride_for(alignment: u64) -> u64 {
        align_up(std::mem::size_of::<FrameUniforms>() as u64, alignment)
    }

    /// Byte offset of the slot used by frame `frame`.
    pub fn slot_offset(&self, frame: u64) -> u64 {
        self.stride * (frame % self.slot_count as u64)
    }

    /// Write `uniforms` into frame `frame`'s slot and return its binding.
    pub fn write(
        &self,
        backend: &dyn RayTracingBackend,
        frame: u64,
        uniforms: &FrameUniforms,
    ) -> BackendResult<Binding> {
        let offset = self.slot_offset(frame);
        backend.write_buffer(&self.buffer, offset, bytemuck::bytes_of(uniforms))?;
        Ok(Binding::UniformBuffer {
            buffer: Arc::clone(&self.buffer),
            offset,
            size: std::mem::size_of::<FrameUniforms>() as u64,
        })
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }
}

impl std::fmt::Debug for UniformRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformRing")
            .field("slot_count", &self.slot_count)
            .field("stride", &self.stride)
            .finish()
    }
}

/// The gate and the uniform ring, sized together.
#[derive(Debug)]
pub struct FrameScheduler {
    gate: Arc<InFlightGate>,
    ring: UniformRing,
}

impl FrameScheduler {
    /// Allow `frames_in_flight` overlapping frames.
    ///
    /// Devices without in-order submission are clamped to [`PING_PONG_DEPTH`].
    pub fn new(backend: &dyn RayTracingBackend, frames_in_flight: u32) -> BackendResult<Self> {
        let mut frames = frames_in_flight;
        if !backend.capabilities().in_order_queue && frames > PING_PONG_DEPTH {
            log::warn!(
                "{} queue is not in order; limiting frames in flight from {} to {}",
                backend.name(),
                frames,
                PING_PONG_DEPTH
            );
            frames = PING_PONG_DEPTH;
        }
        let alignment = backend.limits().min_uniform_buffer_offset_alignment;
        let ring = UniformRing::new(backend, frames, alignment)?;
        log::debug!(
            "Frame scheduler: {} frames in flight, uniform stride {}",
            frames,
            ring.stride()
        );
        Ok(Self {
            gate: Arc::new(InFlightGate::new(frames)),
            ring,
        })
    }

    /// Wait for a free frame slot.
    pub fn begin_frame(&self) {
        self.gate.acquire();
    }

    /// Handle for the completion callback that ends the frame.
    pub fn gate(&self) -> &Arc<InFlightGate> {
        &self.gate
    }

    pub fn ring(&self) -> &UniformRing {
        &self.ring
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.gate.capacity()
    }

    /// Block until no frame is in flight.
    pub fn wait_for_idle(&self) {
        log::trace!("Waiting for {} in-flight frames", self.gate.in_flight());
        self.gate.wait_for_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use std::thread;

    #[test]
    fn gate_blocks_after_capacity() {
        let gate = InFlightGate::new(3);
        for _ in 0..3 {
            assert!(gate.try_acquire_for(Duration::from_millis(1)));
        }
        assert_eq!(gate.in_flight(), 3);
        assert!(!gate.try_acquire_for(Duration::from_millis(20)));

        gate.release();
        assert!(gate.try_acquire_for(Duration::from_millis(1)));
    }

    #[test]
    fn release_from_another_thread_unblocks() {
        let gate = Arc::new(InFlightGate::new(1));
        gate.acquire();

        let releaser = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            releaser.release();
        });
        gate.acquire();
        handle.join().unwrap();
        assert_eq!(gate.in_flight(), 1);
        gate.release();
        gate.wait_for_idle();
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn unmatched_release_is_ignored() {
        let gate = InFlightGate::new(2);
        gate.release();
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn slots_cycle_on_aligned_offsets() {
        let backend = SoftwareBackend::new().unwrap();
        let ring = UniformRing::new(&backend, 3, 256).unwrap();

        assert_eq!(ring.stride(), 256);
        assert_eq!(ring.buffer().size(), 768);
        for frame in 0..10u64 {
            let offset = ring.slot_offset(frame);
            assert_eq!(offset, 256 * (frame % 3));
            assert_eq!(offset % 256, 0);
        }
    }

    #[test]
    fn write_lands_in_slot() {
        let backend = SoftwareBackend::new().unwrap();
        let ring = UniformRing::new(&backend, 2, 256).unwrap();
        let uniforms = FrameUniforms {
            width: 7,
            frame_index: 5,
            ..Default::default()
        };

        let binding = ring.write(&backend, 5, &uniforms).unwrap();
        assert!(matches!(binding, Binding::UniformBuffer { offset: 256, size: 80, .. }));

        let bytes = backend.read_buffer(ring.buffer(), 256, 80).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<FrameUniforms>(&bytes), uniforms);
    }

    #[test]
    fn rejects_bad_alignment() {
        let backend = SoftwareBackend::new().unwrap();
        assert!(UniformRing::new(&backend, 3, 100).is_err());
    }
}

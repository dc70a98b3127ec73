//! Frame buffer pipeline for camera acquisition.
//!
//! This crate owns the memory the hardware writes frames into:
//!
//! - [`FrameBuffer`]: an owned, zero-initialised, 8-byte-aligned block
//! - [`PendingQueue`]: FIFO of the buffers currently submitted to the hardware
//! - [`BufferPool`]: allocates buffers sized to the current frame format and
//!   keeps the hardware fed
//!
//! # Ownership model
//!
//! A `FrameBuffer` is *moved* into [`BufferSink::submit`] and moved back out
//! when the hardware reports it filled. While the hardware owns it, the pool
//! only remembers its [`BufferId`] in the `PendingQueue`, so no buffer can be
//! read by the application while it is still pending.
//!
//! ```text
//! initialize_pipeline ──► submit(b1), submit(b2)      pending = [b1, b2]
//! hardware fills b1    ──► retrieve(b1)               pending = [b2], held = 1
//! payload copied       ──► replace(b1) → submit(b3)   pending = [b2, b3], held = 0
//! ```
//!
//! At any instant `pending_len() + held() == depth()`, except transiently
//! inside a single `retrieve`/`replace` pair.

use camdaq_core::error::{AppResult, DaqError};
use camdaq_core::settings::FrameFormat;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Identity of a buffer, unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An owned, fixed-size, 8-byte-aligned memory block.
///
/// Storage is a `Vec<u64>` so the start address is always 8-byte aligned;
/// the byte view is truncated to the exact requested length.
#[derive(Debug)]
pub struct FrameBuffer {
    id: BufferId,
    words: Vec<u64>,
    len: usize,
}

impl FrameBuffer {
    /// Allocate a zero-initialised buffer of exactly `len` bytes.
    #[must_use]
    pub fn zeroed(id: BufferId, len: usize) -> Self {
        Self {
            id,
            words: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    /// Start address of the block, used for identity diagnostics.
    pub fn address(&self) -> usize {
        self.words.as_ptr() as usize
    }
}

impl AsRef<[u8]> for FrameBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// The hardware side of buffer submission.
pub trait BufferSink {
    /// Hand a buffer to the hardware. Ownership moves into the device.
    fn submit(&mut self, buffer: FrameBuffer) -> AppResult<()>;

    /// Image size the hardware requires per buffer, in bytes.
    ///
    /// May exceed the pixel payload when the hardware appends metadata.
    fn image_size_bytes(&mut self) -> AppResult<usize>;
}

/// FIFO of buffer identities currently owned by the hardware, oldest first.
#[derive(Debug, Default, Clone)]
pub struct PendingQueue {
    ids: VecDeque<BufferId>,
}

impl PendingQueue {
    pub fn push(&mut self, id: BufferId) {
        self.ids.push_back(id);
    }

    pub fn pop(&mut self) -> Option<BufferId> {
        self.ids.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.ids.iter().copied()
    }
}

/// Allocates frame buffers and keeps the hardware continuously fed.
#[derive(Debug, Default)]
pub struct BufferPool {
    format: Option<FrameFormat>,
    buffer_len: usize,
    depth: usize,
    pending: PendingQueue,
    held: usize,
    next_id: u64,
    total_allocated: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one buffer for `format`, sized to the hardware image size.
    ///
    /// Fails with [`DaqError::Allocation`] when the hardware reports an image
    /// size smaller than `width * height * bytes_per_pixel`.
    pub fn allocate<S: BufferSink + ?Sized>(
        &mut self,
        sink: &mut S,
        format: FrameFormat,
    ) -> AppResult<FrameBuffer> {
        let hardware = sink.image_size_bytes()?;
        let len = checked_buffer_len(format, hardware)?;
        Ok(self.allocate_len(len))
    }

    /// Allocate `depth` buffers for `format` and submit all of them.
    ///
    /// Any previous pipeline is torn down first.
    pub fn initialize_pipeline<S: BufferSink + ?Sized>(
        &mut self,
        sink: &mut S,
        format: FrameFormat,
        depth: usize,
    ) -> AppResult<()> {
        if depth == 0 {
            return Err(DaqError::Configuration(
                "pipeline depth must be at least 1".into(),
            ));
        }
        self.teardown();

        let hardware = sink.image_size_bytes()?;
        let len = checked_buffer_len(format, hardware)?;
        self.format = Some(format);
        self.buffer_len = len;
        self.depth = depth;

        for _ in 0..depth {
            let buffer = self.allocate_len(len);
            let id = buffer.id();
            sink.submit(buffer)?;
            self.pending.push(id);
        }

        info!(
            width = format.width,
            height = format.height,
            bytes_per_pixel = format.bytes_per_pixel,
            buffer_len = len,
            depth,
            "Buffer pipeline initialized"
        );
        Ok(())
    }

    /// Account for a buffer the hardware reported filled.
    ///
    /// Pops the oldest pending id and checks it against the returned buffer.
    /// A mismatch means the pending bookkeeping is broken and is fatal.
    pub fn retrieve(&mut self, returned: FrameBuffer) -> AppResult<FrameBuffer> {
        let expected = self.pending.pop();
        if expected != Some(returned.id()) {
            return Err(DaqError::BufferMismatch {
                expected: expected.map(|id| id.0),
                returned: returned.id().0,
            });
        }
        self.held += 1;
        Ok(returned)
    }

    /// Give up a consumed buffer and submit a fresh one in its place.
    pub fn replace<S: BufferSink + ?Sized>(
        &mut self,
        sink: &mut S,
        consumed: FrameBuffer,
    ) -> AppResult<()> {
        self.release(consumed);
        let buffer = self.allocate_len(self.buffer_len);
        let id = buffer.id();
        sink.submit(buffer)?;
        self.pending.push(id);
        Ok(())
    }

    /// Drop a consumed buffer without replacing it.
    pub fn release(&mut self, consumed: FrameBuffer) {
        debug!(buffer = %consumed.id(), "Releasing consumed buffer");
        self.held = self.held.saturating_sub(1);
        drop(consumed);
    }

    /// Forget the current pipeline. Buffers still owned by the hardware are
    /// dropped by the hardware when it is flushed.
    pub fn teardown(&mut self) {
        if self.depth > 0 {
            debug!(pending = self.pending.len(), "Tearing down buffer pipeline");
        }
        self.pending.clear();
        self.held = 0;
        self.depth = 0;
        self.format = None;
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.format
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers retrieved from the hardware and not yet replaced or released.
    pub fn held(&self) -> usize {
        self.held
    }

    /// Total buffers allocated over the pool's lifetime.
    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    fn allocate_len(&mut self, len: usize) -> FrameBuffer {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.total_allocated += 1;
        FrameBuffer::zeroed(id, len)
    }
}

fn checked_buffer_len(format: FrameFormat, hardware: usize) -> AppResult<usize> {
    let required = format.payload_bytes().ok_or_else(|| {
        DaqError::Configuration(format!(
            "frame size {}x{}x{} overflows",
            format.width, format.height, format.bytes_per_pixel
        ))
    })?;
    if hardware < required {
        return Err(DaqError::Allocation { required, hardware });
    }
    Ok(hardware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camdaq_core::error::ErrorClass;

    /// Minimal device: a FIFO of submitted buffers.
    #[derive(Default)]
    struct FifoDevice {
        image_size: usize,
        queued: VecDeque<FrameBuffer>,
    }

    impl FifoDevice {
        fn new(image_size: usize) -> Self {
            Self {
                image_size,
                ..Default::default()
            }
        }

        fn fill(&mut self) -> Option<FrameBuffer> {
            self.queued.pop_front()
        }
    }

    impl BufferSink for FifoDevice {
        fn submit(&mut self, buffer: FrameBuffer) -> AppResult<()> {
            self.queued.push_back(buffer);
            Ok(())
        }

        fn image_size_bytes(&mut self) -> AppResult<usize> {
            Ok(self.image_size)
        }
    }

    const FORMAT: FrameFormat = FrameFormat {
        width: 64,
        height: 64,
        bytes_per_pixel: 2,
    };

    #[test]
    fn test_frame_buffer_is_zeroed_aligned_and_exact() {
        let buffer = FrameBuffer::zeroed(BufferId(0), 13);
        assert_eq!(buffer.len(), 13);
        assert_eq!(buffer.as_bytes().len(), 13);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(buffer.address() % 8, 0);
    }

    #[test]
    fn test_allocate_uses_hardware_size() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(64 * 64 * 2 + 32);
        let buffer = pool.allocate(&mut device, FORMAT).unwrap();
        assert_eq!(buffer.len(), 64 * 64 * 2 + 32);
    }

    #[test]
    fn test_allocate_rejects_small_hardware_size() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(100);
        let err = pool.allocate(&mut device, FORMAT).unwrap_err();
        assert!(matches!(
            err,
            DaqError::Allocation {
                required: 8192,
                hardware: 100
            }
        ));
        assert_eq!(err.class(), ErrorClass::ConfigurationInconsistent);
    }

    #[test]
    fn test_initialize_pipeline_submits_in_order() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(8192);
        pool.initialize_pipeline(&mut device, FORMAT, 3).unwrap();

        assert_eq!(pool.pending_len(), 3);
        let submitted: Vec<_> = device.queued.iter().map(FrameBuffer::id).collect();
        let pending: Vec<_> = pool.pending().iter().collect();
        assert_eq!(submitted, pending);
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(8192);
        assert!(pool.initialize_pipeline(&mut device, FORMAT, 0).is_err());
    }

    #[test]
    fn test_retrieve_detects_identity_mismatch() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(8192);
        pool.initialize_pipeline(&mut device, FORMAT, 2).unwrap();

        let _first = device.fill().unwrap();
        let second = device.fill().unwrap();
        let err = pool.retrieve(second).unwrap_err();
        assert!(matches!(err, DaqError::BufferMismatch { .. }));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_buffer_conservation_over_replace_sequence() {
        let depth = 2;
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(8192);
        pool.initialize_pipeline(&mut device, FORMAT, depth).unwrap();

        for round in 0..50 {
            let filled = device.fill().unwrap();
            let held = pool.retrieve(filled).unwrap();
            assert_eq!(pool.pending_len() + pool.held(), depth, "round {round}");

            // Every third round, drain one extra frame the way the frame waiter does.
            if round % 3 == 0 {
                let newer = device.fill().unwrap();
                pool.replace(&mut device, held).unwrap();
                let newer = pool.retrieve(newer).unwrap();
                assert_eq!(pool.pending_len() + pool.held(), depth);
                pool.replace(&mut device, newer).unwrap();
            } else {
                pool.replace(&mut device, held).unwrap();
            }
            assert_eq!(pool.held(), 0);
            assert_eq!(pool.pending_len(), depth);
            assert_eq!(device.queued.len(), depth);
        }
    }

    #[test]
    fn test_reinitialize_resets_pipeline() {
        let mut pool = BufferPool::new();
        let mut device = FifoDevice::new(8192);
        pool.initialize_pipeline(&mut device, FORMAT, 2).unwrap();

        let smaller = FrameFormat::new(32, 32, 2);
        let mut device = FifoDevice::new(2048);
        pool.initialize_pipeline(&mut device, smaller, 2).unwrap();
        assert_eq!(pool.format(), Some(smaller));
        assert_eq!(pool.buffer_len(), 2048);
        assert_eq!(pool.pending_len(), 2);
        assert_eq!(pool.total_allocated(), 4);
    }
}

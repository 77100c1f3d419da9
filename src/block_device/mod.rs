//! async-sdmmc - Block Device support
//!
//! Asynchronous, completion-driven access to 512-byte blocks. A request is
//! started with `begin_read`/`begin_write` and returns immediately; the
//! device later hands the buffer back through a [`BlockReceiver`].

mod block;
mod memory;

pub use block::*;
pub use memory::{MemoryBlockDevice, MemoryError};

/// A device which reads and writes blocks in the background and reports
/// completion to a receiver, one sector at a time.
///
/// Multi-sector transfers deliver each sector separately. After a non-final
/// sector has been delivered the transfer pauses until the consumer returns a
/// buffer with [`AsyncBlockDevice::clean_buffer`].
pub trait AsyncBlockDevice: Sized {
    /// The errors that the device can report. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Queue a read of `count` blocks starting at `start` into `buffer`.
    fn begin_read<R>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        receiver: &mut R,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        R: BlockReceiver<Self>;

    /// Queue a write of `count` blocks starting at `start` from `buffer`.
    fn begin_write<R>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        receiver: &mut R,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        R: BlockReceiver<Self>;

    /// Return a consumed sector buffer so a paused multi-sector transfer can
    /// continue with the next sector. The buffer comes back as `Err` when no
    /// transfer is waiting for one.
    fn clean_buffer<R>(&mut self, buffer: BlockBuf, receiver: &mut R) -> Result<(), BlockBuf>
    where
        R: BlockReceiver<Self>;

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> BlockCount;
}

/// Receives completions from an [`AsyncBlockDevice`].
///
/// The device passes itself back in, so a receiver may queue more work from
/// inside the callback.
pub trait BlockReceiver<D>
where
    D: AsyncBlockDevice,
{
    /// A sector has been read into `buffer` (or the read failed).
    fn sd_read_complete(
        &mut self,
        device: &mut D,
        block_idx: BlockIdx,
        buffer: BlockBuf,
        result: Result<(), D::Error>,
    );

    /// A sector from `buffer` has been written (or the write failed).
    fn sd_write_complete(
        &mut self,
        device: &mut D,
        block_idx: BlockIdx,
        buffer: BlockBuf,
        result: Result<(), D::Error>,
    );
}

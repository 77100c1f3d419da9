use super::{AsyncBlockDevice, Block, BlockBuf, BlockCount, BlockIdx, BlockReceiver};

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// Errors reported by [`MemoryBlockDevice`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// A transfer is already in progress.
    Busy,
    /// The request runs past the end of the backing memory.
    OutOfRange,
    /// The sector was marked bad with [`MemoryBlockDevice::set_bad_block`].
    BadBlock,
}

#[derive(Debug)]
struct Transfer {
    write: bool,
    next: u32,
    last: u32,
    buffer: Option<BlockBuf>,
}

/// A block device backed by a byte slice, with deferred completion.
///
/// Nothing happens until [`MemoryBlockDevice::complete_next`] is called, which
/// stands in for the interrupt that would finish a hardware transfer.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
    active: Option<Transfer>,
    reads: u32,
    bad_block: Option<u32>,
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self {
            memory,
            active: None,
            reads: 0,
            bad_block: None,
        }
    }

    fn block_range(block_idx: u32) -> core::ops::Range<usize> {
        let start = block_idx as usize * Block::LEN;
        start..start + Block::LEN
    }

    /// Number of sectors read so far.
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Make any transfer that reaches `block` fail there. The rest of that
    /// transfer is abandoned.
    pub fn set_bad_block(&mut self, block: Option<BlockIdx>) {
        self.bad_block = block.map(|block| block.0);
    }

    /// Is a transfer waiting for either completion or a clean buffer?
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn begin(
        &mut self,
        write: bool,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
    ) -> Result<(), (MemoryError, BlockBuf)> {
        if self.active.is_some() {
            return Err((MemoryError::Busy, buffer));
        }
        let end = start.0 as u64 + u64::from(count.0.max(1));
        if end > u64::from(self.num_blocks().0) {
            return Err((MemoryError::OutOfRange, buffer));
        }
        self.active = Some(Transfer {
            write,
            next: start.0,
            last: start.0 + count.0.max(1) - 1,
            buffer: Some(buffer),
        });
        Ok(())
    }

    /// Finish the next pending sector and deliver it to `receiver`. Returns
    /// `false` when nothing could progress (idle, or waiting for a clean
    /// buffer).
    pub fn complete_next<R>(&mut self, receiver: &mut R) -> bool
    where
        R: BlockReceiver<Self>,
    {
        let (write, block_idx, buffer) = match self.active.as_mut() {
            Some(transfer) => match transfer.buffer.take() {
                Some(buffer) => (transfer.write, transfer.next, buffer),
                None => return false,
            },
            None => return false,
        };

        if self.bad_block == Some(block_idx) {
            trace!("memory: block {} is bad", block_idx);
            self.active = None;
            let result = Err(MemoryError::BadBlock);
            if write {
                receiver.sd_write_complete(self, BlockIdx(block_idx), buffer, result);
            } else {
                receiver.sd_read_complete(self, BlockIdx(block_idx), buffer, result);
            }
            return true;
        }

        let range = Self::block_range(block_idx);
        if write {
            self.memory[range].copy_from_slice(&buffer.contents);
        } else {
            buffer.contents.copy_from_slice(&self.memory[range]);
            self.reads += 1;
        }
        trace!("memory: {} block {}", if write { "wrote" } else { "read" }, block_idx);

        if let Some(transfer) = self.active.as_ref() {
            if transfer.next >= transfer.last {
                self.active = None;
            }
        }

        if write {
            receiver.sd_write_complete(self, BlockIdx(block_idx), buffer, Ok(()));
        } else {
            receiver.sd_read_complete(self, BlockIdx(block_idx), buffer, Ok(()));
        }
        true
    }
}

impl<'a> AsyncBlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn begin_read<R>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        _receiver: &mut R,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        R: BlockReceiver<Self>,
    {
        self.begin(false, start, count, buffer)
    }

    fn begin_write<R>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        _receiver: &mut R,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        R: BlockReceiver<Self>,
    {
        self.begin(true, start, count, buffer)
    }

    fn clean_buffer<R>(&mut self, buffer: BlockBuf, _receiver: &mut R) -> Result<(), BlockBuf>
    where
        R: BlockReceiver<Self>,
    {
        match self.active.as_mut() {
            Some(transfer) if transfer.buffer.is_none() => {
                transfer.next += 1;
                transfer.buffer = Some(buffer);
                Ok(())
            }
            _ => Err(buffer),
        }
    }

    fn num_blocks(&self) -> BlockCount {
        BlockCount((self.memory.len() / Block::LEN) as u32)
    }
}

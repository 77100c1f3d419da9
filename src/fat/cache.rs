use crate::block_device::{Block, BlockBuf, BlockIdx};

/// The two single-sector caches.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheId {
    /// Holds a sector of the File Allocation Table
    Fat,
    /// Holds a sector of directory entries (or a boot sector)
    Dentry,
}

/// One 512-byte buffer tagged with the sector it holds.
///
/// The buffer is on loan to the block device while a load is in flight, and
/// the tag is only set once the load has completed successfully.
#[derive(Debug)]
pub struct SectorCache {
    buffer: Option<BlockBuf>,
    tag: Option<BlockIdx>,
}

impl SectorCache {
    pub fn new(buffer: BlockBuf) -> Self {
        Self {
            buffer: Some(buffer),
            tag: None,
        }
    }

    /// Is `lba` cached and readable right now?
    pub fn holds(&self, lba: BlockIdx) -> bool {
        self.tag == Some(lba) && self.buffer.is_some()
    }

    /// The cached sector, if it is `lba`.
    pub fn block(&self, lba: BlockIdx) -> Option<&Block> {
        if self.tag == Some(lba) {
            self.buffer.as_deref()
        } else {
            None
        }
    }

    /// Hand the buffer out for a load. The tag is dropped as the contents
    /// are about to change.
    pub fn lend(&mut self) -> Option<BlockBuf> {
        self.tag = None;
        self.buffer.take()
    }

    /// Is the buffer out on loan?
    pub fn is_lent(&self) -> bool {
        self.buffer.is_none()
    }

    /// Take the buffer back after a load.
    pub fn fill(&mut self, buffer: BlockBuf, lba: Option<BlockIdx>) {
        self.buffer = Some(buffer);
        self.tag = lba;
    }

    pub fn tag(&self) -> Option<BlockIdx> {
        self.tag
    }

    pub fn invalidate(&mut self) {
        self.tag = None;
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

use crate::block_device::{Block, BlockIdx};

use super::cluster::Cluster;
use super::directory::{DirEntry, ShortName};
use super::volume::Volume;

/// An open file: where its entry lives and how far it has been read.
///
/// Reads happen in whole sectors, so `position` is a multiple of 512 except
/// once the end of the file has been reached.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct File {
    name: ShortName,
    first_cluster: Cluster,
    size: u32,
    dir_entry_lba: BlockIdx,
    dir_entry_index: u8,
    pub(crate) current_cluster: Cluster,
    pub(crate) cluster_index: u32,
    pub(crate) byte_in_cluster: u32,
    pub(crate) position: u32,
}

impl File {
    pub(crate) fn new(entry: &DirEntry, dir_entry_lba: BlockIdx, dir_entry_index: u8) -> File {
        File {
            name: entry.name,
            first_cluster: entry.first_cluster,
            size: entry.file_size,
            dir_entry_lba,
            dir_entry_index,
            current_cluster: entry.first_cluster,
            cluster_index: 0,
            byte_in_cluster: 0,
            position: 0,
        }
    }

    pub fn name(&self) -> &ShortName {
        &self.name
    }

    pub fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    /// Size in bytes, from the directory entry.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// The sector holding this file's directory entry, and the entry's index
    /// within it.
    pub fn dir_entry(&self) -> (BlockIdx, u8) {
        (self.dir_entry_lba, self.dir_entry_index)
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.size
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u32 {
        self.size.saturating_sub(self.position)
    }

    /// Sectors that still hold file data.
    pub(crate) fn remaining_sectors(&self) -> u32 {
        (self.remaining() + Block::LEN_U32 - 1) / Block::LEN_U32
    }

    /// The sector at the cursor, if the cursor is inside its cluster.
    pub(crate) fn lba(&self, volume: &Volume) -> Option<BlockIdx> {
        if self.byte_in_cluster >= volume.bytes_per_cluster() {
            return None;
        }
        let base = volume.cluster_to_lba(self.current_cluster).0;
        Some(BlockIdx(base + self.byte_in_cluster / Block::LEN_U32))
    }

    /// Sectors left in the current cluster.
    pub(crate) fn sectors_left_in_cluster(&self, volume: &Volume) -> u32 {
        (volume.bytes_per_cluster() - self.byte_in_cluster.min(volume.bytes_per_cluster()))
            / Block::LEN_U32
    }

    /// Move past one sector. Returns how many of its bytes belong to the
    /// file.
    pub(crate) fn consume_sector(&mut self) -> u32 {
        let valid = self.remaining().min(Block::LEN_U32);
        self.position += valid;
        self.byte_in_cluster += Block::LEN_U32;
        valid
    }

    /// Continue in the next cluster of the chain.
    pub(crate) fn follow(&mut self, next: Cluster, bytes_per_cluster: u32) {
        self.current_cluster = next;
        self.cluster_index += 1;
        self.byte_in_cluster -= bytes_per_cluster;
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

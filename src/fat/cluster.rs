use crate::block_device::BlockIdx;

use super::volume::Volume;

/// A cluster number. Data clusters start at 2.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cluster(pub(crate) u32);

impl Cluster {
    pub fn new(cluster_number: u32) -> Self {
        Self(cluster_number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }
}

/// A position within a directory, one sector at a time.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCursor {
    /// The fixed root directory of FAT12/16, `lba` up to (excluding) `end`
    Region { lba: BlockIdx, end: BlockIdx },
    /// A directory stored in a cluster chain
    Chain { cluster: Cluster, sector: u32 },
}

/// What a [`DirCursor`] needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    /// Scan this sector
    Sector(BlockIdx),
    /// The cluster is used up; its FAT entry says where to go
    NeedLink(Cluster),
    /// No more sectors
    End,
}

impl DirCursor {
    pub fn region(lba: BlockIdx, end: BlockIdx) -> DirCursor {
        DirCursor::Region { lba, end }
    }

    pub fn chain(cluster: Cluster) -> DirCursor {
        DirCursor::Chain { cluster, sector: 0 }
    }

    pub(crate) fn position(&self, volume: &Volume) -> Position {
        match *self {
            DirCursor::Region { lba, end } if lba < end => Position::Sector(lba),
            DirCursor::Region { .. } => Position::End,
            DirCursor::Chain { cluster, sector } if sector < volume.sectors_per_cluster => {
                Position::Sector(BlockIdx(volume.cluster_to_lba(cluster).0 + sector))
            }
            DirCursor::Chain { cluster, .. } => Position::NeedLink(cluster),
        }
    }

    /// Step past the sector just scanned.
    pub(crate) fn advance(&mut self) {
        match self {
            DirCursor::Region { lba, .. } => lba.0 += 1,
            DirCursor::Chain { sector, .. } => *sector += 1,
        }
    }

    /// Continue in the next cluster of the chain.
    pub(crate) fn follow(&mut self, next: Cluster) {
        *self = DirCursor::chain(next);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

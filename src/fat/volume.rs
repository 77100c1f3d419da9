//! Boot sector parsing and the geometry derived from it.

use crate::block_device::{Block, BlockCount, BlockIdx};

use super::cluster::{Cluster, DirCursor};

/// Which variant of the File Allocation Table a volume uses.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Fewer clusters than this means FAT12.
    pub const FAT16_MIN_CLUSTERS: u32 = 4086;
    /// Fewer clusters than this (and not FAT12) means FAT16.
    pub const FAT32_MIN_CLUSTERS: u32 = 65526;

    pub fn from_cluster_count(clusters: u32) -> FatType {
        if clusters < Self::FAT16_MIN_CLUSTERS {
            FatType::Fat12
        } else if clusters < Self::FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// The number of bits in one FAT entry.
    pub fn bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }
}

/// Why a sector was not accepted as a FAT boot sector.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSectorError {
    InvalidSignature(u16),
    InvalidBytesPerSector(u16),
    InvalidSectorsPerCluster(u8),
    InvalidFatCount(u8),
    BothSectorCountsZero,
    LargerThanDevice(u32),
    FatSizeZero,
    RootClusterLessThanTwo,
}

/// A read-only view of a FAT boot sector (the BIOS Parameter Block).
pub struct BootSector<'a> {
    block: &'a Block,
}

impl<'a> BootSector<'a> {
    pub const SIGNATURE: u16 = 0xAA55;

    pub fn new(block: &'a Block) -> Self {
        BootSector { block }
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    define_field!(bytes_per_sector, u16, 11);
    define_field!(sectors_per_cluster, u8, 13);
    define_field!(reserved_sector_count, u16, 14);
    define_field!(num_fats, u8, 16);
    define_field!(root_entries_count, u16, 17);
    define_field!(total_sectors16, u16, 19);
    define_field!(media, u8, 21);
    define_field!(fat_size16, u16, 22);
    define_field!(hidden_sectors, u32, 28);
    define_field!(total_sectors32, u32, 32);

    // FAT32 specific structure
    define_field!(fat_size32, u32, 36);
    define_field!(first_root_dir_cluster, u32, 44);

    define_field!(signature, u16, 510);

    /// Total sectors in the volume, whichever field carries it.
    pub fn total_sectors(&self) -> u32 {
        match self.total_sectors16() {
            0 => self.total_sectors32(),
            n => u32::from(n),
        }
    }

    /// Eight bytes of OEM name.
    pub fn oem_name(&self) -> &[u8] {
        &self.data()[3..11]
    }
}

/// The geometry of a mounted volume. Computed once when the boot sector is
/// accepted and fixed until the next mount.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    pub fat_type: FatType,
    pub fat_begin_lba: BlockIdx,
    pub cluster_begin_lba: BlockIdx,
    pub sectors_per_cluster: u32,
    pub root_dir_sector: BlockIdx,
    /// First sector past a fixed (FAT12/16) root directory
    pub root_dir_end: BlockIdx,
    /// Root directory cluster on FAT32
    pub root_cluster: Option<Cluster>,
    pub cluster_count: u32,
    pub total_sectors: BlockCount,
}

impl Volume {
    /// Accept the boot sector at `lba`, checking it against a device of
    /// `device_blocks` sectors.
    pub fn new(
        boot: &BootSector,
        lba: BlockIdx,
        device_blocks: BlockCount,
    ) -> Result<Volume, BootSectorError> {
        if boot.signature() != BootSector::SIGNATURE {
            return Err(BootSectorError::InvalidSignature(boot.signature()));
        }
        if boot.bytes_per_sector() != Block::LEN as u16 {
            return Err(BootSectorError::InvalidBytesPerSector(
                boot.bytes_per_sector(),
            ));
        }
        let sectors_per_cluster = match boot.sectors_per_cluster() {
            n @ (1 | 2 | 4 | 8 | 16 | 32 | 64 | 128) => u32::from(n),
            n => return Err(BootSectorError::InvalidSectorsPerCluster(n)),
        };
        let num_fats = match boot.num_fats() {
            n @ (1 | 2) => u32::from(n),
            n => return Err(BootSectorError::InvalidFatCount(n)),
        };
        let total_sectors = boot.total_sectors();
        if total_sectors == 0 {
            return Err(BootSectorError::BothSectorCountsZero);
        }
        if u64::from(lba.0) + u64::from(total_sectors) > u64::from(device_blocks.0) {
            return Err(BootSectorError::LargerThanDevice(total_sectors));
        }

        let cluster_count = total_sectors / sectors_per_cluster;
        let fat_type = FatType::from_cluster_count(cluster_count);
        let fat_begin_lba = lba.0 + u32::from(boot.reserved_sector_count());

        let (root_dir_sector, root_dir_end, cluster_begin_lba, root_cluster) = match fat_type {
            FatType::Fat32 => {
                let fat_size = boot.fat_size32();
                if fat_size == 0 {
                    return Err(BootSectorError::FatSizeZero);
                }
                let root = boot.first_root_dir_cluster();
                if root < 2 {
                    return Err(BootSectorError::RootClusterLessThanTwo);
                }
                let cluster_begin = fat_begin_lba + num_fats * fat_size;
                let root_dir_sector = cluster_begin + (root - 2) * sectors_per_cluster;
                (
                    root_dir_sector,
                    root_dir_sector + sectors_per_cluster,
                    cluster_begin,
                    Some(Cluster(root)),
                )
            }
            FatType::Fat12 | FatType::Fat16 => {
                let fat_size = u32::from(boot.fat_size16());
                if fat_size == 0 {
                    return Err(BootSectorError::FatSizeZero);
                }
                let root_dir_sector = fat_begin_lba + num_fats * fat_size;
                let root_bytes = u32::from(boot.root_entries_count()) * 32;
                let root_sectors = (root_bytes + Block::LEN_U32 - 1) / Block::LEN_U32;
                let cluster_begin = root_dir_sector + root_sectors;
                (root_dir_sector, cluster_begin, cluster_begin, None)
            }
        };

        Ok(Volume {
            fat_type,
            fat_begin_lba: BlockIdx(fat_begin_lba),
            cluster_begin_lba: BlockIdx(cluster_begin_lba),
            sectors_per_cluster,
            root_dir_sector: BlockIdx(root_dir_sector),
            root_dir_end: BlockIdx(root_dir_end),
            root_cluster,
            cluster_count,
            total_sectors: BlockCount(total_sectors),
        })
    }

    pub fn cluster_to_lba(&self, cluster: Cluster) -> BlockIdx {
        BlockIdx(self.cluster_begin_lba.0 + (cluster.0 - 2) * self.sectors_per_cluster)
    }

    pub fn lba_to_cluster(&self, lba: BlockIdx) -> Cluster {
        Cluster((lba.0 - self.cluster_begin_lba.0) / self.sectors_per_cluster + 2)
    }

    /// Bytes in one cluster.
    pub fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster * Block::LEN_U32
    }

    /// Highest cluster number that can hold data.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    /// Can `cluster` hold data on this volume?
    pub fn is_data_cluster(&self, cluster: Cluster) -> bool {
        cluster.0 >= 2 && cluster.0 <= self.max_cluster()
    }

    /// Where a scan of the root directory starts.
    pub fn root_dir(&self) -> DirCursor {
        match self.root_cluster {
            Some(cluster) => DirCursor::chain(cluster),
            None => DirCursor::region(self.root_dir_sector, self.root_dir_end),
        }
    }

    /// Where a scan of the directory starting at `cluster` starts. Cluster
    /// zero is how `..` entries refer to the root.
    pub fn dir(&self, cluster: Cluster) -> DirCursor {
        if cluster.0 == 0 {
            self.root_dir()
        } else {
            DirCursor::chain(cluster)
        }
    }

    /// The sector of the first FAT holding the entry for `cluster`, and the
    /// byte offset of the entry within it.
    pub fn fat_entry(&self, cluster: Cluster) -> (BlockIdx, usize) {
        let offset = match self.fat_type {
            FatType::Fat12 => cluster.0 + cluster.0 / 2,
            FatType::Fat16 => cluster.0 * 2,
            FatType::Fat32 => cluster.0 * 4,
        };
        (
            BlockIdx(self.fat_begin_lba.0 + offset / Block::LEN_U32),
            (offset % Block::LEN_U32) as usize,
        )
    }

    /// Interpret a raw FAT entry for `cluster`.
    pub fn link(&self, cluster: Cluster, raw: u32) -> Option<Link> {
        let entry = match self.fat_type {
            FatType::Fat12 => {
                if cluster.0 & 1 == 1 {
                    raw >> 4
                } else {
                    raw & 0x0FFF
                }
            }
            FatType::Fat16 => raw & 0xFFFF,
            FatType::Fat32 => raw & 0x0FFF_FFFF,
        };
        let bad = (1u32 << self.fat_type.bits().min(28)) - 9;
        if entry > bad {
            Some(Link::End)
        } else if entry < 2 || entry == bad || entry > self.max_cluster() {
            None
        } else {
            Some(Link::Next(Cluster(entry)))
        }
    }
}

/// Where a cluster chain goes next.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Next(Cluster),
    End,
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

//! async-sdmmc - Master Boot Record
//!
//! Parses the partition table out of a sector the FAT engine has already
//! loaded. Nothing here touches a block device.

use core::convert::TryInto;

use crate::block_device::{Block, BlockCount, BlockIdx};

#[cfg(feature = "log")]
use log::debug;

#[cfg(feature = "defmt-log")]
use defmt::debug;

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidMbrSignature,
    InvalidPartitionStatus,
    InfoTooShort,
}

/// Which of the four primary partition entries.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionNumber {
    One,
    Two,
    Three,
    Four,
}

impl PartitionNumber {
    pub fn from_number(number: usize) -> Option<Self> {
        let partition = match number {
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            4 => Self::Four,
            _ => return None,
        };
        Some(partition)
    }

    fn offset(self) -> usize {
        let index = match self {
            Self::One => 0,
            Self::Two => 1,
            Self::Three => 2,
            Self::Four => 3,
        };
        Mbr::PARTITION1_START + index * Partition::PARTITION_INFO_LENGTH
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionType {
    Fat12,
    Fat16Small,
    Fat16,
    Fat32ChsLba,
    Fat32Lba,
    Fat16Lba,
    ExtendedLba,
    Unknown(u8),
}

impl PartitionType {
    /// FAT12, first 32 MiB of the disk.
    const FAT12: u8 = 0x01;
    /// FAT16 with fewer than 65536 sectors.
    const FAT16_SMALL: u8 = 0x04;
    /// Marker for a FAT16 partition. Seen on a card formatted with the official
    /// SD-Card formatter.
    const FAT16: u8 = 0x06;
    /// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card formatter?)
    /// use.
    const FAT32_CHS_LBA: u8 = 0x0B;
    /// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
    /// partitions.
    const FAT32_LBA: u8 = 0x0C;
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    const FAT16_LBA: u8 = 0x0E;
    /// Extended partition with LBA.
    const EXTENDED_LBA: u8 = 0x0F;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::FAT12 => Self::Fat12,
            Self::FAT16_SMALL => Self::Fat16Small,
            Self::FAT16 => Self::Fat16,
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            Self::EXTENDED_LBA => Self::ExtendedLba,
            _ => Self::Unknown(value),
        }
    }

    /// Is this a type the FAT engine will try to mount?
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    pub ty: PartitionType,
    pub lba_start: BlockIdx,
    pub block_count: BlockCount,
}

impl Partition {
    const STATUS_IDX: usize = 0;
    const TYPE_IDX: usize = 4;
    const LBA_START_IDX: usize = 8;
    const NUM_BLOCKS_IDX: usize = 12;
    pub(crate) const PARTITION_INFO_LENGTH: usize = 16;

    pub fn from_info(info: &[u8]) -> Result<Self, Error> {
        if info.len() != Self::PARTITION_INFO_LENGTH {
            return Err(Error::InfoTooShort);
        }

        let pstatus = info[Self::STATUS_IDX];
        if pstatus != 0x80 && pstatus != 0x00 {
            return Err(Error::InvalidPartitionStatus);
        }

        let lba_start = read_u32(info, Self::LBA_START_IDX);
        let num_blocks = read_u32(info, Self::NUM_BLOCKS_IDX);

        Ok(Partition {
            ty: PartitionType::from_u8(info[Self::TYPE_IDX]),
            lba_start: BlockIdx(lba_start),
            block_count: BlockCount(num_blocks),
        })
    }

    /// Does this partition lie entirely on a device of `device_blocks`?
    pub fn fits(&self, device_blocks: BlockCount) -> bool {
        let end = u64::from(self.lba_start.0) + u64::from(self.block_count.0);
        self.lba_start.0 < device_blocks.0 && end <= u64::from(device_blocks.0)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// A view of sector 0 as a partition table.
pub struct Mbr<'a> {
    block: &'a Block,
}

impl<'a> Mbr<'a> {
    const FOOTER_START: usize = 510;
    pub const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;

    /// Check the boot signature.
    pub fn new(block: &'a Block) -> Result<Self, Error> {
        let footer = u16::from_le_bytes(
            block[Self::FOOTER_START..Self::FOOTER_START + 2]
                .try_into()
                .map_err(|_| Error::InfoTooShort)?,
        );
        if footer != Self::FOOTER_VALUE {
            return Err(Error::InvalidMbrSignature);
        }
        Ok(Mbr { block })
    }

    pub fn partition(&self, number: PartitionNumber) -> Result<Partition, Error> {
        let start = number.offset();
        Partition::from_info(&self.block[start..start + Partition::PARTITION_INFO_LENGTH])
    }

    /// The first entry with a FAT type code that fits on the device.
    pub fn find_fat(&self, device_blocks: BlockCount) -> Option<Partition> {
        (1..=4)
            .filter_map(PartitionNumber::from_number)
            .filter_map(|number| self.partition(number).ok())
            .inspect(|p| {
                debug!(
                    "mbr: type {:?} start {} blocks {}",
                    p.ty, p.lba_start.0, p.block_count.0
                )
            })
            .find(|p| p.ty.is_supported() && p.fits(device_blocks))
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

//! async-sdmmc - Constants from the SD Specifications
//!
//! Command indices, response bits and data tokens for SPI mode, plus the
//! CSD and CID register layouts.

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification (CID register)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SET_WR_BLK_ERASE_COUNT - pre-erase hint before a multi-block write
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// Argument for SEND_IF_COND: 2.7-3.6V plus the 0xAA check pattern
pub const IF_COND_PATTERN: u32 = 0x1AA;

/// CRC byte that makes CMD0 valid; cards ignore CRC after that
pub const CRC_DEFAULT: u8 = 0x95;

/// CRC byte for CMD8 with the standard check pattern
pub const CRC_IF_COND: u8 = 0x87;

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// bit 7 is clear in every valid R1 response
pub const R1_START_MASK: u8 = 0x80;

/// error bits of an R1 response
pub const R1_ERROR_MASK: u8 = 0x7E;

/// error bits of the SEND_IF_COND response, where illegal command is
/// expected from older cards
pub const R1_IF_COND_ERROR_MASK: u8 = 0x7A;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// OCR: card power up status bit
pub const OCR_POWER_UP: u32 = 1 << 31;

/// OCR: card capacity status, also the host capacity support bit of ACMD41
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;

/// OCR: 3.2-3.3V window
pub const OCR_VDD_32_33: u32 = 1 << 20;

/// Card Specific Data. Both layouts share the same 16 bytes; the version
/// field decides how the size fields are read.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Csd {
    data: [u8; 16],
}

/// The CSD register layouts.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CsdVersion {
    /// Standard capacity, byte addressed
    V1,
    /// High capacity, block addressed
    V2,
}

impl Csd {
    /// Wrap the 16 bytes read back from SEND_CSD.
    pub fn new(data: [u8; 16]) -> Csd {
        Csd { data }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_structure, [127, 126]);
    define_field!(read_block_length, [83, 80]);
    define_field!(device_size_v1, [73, 62]);
    define_field!(device_size_multiplier, [49, 47]);
    define_field!(device_size_v2, [69, 48]);

    pub fn version(&self) -> Option<CsdVersion> {
        match self.csd_structure() {
            0 => Some(CsdVersion::V1),
            1 => Some(CsdVersion::V2),
            _ => None,
        }
    }

    /// Card capacity in 512-byte sectors, or `None` for an unknown layout.
    pub fn sector_count(&self) -> Option<u32> {
        match self.version()? {
            CsdVersion::V1 => {
                let shift = self.device_size_multiplier() + 2 + self.read_block_length();
                let bytes = (u64::from(self.device_size_v1()) + 1) << shift;
                Some((bytes >> 9) as u32)
            }
            CsdVersion::V2 => (self.device_size_v2() + 1).checked_mul(1024),
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> Option<u64> {
        self.sector_count().map(|count| u64::from(count) * 512)
    }
}

/// Card Identification register.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Cid {
    data: [u8; 16],
}

impl Cid {
    /// Wrap the 16 bytes read back from SEND_CID.
    pub fn new(data: [u8; 16]) -> Cid {
        Cid { data }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(manufacturer_id, [127, 120]);
    define_field!(product_revision, [63, 56]);
    define_field!(serial_number, [55, 24]);
    define_field!(manufacture_year_offset, [19, 12]);
    define_field!(manufacture_month, [11, 8]);

    /// Two ASCII characters naming the OEM.
    pub fn oem_id(&self) -> [u8; 2] {
        [self.data[1], self.data[2]]
    }

    /// Five ASCII characters of product name.
    pub fn product_name(&self) -> [u8; 5] {
        [
            self.data[3],
            self.data[4],
            self.data[5],
            self.data[6],
            self.data[7],
        ]
    }

    pub fn manufacture_year(&self) -> u32 {
        self.manufacture_year_offset() + 2000
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

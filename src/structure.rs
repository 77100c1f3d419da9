//! async-sdmmc - Useful macros for parsing on-disk and card structures.

/// Extract the inclusive bit range `msb..=lsb` from a big-endian 128-bit
/// register image (CSD, CID), bit 0 being the last bit of the last byte.
pub(crate) fn ext_bits(data: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    let mut bits = 0;
    for i in 0..=(msb - lsb) {
        let position = lsb + i;
        let byte = 15 - (position >> 3) as usize;
        let value = (u32::from(data[byte]) >> (position & 0x7)) & 1;
        bits |= value << i;
    }
    bits
}

macro_rules! define_field {
    ($name:ident, bool, $offset:expr, $bit:expr) => {
        /// Get the value from the $name field
        pub fn $name(&self) -> bool {
            (self.data()[$offset] & (1 << $bit)) != 0
        }
    };

    ($name:ident, u8, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the ", stringify!($name), " field"),
            pub fn $name(&self) -> u8 {
                self.data()[$offset]
            }
        }
    };

    ($name:ident, u16, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the ", stringify!($name), " field"),
            pub fn $name(&self) -> u16 {
                u16::from_le_bytes([self.data()[$offset], self.data()[$offset + 1]])
            }
        }
    };

    ($name:ident, u32, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the ", stringify!($name), " field"),
            pub fn $name(&self) -> u32 {
                u32::from_le_bytes([
                    self.data()[$offset],
                    self.data()[$offset + 1],
                    self.data()[$offset + 2],
                    self.data()[$offset + 3],
                ])
            }
        }
    };

    ($name:ident, [ $msb:expr, $lsb:expr ]) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the ", stringify!($name), " register field"),
            pub fn $name(&self) -> u32 {
                crate::structure::ext_bits(self.data(), $msb, $lsb)
            }
        }
    };
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

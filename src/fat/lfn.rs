//! Long filename matching.
//!
//! Long names are stored as a run of `0x0F` entries in front of the short
//! entry they belong to, highest sequence number first, thirteen UTF-16
//! units each. Rather than assemble the whole name, each fragment is compared
//! against the matching slice of the wanted name as it is seen.

use super::directory::{DirEntryRaw, ShortName};

/// Flag in the sequence byte of the first (highest) fragment.
const LAST_LONG_ENTRY: u8 = 0x40;

/// UTF-16 units per fragment.
const CHARS_PER_ENTRY: usize = 13;

/// Byte offsets of the name units within an entry.
const UNIT_OFFSETS: [usize; CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Tracks whether the long-name run being scanned spells a given name.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LongNameMatch {
    /// Sequence number expected from the next fragment, zero when no run is
    /// in progress
    next: u8,
    checksum: u8,
    matching: bool,
}

impl LongNameMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any run in progress.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one `0x0F` entry.
    pub fn feed(&mut self, entry: &DirEntryRaw, name: &str) {
        let raw = entry.raw();
        let sequence = raw[0];
        let checksum = raw[13];
        let number = sequence & !LAST_LONG_ENTRY;
        if number == 0 {
            self.reset();
            return;
        }
        if sequence & LAST_LONG_ENTRY != 0 {
            let longest = usize::from(number) * CHARS_PER_ENTRY;
            self.next = number;
            self.checksum = checksum;
            self.matching = name.chars().count() <= longest;
        } else if number != self.next || checksum != self.checksum {
            self.reset();
            return;
        }
        if self.matching {
            let start = usize::from(number - 1) * CHARS_PER_ENTRY;
            self.matching = Self::fragment_matches(raw, name, start);
        }
        self.next = number - 1;
    }

    fn fragment_matches(raw: &[u8], name: &str, start: usize) -> bool {
        let mut wanted = name.chars().skip(start);
        let mut ended = false;
        for offset in UNIT_OFFSETS.iter() {
            let unit = u16::from_le_bytes([raw[*offset], raw[offset + 1]]);
            if ended {
                if unit != 0xFFFF && unit != 0x0000 {
                    return false;
                }
                continue;
            }
            match wanted.next() {
                Some(ch) => {
                    let stored = match char::from_u32(u32::from(unit)) {
                        Some(stored) => stored,
                        None => return false,
                    };
                    if !stored.eq_ignore_ascii_case(&ch) {
                        return false;
                    }
                }
                None => {
                    if unit != 0x0000 {
                        return false;
                    }
                    ended = true;
                }
            }
        }
        true
    }

    /// Does the short entry that ends the run complete a match?
    pub fn completes(&self, short_name: &[u8; 11]) -> bool {
        self.matching && self.next == 0 && self.checksum == ShortName::checksum(short_name)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

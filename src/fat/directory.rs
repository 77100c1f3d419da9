use super::cluster::Cluster;
use super::volume::FatType;

bitflags::bitflags! {
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const VOLUME_ID = (1 << 3);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
    }
}

impl Attributes {
    pub fn is_long_name(&self) -> bool {
        self.contains(Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID)
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.contains(Self::VOLUME_ID) && !self.is_long_name()
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for Attributes {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u8:x}", self.bits())
    }
}

/// Directory entries are 32 bytes, sixteen to a sector.
pub const DIR_ENTRY_LEN: usize = 32;

/// A marker in the first name byte: this and every later entry is unused.
pub const END_OF_DIRECTORY: u8 = 0x00;

/// A marker in the first name byte: this entry was deleted.
pub const DELETED: u8 = 0xE5;

/// One raw 32-byte directory entry.
#[derive(Debug)]
pub struct DirEntryRaw<'a> {
    data: &'a [u8],
}

impl<'a> DirEntryRaw<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    pub fn name(&self) -> [u8; 11] {
        let mut name = [0u8; 11];
        name.copy_from_slice(&self.data()[0..11]);
        name
    }

    define_field!(attr, u8, 11);
    define_field!(fst_clus_hi, u16, 20);
    define_field!(fst_clus_lo, u16, 26);
    define_field!(file_size, u32, 28);

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.attr())
    }

    pub fn is_end(&self) -> bool {
        self.data()[0] == END_OF_DIRECTORY
    }

    pub fn is_deleted(&self) -> bool {
        self.data()[0] == DELETED
    }

    pub fn raw(&self) -> &[u8] {
        self.data
    }
}

/// A short (8.3) name as stored on disk: space padded, upper case.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    contents: [u8; 11],
}

impl ShortName {
    pub fn from_raw(contents: [u8; 11]) -> ShortName {
        ShortName { contents }
    }

    /// Convert one path component to its 8.3 form, if it has one.
    pub fn create_from_str(name: &str) -> Option<ShortName> {
        let mut contents = [b' '; 11];
        if name == "." || name == ".." {
            contents[..name.len()].copy_from_slice(name.as_bytes());
            return Some(ShortName { contents });
        }
        let (base, ext) = match name.rfind('.') {
            Some(dot) => (&name[..dot], &name[dot + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return None;
        }
        for (slot, ch) in contents[..8].iter_mut().zip(base.bytes()) {
            *slot = Self::legal_char(ch)?;
        }
        for (slot, ch) in contents[8..].iter_mut().zip(ext.bytes()) {
            *slot = Self::legal_char(ch)?;
        }
        Some(ShortName { contents })
    }

    fn legal_char(ch: u8) -> Option<u8> {
        match ch {
            0x00..=0x20 | 0x7F..=0xFF => None,
            b'"' | b'*' | b'+' | b',' | b'.' | b'/' | b':' | b';' | b'<' | b'=' | b'>'
            | b'?' | b'[' | b'\\' | b']' | b'|' => None,
            ch => Some(ch.to_ascii_uppercase()),
        }
    }

    pub fn contents(&self) -> &[u8; 11] {
        &self.contents
    }

    /// Compare against an on-disk name, ignoring case.
    pub fn matches(&self, raw: &[u8; 11]) -> bool {
        self.contents.eq_ignore_ascii_case(raw)
    }

    /// The checksum long-name entries carry for the short entry they
    /// belong to.
    pub fn checksum(raw: &[u8; 11]) -> u8 {
        raw.iter()
            .fold(0u8, |sum, b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*b))
    }

    pub fn main_name(&self) -> &[u8] {
        Self::trim(&self.contents[..8])
    }

    pub fn extension(&self) -> &[u8] {
        Self::trim(&self.contents[8..])
    }

    fn trim(name: &[u8]) -> &[u8] {
        let end = name.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
        &name[..end]
    }
}

/// The parts of a short directory entry the engine acts on.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    pub first_cluster: Cluster,
    pub file_size: u32,
}

impl DirEntry {
    pub fn new(raw: &DirEntryRaw, fat_type: FatType) -> Self {
        let clus_hi = match fat_type {
            FatType::Fat32 => u32::from(raw.fst_clus_hi()),
            FatType::Fat12 | FatType::Fat16 => 0,
        };
        DirEntry {
            name: ShortName::from_raw(raw.name()),
            attributes: raw.attributes(),
            first_cluster: Cluster(clus_hi << 16 | u32::from(raw.fst_clus_lo())),
            file_size: raw.file_size(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

use crate::block_device::{Block, BlockBuf, BlockCount, BlockIdx};
use crate::queue::Handle;

use super::cache::CacheId;
use super::cluster::{Cluster, DirCursor};
use super::directory::{DirEntry, DirEntryRaw, ShortName, DIR_ENTRY_LEN};
use super::file::File;
#[cfg(feature = "lfn")]
use super::lfn::LongNameMatch;
use super::volume::{FatType, Link};
use super::{Completion, FatError, PATH_MAX};

/// A path as stored in an open request.
pub type Path = heapless::String<PATH_MAX>;

/// One entry in the FAT work queue.
pub(crate) struct Request {
    pub(crate) action: Action,
    /// The request this one was queued in front of
    pub(crate) parent: Option<Handle>,
    /// Answer from a finished cluster lookup
    pub(crate) link: Option<Link>,
    /// Data buffer lent to `f_read`
    pub(crate) buffer: Option<BlockBuf>,
    /// Set once the request has finished
    pub(crate) result: Option<Result<Completion, FatError>>,
}

impl Request {
    pub(crate) fn new(action: Action) -> Request {
        Request {
            action,
            parent: None,
            link: None,
            buffer: None,
            result: None,
        }
    }

    pub(crate) fn child(action: Action, parent: Handle) -> Request {
        Request {
            parent: Some(parent),
            ..Request::new(action)
        }
    }
}

pub(crate) enum Action {
    /// Fill a cache with one sector
    Load {
        cache: CacheId,
        lba: BlockIdx,
        in_flight: bool,
    },
    /// Look up the FAT entry of `cluster`. `low` holds the first byte of a
    /// FAT12 entry that straddles two sectors.
    NextCluster { cluster: Cluster, low: Option<u8> },
    Mount(MountState),
    Open(OpenState),
    Read(ReadState),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ActionKind {
    Load,
    NextCluster,
    Mount,
    Open,
    Read,
}

impl Action {
    pub(crate) fn kind(&self) -> ActionKind {
        match self {
            Action::Load { .. } => ActionKind::Load,
            Action::NextCluster { .. } => ActionKind::NextCluster,
            Action::Mount(_) => ActionKind::Mount,
            Action::Open(_) => ActionKind::Open,
            Action::Read(_) => ActionKind::Read,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MountStage {
    /// Sector 0: partition table or superfloppy boot sector
    Table,
    /// The first sector of a partition
    BootSector(BlockIdx),
    /// Scanning the root directory for the volume label
    Label(DirCursor),
}

pub(crate) struct MountState {
    pub(crate) stage: MountStage,
    pub(crate) device_blocks: BlockCount,
}

/// The outcome of scanning one directory sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    Found(DirEntry, u8),
    /// Hit the end-of-directory marker
    End,
    /// Nothing here, carry on with the next sector
    Exhausted,
}

pub(crate) struct OpenState {
    pub(crate) path: Path,
    /// Bytes of `path` already resolved
    pub(crate) traversed: usize,
    pub(crate) dir: DirCursor,
    #[cfg(feature = "lfn")]
    pub(crate) long_name: LongNameMatch,
}

impl OpenState {
    pub(crate) fn new(path: Path, dir: DirCursor) -> OpenState {
        OpenState {
            path,
            traversed: 0,
            dir,
            #[cfg(feature = "lfn")]
            long_name: LongNameMatch::new(),
        }
    }

    /// The path component being looked up.
    pub(crate) fn component(&self) -> &str {
        Self::component_of(&self.path, self.traversed)
    }

    fn component_of(path: &str, traversed: usize) -> &str {
        path[traversed..].split('/').next().unwrap_or("")
    }

    pub(crate) fn is_last_component(&self) -> bool {
        let rest = &self.path[self.traversed + self.component().len()..];
        rest.trim_start_matches('/').is_empty()
    }

    /// Move on to the next component, inside the directory at `dir`.
    pub(crate) fn descend(&mut self, dir: DirCursor) {
        let rest = &self.path[self.traversed + self.component().len()..];
        let slashes = rest.len() - rest.trim_start_matches('/').len();
        self.traversed += self.component().len() + slashes;
        self.dir = dir;
        #[cfg(feature = "lfn")]
        self.long_name.reset();
    }

    /// Look for the current component among one sector of entries.
    pub(crate) fn scan(&mut self, block: &Block, fat_type: FatType) -> Scan {
        let component = Self::component_of(&self.path, self.traversed);
        let short_name = ShortName::create_from_str(component);
        for (index, chunk) in block.chunks(DIR_ENTRY_LEN).enumerate() {
            let raw = DirEntryRaw::new(chunk);
            if raw.is_end() {
                return Scan::End;
            }
            let attributes = raw.attributes();
            if raw.is_deleted() || attributes.is_volume_label() {
                #[cfg(feature = "lfn")]
                self.long_name.reset();
                continue;
            }
            if attributes.is_long_name() {
                #[cfg(feature = "lfn")]
                self.long_name.feed(&raw, component);
                continue;
            }
            let name = raw.name();
            let short_match = short_name.map_or(false, |s| s.matches(&name));
            #[cfg(feature = "lfn")]
            let long_match = self.long_name.completes(&name);
            #[cfg(not(feature = "lfn"))]
            let long_match = false;
            #[cfg(feature = "lfn")]
            self.long_name.reset();
            if short_match || long_match {
                return Scan::Found(DirEntry::new(&raw, fat_type), index as u8);
            }
        }
        Scan::Exhausted
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReadStage {
    /// Work out where the next sector is
    Locate,
    /// A device read of sectors up to `last` is running
    Streaming { last: BlockIdx },
    /// Sector `lba` is with the caller until `clean_buffer`
    Delivered { lba: BlockIdx, last: BlockIdx },
}

pub(crate) struct ReadState {
    pub(crate) file: File,
    /// Sectors still to deliver
    pub(crate) remaining: u32,
    /// File bytes delivered so far
    pub(crate) bytes: u32,
    /// File bytes in the buffer right now
    pub(crate) delivered: u32,
    pub(crate) stage: ReadStage,
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

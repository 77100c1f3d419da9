//! async-sdmmc - FAT
//!
//! An asynchronous, read-only FAT12/16/32 engine on top of any
//! [`AsyncBlockDevice`].
//!
//! Requests (`f_mount`, `f_open`, `f_read`) return a [`Handle`] straight
//! away and finish later, as sectors arrive from the device. Only the request
//! at the head of the queue makes progress. When it needs a sector that is
//! not cached, or the next cluster of a chain, it queues a sub-request in
//! front of itself, so prerequisites are always resolved first.
//!
//! Two single-sector caches sit between the engine and the device: one for
//! FAT sectors and one for directory sectors.

mod cache;
pub mod cluster;
pub mod directory;
pub mod file;
#[cfg(feature = "lfn")]
pub mod lfn;
mod request;
pub mod volume;


use crate::block_device::{AsyncBlockDevice, Block, BlockBuf, BlockCount, BlockIdx, BlockReceiver};
use crate::mbr::Mbr;
use crate::queue::SlotQueue;

pub use crate::queue::Handle;
pub use cache::CacheId;
pub use cluster::{Cluster, DirCursor};
pub use directory::{Attributes, DirEntry, ShortName};
pub use file::File;
pub use request::Path;
pub use volume::{BootSector, BootSectorError, FatType, Link, Volume};

use cache::SectorCache;
use cluster::Position;
use directory::{DirEntryRaw, DIR_ENTRY_LEN};
use request::{Action, ActionKind, MountStage, MountState, OpenState, ReadStage, ReadState, Request, Scan};

#[cfg(feature = "log")]
use log::{debug, info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, trace, warn};

/// Requests that can be held at once, finished ones included until taken.
pub const QUEUE_DEPTH: usize = 8;

/// Longest path `f_open` accepts, in bytes.
pub const PATH_MAX: usize = 64;

/// The possible errors a FAT request can finish with.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// A mount was requested while other requests are queued
    Busy,
    /// No free request slots
    QueueFull,
    /// No volume is mounted
    NotMounted,
    /// Sector 0 or the boot sector lacks the 0xAA55 signature
    BadSignature,
    /// Neither a partition table nor a FAT boot sector
    Unrecognized,
    /// A path component does not exist
    NotFound,
    /// Tried to open a directory as a file
    NotAFile,
    /// A path goes through something that is not a directory
    NotADirectory,
    /// The path is longer than `PATH_MAX`
    PathTooLong,
    /// The block device reported an error
    Device,
    /// A cluster chain points somewhere invalid
    BadClusterChain,
    /// Writing is not supported
    WriteUnsupported,
    /// The request is not in a state to do that
    NotReady,
}

/// What a successful request produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The volume is mounted. `label` is the volume label entry of the root
    /// directory, if there is one.
    Mounted { label: Option<ShortName> },
    Opened(File),
    Read(ReadDone),
}

/// The result of an `f_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDone {
    /// The file, with its cursor moved past the data read
    pub file: File,
    /// File bytes delivered
    pub bytes: u32,
}

/// A finished request, taken out of the queue.
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<Completion, FatError>,
    /// The buffer lent to `f_read`, returned whether or not the read worked
    pub buffer: Option<BlockBuf>,
}

/// Told about progress on requests.
///
/// The engine owns its owner, so a callback cannot queue more work directly;
/// it records what happened and the main loop acts on it.
pub trait FatOwner {
    /// A sector of file data is ready. It can also be fetched with
    /// [`Fat::sector_data`] until [`Fat::clean_buffer`] is called.
    fn sector_ready(&mut self, _handle: Handle, _data: &[u8]) {}

    /// A request has finished; collect it with [`Fat::take`].
    fn finished(&mut self, _handle: Handle, _result: Result<(), FatError>) {}
}

impl FatOwner for () {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Step {
    /// Something changed; step the head again
    Continue,
    /// Waiting on the device or the caller
    Wait,
}

/// Where a directory scan has got to.
enum Located {
    /// The sector is in the directory cache
    Sector(BlockIdx),
    /// A sub-request was queued to get there
    Spawned,
    /// The directory has no more sectors
    End,
}

/// The FAT engine: a mounted volume, its caches and its request queue.
pub struct Fat<O = ()>
where
    O: FatOwner,
{
    volume: Option<Volume>,
    fat_cache: SectorCache,
    dentry_cache: SectorCache,
    queue: SlotQueue<Request, QUEUE_DEPTH>,
    owner: O,
}

impl Fat<()> {
    /// Create an engine with no owner. `fat_buf` and `dentry_buf` become
    /// the two sector caches.
    pub fn new(fat_buf: BlockBuf, dentry_buf: BlockBuf) -> Self {
        Self::with_owner(fat_buf, dentry_buf, ())
    }
}

impl<O> Fat<O>
where
    O: FatOwner,
{
    pub fn with_owner(fat_buf: BlockBuf, dentry_buf: BlockBuf, owner: O) -> Self {
        Fat {
            volume: None,
            fat_cache: SectorCache::new(fat_buf),
            dentry_cache: SectorCache::new(dentry_buf),
            queue: SlotQueue::new(),
            owner,
        }
    }

    pub fn owner(&self) -> &O {
        &self.owner
    }

    pub fn owner_mut(&mut self) -> &mut O {
        &mut self.owner
    }

    /// The mounted volume's geometry.
    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    /// Does the mounted geometry look complete?
    pub fn f_mounted(&self) -> bool {
        match &self.volume {
            Some(v) => {
                v.fat_begin_lba.0 != 0
                    && v.cluster_begin_lba.0 != 0
                    && v.sectors_per_cluster != 0
                    && v.root_dir_sector.0 != 0
            }
            None => false,
        }
    }

    /// Number of queued requests, sub-requests included.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The `fini` flag: has this request finished?
    pub fn is_finished(&self, handle: Handle) -> bool {
        self.queue
            .get(handle)
            .map_or(false, |request| request.result.is_some())
    }

    /// Collect a finished request, freeing its slot. The handle must not be
    /// used again afterwards.
    pub fn take(&mut self, handle: Handle) -> Option<Outcome> {
        if !self.is_finished(handle) {
            return None;
        }
        let request = self.queue.remove(handle)?;
        Some(Outcome {
            result: request.result.unwrap_or(Err(FatError::NotReady)),
            buffer: request.buffer,
        })
    }

    /// The file data delivered by a read request, while it is with the
    /// caller.
    pub fn sector_data(&self, handle: Handle) -> Option<&[u8]> {
        let request = self.queue.get(handle)?;
        let len = match &request.action {
            Action::Read(read) if read.delivered > 0 => read.delivered as usize,
            _ => return None,
        };
        request.buffer.as_deref().map(|block| &block.contents[..len])
    }

    /// Mount the volume on `device`: sector 0 is either a partition table or
    /// the boot sector of a superfloppy.
    pub fn f_mount<D>(&mut self, device: &mut D) -> Result<Handle, FatError>
    where
        D: AsyncBlockDevice,
    {
        if !self.queue.is_empty() {
            warn!("fat: mount while {} requests are queued", self.queue.len());
            return Err(FatError::Busy);
        }
        self.volume = None;
        self.fat_cache.invalidate();
        self.dentry_cache.invalidate();
        let request = Request::new(Action::Mount(MountState {
            stage: MountStage::Table,
            device_blocks: device.num_blocks(),
        }));
        self.enqueue(device, request)
    }

    /// Open the file at `path`, relative to the root directory. Components
    /// are separated by `/`.
    pub fn f_open<D>(&mut self, device: &mut D, path: &str) -> Result<Handle, FatError>
    where
        D: AsyncBlockDevice,
    {
        let volume = self.volume.ok_or(FatError::NotMounted)?;
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(FatError::NotAFile);
        }
        let mut stored = Path::new();
        stored.push_str(path).map_err(|_| FatError::PathTooLong)?;
        info!("fat: open {}", path);
        let request = Request::new(Action::Open(OpenState::new(stored, volume.root_dir())));
        self.enqueue(device, request)
    }

    /// Read up to `len` bytes from the cursor of `file`, a sector at a time,
    /// into `buffer`.
    ///
    /// Every sector is reported to the owner and readable through
    /// [`Fat::sector_data`]. All but the last must be handed back with
    /// [`Fat::clean_buffer`] before the next one is read. The buffer comes
    /// back with the [`Outcome`].
    pub fn f_read<D>(
        &mut self,
        device: &mut D,
        file: &File,
        buffer: BlockBuf,
        len: u32,
    ) -> Result<Handle, (FatError, BlockBuf)>
    where
        D: AsyncBlockDevice,
    {
        let volume = match self.volume {
            Some(volume) => volume,
            None => return Err((FatError::NotMounted, buffer)),
        };
        let wanted = ((u64::from(len) + Block::LEN as u64 - 1) / Block::LEN as u64) as u32;
        let sectors = wanted.min(file.remaining_sectors());
        if sectors > 0 && !volume.is_data_cluster(file.current_cluster) {
            return Err((FatError::BadClusterChain, buffer));
        }
        debug!("fat: read {} sectors at offset {}", sectors, file.position());
        let request = Request::new(Action::Read(ReadState {
            file: *file,
            remaining: sectors,
            bytes: 0,
            delivered: 0,
            stage: ReadStage::Locate,
        }));
        let idle = self.queue.is_empty();
        let handle = match self.queue.insert(request) {
            Ok(handle) => handle,
            Err(_) => return Err((FatError::QueueFull, buffer)),
        };
        match self.queue.get_mut(handle) {
            Some(request) => request.buffer = Some(buffer),
            None => return Err((FatError::QueueFull, buffer)),
        }
        self.queue.push_back(handle);
        if idle {
            self.run(device);
        }
        Ok(handle)
    }

    /// Directory and file data writes are not supported.
    pub fn f_write(&mut self, _file: &File, _data: &[u8]) -> Result<u32, FatError> {
        Err(FatError::WriteUnsupported)
    }

    /// Give back the sector delivered to a read request so it can carry on.
    pub fn clean_buffer<D>(&mut self, device: &mut D, handle: Handle) -> Result<(), FatError>
    where
        D: AsyncBlockDevice,
    {
        if self.queue.head() != Some(handle) {
            return Err(FatError::NotReady);
        }
        let request = self.queue.get_mut(handle).ok_or(FatError::NotReady)?;
        let read = match &mut request.action {
            Action::Read(read) => read,
            _ => return Err(FatError::NotReady),
        };
        let (lba, last) = match read.stage {
            ReadStage::Delivered { lba, last } => (lba, last),
            _ => return Err(FatError::NotReady),
        };
        read.delivered = 0;
        if lba >= last {
            // The device run is over; locate the next one.
            read.stage = ReadStage::Locate;
            self.run(device);
            return Ok(());
        }
        read.stage = ReadStage::Streaming { last };
        let buffer = request.buffer.take().ok_or(FatError::NotReady)?;
        trace!("fat: clean buffer after {}", lba.0);
        match device.clean_buffer(buffer, self) {
            Ok(()) => Ok(()),
            Err(buffer) => {
                warn!("fat: device refused buffer after block {}", lba.0);
                if let Some(request) = self.queue.get_mut(handle) {
                    request.buffer = Some(buffer);
                }
                self.fail(handle, FatError::Device);
                self.run(device);
                Err(FatError::Device)
            }
        }
    }

    fn enqueue<D>(&mut self, device: &mut D, request: Request) -> Result<Handle, FatError>
    where
        D: AsyncBlockDevice,
    {
        let idle = self.queue.is_empty();
        let handle = self
            .queue
            .insert(request)
            .map_err(|_| FatError::QueueFull)?;
        self.queue.push_back(handle);
        debug!("fat: queued request {}, {} pending", handle.index(), self.queue.len());
        if idle {
            self.run(device);
        }
        Ok(handle)
    }

    /// Step the head request until it has to wait.
    fn run<D>(&mut self, device: &mut D)
    where
        D: AsyncBlockDevice,
    {
        while let Some(handle) = self.queue.head() {
            match self.step(device, handle) {
                Ok(Step::Continue) => {}
                Ok(Step::Wait) => return,
                Err(e) => self.fail(handle, e),
            }
        }
    }

    fn step<D>(&mut self, device: &mut D, handle: Handle) -> Result<Step, FatError>
    where
        D: AsyncBlockDevice,
    {
        let kind = self
            .queue
            .get(handle)
            .map(|request| request.action.kind())
            .ok_or(FatError::NotReady)?;
        match kind {
            ActionKind::Load => self.step_load(device, handle),
            ActionKind::NextCluster => self.step_next_cluster(handle),
            ActionKind::Mount => self.step_mount(handle),
            ActionKind::Open => self.step_open(handle),
            ActionKind::Read => self.step_read(device, handle),
        }
    }

    fn cache_mut(&mut self, cache: CacheId) -> &mut SectorCache {
        match cache {
            CacheId::Fat => &mut self.fat_cache,
            CacheId::Dentry => &mut self.dentry_cache,
        }
    }

    /// Is `lba` in the cache? If not, queue a load in front of `handle`.
    fn need(&mut self, handle: Handle, cache: CacheId, lba: BlockIdx) -> Result<bool, FatError> {
        if self.cache_mut(cache).holds(lba) {
            trace!("fat: {:?} cache hit on {}", cache, lba.0);
            return Ok(true);
        }
        debug!("fat: {:?} cache miss on {}", cache, lba.0);
        self.spawn(
            handle,
            Action::Load {
                cache,
                lba,
                in_flight: false,
            },
        )?;
        Ok(false)
    }

    /// Queue a sub-request at the head, ahead of `parent`.
    fn spawn(&mut self, parent: Handle, action: Action) -> Result<Step, FatError> {
        let child = self
            .queue
            .insert(Request::child(action, parent))
            .map_err(|_| FatError::QueueFull)?;
        self.queue.push_front(child);
        Ok(Step::Continue)
    }

    /// Pop a finished sub-request, passing its answer to the parent.
    fn complete_child(&mut self, handle: Handle, link: Option<Link>) {
        self.queue.pop_front();
        if let Some(request) = self.queue.remove(handle) {
            if let (Some(parent), Some(link)) = (request.parent, link) {
                if let Some(parent) = self.queue.get_mut(parent) {
                    parent.link = Some(link);
                }
            }
        }
    }

    fn take_link(&mut self, handle: Handle) -> Option<Link> {
        self.queue.get_mut(handle).and_then(|request| request.link.take())
    }

    /// Pop the head request with a result. It stays in its slot until taken.
    fn finish(&mut self, handle: Handle, result: Result<Completion, FatError>) {
        self.queue.pop_front();
        let summary = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(*e),
        };
        if let Some(request) = self.queue.get_mut(handle) {
            if summary.is_err() && request.action.kind() == ActionKind::Mount {
                self.volume = None;
            }
            request.result = Some(result);
        }
        debug!("fat: request {} finished: {:?}", handle.index(), summary);
        self.owner.finished(handle, summary);
    }

    /// Fail the head request, and the request that spawned it, if any.
    fn fail(&mut self, handle: Handle, error: FatError) {
        warn!("fat: request {} failed: {:?}", handle.index(), error);
        match self.queue.get(handle).and_then(|request| request.parent) {
            Some(parent) => {
                self.queue.pop_front();
                self.queue.remove(handle);
                self.fail(parent, error);
            }
            None => self.finish(handle, Err(error)),
        }
    }

    /// Find a stray buffer a home.
    fn adopt(&mut self, buffer: BlockBuf) {
        if self.fat_cache.is_lent() {
            self.fat_cache.fill(buffer, None);
        } else if self.dentry_cache.is_lent() {
            self.dentry_cache.fill(buffer, None);
        } else {
            warn!("fat: dropping a stray buffer");
        }
    }

    fn step_load<D>(&mut self, device: &mut D, handle: Handle) -> Result<Step, FatError>
    where
        D: AsyncBlockDevice,
    {
        let (cache, lba) = match self.queue.get_mut(handle).map(|request| &mut request.action) {
            Some(Action::Load { in_flight: true, .. }) => return Ok(Step::Wait),
            Some(Action::Load { cache, lba, .. }) => (*cache, *lba),
            _ => return Err(FatError::NotReady),
        };
        if self.cache_mut(cache).holds(lba) {
            self.complete_child(handle, None);
            return Ok(Step::Continue);
        }
        let buffer = self.cache_mut(cache).lend().ok_or(FatError::NotReady)?;
        if let Some(Action::Load { in_flight, .. }) =
            self.queue.get_mut(handle).map(|request| &mut request.action)
        {
            *in_flight = true;
        }
        match device.begin_read(lba, BlockCount(1), buffer, self) {
            Ok(()) => Ok(Step::Wait),
            Err((_, buffer)) => {
                warn!("fat: could not start read of block {}", lba.0);
                self.cache_mut(cache).fill(buffer, None);
                Err(FatError::Device)
            }
        }
    }

    fn step_next_cluster(&mut self, handle: Handle) -> Result<Step, FatError> {
        let volume = self.volume.ok_or(FatError::NotMounted)?;
        let (cluster, low) = match self.queue.get(handle).map(|request| &request.action) {
            Some(Action::NextCluster { cluster, low }) => (*cluster, *low),
            _ => return Err(FatError::NotReady),
        };
        let (lba, offset) = volume.fat_entry(cluster);
        let raw = match low {
            None => {
                if !self.need(handle, CacheId::Fat, lba)? {
                    return Ok(Step::Continue);
                }
                let block = self.fat_cache.block(lba).ok_or(FatError::NotReady)?;
                match volume.fat_type {
                    FatType::Fat12 if offset == Block::LEN - 1 => {
                        // The entry continues in the next sector.
                        let first = block[offset];
                        if let Some(Action::NextCluster { low, .. }) =
                            self.queue.get_mut(handle).map(|request| &mut request.action)
                        {
                            *low = Some(first);
                        }
                        return Ok(Step::Continue);
                    }
                    FatType::Fat12 | FatType::Fat16 => {
                        u32::from(u16::from_le_bytes([block[offset], block[offset + 1]]))
                    }
                    FatType::Fat32 => u32::from_le_bytes([
                        block[offset],
                        block[offset + 1],
                        block[offset + 2],
                        block[offset + 3],
                    ]),
                }
            }
            Some(first) => {
                let next = BlockIdx(lba.0 + 1);
                if !self.need(handle, CacheId::Fat, next)? {
                    return Ok(Step::Continue);
                }
                let block = self.fat_cache.block(next).ok_or(FatError::NotReady)?;
                u32::from(u16::from_le_bytes([first, block[0]]))
            }
        };
        let link = volume
            .link(cluster, raw)
            .ok_or(FatError::BadClusterChain)?;
        trace!("fat: cluster {} -> {:?}", cluster.0, link);
        self.complete_child(handle, Some(link));
        Ok(Step::Continue)
    }

    fn set_mount_stage(&mut self, handle: Handle, stage: MountStage) {
        if let Some(Action::Mount(mount)) = self.queue.get_mut(handle).map(|r| &mut r.action) {
            mount.stage = stage;
        }
    }

    fn step_mount(&mut self, handle: Handle) -> Result<Step, FatError> {
        let (stage, device_blocks) = match self.queue.get(handle).map(|request| &request.action) {
            Some(Action::Mount(mount)) => (mount.stage, mount.device_blocks),
            _ => return Err(FatError::NotReady),
        };
        match stage {
            MountStage::Table => {
                let lba = BlockIdx(0);
                if !self.need(handle, CacheId::Dentry, lba)? {
                    return Ok(Step::Continue);
                }
                let block = self.dentry_cache.block(lba).ok_or(FatError::NotReady)?;
                let mbr = Mbr::new(block).map_err(|_| {
                    warn!("fat: bad magic at block 0, corrupt disk?");
                    FatError::BadSignature
                })?;
                if let Some(partition) = mbr.find_fat(device_blocks) {
                    info!(
                        "fat: partition {:?} at block {}",
                        partition.ty, partition.lba_start.0
                    );
                    self.set_mount_stage(handle, MountStage::BootSector(partition.lba_start));
                    return Ok(Step::Continue);
                }
                debug!("fat: no partition table, trying boot sector");
                let volume = Self::parse_volume(block, lba, device_blocks)?;
                self.mounted(handle, volume)
            }
            MountStage::BootSector(lba) => {
                if !self.need(handle, CacheId::Dentry, lba)? {
                    return Ok(Step::Continue);
                }
                let block = self.dentry_cache.block(lba).ok_or(FatError::NotReady)?;
                let volume = Self::parse_volume(block, lba, device_blocks)?;
                self.mounted(handle, volume)
            }
            MountStage::Label(cursor) => self.scan_label(handle, cursor),
        }
    }

    fn parse_volume(
        block: &Block,
        lba: BlockIdx,
        device_blocks: BlockCount,
    ) -> Result<Volume, FatError> {
        let boot = BootSector::new(block);
        match Volume::new(&boot, lba, device_blocks) {
            Ok(volume) => {
                debug!(
                    "fat: boot sector from {:?}, {} hidden sectors",
                    core::str::from_utf8(boot.oem_name()).unwrap_or("?"),
                    boot.hidden_sectors()
                );
                Ok(volume)
            }
            Err(BootSectorError::InvalidSignature(_)) => Err(FatError::BadSignature),
            Err(e) => {
                debug!("fat: not a FAT boot sector at {}: {:?}", lba.0, e);
                Err(FatError::Unrecognized)
            }
        }
    }

    fn mounted(&mut self, handle: Handle, volume: Volume) -> Result<Step, FatError> {
        info!(
            "fat: {:?}, {} sectors per cluster, fat at {}, root at {}, clusters at {}",
            volume.fat_type,
            volume.sectors_per_cluster,
            volume.fat_begin_lba.0,
            volume.root_dir_sector.0,
            volume.cluster_begin_lba.0
        );
        self.volume = Some(volume);
        self.set_mount_stage(handle, MountStage::Label(volume.root_dir()));
        Ok(Step::Continue)
    }

    /// Find the sector a directory scan is at, following the cluster chain
    /// when a cluster is used up.
    fn locate(&mut self, handle: Handle, cursor: &mut DirCursor) -> Result<Located, FatError> {
        let volume = self.volume.ok_or(FatError::NotMounted)?;
        loop {
            match cursor.position(&volume) {
                Position::End => return Ok(Located::End),
                Position::Sector(lba) => {
                    return if self.need(handle, CacheId::Dentry, lba)? {
                        Ok(Located::Sector(lba))
                    } else {
                        Ok(Located::Spawned)
                    };
                }
                Position::NeedLink(cluster) => match self.take_link(handle) {
                    Some(Link::Next(next)) => cursor.follow(next),
                    Some(Link::End) => return Ok(Located::End),
                    None => {
                        self.spawn(handle, Action::NextCluster { cluster, low: None })?;
                        return Ok(Located::Spawned);
                    }
                },
            }
        }
    }

    fn scan_label(&mut self, handle: Handle, cursor: DirCursor) -> Result<Step, FatError> {
        let mut cursor = cursor;
        let located = self.locate(handle, &mut cursor);
        self.set_mount_stage(handle, MountStage::Label(cursor));
        let lba = match located? {
            Located::Spawned => return Ok(Step::Continue),
            Located::End => {
                info!("fat: mounted, end of root directory, no label");
                self.finish(handle, Ok(Completion::Mounted { label: None }));
                return Ok(Step::Continue);
            }
            Located::Sector(lba) => lba,
        };
        let block = self.dentry_cache.block(lba).ok_or(FatError::NotReady)?;
        let mut label = None;
        let mut end = false;
        for chunk in block.chunks(DIR_ENTRY_LEN) {
            let raw = DirEntryRaw::new(chunk);
            if raw.is_end() {
                end = true;
                break;
            }
            if !raw.is_deleted() && raw.attributes().is_volume_label() {
                label = Some(ShortName::from_raw(raw.name()));
                break;
            }
        }
        if label.is_some() || end {
            info!("fat: mounted, label {:?}", label);
            self.finish(handle, Ok(Completion::Mounted { label }));
        } else {
            cursor.advance();
            self.set_mount_stage(handle, MountStage::Label(cursor));
        }
        Ok(Step::Continue)
    }

    fn step_open(&mut self, handle: Handle) -> Result<Step, FatError> {
        let volume = self.volume.ok_or(FatError::NotMounted)?;
        let mut cursor = match self.queue.get(handle).map(|request| &request.action) {
            Some(Action::Open(open)) => open.dir,
            _ => return Err(FatError::NotReady),
        };
        let located = self.locate(handle, &mut cursor);
        let open = match self.queue.get_mut(handle).map(|request| &mut request.action) {
            Some(Action::Open(open)) => open,
            _ => return Err(FatError::NotReady),
        };
        open.dir = cursor;
        let lba = match located? {
            Located::Spawned => return Ok(Step::Continue),
            Located::End => return Err(FatError::NotFound),
            Located::Sector(lba) => lba,
        };

        let block = self.dentry_cache.block(lba).ok_or(FatError::NotReady)?;
        let open = match self.queue.get_mut(handle).map(|request| &mut request.action) {
            Some(Action::Open(open)) => open,
            _ => return Err(FatError::NotReady),
        };
        match open.scan(block, volume.fat_type) {
            Scan::End => Err(FatError::NotFound),
            Scan::Exhausted => {
                open.dir.advance();
                Ok(Step::Continue)
            }
            Scan::Found(entry, index) => {
                trace!("fat: found {:?} at {}:{}", entry.name, lba.0, index);
                if !open.is_last_component() {
                    if !entry.is_dir() {
                        return Err(FatError::NotADirectory);
                    }
                    if entry.first_cluster.0 != 0 && !volume.is_data_cluster(entry.first_cluster) {
                        return Err(FatError::BadClusterChain);
                    }
                    open.descend(volume.dir(entry.first_cluster));
                    return Ok(Step::Continue);
                }
                if entry.is_dir() {
                    return Err(FatError::NotAFile);
                }
                let file = File::new(&entry, lba, index);
                info!("fat: opened, first cluster {}, {} bytes", entry.first_cluster.0, entry.file_size);
                self.finish(handle, Ok(Completion::Opened(file)));
                Ok(Step::Continue)
            }
        }
    }

    fn read_state(&mut self, handle: Handle) -> Result<&mut ReadState, FatError> {
        match self.queue.get_mut(handle).map(|request| &mut request.action) {
            Some(Action::Read(read)) => Ok(read),
            _ => Err(FatError::NotReady),
        }
    }

    fn step_read<D>(&mut self, device: &mut D, handle: Handle) -> Result<Step, FatError>
    where
        D: AsyncBlockDevice,
    {
        let volume = self.volume.ok_or(FatError::NotMounted)?;
        let read = self.read_state(handle)?;
        if read.stage != ReadStage::Locate {
            return Ok(Step::Wait);
        }
        if read.remaining == 0 {
            let done = ReadDone {
                file: read.file,
                bytes: read.bytes,
            };
            self.finish(handle, Ok(Completion::Read(done)));
            return Ok(Step::Continue);
        }

        let mut file = read.file;
        if file.lba(&volume).is_none() {
            match self.take_link(handle) {
                Some(Link::Next(next)) => file.follow(next, volume.bytes_per_cluster()),
                Some(Link::End) => return Err(FatError::BadClusterChain),
                None => {
                    let cluster = file.current_cluster;
                    return self.spawn(handle, Action::NextCluster { cluster, low: None });
                }
            }
        }
        let lba = file.lba(&volume).ok_or(FatError::BadClusterChain)?;

        let read = self.read_state(handle)?;
        let count = read.remaining.min(file.sectors_left_in_cluster(&volume));
        let last = BlockIdx(lba.0 + count - 1);
        read.file = file;
        read.stage = ReadStage::Streaming { last };
        let request = self.queue.get_mut(handle).ok_or(FatError::NotReady)?;
        let buffer = request.buffer.take().ok_or(FatError::NotReady)?;
        debug!("fat: device read of {} sectors at {}", count, lba.0);
        match device.begin_read(lba, BlockCount(count), buffer, self) {
            Ok(()) => Ok(Step::Wait),
            Err((_, buffer)) => {
                warn!("fat: could not start read of block {}", lba.0);
                if let Some(request) = self.queue.get_mut(handle) {
                    request.buffer = Some(buffer);
                }
                Err(FatError::Device)
            }
        }
    }

    /// A sector of file data has arrived for the head read request.
    fn sector_read(&mut self, handle: Handle, lba: BlockIdx, buffer: BlockBuf, ok: bool) {
        let request = match self.queue.get_mut(handle) {
            Some(request) => request,
            None => return self.adopt(buffer),
        };
        request.buffer = Some(buffer);
        let read = match &mut request.action {
            Action::Read(read) => read,
            _ => return,
        };
        let last = match read.stage {
            ReadStage::Streaming { last } => last,
            _ => return,
        };
        if !ok {
            read.stage = ReadStage::Locate;
            return self.fail(handle, FatError::Device);
        }
        let valid = read.file.consume_sector();
        read.remaining -= 1;
        read.bytes += valid;
        read.delivered = valid;
        let done = read.remaining == 0;
        read.stage = if done {
            ReadStage::Locate
        } else {
            ReadStage::Delivered { lba, last }
        };
        let done = if done {
            Some(ReadDone {
                file: read.file,
                bytes: read.bytes,
            })
        } else {
            None
        };
        trace!("fat: delivering block {}, {} bytes", lba.0, valid);
        if let Some(block) = request.buffer.as_deref() {
            self.owner
                .sector_ready(handle, &block.contents[..valid as usize]);
        }
        if let Some(done) = done {
            self.finish(handle, Ok(Completion::Read(done)));
        }
    }
}

impl<D, O> BlockReceiver<D> for Fat<O>
where
    D: AsyncBlockDevice,
    O: FatOwner,
{
    fn sd_read_complete(
        &mut self,
        device: &mut D,
        block_idx: BlockIdx,
        buffer: BlockBuf,
        result: Result<(), D::Error>,
    ) {
        let head = match self.queue.head() {
            Some(head) => head,
            None => {
                warn!("fat: block {} arrived with nothing queued", block_idx.0);
                return self.adopt(buffer);
            }
        };
        let kind = self.queue.get(head).map(|request| request.action.kind());
        match kind {
            Some(ActionKind::Load) => {
                let (cache, lba) = match self.queue.get_mut(head).map(|request| &mut request.action)
                {
                    Some(Action::Load {
                        cache,
                        lba,
                        in_flight,
                    }) => {
                        *in_flight = false;
                        (*cache, *lba)
                    }
                    _ => return self.adopt(buffer),
                };
                if result.is_ok() && lba == block_idx {
                    self.cache_mut(cache).fill(buffer, Some(lba));
                } else {
                    warn!("fat: read of block {} failed", block_idx.0);
                    self.cache_mut(cache).fill(buffer, None);
                    self.fail(head, FatError::Device);
                }
            }
            Some(ActionKind::Read) => self.sector_read(head, block_idx, buffer, result.is_ok()),
            _ => {
                warn!("fat: unexpected block {}", block_idx.0);
                self.adopt(buffer);
            }
        }
        self.run(device);
    }

    fn sd_write_complete(
        &mut self,
        _device: &mut D,
        block_idx: BlockIdx,
        buffer: BlockBuf,
        _result: Result<(), D::Error>,
    ) {
        warn!("fat: unexpected write completion for block {}", block_idx.0);
        self.adopt(buffer);
    }
}

impl<O> core::fmt::Debug for Fat<O>
where
    O: FatOwner,
{
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        fmt.debug_struct("Fat")
            .field("volume", &self.volume)
            .field("fat_cache", &self.fat_cache.tag())
            .field("dentry_cache", &self.dentry_cache.tag())
            .field("pending", &self.queue.len())
            .finish()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

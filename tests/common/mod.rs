//! Test fixtures: a simulated SD card behind fake SPI and DMA registers, FAT
//! image builders and receivers that record what they are handed.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use async_sdmmc::dma::{Channel, ChannelPool, ChannelProgram, Direction, DmaRegisters, FlowControl};
use async_sdmmc::fat::{Fat, FatOwner, Handle, Outcome};
use async_sdmmc::sdmmc::SdCard;
use async_sdmmc::spi::{DmaEnable, SpiRegisters, Status};
use async_sdmmc::{AsyncBlockDevice, Block, BlockBuf, BlockIdx, BlockReceiver, MemoryBlockDevice};
use embedded_hal::digital::v2::OutputPin;
use hex_literal::hex;

pub const CID: [u8; 16] = hex!("03 53 44 53 44 33 32 47 80 12 34 56 78 01 65 01");

pub const OCR_SDHC: u32 = 0xC0FF_8000;
pub const OCR_SDSC: u32 = 0x80FF_8000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn buffer() -> BlockBuf {
    Box::leak(Box::new(Block::new()))
}

// ****************************************************************************
//
// Simulated card
//
// ****************************************************************************

/// How the card answers SEND_IF_COND.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IfCond {
    Echo,
    Illegal,
}

#[derive(Debug)]
enum WriteState {
    Token { multi: bool, sector: u32 },
    Data { multi: bool, sector: u32, data: Vec<u8> },
}

/// An SD card in SPI mode, one byte exchanged at a time.
pub struct SimCard {
    pub storage: Vec<u8>,
    pub if_cond: IfCond,
    pub ocr: u32,
    /// ACMD41 answers "still idle" this many times
    pub busy_polls: u32,
    /// Idle bytes before each data token
    pub token_delay: usize,
    pub reject_writes: bool,
    /// Every command received, with its argument
    pub commands: Vec<(u8, u32)>,
    /// Sectors written
    pub writes: Vec<u32>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    app: bool,
    streaming: Option<u32>,
    write: Option<WriteState>,
}

impl SimCard {
    /// A high capacity card holding `storage`, whose length must be a
    /// multiple of 1024 sectors.
    pub fn new(storage: Vec<u8>) -> SimCard {
        assert_eq!(storage.len() % (1024 * 512), 0);
        SimCard {
            storage,
            if_cond: IfCond::Echo,
            ocr: OCR_SDHC,
            busy_polls: 2,
            token_delay: 1,
            reject_writes: false,
            commands: Vec::new(),
            writes: Vec::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            app: false,
            streaming: None,
            write: None,
        }
    }

    pub fn sectors(&self) -> u32 {
        (self.storage.len() / 512) as u32
    }

    pub fn sector(&self, sector: u32) -> &[u8] {
        let start = sector as usize * 512;
        &self.storage[start..start + 512]
    }

    /// Commands with the given index, arguments only.
    pub fn args(&self, command: u8) -> Vec<u32> {
        self.commands
            .iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, arg)| *arg)
            .collect()
    }

    fn csd(&self) -> [u8; 16] {
        let c_size = self.sectors() / 1024 - 1;
        let mut csd = [0u8; 16];
        csd[0] = 0x40;
        csd[7] = ((c_size >> 16) & 0x3F) as u8;
        csd[8] = (c_size >> 8) as u8;
        csd[9] = c_size as u8;
        csd
    }

    fn high_capacity(&self) -> bool {
        self.ocr & (1 << 30) != 0
    }

    fn sector_of(&self, arg: u32) -> u32 {
        if self.high_capacity() {
            arg
        } else {
            arg >> 9
        }
    }

    /// Clock one byte in, and the byte the card was driving out.
    pub fn exchange(&mut self, mosi: u8) -> u8 {
        if self.out.is_empty() {
            if let Some(sector) = self.streaming {
                self.queue_block(sector);
                self.streaming = Some(sector + 1);
            }
        }
        let miso = self.out.pop_front().unwrap_or(0xFF);
        self.receive(mosi);
        miso
    }

    fn queue_block(&mut self, sector: u32) {
        for _ in 0..self.token_delay {
            self.out.push_back(0xFF);
        }
        self.out.push_back(0xFE);
        let start = sector as usize * 512;
        match self.storage.get(start..start + 512) {
            Some(data) => self.out.extend(data.iter().copied()),
            None => self.out.extend(std::iter::repeat(0).take(512)),
        }
        self.out.extend([0x00, 0x00].iter().copied());
    }

    fn receive(&mut self, mosi: u8) {
        match self.write.take() {
            Some(WriteState::Token { multi, sector }) => match mosi {
                0xFE | 0xFC => {
                    self.write = Some(WriteState::Data {
                        multi,
                        sector,
                        data: Vec::with_capacity(514),
                    });
                    return;
                }
                0xFD if multi => {
                    // stuff byte, then busy for a byte
                    self.out.clear();
                    self.out.extend([0xFF, 0x00].iter().copied());
                    return;
                }
                0xFF => {
                    self.write = Some(WriteState::Token { multi, sector });
                    return;
                }
                _ => {}
            },
            Some(WriteState::Data {
                multi,
                sector,
                mut data,
            }) => {
                data.push(mosi);
                if data.len() < 514 {
                    self.write = Some(WriteState::Data {
                        multi,
                        sector,
                        data,
                    });
                    return;
                }
                if self.reject_writes {
                    self.out.push_back(0x0B);
                    return;
                }
                let start = sector as usize * 512;
                self.storage[start..start + 512].copy_from_slice(&data[..512]);
                self.writes.push(sector);
                self.out.extend([0x05, 0x00].iter().copied());
                if multi {
                    self.write = Some(WriteState::Token {
                        multi,
                        sector: sector + 1,
                    });
                }
                return;
            }
            None => {}
        }

        if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let frame = std::mem::take(&mut self.frame);
            let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            self.command(frame[0] & 0x3F, arg);
        }
    }

    fn command(&mut self, command: u8, arg: u32) {
        self.commands.push((command, arg));
        let app = std::mem::replace(&mut self.app, false);
        self.out.clear();
        match (app, command) {
            (_, 0) => {
                self.streaming = None;
                self.write = None;
                self.out.push_back(0x01);
            }
            (_, 8) => match self.if_cond {
                IfCond::Illegal => self.out.push_back(0x05),
                IfCond::Echo => self.out.extend(
                    [0x01, 0x00, 0x00, ((arg >> 8) & 0x0F) as u8, arg as u8]
                        .iter()
                        .copied(),
                ),
            },
            (_, 55) => {
                self.app = true;
                let r1 = if self.busy_polls > 0 { 0x01 } else { 0x00 };
                self.out.push_back(r1);
            }
            (true, 41) => {
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    self.out.push_back(0x01);
                } else {
                    self.out.push_back(0x00);
                }
            }
            (true, 23) => self.out.push_back(0x00),
            (_, 58) => {
                self.out.push_back(0x00);
                self.out.extend(self.ocr.to_be_bytes().iter().copied());
            }
            (_, 9) => {
                let csd = self.csd();
                self.register(csd);
            }
            (_, 10) => self.register(CID),
            (_, 12) => {
                self.streaming = None;
                self.out.extend([0xFF, 0x00].iter().copied());
            }
            (_, 17) => {
                self.out.push_back(0x00);
                let sector = self.sector_of(arg);
                self.queue_block(sector);
            }
            (_, 18) => {
                self.out.push_back(0x00);
                self.streaming = Some(self.sector_of(arg));
            }
            (_, 24) | (_, 25) => {
                self.out.push_back(0x00);
                self.write = Some(WriteState::Token {
                    multi: command == 25,
                    sector: self.sector_of(arg),
                });
            }
            _ => self.out.push_back(0x04),
        }
    }

    fn register(&mut self, data: [u8; 16]) {
        self.out.extend([0x00, 0xFF, 0xFE].iter().copied());
        self.out.extend(data.iter().copied());
        self.out.extend([0x00, 0x00].iter().copied());
    }
}

// ****************************************************************************
//
// Fake peripherals
//
// ****************************************************************************

/// SPI and DMA registers wired to a [`SimCard`]. A DMA transfer runs to
/// completion as soon as its transmit channel is enabled.
pub struct FakeBus {
    pub card: RefCell<SimCard>,
    rx: RefCell<VecDeque<u8>>,
    dmacr: Cell<DmaEnable>,
    selected: Cell<bool>,
    programs: RefCell<[Option<ChannelProgram>; 8]>,
    enabled: Cell<u8>,
    pending: Cell<u8>,
    /// Sector-sized DMA transfers run so far
    pub dma_transfers: Cell<u32>,
}

impl FakeBus {
    pub fn new(card: SimCard) -> FakeBus {
        FakeBus {
            card: RefCell::new(card),
            rx: RefCell::new(VecDeque::new()),
            dmacr: Cell::new(DmaEnable::empty()),
            selected: Cell::new(false),
            programs: RefCell::new([None; 8]),
            enabled: Cell::new(0),
            pending: Cell::new(0),
            dma_transfers: Cell::new(0),
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected.get()
    }

    fn run_transfer(&self, tx: Channel) {
        let programs = *self.programs.borrow();
        let program = match programs[usize::from(tx.0)] {
            Some(program) => program,
            None => return,
        };
        let rx = (0..8u8).map(Channel).find(|c| {
            self.enabled.get() & (1 << c.0) != 0
                && programs[usize::from(c.0)].map(|p| p.flow) == Some(FlowControl::PeripheralToMemory)
        });
        let mut card = self.card.borrow_mut();
        for i in 0..program.size as usize {
            let source = if program.source.increment {
                program.source.address + i
            } else {
                program.source.address
            };
            // Safety: the driver points the channel at a live sector buffer
            // or at one of its static words.
            let mosi = unsafe { *(source as *const u8) };
            let miso = card.exchange(mosi);
            if let Some(rx) = rx {
                if let Some(rx_program) = programs[usize::from(rx.0)] {
                    let dest = if rx_program.destination.increment {
                        rx_program.destination.address + i
                    } else {
                        rx_program.destination.address
                    };
                    unsafe { *(dest as *mut u8) = miso };
                }
            }
        }
        let mut done = 1 << tx.0;
        if let Some(rx) = rx {
            done |= 1 << rx.0;
        }
        self.enabled.set(self.enabled.get() & !done);
        self.pending.set(self.pending.get() | done);
        self.dma_transfers.set(self.dma_transfers.get() + 1);
    }
}

impl SpiRegisters for FakeBus {
    fn status(&self) -> Status {
        let mut status = Status::TFE | Status::TNF;
        if !self.rx.borrow().is_empty() {
            status |= Status::RNE;
        }
        status
    }

    fn write_data(&self, byte: u8) {
        let miso = self.card.borrow_mut().exchange(byte);
        self.rx.borrow_mut().push_back(miso);
    }

    fn read_data(&self) -> u8 {
        self.rx.borrow_mut().pop_front().unwrap_or(0xFF)
    }

    fn set_clock(&self, _prescaler: u8, _serial_clock_rate: u8) {}

    fn peripheral_clock(&self) -> u32 {
        48_000_000
    }

    fn dma_enable(&self) -> DmaEnable {
        self.dmacr.get()
    }

    fn set_dma_enable(&self, enable: DmaEnable) {
        self.dmacr.set(enable);
    }

    fn data_register_address(&self) -> usize {
        0x4008_8008
    }

    fn dma_request_line(&self, direction: Direction) -> u8 {
        match direction {
            Direction::Source => 1,
            Direction::Destination => 0,
        }
    }
}

impl DmaRegisters for FakeBus {
    fn program(&self, channel: Channel, program: &ChannelProgram) {
        self.programs.borrow_mut()[usize::from(channel.0)] = Some(*program);
    }

    fn write_enable(&self, channel: Channel) {
        self.enabled.set(self.enabled.get() | (1 << channel.0));
        let flow = self.programs.borrow()[usize::from(channel.0)].map(|p| p.flow);
        if flow == Some(FlowControl::MemoryToPeripheral) {
            self.run_transfer(channel);
        }
    }

    fn is_enabled(&self, channel: Channel) -> bool {
        self.enabled.get() & (1 << channel.0) != 0
    }

    fn remaining(&self, _channel: Channel) -> u32 {
        0
    }

    fn pending(&self) -> u8 {
        self.pending.get()
    }

    fn errors(&self) -> u8 {
        0
    }

    fn clear(&self, channel: Channel) {
        self.pending.set(self.pending.get() & !(1 << channel.0));
    }
}

/// Chip select wired to the bus.
pub struct Cs<'a>(pub &'a FakeBus);

impl<'a> OutputPin for Cs<'a> {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        self.0.selected.set(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        self.0.selected.set(false);
        Ok(())
    }
}

pub type Card<'a> = SdCard<'a, &'a FakeBus, Cs<'a>, &'a FakeBus>;

/// Deliver pending DMA interrupts, then run the idle hook.
pub fn pump<'a, Rx>(card: &mut Card<'a>, pool: &ChannelPool, bus: &FakeBus, rx: &mut Rx)
where
    Rx: BlockReceiver<Card<'a>>,
{
    pool.dispatch(bus, |channel, _owner| card.on_dma_interrupt(channel, &mut *rx));
    card.on_idle(rx);
}

// ****************************************************************************
//
// Receivers
//
// ****************************************************************************

/// One completion handed to a [`Collect`].
#[derive(Debug)]
pub struct Completed<E> {
    pub block: u32,
    pub data: Vec<u8>,
    pub result: Result<(), E>,
}

/// Keeps every completion, and the buffers until the test wants them back.
pub struct Collect<E> {
    pub reads: Vec<Completed<E>>,
    pub writes: Vec<Completed<E>>,
    pub buffers: Vec<BlockBuf>,
}

impl<E> Collect<E> {
    pub fn new() -> Self {
        Collect {
            reads: Vec::new(),
            writes: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn read_blocks(&self) -> Vec<u32> {
        self.reads.iter().map(|c| c.block).collect()
    }
}

impl<D, E> BlockReceiver<D> for Collect<E>
where
    D: AsyncBlockDevice<Error = E>,
{
    fn sd_read_complete(&mut self, _device: &mut D, block_idx: BlockIdx, buffer: BlockBuf, result: Result<(), E>) {
        self.reads.push(Completed {
            block: block_idx.0,
            data: buffer.contents.to_vec(),
            result,
        });
        self.buffers.push(buffer);
    }

    fn sd_write_complete(&mut self, _device: &mut D, block_idx: BlockIdx, buffer: BlockBuf, result: Result<(), E>) {
        self.writes.push(Completed {
            block: block_idx.0,
            data: buffer.contents.to_vec(),
            result,
        });
        self.buffers.push(buffer);
    }
}

/// Records file data and finished requests as the FAT engine reports them.
#[derive(Default)]
pub struct Recorder {
    pub data: Vec<u8>,
    pub finished: Vec<Handle>,
}

impl FatOwner for Recorder {
    fn sector_ready(&mut self, _handle: Handle, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn finished(&mut self, handle: Handle, _result: Result<(), async_sdmmc::fat::FatError>) {
        self.finished.push(handle);
    }
}

/// Run `device` until `handle` finishes, returning every delivered sector.
pub fn settle_memory<O>(fat: &mut Fat<O>, device: &mut MemoryBlockDevice, handle: Handle) -> Outcome
where
    O: FatOwner,
{
    for _ in 0..100_000 {
        if device.complete_next(fat) {
            continue;
        }
        if fat.is_finished(handle) {
            return fat.take(handle).expect("finished request");
        }
        fat.clean_buffer(device, handle).expect("clean buffer");
    }
    panic!("request never finished");
}

/// Run the card until `handle` finishes.
pub fn settle_card<'a, O>(
    fat: &mut Fat<O>,
    card: &mut Card<'a>,
    pool: &ChannelPool,
    bus: &FakeBus,
    handle: Handle,
) -> Outcome
where
    O: FatOwner,
{
    for _ in 0..100_000 {
        pool.dispatch(bus, |channel, _owner| card.on_dma_interrupt(channel, &mut *fat));
        card.on_idle(&mut *fat);
        if fat.is_finished(handle) {
            return fat.take(handle).expect("finished request");
        }
        if fat.sector_data(handle).is_some() {
            fat.clean_buffer(card, handle).expect("clean buffer");
        }
    }
    panic!("request never finished");
}

// ****************************************************************************
//
// FAT images
//
// ****************************************************************************

/// A directory being filled in by [`FatImage`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DirId(usize);

pub const ROOT: DirId = DirId(0);

struct DirState {
    /// Empty for the fixed FAT16 root directory
    clusters: Vec<u32>,
    used: usize,
}

/// Builds a FAT16 or FAT32 volume in memory, optionally behind a partition
/// table.
pub struct FatImage {
    pub image: Vec<u8>,
    pub start: u32,
    pub fat32: bool,
    pub spc: u32,
    pub reserved: u32,
    pub fats: u32,
    pub fat_size: u32,
    pub root_entries: u32,
    pub total: u32,
    next_cluster: u32,
    dirs: Vec<DirState>,
}

impl FatImage {
    pub fn fat16(device_sectors: u32, start: u32, total: u32, spc: u32) -> FatImage {
        Self::build(device_sectors, start, total, spc, false)
    }

    pub fn fat32(device_sectors: u32, start: u32, total: u32, spc: u32) -> FatImage {
        Self::build(device_sectors, start, total, spc, true)
    }

    fn build(device_sectors: u32, start: u32, total: u32, spc: u32, fat32: bool) -> FatImage {
        let width = if fat32 { 4 } else { 2 };
        let entries = total / spc + 2;
        let fat_size = (entries * width + 511) / 512;
        let mut image = FatImage {
            image: vec![0u8; device_sectors as usize * 512],
            start,
            fat32,
            spc,
            reserved: if fat32 { 32 } else { 1 },
            fats: 2,
            fat_size,
            root_entries: if fat32 { 0 } else { 512 },
            total,
            next_cluster: if fat32 { 3 } else { 2 },
            dirs: Vec::new(),
        };
        image.boot_sector();
        if fat32 {
            image.set_fat(0, 0x0FFF_FFF8);
            image.set_fat(1, 0x0FFF_FFFF);
            image.set_fat(2, 0x0FFF_FFFF);
            image.dirs.push(DirState {
                clusters: vec![2],
                used: 0,
            });
        } else {
            image.set_fat(0, 0xFFF8);
            image.set_fat(1, 0xFFFF);
            image.dirs.push(DirState {
                clusters: Vec::new(),
                used: 0,
            });
        }
        image
    }

    fn boot_sector(&mut self) {
        let base = self.start as usize * 512;
        let b = &mut self.image[base..base + 512];
        b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        b[3..11].copy_from_slice(b"MSWIN4.1");
        b[11..13].copy_from_slice(&512u16.to_le_bytes());
        b[13] = self.spc as u8;
        b[14..16].copy_from_slice(&(self.reserved as u16).to_le_bytes());
        b[16] = self.fats as u8;
        b[17..19].copy_from_slice(&(self.root_entries as u16).to_le_bytes());
        if !self.fat32 && self.total < 0x10000 {
            b[19..21].copy_from_slice(&(self.total as u16).to_le_bytes());
        } else {
            b[32..36].copy_from_slice(&self.total.to_le_bytes());
        }
        b[21] = 0xF8;
        b[28..32].copy_from_slice(&self.start.to_le_bytes());
        if self.fat32 {
            b[36..40].copy_from_slice(&self.fat_size.to_le_bytes());
            b[44..48].copy_from_slice(&2u32.to_le_bytes());
            b[48..50].copy_from_slice(&1u16.to_le_bytes());
        } else {
            b[22..24].copy_from_slice(&(self.fat_size as u16).to_le_bytes());
        }
        b[510] = 0x55;
        b[511] = 0xAA;
    }

    /// Put a partition table in sector 0 describing this volume.
    pub fn with_mbr(mut self, partition_type: u8) -> FatImage {
        self.partition(0, 0x80, partition_type, self.start, self.total);
        self
    }

    /// Write one partition table entry (and the signature) into sector 0.
    pub fn partition(&mut self, index: usize, status: u8, partition_type: u8, start: u32, count: u32) {
        let entry = 446 + index * 16;
        self.image[entry] = status;
        self.image[entry + 4] = partition_type;
        self.image[entry + 8..entry + 12].copy_from_slice(&start.to_le_bytes());
        self.image[entry + 12..entry + 16].copy_from_slice(&count.to_le_bytes());
        self.image[510] = 0x55;
        self.image[511] = 0xAA;
    }

    pub fn fat_begin(&self) -> u32 {
        self.start + self.reserved
    }

    pub fn root_dir_sector(&self) -> u32 {
        if self.fat32 {
            self.cluster_lba(2)
        } else {
            self.fat_begin() + self.fats * self.fat_size
        }
    }

    pub fn cluster_begin(&self) -> u32 {
        let fats_end = self.fat_begin() + self.fats * self.fat_size;
        if self.fat32 {
            fats_end
        } else {
            fats_end + (self.root_entries * 32 + 511) / 512
        }
    }

    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.cluster_begin() + (cluster - 2) * self.spc
    }

    fn bytes_per_cluster(&self) -> usize {
        self.spc as usize * 512
    }

    fn eoc(&self) -> u32 {
        if self.fat32 {
            0x0FFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..self.fats {
            let sector = self.fat_begin() + copy * self.fat_size;
            let base = sector as usize * 512;
            if self.fat32 {
                let at = base + cluster as usize * 4;
                self.image[at..at + 4].copy_from_slice(&value.to_le_bytes());
            } else {
                let at = base + cluster as usize * 2;
                self.image[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
        }
    }

    /// Allocate a chain of `count` clusters, `stride` apart.
    fn alloc(&mut self, count: usize, stride: u32) -> Vec<u32> {
        let chain: Vec<u32> = (0..count as u32).map(|i| self.next_cluster + i * stride).collect();
        for pair in chain.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(last) = chain.last() {
            let eoc = self.eoc();
            self.set_fat(*last, eoc);
            self.next_cluster = last + 1;
        }
        chain
    }

    fn cluster_bytes(&mut self, cluster: u32) -> &mut [u8] {
        let start = self.cluster_lba(cluster) as usize * 512;
        let len = self.bytes_per_cluster();
        &mut self.image[start..start + len]
    }

    fn entry_slot(&mut self, dir: DirId) -> usize {
        let per_cluster = self.bytes_per_cluster() / 32;
        let used = self.dirs[dir.0].used;
        self.dirs[dir.0].used += 1;
        if self.dirs[dir.0].clusters.is_empty() {
            assert!(used < self.root_entries as usize, "root directory full");
            return self.root_dir_sector() as usize * 512 + used * 32;
        }
        let index = used / per_cluster;
        if index == self.dirs[dir.0].clusters.len() {
            let last = *self.dirs[dir.0].clusters.last().expect("cluster");
            let next = self.alloc(1, 1)[0];
            self.set_fat(last, next);
            self.cluster_bytes(next).iter_mut().for_each(|b| *b = 0);
            self.dirs[dir.0].clusters.push(next);
        }
        let cluster = self.dirs[dir.0].clusters[index];
        self.cluster_lba(cluster) as usize * 512 + (used % per_cluster) * 32
    }

    fn put_entry(&mut self, dir: DirId, entry: [u8; 32]) {
        let at = self.entry_slot(dir);
        self.image[at..at + 32].copy_from_slice(&entry);
    }

    fn put_long_name(&mut self, dir: DirId, long: &str, short: &[u8; 11]) {
        for entry in long_name_entries(long, short) {
            self.put_entry(dir, entry);
        }
    }

    pub fn add_label(&mut self, name: &[u8; 11]) {
        self.put_entry(ROOT, short_entry(name, 0x08, 0, 0));
    }

    /// Add a file whose clusters are `stride` apart. Returns its first
    /// cluster.
    pub fn add_file(
        &mut self,
        dir: DirId,
        short: &[u8; 11],
        long: Option<&str>,
        data: &[u8],
        stride: u32,
    ) -> u32 {
        let bpc = self.bytes_per_cluster();
        let count = (data.len() + bpc - 1) / bpc;
        let chain = self.alloc(count, stride);
        for (cluster, chunk) in chain.iter().zip(data.chunks(bpc)) {
            self.cluster_bytes(*cluster)[..chunk.len()].copy_from_slice(chunk);
        }
        let first = chain.first().copied().unwrap_or(0);
        if let Some(long) = long {
            self.put_long_name(dir, long, short);
        }
        self.put_entry(dir, short_entry(short, 0x20, first, data.len() as u32));
        first
    }

    pub fn add_dir(&mut self, parent: DirId, short: &[u8; 11], long: Option<&str>) -> DirId {
        let cluster = self.alloc(1, 1)[0];
        self.cluster_bytes(cluster).iter_mut().for_each(|b| *b = 0);
        let parent_cluster = match parent {
            ROOT if !self.fat32 => 0,
            _ => self.dirs[parent.0].clusters[0],
        };
        if let Some(long) = long {
            self.put_long_name(parent, long, short);
        }
        self.put_entry(parent, short_entry(short, 0x10, cluster, 0));
        let id = DirId(self.dirs.len());
        self.dirs.push(DirState {
            clusters: vec![cluster],
            used: 0,
        });
        self.put_entry(id, short_entry(b".          ", 0x10, cluster, 0));
        self.put_entry(id, short_entry(b"..         ", 0x10, parent_cluster, 0));
        id
    }

    /// Mark the next entry of `dir` as deleted.
    pub fn add_deleted(&mut self, dir: DirId, short: &[u8; 11]) {
        let mut entry = short_entry(short, 0x20, 0, 0);
        entry[0] = 0xE5;
        self.put_entry(dir, entry);
    }
}

pub fn short_entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0..11].copy_from_slice(name);
    entry[11] = attr;
    entry[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    entry[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
    entry
}

fn checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*b))
}

/// The long name entries for `long`, in directory order.
pub fn long_name_entries(long: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    const OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
    let mut units: Vec<u16> = long.encode_utf16().collect();
    if units.len() % 13 != 0 {
        units.push(0);
    }
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }
    let count = units.len() / 13;
    let sum = checksum(short);
    (1..=count)
        .rev()
        .map(|sequence| {
            let mut entry = [0u8; 32];
            entry[0] = sequence as u8 | if sequence == count { 0x40 } else { 0 };
            entry[11] = 0x0F;
            entry[13] = sum;
            let chunk = &units[(sequence - 1) * 13..sequence * 13];
            for (offset, unit) in OFFSETS.iter().zip(chunk) {
                entry[*offset..*offset + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entry
        })
        .collect()
}

/// Bytes that are easy to tell apart by position.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32 * 7 + u32::from(seed) + (i / 512) as u32) as u8)
        .collect()
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

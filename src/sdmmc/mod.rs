//! async-sdmmc - SDMMC Protocol
//!
//! Implements the SD protocol in SPI mode on top of [`Spi`], with sector data
//! moved by two DMA channels.
//!
//! Card bring-up (`init`) is blocking. After that, reads and writes are queued
//! work items: only the head of the queue runs, advancing through its stages
//! from three places: the call that queued it, the DMA interrupt
//! ([`SdCard::on_dma_interrupt`]) and the main loop ([`SdCard::on_idle`]).
//! Nothing blocks for longer than a few SPI bytes once a transfer is queued.

mod command;
pub mod proto;


use core::sync::atomic::AtomicU32;

use embedded_hal::digital::v2::OutputPin;

use crate::block_device::{AsyncBlockDevice, Block, BlockBuf, BlockCount, BlockIdx, BlockReceiver};
use crate::dma::{self, Channel, ChannelPool, DmaChannel, DmaRegisters, MemoryEndpoint, OwnerId};
use crate::queue::{Handle, SlotQueue};
use crate::spi::{Spi, SpiRegisters};

use command::{Delay, Selected};
use proto::*;

#[cfg(feature = "log")]
use log::{debug, info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, trace, warn};

/// How many reads and writes can be queued at once.
pub const QUEUE_DEPTH: usize = 4;

/// Clocked out by the transmit channel while receiving a sector.
static DUMMY_TX: u32 = 0xFFFF_FFFF;

/// Sink for the bytes clocked in while a sector is written.
static DISCARD: AtomicU32 = AtomicU32::new(0);

/// Card bring-up parameters and poll budgets.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdConfig {
    /// Bus clock used until the card is ready, in Hz
    pub init_frequency: u32,
    /// Bus clock used once the card is ready, in Hz
    pub operating_frequency: u32,
    /// Owner id this session registers its DMA channels under
    pub dma_owner: OwnerId,
    /// How many times a command is sent, and how many bytes are polled for
    /// its response
    pub command_attempts: u32,
    /// How long to wait for the card to leave idle or release busy
    pub ready_polls: u32,
    /// How many `on_idle` polls a read waits for its data token
    pub token_polls: u32,
}

impl Default for SdConfig {
    fn default() -> Self {
        SdConfig {
            init_frequency: 25_000,
            operating_frequency: 10_000_000,
            dma_owner: OwnerId(0),
            command_attempts: 32,
            ready_polls: 512,
            token_polls: 512,
        }
    }
}

/// The different types of card we know about.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardClass {
    /// Not initialised, or initialisation failed
    None,
    /// Legacy MMC card, detected but not supported
    Mmc,
    /// Standard capacity, byte addressed
    Sd,
    /// High capacity, sector addressed
    Sdhc,
}

/// Why card bring-up failed. Each stage has its own code.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The card never answered GO_IDLE_STATE with the idle state
    GoIdle,
    /// SEND_IF_COND failed: legacy or MMC card, or a bad echo
    InterfaceCondition,
    /// SEND_OP_COND failed or the card never left idle
    OperatingCondition,
    /// READ_OCR failed, or power up never completed
    ReadOcr,
    /// The card does not support 3.2-3.3V
    UnsupportedVoltage,
    /// SEND_CSD failed
    ReadCsd,
    /// The CSD structure version is not one we know
    UnknownCsdVersion,
    /// SEND_CID failed
    ReadCid,
    /// Couldn't set the chip select pin
    Transport,
}

/// Broad classes of [`InitError`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitErrorKind {
    CommandTimeout,
    UnsupportedCard,
    Transport,
}

impl InitError {
    /// The negative status code for this stage.
    pub fn code(self) -> i32 {
        match self {
            InitError::GoIdle => -1,
            InitError::InterfaceCondition => -2,
            InitError::OperatingCondition => -3,
            InitError::ReadOcr => -4,
            InitError::UnsupportedVoltage => -5,
            InitError::ReadCsd => -6,
            InitError::UnknownCsdVersion => -7,
            InitError::ReadCid => -8,
            InitError::Transport => -9,
        }
    }

    pub fn kind(self) -> InitErrorKind {
        match self {
            InitError::GoIdle
            | InitError::OperatingCondition
            | InitError::ReadOcr
            | InitError::ReadCsd
            | InitError::ReadCid => InitErrorKind::CommandTimeout,
            InitError::InterfaceCondition
            | InitError::UnsupportedVoltage
            | InitError::UnknownCsdVersion => InitErrorKind::UnsupportedCard,
            InitError::Transport => InitErrorKind::Transport,
        }
    }
}

/// The possible errors a queued transfer can complete with.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The card answered a command with error bits set
    CommandRejected(u8),
    /// We didn't get a response when executing this command
    CommandTimeout(u8),
    /// Expected a data token, got this byte
    UnexpectedToken(u8),
    /// The card stayed idle (0xFF) or busy (0x00) for too long
    TokenTimeout,
    /// The card refused a written block with this data response
    WriteRejected(u8),
    /// The DMA engine failed
    Dma(dma::Error),
    /// The work queue is full
    QueueFull,
    /// The card has not been initialised, or is a type we don't drive
    NotInitialized,
    /// The request was empty or ran past the end of the card
    OutOfRange,
    /// Couldn't set a GPIO pin
    Gpio,
}

impl Error {
    /// A non-zero code for this failure. A rejected write reports the raw
    /// data response token; every other code sits above the byte range.
    pub fn code(self) -> i32 {
        match self {
            Error::CommandRejected(_) => 0x101,
            Error::UnexpectedToken(_) => 0x102,
            Error::TokenTimeout => 0x103,
            Error::CommandTimeout(_) => 0x104,
            Error::Dma(_) => 0x105,
            Error::QueueFull => 0x106,
            Error::NotInitialized => 0x107,
            Error::Gpio => 0x108,
            Error::OutOfRange => 0x109,
            Error::WriteRejected(raw) => i32::from(raw),
        }
    }
}

impl From<dma::Error> for Error {
    fn from(e: dma::Error) -> Self {
        Error::Dma(e)
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ReadStage {
    /// Send READ_BLOCK or READ_BLOCKS
    Start,
    /// Poll for the data start token
    WaitToken,
    /// Program the DMA channels for one sector
    Dma,
    /// DMA running; then discard the CRC
    Checksum,
    /// Sector handed to the receiver, waiting for `clean_buffer`
    BufferDirty,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WriteStage {
    /// Send the erase hint and WRITE_BLOCK or WRITE_BLOCKS
    Start,
    /// Send the start token and program the DMA channels
    Dma,
    /// DMA running; then send the CRC
    Checksum,
    /// Poll for the data response token
    WaitResponse,
    /// Poll until the card releases the busy line
    WaitBusy,
    /// Sector acknowledged to the receiver, waiting for `clean_buffer`
    BufferDirty,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Read(ReadStage),
    Write(WriteStage),
}

#[derive(Debug)]
struct WorkItem {
    sector: u32,
    /// Last sector of a multi-sector transfer
    end_sector: Option<u32>,
    buffer: Option<BlockBuf>,
    stage: Stage,
    polls: u32,
}

impl WorkItem {
    fn is_last(&self) -> bool {
        self.end_sector.map_or(true, |end| self.sector >= end)
    }
}

/// What the work loop does after a stage has run.
#[derive(Debug, PartialEq)]
enum Flow {
    /// The stage changed; run the next one now
    Next,
    /// Nothing to do until polled again from `on_idle`
    Yield,
    /// Waiting for the DMA interrupt or `clean_buffer`
    Suspend,
    /// Hand the current buffer to the receiver
    Deliver { last: bool, result: Result<(), Error> },
}

bitflags::bitflags! {
    struct WorkFlags: u8 {
        const RUNNING = (1 << 0);
        const ERROR = (1 << 1);
        const REQ_WORK = (1 << 3);
    }
}

/// An SD card session on an SPI bus, with two DMA channels for sector data.
pub struct SdCard<'p, R, CS, D>
where
    R: SpiRegisters,
    CS: OutputPin,
    D: DmaRegisters,
{
    spi: Spi<R, CS>,
    dma: D,
    tx_dma: DmaChannel<'p>,
    rx_dma: DmaChannel<'p>,
    tx_mem: MemoryEndpoint,
    rx_mem: MemoryEndpoint,
    dma_outstanding: u8,
    dma_failure: Option<dma::Error>,
    card_class: CardClass,
    sector_count: u32,
    csd: Option<Csd>,
    cid: Option<Cid>,
    queue: SlotQueue<WorkItem, QUEUE_DEPTH>,
    flags: WorkFlags,
    config: SdConfig,
}

impl<'p, R, CS, D> SdCard<'p, R, CS, D>
where
    R: SpiRegisters,
    CS: OutputPin,
    D: DmaRegisters,
{
    /// Create a session. The card is not touched until [`SdCard::init`].
    pub fn new(spi: Spi<R, CS>, dma: D, pool: &'p ChannelPool, config: SdConfig) -> Self {
        let mut tx_mem = MemoryEndpoint::empty();
        tx_mem.setup_fixed(&DUMMY_TX);
        SdCard {
            spi,
            dma,
            tx_dma: DmaChannel::new(pool, config.dma_owner),
            rx_dma: DmaChannel::new(pool, config.dma_owner),
            tx_mem,
            rx_mem: MemoryEndpoint::empty(),
            dma_outstanding: 0,
            dma_failure: None,
            card_class: CardClass::None,
            sector_count: 0,
            csd: None,
            cid: None,
            queue: SlotQueue::new(),
            flags: WorkFlags::empty(),
            config,
        }
    }

    fn select(&mut self) -> Result<Selected<'_, R, CS>, Error> {
        Selected::new(&mut self.spi, self.config.command_attempts)
    }

    /// Bring the card up. Blocks, bounded by the configured poll budgets.
    pub fn init(&mut self) -> Result<(), InitError> {
        self.card_class = CardClass::None;
        self.sector_count = 0;
        self.spi.set_frequency(self.config.init_frequency);

        trace!("sd: reset card");
        // Supply minimum of 74 clock cycles without CS asserted.
        self.spi
            .end_transaction()
            .map_err(|_| InitError::Transport)?;
        for _ in 0..10 {
            self.spi.transfer(0xFF);
        }

        self.go_idle()?;
        self.interface_condition()?;
        self.operating_condition()?;
        self.read_ocr()?;

        // card is fully started, now boost frequency
        self.spi.set_frequency(self.config.operating_frequency);

        let csd = self.read_register(CMD9).map_err(|e| Self::init_error(e, InitError::ReadCsd))?;
        let csd = Csd::new(csd);
        self.sector_count = csd.sector_count().ok_or(InitError::UnknownCsdVersion)?;
        self.csd = Some(csd);
        info!(
            "sd: {:?} card, {} sectors ({} MiB)",
            self.card_class,
            self.sector_count,
            self.sector_count / 2048
        );

        let cid = self.read_register(CMD10).map_err(|e| Self::init_error(e, InitError::ReadCid))?;
        let cid = Cid::new(cid);
        info!(
            "sd: MID {} OEM {:?} s/n {} date {}/{}",
            cid.manufacturer_id(),
            cid.oem_id(),
            cid.serial_number(),
            cid.manufacture_month(),
            cid.manufacture_year()
        );
        self.cid = Some(cid);
        Ok(())
    }

    fn init_error(e: Error, stage: InitError) -> InitError {
        match e {
            Error::Gpio => InitError::Transport,
            _ => stage,
        }
    }

    fn go_idle(&mut self) -> Result<(), InitError> {
        for attempt in 0..self.config.command_attempts {
            let mut s = self.select().map_err(|_| InitError::Transport)?;
            match s.command(CMD0, 0) {
                Ok(R1_IDLE_STATE) => return Ok(()),
                Ok(r) => trace!("sd: GO_IDLE attempt {} got {:x}", attempt, r),
                Err(_) => trace!("sd: GO_IDLE attempt {} timed out", attempt),
            }
        }
        Err(InitError::GoIdle)
    }

    fn interface_condition(&mut self) -> Result<(), InitError> {
        let mut s = self.select().map_err(|_| InitError::Transport)?;
        let r = s
            .command(CMD8, IF_COND_PATTERN)
            .map_err(|e| Self::init_error(e, InitError::InterfaceCondition))?;
        if r & R1_IF_COND_ERROR_MASK != 0 {
            return Err(InitError::InterfaceCondition);
        }
        if r & R1_ILLEGAL_COMMAND != 0 {
            drop(s);
            // Legacy cards have no interface condition. Not supported.
            self.card_class = CardClass::Mmc;
            warn!("sd: SEND_IF_COND illegal, legacy or MMC card");
            return Err(InitError::InterfaceCondition);
        }
        let mut echo = [0u8; 4];
        s.response(&mut echo)
            .map_err(|e| Self::init_error(e, InitError::InterfaceCondition))?;
        if u32::from_be_bytes(echo) & 0xFFF != IF_COND_PATTERN || r != R1_IDLE_STATE {
            return Err(InitError::InterfaceCondition);
        }
        Ok(())
    }

    fn operating_condition(&mut self) -> Result<(), InitError> {
        let mut delay = Delay::new(self.config.ready_polls);
        loop {
            let mut s = self.select().map_err(|_| InitError::Transport)?;
            let r = s
                .acommand(ACMD41, OCR_HIGH_CAPACITY)
                .map_err(|e| Self::init_error(e, InitError::OperatingCondition))?;
            if r & R1_ERROR_MASK != 0 {
                return Err(InitError::OperatingCondition);
            }
            if r == R1_READY_STATE {
                return Ok(());
            }
            delay.delay(InitError::OperatingCondition)?;
        }
    }

    fn read_ocr(&mut self) -> Result<(), InitError> {
        let mut delay = Delay::new(self.config.ready_polls);
        loop {
            let mut s = self.select().map_err(|_| InitError::Transport)?;
            let r = s
                .command(CMD58, 0)
                .map_err(|e| Self::init_error(e, InitError::ReadOcr))?;
            if r & R1_ERROR_MASK != 0 {
                return Err(InitError::ReadOcr);
            }
            let mut ocr = [0u8; 4];
            s.response(&mut ocr)
                .map_err(|e| Self::init_error(e, InitError::ReadOcr))?;
            drop(s);
            let ocr = u32::from_be_bytes(ocr);
            if ocr & OCR_VDD_32_33 == 0 {
                warn!("sd: OCR {:x} lacks 3.2-3.3V", ocr);
                return Err(InitError::UnsupportedVoltage);
            }
            self.card_class = if ocr & OCR_HIGH_CAPACITY != 0 {
                CardClass::Sdhc
            } else {
                CardClass::Sd
            };
            if ocr & OCR_POWER_UP != 0 {
                debug!("sd: card class {:?}", self.card_class);
                return Ok(());
            }
            delay.delay(InitError::ReadOcr)?;
        }
    }

    fn read_register(&mut self, command: u8) -> Result<[u8; 16], Error> {
        let mut s = self.select()?;
        let r = s.command(command, 0)?;
        if r & R1_ERROR_MASK != 0 {
            return Err(Error::CommandRejected(r));
        }
        let mut data = [0u8; 16];
        s.data(&mut data)?;
        Ok(data)
    }

    pub fn card_class(&self) -> CardClass {
        self.card_class
    }

    /// Total number of 512-byte sectors, zero before `init`.
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&self) -> u64 {
        u64::from(self.sector_count) * Block::LEN as u64
    }

    pub fn csd(&self) -> Option<&Csd> {
        self.csd.as_ref()
    }

    /// Card identification, read at the end of `init`.
    pub fn cid(&self) -> Option<&Cid> {
        self.cid.as_ref()
    }

    pub fn spi(&self) -> &Spi<R, CS> {
        &self.spi
    }

    pub fn dma_owner(&self) -> OwnerId {
        self.config.dma_owner
    }

    /// Number of queued transfers, including the one in progress.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Did the last transfer to finish fail?
    pub fn has_error(&self) -> bool {
        self.flags.contains(WorkFlags::ERROR)
    }

    /// Translate a sector index into a command argument for this card.
    fn address(&self, sector: u32) -> Result<u32, Error> {
        match self.card_class {
            CardClass::Sdhc => Ok(sector),
            CardClass::Sd => Ok(sector << 9),
            CardClass::None | CardClass::Mmc => Err(Error::NotInitialized),
        }
    }

    fn enqueue<Rx>(
        &mut self,
        stage: Stage,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        receiver: &mut Rx,
    ) -> Result<(), (Error, BlockBuf)>
    where
        Rx: BlockReceiver<Self>,
    {
        if self.address(start.0).is_err() {
            return Err((Error::NotInitialized, buffer));
        }
        let end = match start.0.checked_add(count.0) {
            Some(end) if count.0 > 0 && end <= self.sector_count => end,
            _ => {
                warn!(
                    "sd: rejected {} sectors at {}, card has {}",
                    count.0, start.0, self.sector_count
                );
                return Err((Error::OutOfRange, buffer));
            }
        };
        let item = WorkItem {
            sector: start.0,
            end_sector: if count.0 > 1 { Some(end - 1) } else { None },
            buffer: None,
            stage,
            polls: 0,
        };
        let handle = match self.queue.insert(item) {
            Ok(handle) => handle,
            Err(_) => return Err((Error::QueueFull, buffer)),
        };
        match self.queue.get_mut(handle) {
            Some(item) => item.buffer = Some(buffer),
            None => return Err((Error::QueueFull, buffer)),
        }
        let idle = self.queue.is_empty();
        self.queue.push_back(handle);
        debug!(
            "sd: queued {:?} of {} sectors at {}, {} pending",
            stage,
            count.0,
            start.0,
            self.queue.len()
        );
        if idle {
            self.work(receiver);
        }
        Ok(())
    }

    /// Call from the main loop: resumes a transfer that is polling the card
    /// and frees finished work items.
    pub fn on_idle<Rx>(&mut self, receiver: &mut Rx)
    where
        Rx: BlockReceiver<Self>,
    {
        if self
            .flags
            .contains(WorkFlags::RUNNING | WorkFlags::REQ_WORK)
        {
            self.work(receiver);
        }
        self.queue.collect_garbage();
    }

    /// Call when the DMA vector routes `channel` to this session.
    pub fn on_dma_interrupt<Rx>(&mut self, channel: Channel, receiver: &mut Rx)
    where
        Rx: BlockReceiver<Self>,
    {
        let result = if self.rx_dma.channel() == Some(channel) {
            self.rx_dma.isr(&self.dma, &mut self.spi, &mut self.rx_mem)
        } else if self.tx_dma.channel() == Some(channel) {
            self.tx_dma.isr(&self.dma, &mut self.tx_mem, &mut self.spi)
        } else {
            warn!("sd: interrupt for foreign dma channel {}", channel.0);
            self.dma.clear(channel);
            return;
        };
        if let Err(e) = result {
            self.dma_failure = Some(e);
        }
        self.dma_outstanding = self.dma_outstanding.saturating_sub(1);
        if self.dma_outstanding == 0 {
            trace!("sd: sector dma complete");
            self.work(receiver);
        }
    }

    fn work<Rx>(&mut self, receiver: &mut Rx)
    where
        Rx: BlockReceiver<Self>,
    {
        self.flags.remove(WorkFlags::REQ_WORK);
        while let Some(handle) = self.queue.head() {
            self.flags.insert(WorkFlags::RUNNING);
            match self.advance(handle) {
                Flow::Next => {}
                Flow::Yield => {
                    self.flags.insert(WorkFlags::REQ_WORK);
                    return;
                }
                Flow::Suspend => return,
                Flow::Deliver { last, result } => {
                    self.deliver(handle, last, result, receiver);
                    return;
                }
            }
        }
        self.flags.remove(WorkFlags::RUNNING | WorkFlags::REQ_WORK);
    }

    fn advance(&mut self, handle: Handle) -> Flow {
        let stage = match self.queue.get(handle) {
            Some(item) => item.stage,
            None => return Flow::Suspend,
        };
        trace!("sd: advance {:?}", stage);
        let flow = match stage {
            Stage::Read(stage) => self.advance_read(handle, stage),
            Stage::Write(stage) => self.advance_write(handle, stage),
        };
        match flow {
            Ok(flow) => flow,
            Err(e) => {
                self.abort(handle, e);
                Flow::Deliver {
                    last: true,
                    result: Err(e),
                }
            }
        }
    }

    fn set_stage(&mut self, handle: Handle, stage: Stage) {
        if let Some(item) = self.queue.get_mut(handle) {
            item.stage = stage;
            item.polls = 0;
        }
    }

    /// Count one more poll against `budget`.
    fn poll(&mut self, handle: Handle, budget: u32) -> Result<Flow, Error> {
        match self.queue.get_mut(handle) {
            Some(item) if item.polls < budget => {
                item.polls += 1;
                Ok(Flow::Yield)
            }
            _ => Err(Error::TokenTimeout),
        }
    }

    fn item(&self, handle: Handle) -> Result<&WorkItem, Error> {
        self.queue.get(handle).ok_or(Error::NotInitialized)
    }

    fn advance_read(&mut self, handle: Handle, stage: ReadStage) -> Result<Flow, Error> {
        match stage {
            ReadStage::Start => {
                self.flags.remove(WorkFlags::ERROR);
                let (sector, multi) = {
                    let item = self.item(handle)?;
                    (item.sector, item.end_sector.is_some())
                };
                let address = self.address(sector)?;
                let command = if multi { CMD18 } else { CMD17 };
                let mut s = self.select()?;
                let r = s.command(command, address)?;
                s.keep();
                if r & R1_ERROR_MASK != 0 {
                    return Err(Error::CommandRejected(r));
                }
                self.set_stage(handle, Stage::Read(ReadStage::WaitToken));
                Ok(Flow::Next)
            }
            ReadStage::WaitToken => match self.spi.transfer(0xFF) {
                DATA_START_BLOCK => {
                    self.set_stage(handle, Stage::Read(ReadStage::Dma));
                    Ok(Flow::Next)
                }
                0xFF => self.poll(handle, self.config.token_polls),
                other => Err(Error::UnexpectedToken(other)),
            },
            ReadStage::Dma => {
                self.start_dma(handle, false)?;
                self.set_stage(handle, Stage::Read(ReadStage::Checksum));
                Ok(Flow::Suspend)
            }
            ReadStage::Checksum => {
                if self.dma_outstanding > 0 {
                    return Ok(Flow::Suspend);
                }
                if let Some(e) = self.dma_failure.take() {
                    return Err(Error::Dma(e));
                }
                self.spi.transfer(0xFF);
                self.spi.transfer(0xFF);

                let (last, multi) = {
                    let item = self.item(handle)?;
                    (item.is_last(), item.end_sector.is_some())
                };
                if !last {
                    self.set_stage(handle, Stage::Read(ReadStage::BufferDirty));
                    return Ok(Flow::Deliver {
                        last: false,
                        result: Ok(()),
                    });
                }
                if multi {
                    self.stop_transmission()?;
                }
                self.end_transaction()?;
                Ok(Flow::Deliver {
                    last: true,
                    result: Ok(()),
                })
            }
            ReadStage::BufferDirty => Ok(Flow::Suspend),
        }
    }

    fn advance_write(&mut self, handle: Handle, stage: WriteStage) -> Result<Flow, Error> {
        match stage {
            WriteStage::Start => {
                self.flags.remove(WorkFlags::ERROR);
                let (sector, end_sector) = {
                    let item = self.item(handle)?;
                    (item.sector, item.end_sector)
                };
                let address = self.address(sector)?;
                let mut s = self.select()?;
                let command = match end_sector {
                    Some(end) => {
                        let r = s.acommand(ACMD23, end - sector + 1)?;
                        if r & R1_ERROR_MASK != 0 {
                            return Err(Error::CommandRejected(r));
                        }
                        CMD25
                    }
                    None => CMD24,
                };
                let r = s.command(command, address)?;
                s.keep();
                if r & R1_ERROR_MASK != 0 {
                    return Err(Error::CommandRejected(r));
                }
                self.set_stage(handle, Stage::Write(WriteStage::Dma));
                Ok(Flow::Next)
            }
            WriteStage::Dma => {
                let token = match self.item(handle)?.end_sector {
                    Some(_) => WRITE_MULTIPLE_TOKEN,
                    None => DATA_START_BLOCK,
                };
                self.spi.transfer(0xFF);
                self.spi.transfer(token);
                self.start_dma(handle, true)?;
                self.set_stage(handle, Stage::Write(WriteStage::Checksum));
                Ok(Flow::Suspend)
            }
            WriteStage::Checksum => {
                if self.dma_outstanding > 0 {
                    return Ok(Flow::Suspend);
                }
                if let Some(e) = self.dma_failure.take() {
                    return Err(Error::Dma(e));
                }
                self.spi.transfer(0xFF);
                self.spi.transfer(0xFF);
                self.set_stage(handle, Stage::Write(WriteStage::WaitResponse));
                Ok(Flow::Next)
            }
            WriteStage::WaitResponse => {
                let r = self.spi.transfer(0xFF);
                if r == 0xFF {
                    return self.poll(handle, self.config.token_polls);
                }
                if r & DATA_RES_MASK != DATA_RES_ACCEPTED {
                    warn!("sd: write rejected with {:x}", r);
                    return Err(Error::WriteRejected(r));
                }
                self.set_stage(handle, Stage::Write(WriteStage::WaitBusy));
                Ok(Flow::Next)
            }
            WriteStage::WaitBusy => {
                if self.spi.transfer(0xFF) == 0x00 {
                    return self.poll(handle, self.config.ready_polls);
                }
                let (last, multi) = {
                    let item = self.item(handle)?;
                    (item.is_last(), item.end_sector.is_some())
                };
                if !last {
                    self.set_stage(handle, Stage::Write(WriteStage::BufferDirty));
                    return Ok(Flow::Deliver {
                        last: false,
                        result: Ok(()),
                    });
                }
                if multi {
                    self.spi.transfer(STOP_TRAN_TOKEN);
                    let polls = self.config.ready_polls;
                    let mut s = self.select()?;
                    // stuff byte, then busy until programming finishes
                    s.receive();
                    s.wait_not_busy(polls)?;
                } else {
                    self.end_transaction()?;
                }
                Ok(Flow::Deliver {
                    last: true,
                    result: Ok(()),
                })
            }
            WriteStage::BufferDirty => Ok(Flow::Suspend),
        }
    }

    fn end_transaction(&mut self) -> Result<(), Error> {
        self.spi.end_transaction().map_err(|_| Error::Gpio)
    }

    fn stop_transmission(&mut self) -> Result<(), Error> {
        let mut s = self.select()?;
        let r = s.command(CMD12, 0)?;
        if r & R1_ERROR_MASK != 0 {
            return Err(Error::CommandRejected(r));
        }
        Ok(())
    }

    /// Program both channels for one sector: receive into the buffer while
    /// clocking 0xFF out, or send the buffer while discarding what comes
    /// back.
    fn start_dma(&mut self, handle: Handle, write: bool) -> Result<(), Error> {
        let address = match self.queue.get(handle).and_then(|item| item.buffer.as_ref()) {
            Some(buffer) => buffer.contents.as_ptr(),
            None => return Err(Error::Dma(dma::Error::NotAllocated)),
        };
        if write {
            self.tx_mem.setup(address, Block::LEN);
            self.rx_mem.setup_fixed(DISCARD.as_ptr());
        } else {
            self.tx_mem.setup_fixed(&DUMMY_TX);
            self.rx_mem.setup(address, Block::LEN);
        }

        self.rx_dma
            .setup(&self.dma, &self.spi, &self.rx_mem, Block::LEN_U32)?;
        if let Err(e) = self
            .tx_dma
            .setup(&self.dma, &self.tx_mem, &self.spi, Block::LEN_U32)
        {
            self.rx_dma.release();
            return Err(e.into());
        }

        self.dma_failure = None;
        self.dma_outstanding = 2;
        // Receive first, so nothing clocked in is missed.
        self.rx_dma
            .begin(&self.dma, &mut self.spi, &mut self.rx_mem)?;
        self.tx_dma
            .begin(&self.dma, &mut self.tx_mem, &mut self.spi)?;
        Ok(())
    }

    /// Leave the card in a sane state after a failed stage.
    fn abort(&mut self, handle: Handle, error: Error) {
        self.flags.insert(WorkFlags::ERROR);
        let started = match self.queue.get(handle) {
            Some(item) => !matches!(
                item.stage,
                Stage::Read(ReadStage::Start) | Stage::Write(WriteStage::Start)
            ),
            None => false,
        };
        let multi = self
            .queue
            .get(handle)
            .map_or(false, |item| item.end_sector.is_some());
        let rejected = matches!(error, Error::WriteRejected(_));
        if started && (multi || rejected) {
            if let Err(e) = self.stop_transmission() {
                warn!("sd: stop after failure: {:?}", e);
            }
        }
        self.spi.end_transaction().ok();
    }

    /// Hand the head item's buffer to the receiver. A finished item is
    /// popped and recycled first so the callback may queue more work.
    fn deliver<Rx>(&mut self, handle: Handle, last: bool, result: Result<(), Error>, receiver: &mut Rx)
    where
        Rx: BlockReceiver<Self>,
    {
        let (stage, sector, buffer) = match self.queue.get_mut(handle) {
            Some(item) => (item.stage, item.sector, item.buffer.take()),
            None => return,
        };
        if last {
            self.queue.pop_front();
            self.queue.retire(handle);
            if self.queue.is_empty() {
                self.flags
                    .remove(WorkFlags::RUNNING | WorkFlags::REQ_WORK);
            } else {
                self.flags.insert(WorkFlags::REQ_WORK);
            }
        }
        if let Err(e) = result {
            warn!("sd: transfer at sector {} failed: {:?}", sector, e);
        }
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                warn!("sd: work item at sector {} lost its buffer", sector);
                return;
            }
        };
        match stage {
            Stage::Read(_) => receiver.sd_read_complete(self, BlockIdx(sector), buffer, result),
            Stage::Write(_) => receiver.sd_write_complete(self, BlockIdx(sector), buffer, result),
        }
    }
}

impl<'p, R, CS, D> AsyncBlockDevice for SdCard<'p, R, CS, D>
where
    R: SpiRegisters,
    CS: OutputPin,
    D: DmaRegisters,
{
    type Error = Error;

    /// Queue a read of one or more sectors. A multi-sector read delivers each
    /// sector separately and waits for `clean_buffer` in between.
    fn begin_read<Rx>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        receiver: &mut Rx,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        Rx: BlockReceiver<Self>,
    {
        self.enqueue(Stage::Read(ReadStage::Start), start, count, buffer, receiver)
    }

    /// Queue a write of one or more sectors. After each sector of a
    /// multi-sector write is acknowledged, refill the buffer and return it
    /// with `clean_buffer`.
    fn begin_write<Rx>(
        &mut self,
        start: BlockIdx,
        count: BlockCount,
        buffer: BlockBuf,
        receiver: &mut Rx,
    ) -> Result<(), (Self::Error, BlockBuf)>
    where
        Rx: BlockReceiver<Self>,
    {
        self.enqueue(Stage::Write(WriteStage::Start), start, count, buffer, receiver)
    }

    fn clean_buffer<Rx>(&mut self, buffer: BlockBuf, receiver: &mut Rx) -> Result<(), BlockBuf>
    where
        Rx: BlockReceiver<Self>,
    {
        let head = match self.queue.head() {
            Some(head) => head,
            None => return Err(buffer),
        };
        let item = match self.queue.get_mut(head) {
            Some(item) => item,
            None => return Err(buffer),
        };
        let next = match item.stage {
            Stage::Read(ReadStage::BufferDirty) => Stage::Read(ReadStage::WaitToken),
            Stage::Write(WriteStage::BufferDirty) => Stage::Write(WriteStage::Dma),
            _ => return Err(buffer),
        };
        item.sector += 1;
        item.buffer = Some(buffer);
        item.stage = next;
        item.polls = 0;
        trace!("sd: buffer clean, continuing at sector {}", item.sector);
        self.work(receiver);
        Ok(())
    }

    fn num_blocks(&self) -> BlockCount {
        BlockCount(self.sector_count)
    }
}

impl<'p, R, CS, D> core::fmt::Debug for SdCard<'p, R, CS, D>
where
    R: SpiRegisters,
    CS: OutputPin,
    D: DmaRegisters,
{
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        fmt.debug_struct("SdCard")
            .field("card_class", &self.card_class)
            .field("sector_count", &self.sector_count)
            .field("pending", &self.queue.len())
            .finish()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

//! async-sdmmc - DMA Channel Engine
//!
//! A small pool of one-shot hardware channels. Each transfer binds a source
//! and a destination [`DmaEndpoint`], is programmed from what the endpoints
//! report about themselves, and completes through an interrupt routed by
//! [`ChannelPool::dispatch`].


use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// How many hardware channels the controller has.
pub const CHANNEL_COUNT: usize = 8;

const NO_OWNER: u8 = 0xFF;

/// The possible errors the DMA engine can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every channel in the pool is in use
    ChannelExhausted,
    /// The operation needs a channel but none has been set up
    NotAllocated,
    /// The controller flagged an error on this channel
    TransferFailed,
    /// The channel is disabled but still has data left to move
    InconsistentState,
}

/// Index of a hardware channel.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Channel(pub u8);

impl Channel {
    fn mask(self) -> u8 {
        1 << self.0
    }
}

/// Identifies whoever allocated a channel, so the shared interrupt vector
/// can route completions back to it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OwnerId(pub u8);

/// Which side of a transfer an endpoint sits on.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Source,
    Destination,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Memory,
    Peripheral { request_line: u8 },
}

/// Width of a single DMA beat.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    Byte,
    HalfWord,
    Word,
}

/// Beats per burst request.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Burst {
    One,
    Four,
    Eight,
    Sixteen,
}

/// What an endpoint reports when asked to take part in a transfer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub address: usize,
    pub width: Width,
    pub burst: Burst,
    pub increment: bool,
}

/// Transfer type, derived from the kinds of both endpoints.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowControl {
    MemoryToMemory,
    MemoryToPeripheral,
    PeripheralToMemory,
    PeripheralToPeripheral,
}

impl FlowControl {
    fn between(source: EndpointKind, destination: EndpointKind) -> FlowControl {
        match (source, destination) {
            (EndpointKind::Memory, EndpointKind::Memory) => FlowControl::MemoryToMemory,
            (EndpointKind::Memory, EndpointKind::Peripheral { .. }) => {
                FlowControl::MemoryToPeripheral
            }
            (EndpointKind::Peripheral { .. }, EndpointKind::Memory) => {
                FlowControl::PeripheralToMemory
            }
            (EndpointKind::Peripheral { .. }, EndpointKind::Peripheral { .. }) => {
                FlowControl::PeripheralToPeripheral
            }
        }
    }
}

/// Everything the controller needs to run one transfer on one channel.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelProgram {
    pub flow: FlowControl,
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    /// Number of beats to move
    pub size: u32,
}

/// Something a DMA channel can read from or write to.
pub trait DmaEndpoint {
    /// Describe this endpoint for a transfer where it plays `direction`.
    fn configure(&self, direction: Direction) -> EndpointConfig;
    /// Called just before the channel is enabled.
    fn on_dma_begin(&mut self, direction: Direction);
    /// Called from the channel interrupt once the transfer has finished.
    fn on_dma_complete(&mut self, direction: Direction);
}

/// A plain memory buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryEndpoint {
    pub address: usize,
    pub len: usize,
    pub increment: bool,
}

impl MemoryEndpoint {
    pub const fn empty() -> MemoryEndpoint {
        MemoryEndpoint {
            address: 0,
            len: 0,
            increment: true,
        }
    }

    /// Point at a byte buffer, walking forwards through it.
    pub fn setup(&mut self, buffer: *const u8, len: usize) {
        self.address = buffer as usize;
        self.len = len;
        self.increment = true;
    }

    /// Point at a single fixed word which is read or written repeatedly.
    pub fn setup_fixed(&mut self, word: *const u32) {
        self.address = word as usize;
        self.len = 4;
        self.increment = false;
    }
}

impl DmaEndpoint for MemoryEndpoint {
    fn configure(&self, _direction: Direction) -> EndpointConfig {
        EndpointConfig {
            kind: EndpointKind::Memory,
            address: self.address,
            width: Width::Byte,
            burst: Burst::One,
            increment: self.increment,
        }
    }

    fn on_dma_begin(&mut self, _direction: Direction) {}

    fn on_dma_complete(&mut self, _direction: Direction) {}
}

/// The DMA controller's registers. Methods take `&self` because they stand
/// for memory-mapped hardware.
pub trait DmaRegisters {
    /// Write the source, destination and control words for a channel.
    fn program(&self, channel: Channel, program: &ChannelProgram);
    /// Set the channel enable bit.
    fn write_enable(&self, channel: Channel);
    /// Read back the channel enable bit.
    fn is_enabled(&self, channel: Channel) -> bool;
    /// Beats left to move on this channel.
    fn remaining(&self, channel: Channel) -> u32;
    /// Bitmap of channels with a terminal-count interrupt pending.
    fn pending(&self) -> u8;
    /// Bitmap of channels with an error interrupt pending.
    fn errors(&self) -> u8;
    /// Clear the terminal-count and error flags of a channel.
    fn clear(&self, channel: Channel);
}

impl<T> DmaRegisters for &T
where
    T: DmaRegisters,
{
    fn program(&self, channel: Channel, program: &ChannelProgram) {
        T::program(self, channel, program)
    }

    fn write_enable(&self, channel: Channel) {
        T::write_enable(self, channel)
    }

    fn is_enabled(&self, channel: Channel) -> bool {
        T::is_enabled(self, channel)
    }

    fn remaining(&self, channel: Channel) -> u32 {
        T::remaining(self, channel)
    }

    fn pending(&self) -> u8 {
        T::pending(self)
    }

    fn errors(&self) -> u8 {
        T::errors(self)
    }

    fn clear(&self, channel: Channel) {
        T::clear(self, channel)
    }
}

/// The shared channel bitmap plus the owner registered for each channel.
///
/// Usually lives in a `static` so the interrupt handler can reach it.
pub struct ChannelPool {
    allocated: AtomicU8,
    owners: [AtomicU8; CHANNEL_COUNT],
}

impl ChannelPool {
    #[allow(clippy::declare_interior_mutable_const)]
    const UNOWNED: AtomicU8 = AtomicU8::new(NO_OWNER);

    pub const fn new() -> ChannelPool {
        ChannelPool {
            allocated: AtomicU8::new(0),
            owners: [Self::UNOWNED; CHANNEL_COUNT],
        }
    }

    /// Claim the lowest free channel for `owner`.
    pub fn allocate(&self, owner: OwnerId) -> Result<Channel, Error> {
        let previous = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let index = bits.trailing_ones();
                if index as usize >= CHANNEL_COUNT {
                    None
                } else {
                    Some(bits | (1 << index))
                }
            })
            .map_err(|_| Error::ChannelExhausted)?;
        let channel = Channel(previous.trailing_ones() as u8);
        self.owners[usize::from(channel.0)].store(owner.0, Ordering::Release);
        debug!("dma: channel {} allocated to {}", channel.0, owner.0);
        Ok(channel)
    }

    /// Put a channel back into the pool.
    pub fn release(&self, channel: Channel) {
        self.owners[usize::from(channel.0)].store(NO_OWNER, Ordering::Release);
        self.allocated.fetch_and(!channel.mask(), Ordering::AcqRel);
        trace!("dma: channel {} released", channel.0);
    }

    pub fn is_allocated(&self, channel: Channel) -> bool {
        self.allocated.load(Ordering::Acquire) & channel.mask() != 0
    }

    /// Who holds this channel, if anyone.
    pub fn owner(&self, channel: Channel) -> Option<OwnerId> {
        if !self.is_allocated(channel) {
            return None;
        }
        match self.owners[usize::from(channel.0)].load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(OwnerId(id)),
        }
    }

    /// Number of channels currently claimed.
    pub fn in_use(&self) -> u32 {
        self.allocated.load(Ordering::Acquire).count_ones()
    }

    /// Route every pending channel interrupt to its registered owner. Call
    /// this from the shared DMA vector.
    ///
    /// Interrupts on channels nobody owns are cleared and dropped.
    pub fn dispatch<R, F>(&self, regs: &R, mut handler: F)
    where
        R: DmaRegisters,
        F: FnMut(Channel, OwnerId),
    {
        let pending = regs.pending() | regs.errors();
        for index in 0..CHANNEL_COUNT as u8 {
            let channel = Channel(index);
            if pending & channel.mask() == 0 {
                continue;
            }
            match self.owner(channel) {
                Some(owner) => handler(channel, owner),
                None => {
                    warn!("dma: interrupt on unowned channel {}", index);
                    regs.clear(channel);
                }
            }
        }
    }
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One transfer slot, bound to a pool. The hardware channel is claimed on
/// the first [`DmaChannel::setup`] and given back by [`DmaChannel::isr`].
pub struct DmaChannel<'p> {
    pool: &'p ChannelPool,
    channel: Option<Channel>,
    owner: OwnerId,
}

impl<'p> DmaChannel<'p> {
    pub fn new(pool: &'p ChannelPool, owner: OwnerId) -> DmaChannel<'p> {
        DmaChannel {
            pool,
            channel: None,
            owner,
        }
    }

    /// The hardware channel currently held, if any.
    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    /// Give the channel back without waiting for an interrupt. Only for a
    /// channel that was set up but never begun.
    pub fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.release(channel);
        }
    }

    /// Program a transfer of `size` beats from `source` to `destination`.
    pub fn setup<R, S, D>(
        &mut self,
        regs: &R,
        source: &S,
        destination: &D,
        size: u32,
    ) -> Result<Channel, Error>
    where
        R: DmaRegisters,
        S: DmaEndpoint + ?Sized,
        D: DmaEndpoint + ?Sized,
    {
        let channel = match self.channel {
            Some(channel) => channel,
            None => {
                let channel = self.pool.allocate(self.owner)?;
                self.channel = Some(channel);
                channel
            }
        };

        let source = source.configure(Direction::Source);
        let destination = destination.configure(Direction::Destination);
        let program = ChannelProgram {
            flow: FlowControl::between(source.kind, destination.kind),
            source,
            destination,
            size,
        };
        trace!("dma: channel {} setup {:?}", channel.0, program.flow);
        regs.clear(channel);
        regs.program(channel, &program);
        Ok(channel)
    }

    /// Tell both endpoints the transfer is starting, then enable the channel.
    pub fn begin<R, S, D>(&mut self, regs: &R, source: &mut S, destination: &mut D) -> Result<(), Error>
    where
        R: DmaRegisters,
        S: DmaEndpoint + ?Sized,
        D: DmaEndpoint + ?Sized,
    {
        let channel = self.channel.ok_or(Error::NotAllocated)?;
        source.on_dma_begin(Direction::Source);
        destination.on_dma_begin(Direction::Destination);
        // The enable bit does not always stick on the first write.
        loop {
            regs.write_enable(channel);
            if regs.is_enabled(channel) || regs.pending() & channel.mask() != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Beats left while the transfer is active, zero when idle.
    pub fn running<R>(&self, regs: &R) -> Result<u32, Error>
    where
        R: DmaRegisters,
    {
        let channel = match self.channel {
            Some(channel) => channel,
            None => return Ok(0),
        };
        let remaining = regs.remaining(channel);
        if regs.is_enabled(channel) {
            Ok(remaining)
        } else if remaining != 0 && regs.pending() & channel.mask() == 0 {
            Err(Error::InconsistentState)
        } else {
            Ok(0)
        }
    }

    /// Handle this channel's interrupt: clear its flags, notify both
    /// endpoints and return the channel to the pool.
    pub fn isr<R, S, D>(&mut self, regs: &R, source: &mut S, destination: &mut D) -> Result<(), Error>
    where
        R: DmaRegisters,
        S: DmaEndpoint + ?Sized,
        D: DmaEndpoint + ?Sized,
    {
        let channel = self.channel.take().ok_or(Error::NotAllocated)?;
        let failed = regs.errors() & channel.mask() != 0;
        regs.clear(channel);
        source.on_dma_complete(Direction::Source);
        destination.on_dma_complete(Direction::Destination);
        self.pool.release(channel);
        if failed {
            warn!("dma: channel {} reported an error", channel.0);
            Err(Error::TransferFailed)
        } else {
            Ok(())
        }
    }
}

impl<'p> core::fmt::Debug for DmaChannel<'p> {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        fmt.debug_struct("DmaChannel")
            .field("channel", &self.channel)
            .field("owner", &self.owner)
            .finish()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

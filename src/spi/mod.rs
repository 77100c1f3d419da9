//! async-sdmmc - SPI Transport
//!
//! A polled, byte-oriented SPI master which can also hand its data register
//! to the DMA engine for block transfers.


use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::digital::v2::OutputPin;

use crate::dma::{Burst, Direction, DmaEndpoint, EndpointConfig, EndpointKind, Width};

#[cfg(feature = "log")]
use log::{debug, trace};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace};

/// Largest number of frames pushed before draining the receive FIFO.
const FIFO_DEPTH: usize = 8;

bitflags::bitflags! {
    /// SPI status register.
    pub struct Status: u8 {
        /// Transmit FIFO empty
        const TFE = (1 << 0);
        /// Transmit FIFO not full
        const TNF = (1 << 1);
        /// Receive FIFO not empty
        const RNE = (1 << 2);
        /// Receive FIFO full
        const RFF = (1 << 3);
        /// Busy shifting a frame
        const BSY = (1 << 4);
    }
}

bitflags::bitflags! {
    /// SPI DMA control register.
    pub struct DmaEnable: u8 {
        const RX = (1 << 0);
        const TX = (1 << 1);
    }
}

/// The possible errors `Spi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Couldn't set the chip select pin
    Gpio,
}

/// The SPI peripheral's registers. Methods take `&self` because they stand
/// for memory-mapped hardware.
pub trait SpiRegisters {
    fn status(&self) -> Status;
    fn write_data(&self, byte: u8);
    fn read_data(&self) -> u8;
    /// Program the clock prescaler and the serial clock rate divider.
    fn set_clock(&self, prescaler: u8, serial_clock_rate: u8);
    /// Clock feeding the peripheral, in Hz.
    fn peripheral_clock(&self) -> u32;
    fn dma_enable(&self) -> DmaEnable;
    fn set_dma_enable(&self, enable: DmaEnable);
    /// Bus address of the data register, for the DMA controller.
    fn data_register_address(&self) -> usize;
    /// DMA request line serving this peripheral in the given role.
    fn dma_request_line(&self, direction: Direction) -> u8;
    /// Sleep until something interesting happens. Spinning is fine too.
    fn wait_for_interrupt(&self) {}
}

impl<T> SpiRegisters for &T
where
    T: SpiRegisters,
{
    fn status(&self) -> Status {
        T::status(self)
    }

    fn write_data(&self, byte: u8) {
        T::write_data(self, byte)
    }

    fn read_data(&self) -> u8 {
        T::read_data(self)
    }

    fn set_clock(&self, prescaler: u8, serial_clock_rate: u8) {
        T::set_clock(self, prescaler, serial_clock_rate)
    }

    fn peripheral_clock(&self) -> u32 {
        T::peripheral_clock(self)
    }

    fn dma_enable(&self) -> DmaEnable {
        T::dma_enable(self)
    }

    fn set_dma_enable(&self, enable: DmaEnable) {
        T::set_dma_enable(self, enable)
    }

    fn data_register_address(&self) -> usize {
        T::data_register_address(self)
    }

    fn dma_request_line(&self, direction: Direction) -> u8 {
        T::dma_request_line(self, direction)
    }

    fn wait_for_interrupt(&self) {
        T::wait_for_interrupt(self)
    }
}

/// An SPI master with its own chip select line.
///
/// While a DMA transfer owns the data register the blocking calls wait.
pub struct Spi<R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    regs: R,
    cs: CS,
    dma_locked: AtomicBool,
}

impl<R, CS> Spi<R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    /// Wrap the peripheral. Chip select starts deasserted and no DMA request
    /// is enabled.
    pub fn new(regs: R, mut cs: CS) -> Result<Self, Error> {
        cs.set_high().map_err(|_| Error::Gpio)?;
        regs.set_dma_enable(DmaEnable::empty());
        Ok(Spi {
            regs,
            cs,
            dma_locked: AtomicBool::new(false),
        })
    }

    /// Access the underlying registers.
    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Is a DMA transfer currently driving the data register?
    pub fn is_dma_locked(&self) -> bool {
        self.dma_locked.load(Ordering::Acquire)
    }

    fn wait_idle(&self) {
        while self.is_dma_locked() || self.regs.status().contains(Status::BSY) {
            self.regs.wait_for_interrupt();
        }
    }

    fn drain(&self) {
        while self.regs.status().contains(Status::RNE) {
            let _ = self.regs.read_data();
        }
    }

    fn wait_not_busy(&self) {
        while self.regs.status().contains(Status::BSY) {}
    }

    /// Exchange one byte.
    pub fn transfer(&mut self, out: u8) -> u8 {
        self.wait_idle();
        self.regs.write_data(out);
        self.wait_not_busy();
        while !self.regs.status().contains(Status::RNE) {}
        self.regs.read_data()
    }

    /// Transmit a block, throwing away whatever comes back.
    pub fn send_block(&mut self, tx: &[u8]) {
        self.wait_idle();
        self.drain();
        let mut sent = 0;
        while sent < tx.len() {
            while sent < tx.len() && self.regs.status().contains(Status::TNF) {
                self.regs.write_data(tx[sent]);
                sent += 1;
            }
            self.drain();
        }
        while self.regs.status() & (Status::BSY | Status::TFE) != Status::TFE {}
        self.drain();
    }

    /// Fill `rx` from the bus, clocking out `txchar` for every byte.
    pub fn recv_block(&mut self, rx: &mut [u8], txchar: u8) {
        self.wait_idle();
        self.drain();
        let mut done = 0;
        while done < rx.len() {
            let mut sent = 0;
            while done + sent < rx.len()
                && sent < FIFO_DEPTH
                && self.regs.status().contains(Status::TNF)
            {
                self.regs.write_data(txchar);
                sent += 1;
            }
            self.wait_not_busy();
            let received = self.collect(&mut rx[done..done + sent]);
            Self::check_counts(sent, received);
            done += sent;
        }
    }

    /// Full-duplex block exchange. `rx` must be at least as long as `tx`.
    pub fn transfer_block(&mut self, tx: &[u8], rx: &mut [u8]) {
        self.wait_idle();
        self.drain();
        let mut done = 0;
        while done < tx.len() {
            let mut sent = 0;
            while done + sent < tx.len()
                && sent < FIFO_DEPTH
                && self.regs.status().contains(Status::TNF)
            {
                self.regs.write_data(tx[done + sent]);
                sent += 1;
            }
            self.wait_not_busy();
            let received = self.collect(&mut rx[done..done + sent]);
            Self::check_counts(sent, received);
            done += sent;
        }
    }

    fn collect(&self, rx: &mut [u8]) -> usize {
        let mut received = 0;
        while self.regs.status().contains(Status::RNE) {
            let byte = self.regs.read_data();
            if let Some(slot) = rx.get_mut(received) {
                *slot = byte;
            }
            received += 1;
        }
        received
    }

    fn check_counts(sent: usize, received: usize) {
        if sent != received {
            panic!(
                "SPI FIFO lost sync: sent {} frames, received {}",
                sent, received
            );
        }
    }

    /// Assert chip select.
    pub fn begin_transaction(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Gpio)
    }

    /// Deassert chip select.
    pub fn end_transaction(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Gpio)
    }

    /// Run `f` with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`.
    pub fn with_chip_select<F, T, E>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<Error>,
    {
        self.begin_transaction()?;
        let result = f(self);
        let deselect = self.end_transaction();
        let value = result?;
        deselect?;
        Ok(value)
    }

    /// Pick the clock dividers closest to `target` Hz and return the
    /// frequency actually achieved.
    ///
    /// The bus runs at `pclk / (prescaler * (scr + 1))` where the prescaler
    /// is even. Larger prescalers are preferred.
    pub fn set_frequency(&mut self, target: u32) -> u32 {
        let pclk = self.regs.peripheral_clock();
        let target = target.max(1);

        self.wait_not_busy();
        self.drain();

        let mut best_b = 127;
        let mut best_delta = pclk;
        for b in (1..=127u32).rev() {
            let s = Self::rate_divider(pclk, b, target);
            if (1..=256).contains(&s) {
                let actual = pclk / b / s / 2;
                let delta = if actual > target {
                    actual - target
                } else {
                    target - actual
                };
                if delta < best_delta {
                    best_b = b;
                    best_delta = delta;
                    if delta == 0 {
                        break;
                    }
                }
            }
        }

        let s = Self::rate_divider(pclk, best_b, target).max(1).min(256);
        self.regs.set_clock((2 * best_b) as u8, (s - 1) as u8);
        let actual = pclk / best_b / s / 2;
        debug!(
            "spi: {} Hz requested, prescaler {} scr {} gives {} Hz",
            target,
            2 * best_b,
            s - 1,
            actual
        );
        actual
    }

    fn rate_divider(pclk: u32, b: u32, target: u32) -> u32 {
        let mut s = pclk / b / target;
        if s & 1 != 0 {
            s += 1;
        }
        s / 2
    }
}

impl<R, CS> DmaEndpoint for Spi<R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    fn configure(&self, direction: Direction) -> EndpointConfig {
        EndpointConfig {
            kind: EndpointKind::Peripheral {
                request_line: self.regs.dma_request_line(direction),
            },
            address: self.regs.data_register_address(),
            width: Width::Byte,
            burst: Burst::Eight,
            increment: false,
        }
    }

    fn on_dma_begin(&mut self, direction: Direction) {
        self.dma_locked.store(true, Ordering::Release);
        let bit = match direction {
            // Data flows out of our receive FIFO.
            Direction::Source => DmaEnable::RX,
            Direction::Destination => DmaEnable::TX,
        };
        self.regs.set_dma_enable(self.regs.dma_enable() | bit);
        trace!("spi: dma begin, DMACR={:x}", self.regs.dma_enable().bits());
    }

    fn on_dma_complete(&mut self, direction: Direction) {
        let bit = match direction {
            Direction::Source => DmaEnable::RX,
            Direction::Destination => DmaEnable::TX,
        };
        let remaining = self.regs.dma_enable() - bit;
        self.regs.set_dma_enable(remaining);
        if remaining.is_empty() {
            self.dma_locked.store(false, Ordering::Release);
        }
        trace!("spi: dma complete, DMACR={:x}", remaining.bits());
    }
}

impl<R, CS> core::fmt::Debug for Spi<R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        fmt.debug_struct("Spi")
            .field("dma_locked", &self.is_dma_locked())
            .finish()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

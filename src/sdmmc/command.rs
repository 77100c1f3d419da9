use embedded_hal::digital::v2::OutputPin;

use crate::spi::{Spi, SpiRegisters};

use super::proto::*;
use super::Error;

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// A bounded number of polls, used wherever the card is waited on.
pub(crate) struct Delay(u32);

impl Delay {
    pub(crate) fn new(budget: u32) -> Delay {
        Delay(budget)
    }

    /// Use up one poll, failing with `err` once none are left.
    pub(crate) fn delay<E>(&mut self, err: E) -> Result<(), E> {
        if self.0 == 0 {
            Err(err)
        } else {
            self.0 -= 1;
            Ok(())
        }
    }
}

/// A struct used to ensure that communication only occurs
/// when CS is low.
///
/// Chip select is released on drop unless [`Selected::keep`] hands the
/// selection over to a data phase that outlives this guard.
pub(crate) struct Selected<'spi, R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    spi: &'spi mut Spi<R, CS>,
    attempts: u32,
    release: bool,
}

impl<'spi, R, CS> Drop for Selected<'spi, R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    fn drop(&mut self) {
        if self.release {
            self.spi.end_transaction().ok();
        }
    }
}

impl<'spi, R, CS> Selected<'spi, R, CS>
where
    R: SpiRegisters,
    CS: OutputPin,
{
    /// Assert chip select. `attempts` bounds every response poll.
    pub(crate) fn new(spi: &'spi mut Spi<R, CS>, attempts: u32) -> Result<Self, Error> {
        spi.begin_transaction().map_err(|_| Error::Gpio)?;
        Ok(Selected {
            spi,
            attempts,
            release: true,
        })
    }

    /// Leave chip select asserted when this guard goes away.
    pub(crate) fn keep(mut self) {
        self.release = false;
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub(crate) fn receive(&mut self) -> u8 {
        self.spi.transfer(0xFF)
    }

    /// Send a command frame and poll for its R1 response.
    ///
    /// The frame is preceded by four idle bytes. The CRC is only checked by
    /// the card for CMD0 and CMD8, so the other commands reuse CMD0's.
    pub(crate) fn command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        let arg = arg.to_be_bytes();
        let crc = if command == CMD8 {
            CRC_IF_COND
        } else {
            CRC_DEFAULT
        };
        let frame = [
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            0x40 | command,
            arg[0],
            arg[1],
            arg[2],
            arg[3],
            crc,
        ];
        self.spi.send_block(&frame);

        // skip stuff byte for stop read
        if command == CMD12 {
            let _ = self.receive();
        }

        for _ in 0..self.attempts {
            let result = self.receive();
            if result & R1_START_MASK == 0 {
                trace!("sd: CMD{} -> {:x}", command, result);
                return Ok(result);
            }
        }

        Err(Error::CommandTimeout(command))
    }

    /// Perform an application-specific command.
    pub(crate) fn acommand(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        let r = self.command(CMD55, 0)?;
        if r & R1_ERROR_MASK != 0 {
            return Ok(r);
        }
        self.command(command, arg)
    }

    /// Read a short response (R3/R7 payload, register contents) whose first
    /// byte is anything but 0xFF.
    pub(crate) fn response(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut delay = Delay::new(self.attempts);
        let first = loop {
            let b = self.receive();
            if b != 0xFF {
                break b;
            }
            delay.delay(Error::TokenTimeout)?;
        };
        if let Some((head, rest)) = buffer.split_first_mut() {
            *head = first;
            self.spi.recv_block(rest, 0xFF);
        }
        Ok(())
    }

    /// Read a data block introduced by the start token, discarding the CRC.
    pub(crate) fn data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut delay = Delay::new(self.attempts);
        loop {
            match self.receive() {
                DATA_START_BLOCK => break,
                0xFF => delay.delay(Error::TokenTimeout)?,
                other => return Err(Error::UnexpectedToken(other)),
            }
        }
        self.spi.recv_block(buffer, 0xFF);
        let mut crc = [0u8; 2];
        self.spi.recv_block(&mut crc, 0xFF);
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    pub(crate) fn wait_not_busy(&mut self, polls: u32) -> Result<(), Error> {
        let mut delay = Delay::new(polls);
        while self.receive() != 0xFF {
            delay.delay(Error::TokenTimeout)?;
        }
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

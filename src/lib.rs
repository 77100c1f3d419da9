//! # async-sdmmc
//!
//! > An interrupt-driven SD card and FAT reader written in Embedded Rust
//!
//! This crate reads files from a FAT formatted SD card without ever blocking
//! for a whole sector. The card is driven in SPI mode, sector data is moved by
//! DMA, and everything above the card (the FAT engine included) runs as a
//! queue of requests that advance from interrupts and from the main loop. It
//! is `#![no_std]` and does not use `alloc`.
//!
//! The layers, bottom up:
//!
//! * [`dma`]: a pool of one-shot DMA channels and the endpoints they connect
//! * [`spi`]: a byte-oriented SPI master which can lend its data register to DMA
//! * [`sdmmc`]: the SD protocol, as an [`AsyncBlockDevice`]
//! * [`fat`]: mount, open and read on FAT12/16/32 over any [`AsyncBlockDevice`]
//!
//! ## Using the crate
//!
//! ```rust,ignore
//! static POOL: ChannelPool = ChannelPool::new();
//! static mut FAT_BUF: Block = Block::new();
//! static mut DIR_BUF: Block = Block::new();
//! static mut DATA_BUF: Block = Block::new();
//!
//! let spi = Spi::new(spi_registers, cs_pin)?;
//! let mut card = SdCard::new(spi, dma_registers, &POOL, SdConfig::default());
//! card.init()?;
//!
//! let mut fat = Fat::new(unsafe { &mut FAT_BUF }, unsafe { &mut DIR_BUF });
//! let mount = fat.f_mount(&mut card)?;
//! while !fat.is_finished(mount) {
//!     card.on_idle(&mut fat);
//! }
//! fat.take(mount);
//!
//! let open = fat.f_open(&mut card, "/logs/boot.txt")?;
//! // ... and so on, calling `card.on_dma_interrupt(channel, &mut fat)`
//! // from the DMA interrupt.
//! ```
//!
//! ## Features
//!
//! * `log` (default): log through the `log` crate.
//! * `defmt-log`: by turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over defmt
//! instead.
//! * `lfn` (default): match path components against long file names as well
//! as 8.3 names.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
mod structure;

pub mod block_device;
pub mod dma;
pub mod fat;
pub mod mbr;
pub mod queue;
pub mod sdmmc;
pub mod spi;

pub use crate::block_device::{
    AsyncBlockDevice, Block, BlockBuf, BlockCount, BlockIdx, BlockReceiver, MemoryBlockDevice,
};
pub use crate::dma::{Channel, ChannelPool, DmaRegisters, OwnerId};
pub use crate::fat::{Completion, Fat, FatError, FatOwner, File, Handle, Outcome};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{InitError, SdCard, SdConfig};
pub use crate::spi::{Spi, SpiRegisters};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

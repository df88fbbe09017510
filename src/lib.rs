//! iecdevice-rs
//!
//! A protocol engine for building peripherals (disk drives, printers,
//! anything with a 6-pin DIN plug) that sit on the Commodore IEC serial
//! bus.  The engine bit-bangs the three open-collector bus lines through a
//! host-supplied [`Pins`] implementation and multiplexes up to eight
//! device personalities, each addressed 0-30, behind one [`IecDriver`].
//!
//! Besides the standard handshake, three fast-loader protocols are
//! supported and negotiated transparently in-protocol, each behind a cargo
//! feature:
//!
//! * JiffyDos (`jiffy`) - byte and block transfer, detected during
//!   addressing.
//! * DolphinDos (`dolphin`) - parallel-cable assisted transfer with burst
//!   modes, detected via a cable handshake and the `XQ`/`XZ` commands.
//! * Epyx FastLoad (`epyx`, optionally `epyx-sectorops`) - detected via
//!   the cartridge's `M-W`/`M-E` upload sequence.
//!
//! The engine is `no_std`, allocation-free and runs entirely from a
//! cooperative [`IecDriver::tick`] driven by the host's main loop:
//!
//! ```ignore
//! let mut drive = MyDrive::new(8);            // implements Device
//! let mut driver = IecDriver::new(board_pins); // implements Pins
//! driver.attach(&mut drive);
//! driver.begin();
//! loop {
//!     driver.tick();
//! }
//! ```
//!
//! If ATN is not wired to an interrupt (see [`isr`]) and no ATN->DATA
//! hardware override exists, `tick()` must run at least once per
//! millisecond, or the bus master will decide the device is not present.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![no_std]

// Logging macros; must come first so the other modules see them.
#[macro_use]
mod fmt;

mod bus;
pub mod constants;
mod device;
pub mod isr;
mod pins;
mod protocol;

pub use bus::IecBus;
pub use device::Device;
pub use pins::{Line, Pins};
pub use protocol::{BusError, IecDriver};

//! The IEC bus protocol engine.
//!
//! `IecDriver` owns the bus lines, the table of device personalities and
//! one fastload buffer, and multiplexes everything through a single
//! cooperative [`IecDriver::tick`].  The standard handshake lives in
//! `iec.rs`; the fastload protocols each get their own module and are
//! compiled in via the `jiffy`, `dolphin` and `epyx` features.
//!
//! The one rule every blocking wait in here obeys: if the ATN line no
//! longer matches the engine's internal ATN state, the wait aborts.  ATN
//! is the bus master's pre-emption signal and must win against anything
//! else the engine is doing.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

mod commands;
#[cfg(feature = "dolphin")]
mod dolphin;
#[cfg(feature = "epyx")]
mod epyx;
mod iec;
#[cfg(feature = "jiffy")]
mod jiffy;

use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};
use heapless::Vec;
#[cfg(any(feature = "dolphin", feature = "epyx"))]
use static_assertions::const_assert;

use crate::bus::IecBus;
use crate::constants::{
    ATN_SETTLE, FASTLOAD_BUFFER_SIZE, IEC_BETWEEN_BYTES, IEC_EDGE_TIMEOUT, IEC_LISTEN, IEC_TALK,
    IEC_TALK_FIRST_BYTE, IEC_UNLISTEN, IEC_UNTALK, MAX_DEVICES,
};
#[cfg(feature = "dolphin")]
use crate::constants::{
    DOLPHIN_BURST_RX_HOLDOFF, DOLPHIN_BURST_TX_HOLDOFF, DOLPHIN_PREBUFFER_BYTES,
};
use crate::device::Device;
use crate::pins::Pins;
use commands::CommandCapture;

#[cfg(feature = "dolphin")]
const_assert!(FASTLOAD_BUFFER_SIZE >= DOLPHIN_PREBUFFER_BYTES);
#[cfg(feature = "epyx")]
const_assert!(FASTLOAD_BUFFER_SIZE >= 32);
#[cfg(feature = "epyx-sectorops")]
const_assert!(FASTLOAD_BUFFER_SIZE >= 256);

/// Errors local to one bus transaction.  `tick()` translates any of these
/// into "release the lines and mark the transaction done"; nothing is
/// retried at protocol level - the host re-issues the transaction if it
/// wants to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// An expected bus edge did not arrive in time.
    Timeout,
    /// ATN changed state mid-operation; the byte in flight is discarded
    /// and the engine re-enters the addressing state machine.
    AtnPreempted,
    /// The primary address matched no attached device; the frame is not
    /// acknowledged and the host times out to "device not present".
    NotAddressed,
    /// The device refused data (`can_write() == 0`) or had none to give
    /// (`can_read() == 0`).
    DeviceRefused,
    /// An Epyx routine upload had an unrecognized checksum.
    ChecksumMismatch,
}

bitflags! {
    /// Top-level bus state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Flags: u8 {
        /// ATN is asserted; we are in the addressing phase.
        const ATN = 0x80;
        /// We were addressed as listener.
        const LISTENING = 0x40;
        /// We were addressed as talker.
        const TALKING = 0x20;
        /// The current transaction ended (possibly in error); ignore the
        /// bus until the next ATN.
        const DONE = 0x10;
        /// Level seen on RESET last tick, for edge detection.
        const RESET = 0x08;
    }
}

bitflags! {
    /// Per-device protocol state.  The `*_ENABLED` bits are configuration;
    /// everything else is transient per-transaction state cleared on each
    /// ATN falling edge.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct DeviceFlags: u16 {
        const JIFFY_ENABLED          = 0x0001;
        const JIFFY_DETECTED         = 0x0002;
        const JIFFY_BLOCK            = 0x0004;
        const DOLPHIN_ENABLED        = 0x0008;
        const DOLPHIN_DETECTED       = 0x0010;
        const DOLPHIN_BURST_ENABLED  = 0x0020;
        const DOLPHIN_BURST_TRANSMIT = 0x0040;
        const DOLPHIN_BURST_RECEIVE  = 0x0080;
        const EPYX_ENABLED           = 0x0100;
        const EPYX_HEADER            = 0x0200;
        const EPYX_LOAD              = 0x0400;
        const EPYX_SECTOROP          = 0x0800;

        /// Everything cleared on an ATN falling edge.
        const TRANSIENT = Self::JIFFY_DETECTED.bits()
            | Self::JIFFY_BLOCK.bits()
            | Self::DOLPHIN_DETECTED.bits()
            | Self::DOLPHIN_BURST_TRANSMIT.bits()
            | Self::DOLPHIN_BURST_RECEIVE.bits()
            | Self::EPYX_HEADER.bits()
            | Self::EPYX_LOAD.bits()
            | Self::EPYX_SECTOROP.bits();
    }
}

/// One attached device personality plus the engine-side state for it.
pub(crate) struct DeviceEntry<'a> {
    pub(crate) dev: &'a mut dyn Device,
    pub(crate) address: u8,
    pub(crate) sflags: DeviceFlags,
    /// Progress through the Epyx `M-W`/`M-E` recognition sequence.
    #[cfg(feature = "epyx")]
    pub(crate) epyx_ctr: u8,
}

/// The bus protocol engine.
///
/// Drive it by calling [`IecDriver::tick`] from the main loop.  If the ATN
/// pin is not bound to an interrupt (see [`crate::isr`]) and there is no
/// hardware ATN override wired, `tick()` must be called at least once per
/// millisecond or the bus master will see "device not present".
pub struct IecDriver<'a, P: Pins> {
    pub(crate) bus: IecBus<P>,
    pub(crate) devices: Vec<DeviceEntry<'a>, MAX_DEVICES>,
    /// The selected device: `Some` iff we are LISTENING, TALKING or
    /// mid-addressing with a matching primary.
    pub(crate) current: Option<usize>,
    pub(crate) flags: Flags,
    /// First non-zero byte captured under ATN; 0 means "none yet".
    pub(crate) primary: u8,
    /// Second byte captured under ATN; 0 means "none yet".
    pub(crate) secondary: u8,
    /// Reference instant for the various inter-operation delays.
    pub(crate) timeout_start: u32,
    /// Minimum gap from `timeout_start` before the next transmitted byte.
    pub(crate) timeout_duration: u32,
    /// Gates the ATN ISR out of `atn_request()` while `tick()` owns the
    /// engine state.
    pub(crate) in_tick: AtomicBool,
    pub(crate) atn_isr_bound: bool,
    begun: bool,
    /// Fastload scratch buffer; devices only ever see transient slices.
    pub(crate) buffer: [u8; FASTLOAD_BUFFER_SIZE],
    /// DolphinDos SAVE prebuffer / LOAD resend counter.
    #[cfg(feature = "dolphin")]
    pub(crate) dolphin_ctr: usize,
    pub(crate) cmd: CommandCapture,
}

impl<'a, P: Pins> IecDriver<'a, P> {
    /// Create an engine on the given pins.  All bus lines are released.
    pub fn new(pins: P) -> Self {
        Self {
            bus: IecBus::new(pins),
            devices: Vec::new(),
            current: None,
            flags: Flags::empty(),
            primary: 0,
            secondary: 0,
            timeout_start: 0,
            timeout_duration: 0,
            in_tick: AtomicBool::new(false),
            atn_isr_bound: false,
            begun: false,
            buffer: [0; FASTLOAD_BUFFER_SIZE],
            #[cfg(feature = "dolphin")]
            dolphin_ctr: 0,
            cmd: CommandCapture::new(),
        }
    }

    /// Start bus operation.  Must be called once before the first
    /// `tick()`; calls `begin()` on every attached device.
    pub fn begin(&mut self) {
        self.bus.release_clock();
        self.bus.release_data();
        self.flags = Flags::empty();

        // Allow ATN to pull DATA low in hardware, if wired.
        self.bus.atn_override(true);

        self.begun = true;
        for entry in self.devices.iter_mut() {
            entry.dev.begin();
        }
        debug!("IEC engine started, {} device(s)", self.devices.len());
    }

    /// Attach a device personality.  Fails if the table is full or the
    /// address is already taken.
    pub fn attach(&mut self, dev: &'a mut dyn Device) -> bool {
        let address = dev.address();
        if self.devices.is_full() || self.device_index(address).is_some() {
            warn!("Cannot attach device {}", address);
            return false;
        }

        let entry = DeviceEntry {
            dev,
            address,
            sflags: DeviceFlags::empty(),
            #[cfg(feature = "epyx")]
            epyx_ctr: 0,
        };
        // Capacity was checked above.
        let _ = self.devices.push(entry);

        if self.begun {
            if let Some(entry) = self.devices.last_mut() {
                entry.dev.begin();
            }
        }
        debug!("Attached device {}", address);
        true
    }

    /// Detach the device at the given bus address.
    pub fn detach(&mut self, address: u8) -> bool {
        match self.device_index(address) {
            Some(i) => {
                self.devices.swap_remove(i);
                self.current = None;
                debug!("Detached device {}", address);
                true
            }
            None => false,
        }
    }

    /// Whether ATN can be served while the engine is blocked inside a
    /// device's `can_read`/`can_write`: true if the hardware ATN override
    /// is wired or an ATN interrupt is bound.
    pub fn can_serve_atn(&self) -> bool {
        self.bus.has_atn_override() || self.atn_isr_bound
    }

    pub(crate) fn device_index(&self, address: u8) -> Option<usize> {
        self.devices.iter().position(|e| e.address == address)
    }

    // ------------------------- protocol enables -------------------------

    /// Enable or disable JiffyDos support for one device.  Returns the
    /// resulting state.
    #[cfg(feature = "jiffy")]
    pub fn enable_jiffydos(&mut self, address: u8, enable: bool) -> bool {
        let Some(i) = self.device_index(address) else {
            return false;
        };
        let entry = &mut self.devices[i];
        if enable {
            entry.sflags.insert(DeviceFlags::JIFFY_ENABLED);
        } else {
            entry.sflags.remove(DeviceFlags::JIFFY_ENABLED);
        }
        // Cancel any JiffyDos activity in flight.
        entry
            .sflags
            .remove(DeviceFlags::JIFFY_DETECTED | DeviceFlags::JIFFY_BLOCK);
        entry.sflags.contains(DeviceFlags::JIFFY_ENABLED)
    }

    /// Enable or disable DolphinDos support for one device.  Requires the
    /// parallel cable lines to be wired.  Returns the resulting state.
    #[cfg(feature = "dolphin")]
    pub fn enable_dolphindos(&mut self, address: u8, enable: bool) -> bool {
        let cable = self.bus.has_parallel_cable();
        let Some(i) = self.device_index(address) else {
            return false;
        };
        let entry = &mut self.devices[i];
        if enable && cable {
            entry
                .sflags
                .insert(DeviceFlags::DOLPHIN_ENABLED | DeviceFlags::DOLPHIN_BURST_ENABLED);
        } else {
            entry
                .sflags
                .remove(DeviceFlags::DOLPHIN_ENABLED | DeviceFlags::DOLPHIN_BURST_ENABLED);
        }
        // Cancel any DolphinDos activity in flight.
        entry.sflags.remove(
            DeviceFlags::DOLPHIN_DETECTED
                | DeviceFlags::DOLPHIN_BURST_TRANSMIT
                | DeviceFlags::DOLPHIN_BURST_RECEIVE,
        );
        entry.sflags.contains(DeviceFlags::DOLPHIN_ENABLED)
    }

    /// Enable or disable DolphinDos burst mode for one device (the `XF+`/
    /// `XF-` commands arrive here too).  With burst disabled the engine
    /// falls back to byte mode when the host requests a burst.
    #[cfg(feature = "dolphin")]
    pub fn enable_dolphin_burst(&mut self, address: u8, enable: bool) {
        let Some(i) = self.device_index(address) else {
            return;
        };
        let entry = &mut self.devices[i];
        if enable {
            entry.sflags.insert(DeviceFlags::DOLPHIN_BURST_ENABLED);
        } else {
            entry.sflags.remove(DeviceFlags::DOLPHIN_BURST_ENABLED);
        }
        entry
            .sflags
            .remove(DeviceFlags::DOLPHIN_BURST_TRANSMIT | DeviceFlags::DOLPHIN_BURST_RECEIVE);
    }

    /// Enable or disable Epyx FastLoad support for one device.  Returns
    /// the resulting state.
    #[cfg(feature = "epyx")]
    pub fn enable_epyx_fastload(&mut self, address: u8, enable: bool) -> bool {
        let Some(i) = self.device_index(address) else {
            return false;
        };
        let entry = &mut self.devices[i];
        if enable {
            entry.sflags.insert(DeviceFlags::EPYX_ENABLED);
        } else {
            entry.sflags.remove(DeviceFlags::EPYX_ENABLED);
        }
        // Cancel any Epyx activity in flight.
        entry.sflags.remove(
            DeviceFlags::EPYX_HEADER | DeviceFlags::EPYX_LOAD | DeviceFlags::EPYX_SECTOROP,
        );
        entry.sflags.contains(DeviceFlags::EPYX_ENABLED)
    }

    // ------------------------- fastload requests ------------------------

    /// The host asked for a DolphinDos burst receive (`XZ` on the command
    /// channel).  Normally the engine's own command sniffer calls this.
    #[cfg(feature = "dolphin")]
    pub fn dolphin_burst_receive_request(&mut self, address: u8) {
        if let Some(i) = self.device_index(address) {
            self.devices[i]
                .sflags
                .insert(DeviceFlags::DOLPHIN_BURST_RECEIVE);
            self.timeout_start = self.bus.micros();
        }
    }

    /// The host asked for a DolphinDos burst transmit (`XQ` on the command
    /// channel).  Normally the engine's own command sniffer calls this.
    #[cfg(feature = "dolphin")]
    pub fn dolphin_burst_transmit_request(&mut self, address: u8) {
        if let Some(i) = self.device_index(address) {
            self.devices[i]
                .sflags
                .insert(DeviceFlags::DOLPHIN_BURST_TRANSMIT);
            self.timeout_start = self.bus.micros();
        }
    }

    /// An Epyx FastLoad routine upload is about to start on this device.
    /// Normally the engine's own command sniffer calls this.
    #[cfg(feature = "epyx")]
    pub fn epyx_load_request(&mut self, address: u8) {
        if let Some(i) = self.device_index(address) {
            if self.devices[i].sflags.contains(DeviceFlags::EPYX_ENABLED) {
                self.devices[i].sflags.insert(DeviceFlags::EPYX_HEADER);
            }
        }
    }

    // ------------------------- wait primitives --------------------------

    /// Internal ATN state vs the line.  A mismatch means an ATN edge
    /// happened that the state machine has not processed yet - the
    /// universal abort condition for every blocking wait.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn atn_mismatch(&self) -> bool {
        // Flag set means "we believe ATN is asserted (line low)".
        self.flags.contains(Flags::ATN) == self.bus.get_atn()
    }

    /// Wait for `timeout_us` measured from `start`, aborting if ATN is
    /// newly asserted.
    pub(crate) fn wait_timeout_from(&self, start: u32, timeout_us: u32) -> Result<(), BusError> {
        while self.bus.micros().wrapping_sub(start) < timeout_us {
            if !self.flags.contains(Flags::ATN) && !self.bus.get_atn() {
                return Err(BusError::AtnPreempted);
            }
        }
        Ok(())
    }

    /// Wait for `timeout_us` from now, aborting if ATN is newly asserted.
    pub(crate) fn wait_timeout(&self, timeout_us: u32) -> Result<(), BusError> {
        self.wait_timeout_from(self.bus.micros(), timeout_us)
    }

    /// Wait for CLK to reach `state` (`true` = high).  A `timeout_us` of 0
    /// waits forever - and avoids reading the clock source, which on some
    /// platforms would re-enable interrupts.  The ATN rule applies either
    /// way.
    pub(crate) fn wait_clk(&self, state: bool, timeout_us: u32) -> Result<(), BusError> {
        if timeout_us == 0 {
            while self.bus.get_clock() != state {
                if self.atn_mismatch() {
                    return Err(BusError::AtnPreempted);
                }
            }
        } else {
            let start = self.bus.micros();
            while self.bus.get_clock() != state {
                if self.atn_mismatch() {
                    return Err(BusError::AtnPreempted);
                }
                if self.bus.micros().wrapping_sub(start) >= timeout_us {
                    return Err(BusError::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Wait for DATA to reach `state` (`true` = high), like [`wait_clk`].
    ///
    /// One extra wrinkle: DATA low is only trustworthy if we know why it
    /// is low.  If we waited for low while believing ATN was released but
    /// the line is in fact asserted, the low may be another device's ATN
    /// response, so report pre-emption instead of success.
    pub(crate) fn wait_data(&self, state: bool, timeout_us: u32) -> Result<(), BusError> {
        if timeout_us == 0 {
            while self.bus.get_data() != state {
                if self.atn_mismatch() {
                    return Err(BusError::AtnPreempted);
                }
            }
        } else {
            let start = self.bus.micros();
            while self.bus.get_data() != state {
                if self.atn_mismatch() {
                    return Err(BusError::AtnPreempted);
                }
                if self.bus.micros().wrapping_sub(start) >= timeout_us {
                    return Err(BusError::Timeout);
                }
            }
        }

        if !state && !self.flags.contains(Flags::ATN) && !self.bus.get_atn() {
            return Err(BusError::AtnPreempted);
        }
        Ok(())
    }

    // --------------------------- ATN handling ---------------------------

    /// Falling edge on ATN: the bus master is addressing all devices.
    /// Called from `tick()` or, between ticks, from the bound ATN ISR.
    pub(crate) fn atn_request(&mut self) {
        self.flags.insert(Flags::ATN);
        self.flags.remove(Flags::DONE);
        self.current = None;
        self.primary = 0;
        self.secondary = 0;

        // Ignore bus activity for the first 100us after the edge.
        self.timeout_start = self.bus.micros();

        // Release CLK (we may have been holding it as talker) and answer
        // "I am here" on DATA.  Without this within ~1ms the bus master
        // reports "device not present".
        self.bus.release_clock();
        self.bus.set_data();

        // We are holding DATA ourselves now; the hardware override would
        // only fight the rest of the transaction.
        self.bus.atn_override(false);

        for entry in self.devices.iter_mut() {
            entry.sflags.remove(DeviceFlags::TRANSIENT);
        }
    }

    /// ISR entry: runs `atn_request()` unless `tick()` currently owns the
    /// engine state (in which case `tick()` itself will see the edge).
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`crate::isr::bind_atn_isr`] and the interrupt
    /// must run on the core that calls `tick()`, so that this never
    /// executes concurrently with engine code - only *instead* of it,
    /// while `tick()` is parked inside a device `can_read`/`can_write`
    /// call or not running at all.
    pub(crate) unsafe fn isr_atn_service(ptr: *mut Self) {
        let in_tick = unsafe { (*ptr).in_tick.load(Ordering::Acquire) };
        if !in_tick {
            let drv = unsafe { &mut *ptr };
            if !drv.flags.contains(Flags::ATN) {
                drv.atn_request();
            }
        }
    }

    // ------------------------- data plumbing ----------------------------

    /// Hand one received data byte to the selected device, teeing it into
    /// the command capture when the host is writing the command channel.
    pub(crate) fn deliver_byte(&mut self, data: u8, eoi: bool) {
        if self.flags.contains(Flags::LISTENING) && self.cmd.armed() {
            self.cmd.push(data);
        }
        if let Some(i) = self.current {
            self.devices[i].dev.write(data, eoi);
        }
    }

    // ------------------------------ tick --------------------------------

    /// One pass of the cooperative scheduler: reset and ATN edges, pending
    /// fastload work, then at most one byte of receive or transmit.
    #[allow(clippy::too_many_lines)]
    pub fn tick(&mut self) {
        if !self.begun {
            return;
        }

        // Keep the ATN ISR out of atn_request() while we own the state.
        self.in_tick.store(true, Ordering::Release);

        self.tick_reset();
        self.tick_atn_edges();
        #[cfg(feature = "dolphin")]
        self.tick_dolphin_pending();
        #[cfg(feature = "epyx")]
        self.tick_epyx_pending();
        self.tick_receive();
        self.tick_transmit();

        self.in_tick.store(false, Ordering::Release);

        // If ATN went low while we were blocked above and the ISR could
        // not run (or is not bound), handle the edge before leaving.
        if self.atn_isr_bound && !self.bus.get_atn() && !self.flags.contains(Flags::ATN) {
            critical_section::with(|_| self.atn_request());
        }

        for entry in self.devices.iter_mut() {
            entry.dev.task();
        }
    }

    /// Falling-edge detection on RESET: clear everything and let the
    /// devices know.
    fn tick_reset(&mut self) {
        if self.bus.get_reset() {
            self.flags.insert(Flags::RESET);
        } else if self.flags.contains(Flags::RESET) {
            info!("RESET edge - resetting bus state");
            self.flags = Flags::empty();

            self.bus.release_clock();
            self.bus.release_data();
            self.bus.atn_override(true);

            for entry in self.devices.iter_mut() {
                entry.dev.reset();
            }
        }
    }

    /// ATN edge handling: enter the addressing phase on a falling edge;
    /// classify the captured primary on the rising edge.
    fn tick_atn_edges(&mut self) {
        if !self.flags.contains(Flags::ATN) && !self.bus.get_atn() {
            self.atn_request();
            return;
        }

        if !(self.flags.contains(Flags::ATN) && self.bus.get_atn()) {
            return;
        }

        // Rising edge: the bus master finished addressing.
        self.flags.remove(Flags::ATN);
        self.bus.atn_override(true);

        // Note that UNLISTEN (0x3F) and UNTALK (0x5F) share the LISTEN and
        // TALK high nibbles; they reach their own branches below because
        // address 0x1F never matches a device.
        let mut addressed = false;
        if self.primary & 0xE0 == IEC_LISTEN {
            self.current = self.device_index(self.primary & 0x1F);
            if let Some(i) = self.current {
                addressed = true;
                trace!("LISTEN secondary 0x{:02x}", self.secondary);

                self.cmd.listen(self.devices[i].address, self.secondary);
                self.devices[i].dev.listen(self.secondary);
                self.flags.remove(Flags::TALKING);
                self.flags.insert(Flags::LISTENING);

                // A SAVE (channel 1) may turn into a Dolphin burst; hold
                // the first bytes back until we know.
                #[cfg(feature = "dolphin")]
                if self.secondary == 0x61 {
                    self.dolphin_ctr = 2 * DOLPHIN_PREBUFFER_BYTES;
                }

                // Keep holding DATA: "I am here".
                self.bus.set_data();
            }
        } else if self.primary & 0xE0 == IEC_TALK {
            self.current = self.device_index(self.primary & 0x1F);
            if let Some(i) = self.current {
                addressed = true;
                trace!("TALK secondary 0x{:02x}", self.secondary);

                // JiffyDos uses talk secondary 0x61 to request block
                // transfer mode; the device sees the plain data channel.
                #[cfg(feature = "jiffy")]
                if self.devices[i].sflags.contains(DeviceFlags::JIFFY_DETECTED)
                    && self.secondary == 0x61
                {
                    self.secondary = 0x60;
                    self.devices[i].sflags.insert(DeviceFlags::JIFFY_BLOCK);
                }

                self.cmd.talk(self.secondary);
                self.devices[i].dev.talk(self.secondary);
                self.flags.remove(Flags::LISTENING);
                self.flags.insert(Flags::TALKING);

                #[cfg(feature = "dolphin")]
                if self.secondary == 0x60 {
                    self.dolphin_ctr = 0;
                }

                // Role reversal: bus master releases CLK (and holds DATA),
                // then we take over CLK.
                if self.wait_clk(true, IEC_EDGE_TIMEOUT).is_ok() {
                    self.bus.set_clock();
                    self.bus.release_data();

                    self.timeout_start = self.bus.micros();
                    self.timeout_duration = IEC_TALK_FIRST_BYTE;
                }
            }
        }

        if !addressed {
            if self.primary == IEC_UNLISTEN && self.flags.contains(Flags::LISTENING) {
                trace!("UNLISTEN");
                self.flags.remove(Flags::LISTENING);
                for entry in self.devices.iter_mut() {
                    entry.dev.unlisten();
                }
                self.dispatch_command();
            } else if self.primary == IEC_UNTALK && self.flags.contains(Flags::TALKING) {
                trace!("UNTALK");
                self.flags.remove(Flags::TALKING);
                for entry in self.devices.iter_mut() {
                    entry.dev.untalk();
                }
            }
        }

        if !self.flags.intersects(Flags::LISTENING | Flags::TALKING) {
            // Neither role: make sure we hold nothing.
            self.bus.release_clock();
            self.bus.release_data();
        }
    }

    /// Pending DolphinDos bursts, armed by the `XQ`/`XZ` commands.  Each
    /// waits out a holdoff and the matching line condition, then either
    /// runs the burst or falls back to byte mode.
    #[cfg(feature = "dolphin")]
    fn tick_dolphin_pending(&mut self) {
        for i in 0..self.devices.len() {
            let sflags = self.devices[i].sflags;
            let elapsed = self.bus.micros().wrapping_sub(self.timeout_start);

            if sflags.contains(DeviceFlags::DOLPHIN_BURST_TRANSMIT)
                && elapsed > DOLPHIN_BURST_TX_HOLDOFF
                && !self.bus.get_data()
            {
                // Other devices have had time to release DATA and the host
                // is now holding it: take CLK and go.
                self.bus.set_clock();

                self.current = Some(i);
                if sflags.contains(DeviceFlags::DOLPHIN_BURST_ENABLED) {
                    let _ = self.transmit_dolphin_burst();

                    // The host skips the CLOSE in burst mode; do it
                    // ourselves.
                    self.devices[i].dev.listen(0xE0);
                    self.devices[i].dev.unlisten();

                    if !self.bus.get_atn() {
                        self.atn_request();
                    }
                } else {
                    // Burst disabled: fall back to plain Dolphin byte
                    // transmission.
                    self.flags = Flags::TALKING;
                    self.devices[i].sflags.insert(DeviceFlags::DOLPHIN_DETECTED);
                    self.secondary = 0x60;
                }

                self.devices[i]
                    .sflags
                    .remove(DeviceFlags::DOLPHIN_BURST_TRANSMIT);
            } else if sflags.contains(DeviceFlags::DOLPHIN_BURST_RECEIVE)
                && elapsed > DOLPHIN_BURST_RX_HOLDOFF
                && !self.bus.get_clock()
            {
                // The host has released CLK after the request and pulled
                // it low again to start the burst.
                self.current = Some(i);
                if sflags.contains(DeviceFlags::DOLPHIN_BURST_ENABLED) {
                    let _ = self.receive_dolphin_burst();

                    if !self.bus.get_atn() {
                        self.atn_request();
                    }
                } else {
                    // Burst disabled: fall back to plain Dolphin byte
                    // reception, rebasing the prebuffer counter so the
                    // bytes already buffered still reach the device.
                    self.flags = Flags::LISTENING;
                    self.devices[i].sflags.insert(DeviceFlags::DOLPHIN_DETECTED);
                    self.secondary = 0x61;
                    self.dolphin_ctr = 2 * DOLPHIN_PREBUFFER_BYTES - self.dolphin_ctr;

                    // Not ready to receive yet.
                    self.bus.set_data();
                }

                self.devices[i]
                    .sflags
                    .remove(DeviceFlags::DOLPHIN_BURST_RECEIVE);
            }
        }
    }

    /// Pending Epyx FastLoad work: a sniffed upload, a load in progress,
    /// or a sector-op continuation.
    #[cfg(feature = "epyx")]
    fn tick_epyx_pending(&mut self) {
        for i in 0..self.devices.len() {
            let sflags = self.devices[i].sflags;

            if sflags.contains(DeviceFlags::EPYX_HEADER) && self.bus.get_data() {
                self.current = Some(i);
                self.devices[i].sflags.remove(DeviceFlags::EPYX_HEADER);
                if let Err(e) = self.receive_epyx_header() {
                    debug!("Epyx header failed: {:?}", e);
                    self.bus.release_clock();
                    self.bus.release_data();
                }
            } else if sflags.contains(DeviceFlags::EPYX_LOAD) {
                self.current = Some(i);
                if !self.transmit_epyx_block() {
                    // End of data or transmission error: either way we are
                    // finished with the load.
                    self.bus.release_clock();
                    self.bus.release_data();

                    // Close the file opened for the load.
                    self.devices[i].dev.listen(0xE0);
                    self.devices[i].dev.unlisten();

                    self.devices[i].sflags.remove(DeviceFlags::EPYX_LOAD);
                }
            } else {
                #[cfg(feature = "epyx-sectorops")]
                if sflags.contains(DeviceFlags::EPYX_SECTOROP) {
                    self.current = Some(i);
                    if !self.finish_epyx_sector_command() {
                        self.bus.release_clock();
                        self.bus.release_data();
                        self.devices[i].sflags.remove(DeviceFlags::EPYX_SECTOROP);
                    }
                }
            }
        }
    }

    /// Receive side: under ATN or listening, and the transaction is still
    /// live.
    fn tick_receive(&mut self) {
        if !self.flags.intersects(Flags::ATN | Flags::LISTENING) || self.flags.contains(Flags::DONE)
        {
            return;
        }

        // Ask the device whether it can take a byte.  This is the hook
        // where devices run long operations, so drop the ISR gate while we
        // are in there, and re-check ATN ourselves afterwards.
        let num_data = match self.current {
            Some(i) => {
                self.in_tick.store(false, Ordering::Release);
                let n = self.devices[i].dev.can_write();
                self.in_tick.store(true, Ordering::Release);
                n
            }
            None => 0,
        };

        if !self.flags.contains(Flags::ATN) && !self.bus.get_atn() {
            // ATN fell while we were inside can_write().
            self.atn_request();
            return;
        }

        if self.flags.contains(Flags::ATN)
            && self.bus.micros().wrapping_sub(self.timeout_start) < ATN_SETTLE
        {
            // Within the settling window after the ATN edge; other devices
            // may still be releasing CLK.
            return;
        }

        #[cfg(feature = "jiffy")]
        if !self.flags.contains(Flags::ATN) && num_data >= 0 {
            if let Some(i) = self.current {
                if self.devices[i].sflags.contains(DeviceFlags::JIFFY_DETECTED) {
                    if self.receive_jiffy_byte(num_data > 0).is_err() {
                        self.bus.release_data();
                        self.flags.insert(Flags::DONE);
                    }
                    return;
                }
            }
        }

        #[cfg(feature = "dolphin")]
        if !self.flags.contains(Flags::ATN) && num_data >= 0 {
            if let Some(i) = self.current {
                if self.devices[i]
                    .sflags
                    .contains(DeviceFlags::DOLPHIN_DETECTED)
                {
                    if !self.bus.get_clock() {
                        // Sender not ready yet.
                    } else if self.receive_dolphin_byte(num_data > 0).is_err() {
                        self.bus.release_data();
                        self.flags.insert(Flags::DONE);
                    }
                    return;
                }
            }
        }

        if (self.flags.contains(Flags::ATN) || num_data >= 0) && self.bus.get_clock() {
            // Sender released CLK: ready to send.  Under ATN we always
            // take the byte (it is addressing, not data).
            if let Err(e) = self.receive_iec_byte(num_data > 0) {
                trace!("receive failed: {:?}", e);
                self.bus.release_data();
                self.flags.insert(Flags::DONE);
            }
        }
    }

    /// Transmit side: talking, not under ATN, transaction still live.
    fn tick_transmit(&mut self) {
        if self.flags & (Flags::ATN | Flags::TALKING | Flags::DONE) != Flags::TALKING {
            return;
        }

        #[cfg(feature = "jiffy")]
        {
            let block = self
                .current
                .map(|i| self.devices[i].sflags.contains(DeviceFlags::JIFFY_BLOCK))
                .unwrap_or(false);
            if block {
                self.tick_transmit_jiffy_block();
                return;
            }
        }

        // Ask the device for data; like can_write() this may block, so the
        // ISR gate is dropped and ATN re-checked.
        let Some(cur) = self.current else {
            return;
        };
        self.in_tick.store(false, Ordering::Release);
        let num_data = self.devices[cur].dev.can_read();
        self.in_tick.store(true, Ordering::Release);

        if !self.bus.get_atn() {
            // ATN fell while we were inside can_read().
            self.atn_request();
            return;
        }

        if self.bus.micros().wrapping_sub(self.timeout_start) < self.timeout_duration
            || num_data < 0
        {
            // Inter-byte gap not yet met, or the device has not decided.
            return;
        }

        #[cfg(feature = "jiffy")]
        if self.devices[cur]
            .sflags
            .contains(DeviceFlags::JIFFY_DETECTED)
        {
            if self.transmit_jiffy_byte(num_data).is_err() {
                self.flags.insert(Flags::DONE);
            }
            return;
        }

        #[cfg(feature = "dolphin")]
        if self.devices[cur]
            .sflags
            .contains(DeviceFlags::DOLPHIN_DETECTED)
        {
            if self.transmit_dolphin_byte(num_data).is_err() {
                self.bus.release_clock();
                self.flags.insert(Flags::DONE);
            }
            return;
        }

        match self.transmit_iec_byte(num_data) {
            Ok(()) => {
                // Observe the between-bytes gap before the next one.
                self.timeout_start = self.bus.micros();
                self.timeout_duration = IEC_BETWEEN_BYTES;
            }
            Err(e) => {
                trace!("transmit failed: {:?}", e);
                self.flags.insert(Flags::DONE);
            }
        }
    }

    /// JiffyDos block mode: pull a whole buffer from the device and clock
    /// it out in one burst.
    #[cfg(feature = "jiffy")]
    fn tick_transmit_jiffy_block(&mut self) {
        let Some(cur) = self.current else {
            return;
        };
        let n = self.devices[cur].dev.read_block(&mut self.buffer);

        // Give the receiver time to see CLK low from the previous block
        // before we release it again.
        if self
            .wait_timeout_from(self.timeout_start, crate::constants::JIFFY_BLOCK_GAP)
            .is_err()
            || !self.transmit_jiffy_block(n)
        {
            self.flags.insert(Flags::DONE);
        } else {
            self.timeout_start = self.bus.micros();
        }
    }
}

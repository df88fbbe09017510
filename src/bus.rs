//! Line-level operations on the physical IEC bus.
//!
//! `IecBus` wraps the host's [`Pins`] with the open-collector discipline
//! and the handful of line groups the protocol code works in.  Nothing in
//! here knows about the handshake - that lives in [`crate::protocol`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::pins::{Line, Pins};

/// The physical IEC bus: three serial lines, the optional RESET and CTRL
/// lines, and (with the `dolphin` feature) the parallel cable.
pub struct IecBus<P: Pins> {
    pins: P,
}

impl<P: Pins> IecBus<P> {
    /// Wrap the host pins.  All lines start released.
    pub fn new(pins: P) -> Self {
        let mut bus = Self { pins };
        bus.release_clock();
        bus.release_data();
        if bus.pins.has(Line::HandshakeTx) {
            bus.pins.release(Line::HandshakeTx);
        }
        bus.pins.set_parallel_input();
        bus
    }

    // CLOCK line control

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn set_clock(&mut self) {
        self.pins.drive_low(Line::Clk);
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn release_clock(&mut self) {
        self.pins.release(Line::Clk);
    }

    /// Read CLK: `true` is high/released.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn get_clock(&self) -> bool {
        self.pins.read(Line::Clk)
    }

    /// Write CLK as a logic level: `true` releases, `false` drives low.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn write_clock(&mut self, high: bool) {
        if high {
            self.release_clock();
        } else {
            self.set_clock();
        }
    }

    // DATA line control

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn set_data(&mut self) {
        self.pins.drive_low(Line::Data);
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn release_data(&mut self) {
        self.pins.release(Line::Data);
    }

    /// Read DATA: `true` is high/released.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn get_data(&self) -> bool {
        self.pins.read(Line::Data)
    }

    /// Write DATA as a logic level: `true` releases, `false` drives low.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn write_data(&mut self, high: bool) {
        if high {
            self.release_data();
        } else {
            self.set_data();
        }
    }

    // ATN line (input only for a peripheral)

    /// Read ATN: `true` is high/released, `false` is asserted.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn get_atn(&self) -> bool {
        self.pins.read(Line::Atn)
    }

    // RESET line

    /// Read RESET: `true` is high/released.  Reads as released when the
    /// line is not wired.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn get_reset(&self) -> bool {
        if self.pins.has(Line::Reset) {
            self.pins.read(Line::Reset)
        } else {
            true
        }
    }

    // CTRL line (ATN->DATA hardware override)

    /// Assert or release the hardware ATN override.  While enabled,
    /// external hardware pulls DATA low whenever ATN is low, so the engine
    /// may be slow to react to ATN without the bus master seeing "device
    /// not present".
    pub fn atn_override(&mut self, enable: bool) {
        if self.pins.has(Line::Ctrl) {
            if enable {
                self.pins.drive_low(Line::Ctrl);
            } else {
                self.pins.release(Line::Ctrl);
            }
        }
    }

    /// Whether the hardware ATN override exists.
    pub fn has_atn_override(&self) -> bool {
        self.pins.has(Line::Ctrl)
    }

    // Timing

    /// Current microsecond counter.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn micros(&self) -> u32 {
        self.pins.micros()
    }

    /// Spin until `offset_us` after `reference`.  Used for the fastload
    /// bit clocks, where every edge is placed relative to one reference
    /// edge; worst-case jitter is one `micros()` granule.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn wait_until(&self, reference: u32, offset_us: u32) {
        while self.pins.micros().wrapping_sub(reference) < offset_us {}
    }

    /// Spin for `us` microseconds, unconditionally.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn delay_us(&self, us: u32) {
        self.wait_until(self.pins.micros(), us);
    }

    // DolphinDos parallel cable

    /// Whether the parallel cable lines are wired.
    #[cfg(feature = "dolphin")]
    pub fn has_parallel_cable(&self) -> bool {
        self.pins.has(Line::HandshakeTx) && self.pins.has(Line::HandshakeRx)
    }

    /// Whether a falling edge arrived on the handshake receive line since
    /// the last call (clears the latch).
    #[cfg(feature = "dolphin")]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn parallel_handshake_received(&mut self) -> bool {
        self.pins.parallel_handshake_received()
    }

    /// Send a handshake pulse: open-collector low pulse on the handshake
    /// transmit line.
    #[cfg(feature = "dolphin")]
    pub fn parallel_handshake_transmit(&mut self) {
        self.pins.drive_low(Line::HandshakeTx);
        self.delay_us(crate::constants::DOLPHIN_HANDSHAKE_PULSE);
        self.pins.release(Line::HandshakeTx);
    }

    #[cfg(feature = "dolphin")]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn read_parallel(&self) -> u8 {
        self.pins.read_parallel()
    }

    #[cfg(feature = "dolphin")]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn write_parallel(&mut self, data: u8) {
        self.pins.write_parallel(data);
    }

    /// Switch the parallel data lines back to input.  Every write-side
    /// routine must do this on all of its exit paths.
    #[cfg(feature = "dolphin")]
    pub fn set_parallel_input(&mut self) {
        self.pins.set_parallel_input();
    }

    #[cfg(feature = "dolphin")]
    pub fn set_parallel_output(&mut self) {
        self.pins.set_parallel_output();
    }
}

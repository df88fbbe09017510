//! The `Pins` capability: the host-supplied GPIO and microsecond clock
//! the engine runs on.
//!
//! The engine never drives a bus line high.  Open collector behavior is
//! emulated the usual way:
//! - releasing a line switches the pin to input (high-Z); the bus pull-up
//!   provides the high level,
//! - driving a line switches the pin to output low.
//!
//! Implementations must make `read`, `drive_low` and `release` fast - they
//! are called from bit loops with microsecond-level deadlines.  On most
//! MCUs this means going to the GPIO registers directly rather than through
//! a HAL's checked pin API.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

/// A logical bus line.
///
/// `Atn`, `Clk` and `Data` must always be wired.  The rest are optional -
/// see [`Pins::has`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    /// Attention, input.  Falling edge means "all devices listen for an
    /// address".
    Atn,
    /// Clock, bidirectional.
    Clk,
    /// Data, bidirectional.
    Data,
    /// Reset, input.  Falling edge resets all devices.
    Reset,
    /// Control output for the optional ATN->DATA hardware override.  While
    /// asserted (driven low), external hardware holds DATA low whenever ATN
    /// is low, without software involvement.
    Ctrl,
    /// DolphinDos parallel cable: outgoing handshake (open collector).
    HandshakeTx,
    /// DolphinDos parallel cable: incoming handshake.
    HandshakeRx,
    /// DolphinDos parallel cable: data bit 0-7 (push-pull, direction
    /// switched as a group).
    Parallel(u8),
}

/// Host-supplied pin I/O and timing.
///
/// Lines the hardware does not provide need no special handling beyond
/// returning `false` from [`Pins::has`]: the engine will not touch them.
pub trait Pins {
    /// Read the logical bus level of a line: `true` is high (released),
    /// `false` is low (driven by someone).
    fn read(&self, line: Line) -> bool;

    /// Drive a line low (configure the pin as output low).
    fn drive_low(&mut self, line: Line);

    /// Release a line (configure the pin as input, high-Z).
    fn release(&mut self, line: Line);

    /// Monotonic microsecond counter.  Wraps at `u32::MAX`; the engine only
    /// ever computes wrapping differences.
    fn micros(&self) -> u32;

    /// Whether a line is wired at all.
    ///
    /// The default claims the three mandatory serial lines and nothing
    /// else.
    fn has(&self, line: Line) -> bool {
        matches!(line, Line::Atn | Line::Clk | Line::Data)
    }

    /// Whether a falling edge has been seen on [`Line::HandshakeRx`] since
    /// the last call.  The pulse is ~1us wide so polling the level cannot
    /// catch it; hosts latch the edge in hardware or in an interrupt
    /// handler and clear the latch here.
    fn parallel_handshake_received(&mut self) -> bool {
        false
    }

    /// Read the 8 parallel data lines as a byte, bit 0 on `Parallel(0)`.
    fn read_parallel(&self) -> u8 {
        0xFF
    }

    /// Put a byte on the 8 parallel data lines.  Only meaningful after
    /// `set_parallel_output`.
    fn write_parallel(&mut self, _data: u8) {}

    /// Switch the parallel data lines to input (high-Z).
    fn set_parallel_input(&mut self) {}

    /// Switch the parallel data lines to push-pull output.
    fn set_parallel_output(&mut self) {}
}

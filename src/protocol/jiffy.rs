//! JiffyDos transfer engine.
//!
//! JiffyDos replaces the bit-serial phase with a self-clocked protocol:
//! both sides agree on one reference edge per byte and every bit pair is
//! latched at a fixed microsecond offset from it.  The host side runs
//! cycle-counted kernal loops, so our side must hold the same offsets
//! within a microsecond - each byte therefore runs inside a critical
//! section with interrupts masked.
//!
//! Offsets are in `constants.rs`; they come from the JiffyDos kernal
//! disassembly and are shared with every other JiffyDos device
//! implementation.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{BusError, IecDriver};
use crate::constants::{
    JIFFY_BLOCK_EOI_PULSE, JIFFY_BLOCK_OFFSETS, JIFFY_RX_ACK, JIFFY_RX_EOI, JIFFY_RX_OFFSETS,
    JIFFY_TX_OFFSETS, JIFFY_TX_SETTLE,
};
use crate::pins::Pins;

impl<'a, P: Pins> IecDriver<'a, P> {
    /// Receive one byte under the JiffyDos protocol.  Reference edge:
    /// CLK high.
    pub(crate) fn receive_jiffy_byte(&mut self, can_write_ok: bool) -> Result<(), BusError> {
        let (data, eoi) = critical_section::with(|_| {
            // Signal ready by releasing DATA.
            self.bus.release_data();

            // Wait (indefinitely) for CLK high or ATN low.  This must be
            // a blocking spin: the sender starts the byte immediately
            // after raising CLK.
            while !self.bus.get_clock() && self.bus.get_atn() {}
            let reference = self.bus.micros();

            if !self.bus.get_atn() {
                return Err(BusError::AtnPreempted);
            }

            let mut data: u8 = 0;

            // Bit pairs appear at fixed offsets: 4+5, 6+7, 3+1, 2+0.
            // A low line is a set bit.
            for (i, bits) in [(4u8, 5u8), (6, 7), (3, 1), (2, 0)].iter().enumerate() {
                self.bus.wait_until(reference, JIFFY_RX_OFFSETS[i]);
                if !self.bus.get_clock() {
                    data |= 1 << bits.0;
                }
                if !self.bus.get_data() {
                    data |= 1 << bits.1;
                }
            }

            // CLK still high at the EOI offset means this was the last
            // byte.
            self.bus.wait_until(reference, JIFFY_RX_EOI);
            let eoi = self.bus.get_clock();

            // Acknowledge receipt; the sender samples DATA at 80 cycles.
            self.bus.set_data();
            self.bus.wait_until(reference, JIFFY_RX_ACK);

            Ok((data, eoi))
        })?;

        if can_write_ok {
            self.deliver_byte(data, eoi);
            Ok(())
        } else {
            Err(BusError::DeviceRefused)
        }
    }

    /// Transmit one byte under the JiffyDos protocol.  Reference edge:
    /// DATA high (driven by the receiver).
    pub(crate) fn transmit_jiffy_byte(&mut self, num_data: i8) -> Result<(), BusError> {
        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };
        let data = if num_data > 0 {
            self.devices[cur].dev.peek()
        } else {
            0
        };

        let reference = critical_section::with(|_| {
            // Signal ready by releasing CLK.
            self.bus.release_clock();

            // Wait (indefinitely) for DATA high or ATN low; the receiver
            // reads the first pair immediately after raising DATA.
            while !self.bus.get_data() && self.bus.get_atn() {}
            let reference = self.bus.micros();

            if !self.bus.get_atn() {
                return Err(BusError::AtnPreempted);
            }

            // First pair goes out at the reference edge itself.
            self.bus.write_clock(data & 0x01 != 0);
            self.bus.write_data(data & 0x02 != 0);

            self.bus.wait_until(reference, JIFFY_TX_OFFSETS[0]);
            self.bus.write_clock(data & 0x04 != 0);
            self.bus.write_data(data & 0x08 != 0);

            self.bus.wait_until(reference, JIFFY_TX_OFFSETS[1]);
            self.bus.write_clock(data & 0x10 != 0);
            self.bus.write_data(data & 0x20 != 0);

            self.bus.wait_until(reference, JIFFY_TX_OFFSETS[2]);
            self.bus.write_clock(data & 0x40 != 0);
            self.bus.write_data(data & 0x80 != 0);

            self.bus.wait_until(reference, JIFFY_TX_OFFSETS[3]);

            // Status flags: CLK low + DATA high = more data follows,
            // CLK high + DATA low = EOI, CLK high + DATA high = error.
            if num_data > 1 {
                self.bus.set_clock();
                self.bus.release_data();
            } else {
                self.bus.release_clock();
                self.bus.write_data(num_data == 0);
            }

            Ok(reference)
        })?;

        // Let DATA settle high before the receiver's acknowledge, which
        // lands 63 cycles after the reference edge.
        self.bus.wait_until(reference, JIFFY_TX_SETTLE);

        // Receiver pulls DATA low when it is done.
        self.wait_data(false, crate::constants::IEC_EDGE_TIMEOUT)?;

        if num_data > 0 {
            // Byte is safely across: consume what we peeked.
            self.devices[cur].dev.read();
            Ok(())
        } else {
            Err(BusError::DeviceRefused)
        }
    }

    /// Transmit up to one buffer of data in JiffyDos block mode.  The
    /// receiver clocks each byte by pulling DATA low.  Returns whether the
    /// transfer may continue (an empty block signals EOI and ends it).
    pub(crate) fn transmit_jiffy_block(&mut self, num_bytes: usize) -> bool {
        // Wait until the receiver is no longer holding DATA; it starts
        // its EOI timeout the moment it releases, so we must be here
        // spinning, not in the scheduler.
        while !self.bus.get_data() {
            if !self.bus.get_atn() {
                return false;
            }
        }

        if num_bytes == 0 {
            // Nothing to send: signal EOI by pulsing CLK with DATA high.
            self.bus.release_data();
            self.bus.release_clock();
            if self.wait_timeout(JIFFY_BLOCK_EOI_PULSE).is_err() {
                return false;
            }
            self.bus.set_clock();
            if self.wait_timeout(JIFFY_BLOCK_EOI_PULSE).is_err() {
                return false;
            }
            return false;
        }

        // Ready-to-send: DATA low, CLK released.
        self.bus.set_data();
        self.bus.release_clock();

        // Make sure the receiver has seen DATA low; even in its tight
        // loop a VIC "bad line" may steal 40us from it.
        if self.wait_timeout(50).is_err() {
            return false;
        }

        critical_section::with(|_| {
            for i in 0..num_bytes {
                let data = self.buffer[i];

                self.bus.release_data();
                self.bus.release_clock();

                // The receiver needs at least 19 cycles between seeing
                // DATA high and answering with DATA low.
                self.bus.delay_us(2);

                // Wait (indefinitely) for DATA low or ATN low.
                while self.bus.get_data() && self.bus.get_atn() {}
                let reference = self.bus.micros();

                if !self.bus.get_atn() {
                    return false;
                }

                self.bus.wait_until(reference, JIFFY_BLOCK_OFFSETS[0]);
                self.bus.write_clock(data & 0x01 != 0);
                self.bus.write_data(data & 0x02 != 0);

                self.bus.wait_until(reference, JIFFY_BLOCK_OFFSETS[1]);
                self.bus.write_clock(data & 0x04 != 0);
                self.bus.write_data(data & 0x08 != 0);

                self.bus.wait_until(reference, JIFFY_BLOCK_OFFSETS[2]);
                self.bus.write_clock(data & 0x10 != 0);
                self.bus.write_data(data & 0x20 != 0);

                self.bus.wait_until(reference, JIFFY_BLOCK_OFFSETS[3]);
                self.bus.write_clock(data & 0x40 != 0);
                self.bus.write_data(data & 0x80 != 0);

                self.bus.wait_until(reference, JIFFY_BLOCK_OFFSETS[4]);
            }

            // Block done: not-ready on CLK, give DATA back.
            self.bus.set_clock();
            self.bus.release_data();

            true
        })
    }
}

//! DolphinDos transfer engine.
//!
//! DolphinDos moves the data bits onto a side-channel parallel cable and
//! keeps the serial lines for framing only.  Byte mode frames each byte
//! with the CLK/DATA handshake; burst mode drops the serial handshake
//! entirely and frames bytes with pulses on the two parallel handshake
//! lines (HT out, HR in), with CLK carrying only the end-of-data mark.
//!
//! The awkward part is SAVE: the host sends two data bytes before deciding
//! (via the `XZ` command) whether to switch to burst mode, and a burst
//! re-sends them.  The engine therefore holds the first two bytes of a
//! SAVE in the fastload buffer and either discards them (burst) or
//! delivers them late (no burst).

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{BusError, IecDriver};
use crate::constants::{
    DOLPHIN_ACK_TIMEOUT, DOLPHIN_BURST_CONFIRM_DELAY, DOLPHIN_EOI_ACK, DOLPHIN_EOI_GAP,
    DOLPHIN_PREBUFFER_BYTES, FASTLOAD_BUFFER_SIZE,
};
use crate::pins::Pins;

impl<'a, P: Pins> IecDriver<'a, P> {
    /// Receive one byte in Dolphin byte mode.  The sender has already
    /// released CLK (ready-to-send).
    pub(crate) fn receive_dolphin_byte(&mut self, can_write_ok: bool) -> Result<(), BusError> {
        let mut eoi = false;

        // If a SAVE left bytes in the prebuffer and no burst request
        // arrived, they must reach the device - in order - before the next
        // byte off the wire.  We only get here once the host is ready to
        // send again, which is exactly late enough to know no burst is
        // coming.
        if self.secondary == 0x61
            && self.dolphin_ctr > 0
            && self.dolphin_ctr <= DOLPHIN_PREBUFFER_BYTES
        {
            let data = self.buffer[self.dolphin_ctr - 1];
            self.deliver_byte(data, false);
            self.dolphin_ctr -= 1;
            return Ok(());
        }

        // Signal ready.
        self.bus.release_data();

        match self.wait_clk(false, DOLPHIN_EOI_GAP) {
            Ok(()) => {}
            Err(BusError::Timeout) => {
                // No CLK low within 100us: EOI.  Acknowledge with a 60us
                // DATA pulse, then wait for the byte.
                eoi = true;
                self.bus.set_data();
                self.wait_timeout(DOLPHIN_EOI_ACK)?;
                self.bus.release_data();

                self.wait_clk(false, 0)?;
            }
            Err(e) => return Err(e),
        }

        if !can_write_ok {
            return Err(BusError::DeviceRefused);
        }

        // The bits travel on the parallel cable.
        let data = self.bus.read_parallel();

        // Confirm receipt.
        self.bus.set_data();

        if self.secondary == 0x61 && self.dolphin_ctr > DOLPHIN_PREBUFFER_BYTES {
            // Start of a SAVE: hold the byte back (see module docs).
            self.buffer[self.dolphin_ctr - DOLPHIN_PREBUFFER_BYTES - 1] = data;
            self.dolphin_ctr -= 1;
        } else {
            self.deliver_byte(data, eoi);
        }

        Ok(())
    }

    /// Transmit one byte in Dolphin byte mode.
    pub(crate) fn transmit_dolphin_byte(&mut self, num_data: i8) -> Result<(), BusError> {
        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };

        // The receiver starts a 50us EOI timeout the moment it releases
        // DATA, so everything from ready-to-send to data-valid runs with
        // interrupts masked, and the byte is fetched up front.
        let data = if num_data > 0 {
            self.devices[cur].dev.peek()
        } else {
            0xFF
        };

        critical_section::with(|_| {
            // Ready-to-send.
            self.bus.release_clock();

            // Wait for ready-for-data.
            self.wait_data(true, 0)?;

            if num_data == 0 {
                // Nothing to send; aborting signals the error.
                return Err(BusError::DeviceRefused);
            }

            if num_data == 1 {
                // Last byte: EOI, confirmed by a low/high pulse on DATA.
                self.wait_data(false, DOLPHIN_ACK_TIMEOUT)?;
                self.wait_data(true, DOLPHIN_ACK_TIMEOUT)?;
            }

            // Data valid: byte on the cable, CLK low.
            self.bus.set_parallel_output();
            self.bus.write_parallel(data);
            self.bus.set_clock();

            Ok(())
        })?;

        // Byte is on the wire: consume it.
        self.devices[cur].dev.read();

        // Keep a copy of the first LOAD bytes; a later `XQ` burst request
        // makes us re-send them (see transmit_dolphin_burst).
        if self.secondary == 0x60 && self.dolphin_ctr < DOLPHIN_PREBUFFER_BYTES {
            self.buffer[self.dolphin_ctr] = data;
            self.dolphin_ctr += 1;
        }

        // Receiver confirms within 1ms.
        let res = self.wait_data(false, DOLPHIN_ACK_TIMEOUT);

        // The parallel bus is shared; always hand it back.
        self.bus.set_parallel_input();

        res
    }

    /// Receive a whole transmission in burst mode.  The sender has already
    /// pulled CLK low; each byte is framed by HT/HR handshake pulses and
    /// CLK high marks the final byte.
    pub(crate) fn receive_dolphin_burst(&mut self) -> Result<(), BusError> {
        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };
        let mut n = 0;

        // Clear any stale handshake edge.
        self.bus.parallel_handshake_received();

        // Not ready for the serial handshake anymore.
        self.bus.set_data();

        // Confirm burst mode.
        self.bus.parallel_handshake_transmit();

        let mut eoi = false;
        while !eoi {
            // Wait for "data ready", giving up if ATN is asserted.
            while !self.bus.parallel_handshake_received() {
                if !self.bus.get_atn() {
                    return Err(BusError::AtnPreempted);
                }
            }

            // CLK released means this is the final byte.
            eoi = self.bus.get_clock();

            self.buffer[n] = self.bus.read_parallel();
            n += 1;

            if n < FASTLOAD_BUFFER_SIZE && !eoi {
                // Buffered; keep the host streaming.
                self.bus.parallel_handshake_transmit();
            } else if self.devices[cur].dev.write_block(&self.buffer[..n], eoi) == n {
                self.bus.parallel_handshake_transmit();
                n = 0;
            } else {
                // Device refused the data: release DATA to signal the
                // error and stop.
                self.bus.release_data();
                return Err(BusError::DeviceRefused);
            }
        }

        Ok(())
    }

    /// Transmit the rest of the current file in burst mode.  The host has
    /// already pulled DATA low.
    pub(crate) fn transmit_dolphin_burst(&mut self) -> Result<(), BusError> {
        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };

        // Confirm the burst request.
        self.bus.parallel_handshake_transmit();

        // The host prints the load address after seeing the confirmation;
        // a handshake sent too early would be lost.
        self.bus.delay_us(DOLPHIN_BURST_CONFIRM_DELAY);

        self.bus.set_parallel_output();

        // The host switched to burst after the transmission had started;
        // re-send the bytes that already went out in byte mode.
        for i in 0..self.dolphin_ctr {
            let data = self.buffer[i];
            if let Err(e) = self.burst_transmit_byte(data) {
                self.bus.set_parallel_input();
                return Err(e);
            }
        }

        // Stream the device dry.
        loop {
            let n = self.devices[cur].dev.read_block(&mut self.buffer);
            if n == 0 {
                break;
            }
            for i in 0..n {
                let data = self.buffer[i];
                if let Err(e) = self.burst_transmit_byte(data) {
                    self.bus.set_parallel_input();
                    self.bus.release_clock();
                    return Err(e);
                }
            }
        }

        self.bus.set_parallel_input();

        // End of data.
        self.bus.release_clock();

        // Host confirms by releasing DATA; answer with a final handshake.
        self.wait_data(true, DOLPHIN_ACK_TIMEOUT)?;
        self.bus.parallel_handshake_transmit();

        Ok(())
    }

    /// One byte of a burst transmit: put it on the cable, pulse HT, wait
    /// for the HR pulse back.
    fn burst_transmit_byte(&mut self, data: u8) -> Result<(), BusError> {
        self.bus.write_parallel(data);

        // Our own HT pulse can couple a glitch onto HR, so clear the
        // receive latch immediately after pulsing, with nothing allowed in
        // between.
        critical_section::with(|_| {
            self.bus.parallel_handshake_transmit();
            self.bus.parallel_handshake_received();
        });

        while !self.bus.parallel_handshake_received() {
            if !self.bus.get_atn() || self.bus.get_data() {
                // Host pulled ATN or released DATA: transfer is dead.
                return Err(BusError::AtnPreempted);
            }
        }

        Ok(())
    }
}

//! Standard IEC handshake: receive and transmit one byte.
//!
//! Both routines are entered from `tick()` once the other side has
//! signaled readiness; they own the bus until the byte is done or the
//! handshake dies.  Fast-loader detection hooks live inside the receive
//! path because that is where the host hides its signatures.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[cfg(any(feature = "jiffy", feature = "dolphin"))]
use super::DeviceFlags;
use super::{BusError, Flags, IecDriver};
use crate::constants::{
    IEC_BIT_SETUP, IEC_BIT_VALID, IEC_EDGE_TIMEOUT, IEC_EOI_ACK, IEC_EOI_GAP, IEC_UNLISTEN,
    IEC_UNTALK,
};
use crate::pins::Pins;

impl<'a, P: Pins> IecDriver<'a, P> {
    /// Receive one byte.  The sender has already released CLK
    /// (ready-to-send); we are either under ATN or addressed as listener.
    ///
    /// `can_write_ok` is the result of the device's `can_write()` gate;
    /// addressing bytes ignore it.
    pub(crate) fn receive_iec_byte(&mut self, can_write_ok: bool) -> Result<(), BusError> {
        let mut eoi = false;

        // Signal ready-for-data.
        self.bus.release_data();

        // Under ATN, other devices may still be holding DATA; wait until
        // the line is really high or we will mis-read the EOI gap.
        if self.flags.contains(Flags::ATN) {
            self.wait_data(true, IEC_EDGE_TIMEOUT)?;
        }

        match self.wait_clk(false, IEC_EOI_GAP) {
            Ok(()) => {}
            Err(BusError::Timeout) => {
                // Sender did not pull CLK low within 200us of our DATA
                // release: EOI.  Acknowledge with an 80us DATA pulse and
                // then wait for the byte proper.
                eoi = true;
                self.bus.set_data();
                self.wait_timeout(IEC_EOI_ACK)?;
                self.bus.release_data();

                self.wait_clk(false, 0)?;
            }
            Err(e) => return Err(e),
        }

        let mut data: u8 = 0;
        for bit in 0..8u8 {
            // Wait for CLK high: data valid.
            #[cfg(feature = "jiffy")]
            match self.wait_clk(true, IEC_EOI_GAP) {
                Ok(()) => {}
                Err(e) => {
                    if !self.flags.contains(Flags::ATN) && !self.bus.get_atn() {
                        return Err(BusError::AtnPreempted);
                    }

                    // A sender delaying the final bit of the primary
                    // address under ATN by >200us is asking "do you speak
                    // JiffyDos?".  The partial byte holds 7 of the 8 bits;
                    // its low nibble (after the pending shift) is the
                    // device address being probed.
                    if e == BusError::Timeout
                        && self.flags.contains(Flags::ATN)
                        && self.primary == 0
                        && bit == 7
                    {
                        if let Some(i) = self.device_index((data >> 1) & 0x0F) {
                            if self.devices[i].sflags.contains(DeviceFlags::JIFFY_ENABLED) {
                                self.devices[i].sflags.insert(DeviceFlags::JIFFY_DETECTED);

                                // Acknowledge with an 80us DATA pulse.
                                self.bus.set_data();
                                self.wait_timeout(IEC_EOI_ACK)?;
                                self.bus.release_data();
                            }
                        }
                    }

                    self.wait_clk(true, IEC_EDGE_TIMEOUT)?;
                }
            }
            #[cfg(not(feature = "jiffy"))]
            {
                let _ = bit;
                self.wait_clk(true, IEC_EDGE_TIMEOUT)?;
            }

            // Sample the bit, LSB first.
            data >>= 1;
            if self.bus.get_data() {
                data |= 0x80;
            }

            // Wait for CLK low: data not valid.
            self.wait_clk(false, IEC_EDGE_TIMEOUT)?;
        }

        if self.flags.contains(Flags::ATN) {
            self.receive_under_atn(data)
        } else if can_write_ok {
            // Acknowledge receipt and hand the byte up.
            self.bus.set_data();
            self.deliver_byte(data, eoi);
            Ok(())
        } else {
            Err(BusError::DeviceRefused)
        }
    }

    /// An addressing byte arrived under ATN: capture primary/secondary and
    /// decide whether to acknowledge the frame.
    fn receive_under_atn(&mut self, data: u8) -> Result<(), BusError> {
        if self.primary == 0 {
            self.primary = data;
            self.current = self.device_index(self.primary & 0x0F);
            if let Some(i) = self.current {
                self.devices[i].dev.primary_address(self.primary);
            }
        } else if self.secondary == 0 {
            self.secondary = data;
            if let Some(i) = self.current {
                self.devices[i].dev.secondary_address(self.secondary);
            }
        }

        if self.primary != IEC_UNLISTEN
            && self.primary != IEC_UNTALK
            && self.device_index(self.primary & 0x1F).is_none()
        {
            // Not a broadcast and not our address: do not acknowledge and
            // stop listening.  If every device stays silent the bus master
            // sees "device not present".
            trace!("primary 0x{:02x} not for us", self.primary);
            return Err(BusError::NotAddressed);
        }

        // Acknowledge receipt.
        self.bus.set_data();

        // DolphinDos parallel cable probe: after any acknowledged non-zero
        // secondary the host pulses the parallel handshake line; reply in
        // kind to confirm the cable.
        #[cfg(feature = "dolphin")]
        if self.secondary != 0 {
            if let Some(i) = self.device_index(self.primary & 0x0F) {
                if self.devices[i]
                    .sflags
                    .contains(DeviceFlags::DOLPHIN_ENABLED)
                {
                    // Clear any stale handshake, then watch for one until
                    // ATN rises.
                    self.bus.parallel_handshake_received();
                    while !self.bus.get_atn() {
                        if self.bus.parallel_handshake_received() {
                            self.devices[i].sflags.insert(DeviceFlags::DOLPHIN_DETECTED);
                            self.bus.parallel_handshake_transmit();
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Transmit one byte.  We are the talker; `num_data` is the device's
    /// `can_read()` answer: 0 means nothing to send (error), 1 means this
    /// is the last byte (EOI), more means more will follow.
    pub(crate) fn transmit_iec_byte(&mut self, num_data: i8) -> Result<(), BusError> {
        // DATA already high before we signaled ready-to-send reads as the
        // 1541's "verify error" condition; it forces the EOI path with an
        // untimed wait.
        let verify_error = self.bus.get_data();

        // Signal ready-to-send.
        self.bus.release_clock();

        // Wait for ready-to-receive.  No timeout: the receiver starts its
        // EOI clock the moment it releases DATA, so returning to the
        // scheduler here would corrupt the handshake.
        self.wait_data(true, 0)?;

        if num_data == 1 || verify_error {
            // Last byte: signal EOI by keeping CLK released and wait for
            // the receiver's DATA low/high acknowledge pulse.
            self.wait_data(false, if verify_error { 0 } else { IEC_EDGE_TIMEOUT })?;
            self.wait_data(true, IEC_EDGE_TIMEOUT)?;
        }

        if num_data == 0 {
            // Nothing to send.  Aborting here is what the host perceives
            // as e.g. "file not found" on LOAD.
            return Err(BusError::DeviceRefused);
        }

        // Data not valid yet.
        self.bus.set_clock();

        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };
        let mut data = self.devices[cur].dev.read();

        for _ in 0..8 {
            self.bus.set_clock();
            self.bus.write_data(data & 1 != 0);
            self.wait_timeout(IEC_BIT_SETUP)?;

            // Data valid.
            self.bus.release_clock();
            self.wait_timeout(IEC_BIT_VALID)?;

            data >>= 1;
        }

        // Byte done: busy again, hand DATA back to the receiver.
        self.bus.set_clock();
        self.bus.release_data();

        // Receiver acknowledges by pulling DATA low.
        self.wait_data(false, IEC_EDGE_TIMEOUT)?;

        Ok(())
    }
}

//! Epyx FastLoad transfer engine.
//!
//! The cartridge announces itself in-band: two `M-W` commands upload a
//! routine into drive RAM and an `M-E` executes it (recognized by the
//! command sniffer in `commands.rs`).  From then on the computer clocks
//! everything - first it sends us the 256-byte routine again over the
//! fast bit protocol, and the 8-bit sum of that upload tells us which
//! operation it performs: LOAD FILE, or (V1-V3) a sector read/write.
//!
//! Both bit directions run fully receiver-clocked with interrupts masked;
//! the transmit side places inverted bit pairs at fixed offsets from the
//! DATA high edge, the receive side samples on alternating CLK edges.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::{BusError, DeviceFlags, IecDriver};
use crate::constants::{
    EPYX_HEADER_SIZE, EPYX_LOAD_CHECKSUMS, EPYX_MAX_FILENAME, EPYX_TX_OFFSETS, EPYX_TX_RELEASE,
};
#[cfg(feature = "epyx-sectorops")]
use crate::constants::{
    EPYX_COMMAND_GAP, EPYX_HEARTBEAT_HALF_PERIOD, EPYX_HEARTBEAT_ITERATIONS,
};
use crate::pins::Pins;

impl<'a, P: Pins> IecDriver<'a, P> {
    /// Receive one byte, computer-clocked: one bit per CLK edge,
    /// alternating, DATA read inverted, MSB shifted in first.
    ///
    /// No timeouts here - interrupts are masked and on some platforms the
    /// clock source must not be touched in that state, so the ATN rule is
    /// the only way out.
    pub(crate) fn receive_epyx_byte(&mut self) -> Result<u8, BusError> {
        let mut clk = true;
        let mut data: u8 = 0;

        for _ in 0..8 {
            clk = !clk;
            self.wait_clk(clk, 0)?;

            data >>= 1;
            if !self.bus.get_data() {
                data |= 0x80;
            }
        }

        Ok(data)
    }

    /// Transmit one byte, computer-clocked from the DATA high edge, bits
    /// inverted, pairs {7,5} {6,4} {3,1} {2,0}.
    pub(crate) fn transmit_epyx_byte(&mut self, data: u8) -> Result<(), BusError> {
        // Receiver expects inverted bits.
        let data = !data;

        // Wait (indefinitely) for DATA high or ATN low.
        while !self.bus.get_data() && self.bus.get_atn() {}
        let reference = self.bus.micros();

        if !self.bus.get_atn() {
            return Err(BusError::AtnPreempted);
        }

        self.bus.write_clock(data & 0x80 != 0);
        self.bus.write_data(data & 0x20 != 0);

        self.bus.wait_until(reference, EPYX_TX_OFFSETS[0]);
        self.bus.write_clock(data & 0x40 != 0);
        self.bus.write_data(data & 0x10 != 0);

        self.bus.wait_until(reference, EPYX_TX_OFFSETS[1]);
        self.bus.write_clock(data & 0x08 != 0);
        self.bus.write_data(data & 0x02 != 0);

        self.bus.wait_until(reference, EPYX_TX_OFFSETS[2]);
        self.bus.write_clock(data & 0x04 != 0);
        self.bus.write_data(data & 0x01 != 0);

        self.bus.wait_until(reference, EPYX_TX_OFFSETS[3]);

        // Give DATA back and let it stabilize before the receiver drives
        // it low again.
        self.bus.release_data();
        self.bus.wait_until(reference, EPYX_TX_RELEASE);

        // Receiver signals "not ready" for the next byte.
        self.wait_data(false, 0)?;

        Ok(())
    }

    /// The upload announced by `M-W`/`M-E` is about to arrive: receive the
    /// 256-byte routine, classify it by checksum and start the requested
    /// operation.
    pub(crate) fn receive_epyx_header(&mut self) -> Result<(), BusError> {
        let checksum = critical_section::with(|_| {
            // Ready for the header.
            self.bus.set_clock();

            // Computer answers with DATA low.
            self.wait_data(false, 0)?;

            self.bus.release_clock();

            let mut checksum: u8 = 0;
            for _ in 0..EPYX_HEADER_SIZE {
                let data = self.receive_epyx_byte()?;
                checksum = checksum.wrapping_add(data);
            }
            Ok(checksum)
        })?;

        if EPYX_LOAD_CHECKSUMS.contains(&checksum) {
            debug!("Epyx LOAD FILE, checksum 0x{:02x}", checksum);
            return self.receive_epyx_filename();
        }

        #[cfg(feature = "epyx-sectorops")]
        match checksum {
            // V1 sector read.
            0x0B => return self.start_epyx_sector_command(0x82),
            // V1 sector write.
            0xBA => return self.start_epyx_sector_command(0x81),
            // V2 and V3 sector read or write.
            0xB8 => return self.start_epyx_sector_command(0),
            _ => {}
        }

        debug!("Unknown Epyx routine, checksum 0x{:02x}", checksum);
        Err(BusError::ChecksumMismatch)
    }

    /// LOAD FILE: receive the filename (sent in reverse), open channel 0
    /// on the device with it and arm the block transmitter.
    fn receive_epyx_filename(&mut self) -> Result<(), BusError> {
        let n = critical_section::with(|_| {
            let n = self.receive_epyx_byte()? as usize;
            if n == 0 || n > EPYX_MAX_FILENAME {
                return Err(BusError::ChecksumMismatch);
            }

            // The name arrives last-character-first.
            for i in (0..n).rev() {
                self.buffer[i] = self.receive_epyx_byte()?;
            }

            // Not ready while the file opens.
            self.bus.set_clock();
            Ok(n)
        })?;

        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };

        // Run a DOS OPEN on channel 0 with the received name.
        self.devices[cur].dev.listen(0xF0);
        for i in 0..n {
            // The device may need disk time before it can take the name.
            loop {
                let ok = self.devices[cur].dev.can_write();
                if ok > 0 {
                    break;
                }
                if ok == 0 {
                    return Err(BusError::DeviceRefused);
                }
                if !self.bus.get_atn() {
                    return Err(BusError::AtnPreempted);
                }
            }
            let byte = self.buffer[i];
            let eoi = i < n - 1;
            self.devices[cur].dev.write(byte, eoi);
        }
        self.devices[cur].dev.unlisten();

        self.devices[cur].sflags.insert(DeviceFlags::EPYX_LOAD);
        Ok(())
    }

    /// Send one block of the file being loaded: a length byte followed by
    /// that many payload bytes.  A zero length tells the computer the file
    /// is done; returns whether there is more to send.
    pub(crate) fn transmit_epyx_block(&mut self) -> bool {
        let Some(cur) = self.current else {
            return false;
        };
        // The block length travels as one byte, so never pull more than
        // 255 at a time even when the buffer is larger.
        let cap = self.buffer.len().min(255);
        let n = self.devices[cur].dev.read_block(&mut self.buffer[..cap]);

        let sent = critical_section::with(|_| {
            // Ready.
            self.bus.release_clock();

            self.transmit_epyx_byte(n as u8)?;
            for i in 0..n {
                let data = self.buffer[i];
                self.transmit_epyx_byte(data)?;
            }

            // Not ready.
            self.bus.set_clock();
            Ok::<(), BusError>(())
        });

        sent.is_ok() && n > 0
    }

    /// Start one sector command: receive track/sector (and for V2/V3 the
    /// command byte), plus the sector data on a write.  `command` is 0x81
    /// for V1 write, 0x82 for V1 read, 0 for V2/V3 (command follows on the
    /// wire).
    #[cfg(feature = "epyx-sectorops")]
    pub(crate) fn start_epyx_sector_command(&mut self, command: u8) -> Result<(), BusError> {
        let mut command = command;

        if command == 0x81 {
            // V1 write re-enters here between sectors; the computer pulls
            // DATA low when the next block is ready.
            self.wait_data(false, 0)?;
        }

        let (track, sector) = critical_section::with(|_| {
            if command == 0x81 {
                self.bus.release_clock();
            }

            let track = self.receive_epyx_byte()?;
            let sector = self.receive_epyx_byte()?;

            // V1 uses distinct uploads for read and write; V2/V3 send the
            // command over the wire.
            if command == 0 {
                command = self.receive_epyx_byte()?;
            }

            if command & 0x7F == 1 {
                // Sector write: the data comes now.
                for i in 0..256 {
                    self.buffer[i] = self.receive_epyx_byte()?;
                }
            }

            // Not ready while we touch the disk.
            self.bus.set_clock();

            Ok((track, sector))
        })?;

        let Some(cur) = self.current else {
            return Err(BusError::DeviceRefused);
        };

        if command & 0x7F == 1
            && !self.devices[cur]
                .dev
                .epyx_write_sector(track, sector, &self.buffer[..256])
        {
            return Err(BusError::DeviceRefused);
        }

        // Stash the command for the continuation in the next tick.
        self.buffer[0] = command;
        self.buffer[1] = track;
        self.buffer[2] = sector;

        self.devices[cur].sflags.insert(DeviceFlags::EPYX_SECTOROP);
        Ok(())
    }

    /// Continue a sector command: produce the data on a read, then keep a
    /// heartbeat going until the computer either requests another sector
    /// or walks away.  Returns whether the sector-op session continues.
    #[cfg(feature = "epyx-sectorops")]
    pub(crate) fn finish_epyx_sector_command(&mut self) -> bool {
        let command = self.buffer[0];
        let track = self.buffer[1];
        let sector = self.buffer[2];

        let Some(cur) = self.current else {
            return false;
        };

        if command & 0x7F != 1
            && !self.devices[cur]
                .dev
                .epyx_read_sector(track, sector, &mut self.buffer[..256])
        {
            return false;
        }

        if command == 0x81 {
            // V1 write: ready, then straight into the next track/sector.
            self.bus.release_clock();
            return self.start_epyx_sector_command(0x81).is_ok();
        }

        let transferred = critical_section::with(|_| {
            // Ready.
            self.bus.release_clock();

            if command & 0x7F != 1 {
                // Sector read: send the data.
                for i in 0..256 {
                    let data = self.buffer[i];
                    self.transmit_epyx_byte(data)?;
                }
            } else {
                // V2/V3 write: hand DATA back and wait for the computer.
                self.bus.release_data();
                self.wait_data(false, 0)?;
            }
            Ok::<(), BusError>(())
        });
        if transferred.is_err() {
            return false;
        }

        // Toggle CLK as a heartbeat so the computer knows the sector code
        // is still "running" in the drive; without it, every sector of a
        // disk copy would re-upload the routine.  Give up after ~500ms of
        // DATA staying low.
        let mut alive = false;
        for _ in 0..EPYX_HEARTBEAT_ITERATIONS {
            self.bus.set_clock();
            if !self.bus.get_atn() {
                break;
            }
            self.bus.delay_us(EPYX_HEARTBEAT_HALF_PERIOD);
            self.bus.release_clock();
            if self.bus.get_data() {
                alive = true;
                break;
            }
            self.bus.delay_us(EPYX_HEARTBEAT_HALF_PERIOD);
        }

        if !alive || !self.bus.get_atn() {
            return false;
        }

        // The DATA high pulse between commands can be up to 90us wide.
        if self.wait_timeout(EPYX_COMMAND_GAP).is_err() {
            return false;
        }

        if self.bus.get_data() || !self.bus.get_atn() {
            // DATA stayed high: the computer is done with sector ops.
            false
        } else {
            // Another sector follows.
            let next = if command & 0x80 != 0 { command } else { 0 };
            self.start_epyx_sector_command(next).is_ok()
        }
    }
}

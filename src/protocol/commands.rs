//! Channel-15 command sniffing.
//!
//! Fast loaders announce themselves with commands on the command channel:
//! DolphinDos with the `XQ`/`XZ` burst requests and `XF+`/`XF-` toggles,
//! Epyx FastLoad with a fixed sequence of `M-W` memory writes followed by
//! an `M-E` execute.  The device layer owns command *execution*; the
//! engine only tees the bytes off as they are delivered and pattern-matches
//! them when the host unlistens, so that the protocol switch can be armed
//! without the device layer knowing anything about fast loaders.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use heapless::Vec;

use super::IecDriver;
use crate::constants::{COMMAND_BUFFER_SIZE, COMMAND_CHANNEL};
use crate::pins::Pins;

/// Captures the bytes the host writes to the command channel of whichever
/// device it is currently addressing.
pub(crate) struct CommandCapture {
    buf: Vec<u8, COMMAND_BUFFER_SIZE>,
    /// The address of the device being listened on channel 15, while that
    /// is the case.
    device: Option<u8>,
}

impl CommandCapture {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            device: None,
        }
    }

    /// A LISTEN completed; start or stop capturing depending on the
    /// channel.
    pub(crate) fn listen(&mut self, address: u8, secondary: u8) {
        if secondary & 0x0F == COMMAND_CHANNEL {
            self.buf.clear();
            self.device = Some(address);
        } else {
            self.device = None;
        }
    }

    /// A TALK completed; the host is reading (e.g. the status channel),
    /// not sending a command.
    pub(crate) fn talk(&mut self, secondary: u8) {
        if secondary & 0x0F != COMMAND_CHANNEL {
            self.device = None;
        }
    }

    pub(crate) fn armed(&self) -> bool {
        self.device.is_some()
    }

    /// Record one command byte.  Oversized commands are truncated; none of
    /// the recognized ones come close to the buffer size.
    pub(crate) fn push(&mut self, data: u8) {
        let _ = self.buf.push(data);
    }

    /// Take the finished command, stripping the trailing carriage return
    /// BASIC appends to `PRINT#`-style commands.
    fn take(&mut self) -> (u8, usize) {
        let device = self.device.take().unwrap_or(0);
        let mut len = self.buf.len();
        if len > 0 && self.buf[len - 1] == 0x0D {
            len -= 1;
        }
        (device, len)
    }

    fn bytes(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }
}

/// Does `cmd` look like `M-W <addr> <len>` with a payload summing to
/// `checksum`?  The triple (address, length, checksum) identifies one
/// block of an Epyx FastLoad routine upload.
#[cfg(feature = "epyx")]
fn is_mw_command(cmd: &[u8], addr: u16, len: u8, checksum: u8) -> bool {
    let len = len as usize;
    if cmd.len() < len + 6 || &cmd[..3] != b"M-W" {
        return false;
    }
    if cmd[3] != (addr & 0xFF) as u8 || cmd[4] != (addr >> 8) as u8 || cmd[5] != len as u8 {
        return false;
    }

    let mut sum: u8 = 0;
    for byte in &cmd[6..6 + len] {
        sum = sum.wrapping_add(*byte);
    }
    sum == checksum
}

/// Does `cmd` start with `M-E <addr>`?
#[cfg(feature = "epyx")]
fn is_me_command(cmd: &[u8], addr: u16) -> bool {
    cmd.len() >= 5
        && &cmd[..3] == b"M-E"
        && cmd[3] == (addr & 0xFF) as u8
        && cmd[4] == (addr >> 8) as u8
}

impl<'a, P: Pins> IecDriver<'a, P> {
    /// The host unlistened after writing the command channel: run the
    /// recognizers over what it sent.  The bytes have already been
    /// delivered to the device - recognition is a side channel, not a
    /// filter.
    pub(crate) fn dispatch_command(&mut self) {
        if !self.cmd.armed() {
            return;
        }
        let (address, len) = self.cmd.take();
        if len == 0 {
            return;
        }

        #[cfg(feature = "epyx")]
        self.sniff_epyx_command(address, len);
        #[cfg(feature = "dolphin")]
        self.sniff_dolphin_command(address, len);
        #[cfg(not(any(feature = "epyx", feature = "dolphin")))]
        let _ = (address, len);
    }

    /// Track the Epyx upload sequence for this device.  V1 writes two
    /// 0x20-byte blocks at $0180/$01A0 and executes at $01A2; V2/V3 write
    /// three 0x19-byte blocks at $0180/$0199/$01B2 and execute at $01A9.
    /// Anything else resets the match.
    #[cfg(feature = "epyx")]
    fn sniff_epyx_command(&mut self, address: u8, len: usize) {
        let Some(i) = self.device_index(address) else {
            return;
        };

        let cmd = self.cmd.bytes(len);
        let ctr = self.devices[i].epyx_ctr;

        let next = if ctr == 0 && is_mw_command(cmd, 0x0180, 0x20, 0x2E) {
            11
        } else if ctr == 11 && is_mw_command(cmd, 0x01A0, 0x20, 0xA5) {
            12
        } else if ctr == 12 && is_me_command(cmd, 0x01A2) {
            // Epyx V1.
            99
        } else if ctr == 0 && is_mw_command(cmd, 0x0180, 0x19, 0x53) {
            21
        } else if ctr == 21 && is_mw_command(cmd, 0x0199, 0x19, 0xA6) {
            22
        } else if ctr == 22 && is_mw_command(cmd, 0x01B2, 0x19, 0x8F) {
            23
        } else if ctr == 23 && is_me_command(cmd, 0x01A9) {
            // Epyx V2 or V3.
            99
        } else {
            0
        };

        if next == 99 {
            info!("Epyx FastLoad detected on device {}", address);
            self.devices[i].epyx_ctr = 0;
            self.epyx_load_request(address);
        } else {
            self.devices[i].epyx_ctr = next;
        }
    }

    /// DolphinDos burst requests and the burst enable toggle.
    #[cfg(feature = "dolphin")]
    fn sniff_dolphin_command(&mut self, address: u8, len: usize) {
        let cmd = self.cmd.bytes(len);
        let burst_tx = cmd == b"XQ";
        let burst_rx = cmd == b"XZ";
        let burst_on = cmd == b"XF+";
        let burst_off = cmd == b"XF-";

        if burst_tx {
            debug!("Dolphin burst transmit request from device {}", address);
            self.dolphin_burst_transmit_request(address);
        } else if burst_rx {
            debug!("Dolphin burst receive request from device {}", address);
            self.dolphin_burst_receive_request(address);
        } else if burst_on {
            self.enable_dolphin_burst(address, true);
        } else if burst_off {
            self.enable_dolphin_burst(address, false);
        }
    }
}

//! This module contains the timing and sizing constants used by the IEC
//! bus engine.
//!
//! The bus timings are the ones the Commodore serial bus and the fastload
//! protocols were designed around.  They are not tunable - hosts time their
//! side of the handshake against real 1541 hardware, so changing any of
//! these values will break real-world compatibility.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

// Allow dead code in here, as some constants are not used, depending on the
// features enabled.
#![allow(dead_code)]

/// Maximum number of device personalities the engine can multiplex on one
/// bus.  Bus addresses are 5 bits (0-30) but no real setup comes close to
/// that many drives.
pub const MAX_DEVICES: usize = 8;

/// Maximum number of engine instances that may bind an ATN interrupt.  Two
/// engines (e.g. one per physical bus connector) share the ISR trampoline
/// registry.
pub const MAX_ENGINES: usize = 2;

/// Size of the engine-owned fastload buffer.  Backs JiffyDos block
/// transfers, DolphinDos pre-buffering and burst transfers, and Epyx block
/// operations.  Epyx sector operations move whole 256-byte sectors through
/// it, so the buffer grows when they are enabled.
#[cfg(feature = "epyx-sectorops")]
pub const FASTLOAD_BUFFER_SIZE: usize = 256;
#[cfg(not(feature = "epyx-sectorops"))]
pub const FASTLOAD_BUFFER_SIZE: usize = 128;

/// Capacity of the channel-15 command capture buffer.  The longest
/// recognized command is an Epyx `M-W` upload: 6 bytes of header plus 32
/// bytes of payload.
pub const COMMAND_BUFFER_SIZE: usize = 40;

//
// Primary/secondary address encoding
//

/// Primary address high-nibble: device should listen.
pub const IEC_LISTEN: u8 = 0x20;

/// Primary address high-nibble: device should talk.
pub const IEC_TALK: u8 = 0x40;

/// All listeners stop listening.
pub const IEC_UNLISTEN: u8 = 0x3F;

/// All talkers stop talking.
pub const IEC_UNTALK: u8 = 0x5F;

/// Secondary address high-nibble: data channel.
pub const IEC_OPEN_DATA: u8 = 0x60;

/// Secondary address high-nibble: close file on channel.
pub const IEC_CLOSE: u8 = 0xE0;

/// Secondary address high-nibble: open named file on channel (name follows
/// as data bytes).
pub const IEC_OPEN: u8 = 0xF0;

/// The command channel.
pub const COMMAND_CHANNEL: u8 = 15;

//
// Standard IEC protocol timings, in microseconds.
//

/// A sender that does not pull CLK low within this time after the receiver
/// released DATA is signaling EOI.
pub const IEC_EOI_GAP: u32 = 200;

/// How long the receiver holds DATA low to acknowledge an EOI.
pub const IEC_EOI_ACK: u32 = 80;

/// Data-bit hold time with CLK low (bit setup).
pub const IEC_BIT_SETUP: u32 = 80;

/// Data-bit hold time with CLK released (bit valid).
pub const IEC_BIT_VALID: u32 = 60;

/// Minimum gap between transmitted bytes.
pub const IEC_BETWEEN_BYTES: u32 = 200;

/// Delay between TALK role reversal and the first transmitted byte.
pub const IEC_TALK_FIRST_BYTE: u32 = 80;

/// Default timeout for a handshake edge that should arrive promptly.
pub const IEC_EDGE_TIMEOUT: u32 = 1000;

/// Other devices get this long after an ATN falling edge to release CLK
/// before we start interpreting bus state.
pub const ATN_SETTLE: u32 = 100;

//
// JiffyDos timings, in microseconds.  All offsets are measured from the
// reference edge (CLK high for receive, DATA high for transmit, DATA low
// for block transmit) as produced by the host's fixed-cycle kernal loops.
//

/// Receive bit-pair sample offsets: bits 4+5, 6+7, 3+1, 2+0.
pub const JIFFY_RX_OFFSETS: [u32; 4] = [14, 27, 38, 51];

/// Receive EOI sample offset (CLK still high at this point means EOI).
pub const JIFFY_RX_EOI: u32 = 64;

/// Receive acknowledge: DATA is held low until this offset.
pub const JIFFY_RX_ACK: u32 = 83;

/// Transmit bit-pair output offsets for pairs 2..=4 (the first pair goes
/// out at the reference edge itself), then the EOI/error flags.
pub const JIFFY_TX_OFFSETS: [u32; 4] = [17, 28, 39, 50];

/// Transmit: DATA must have settled high before the receiver acks.
pub const JIFFY_TX_SETTLE: u32 = 60;

/// Block transmit bit-pair output offsets from the DATA low edge.
pub const JIFFY_BLOCK_OFFSETS: [u32; 5] = [6, 17, 27, 39, 50];

/// Block transmit: gap the receiver needs between blocks to see CLK low
/// and enter its "new data block" state.
pub const JIFFY_BLOCK_GAP: u32 = 150;

/// Block transmit: CLK pulse width signaling an empty (EOI) block.
pub const JIFFY_BLOCK_EOI_PULSE: u32 = 100;

//
// DolphinDos timings, in microseconds.
//

/// Number of data bytes buffered at the start of a SAVE (secondary 0x61)
/// in case the host switches to burst mode and re-sends them.
pub const DOLPHIN_PREBUFFER_BYTES: usize = 2;

/// Byte receive: a sender that does not pull CLK low within this time is
/// signaling EOI.
pub const DOLPHIN_EOI_GAP: u32 = 100;

/// Byte receive: how long DATA is held low to acknowledge an EOI.
pub const DOLPHIN_EOI_ACK: u32 = 60;

/// Byte transmit: the receiver must acknowledge within this time.
pub const DOLPHIN_ACK_TIMEOUT: u32 = 1000;

/// Open-collector pulse width on the parallel handshake transmit line.
pub const DOLPHIN_HANDSHAKE_PULSE: u32 = 2;

/// Burst transmit: holdoff after the `XQ` request before the engine starts
/// driving the bus (gives other devices time to release DATA).
pub const DOLPHIN_BURST_TX_HOLDOFF: u32 = 200;

/// Burst receive: holdoff after the `XZ` request before the engine samples
/// CLK (the host needs time to release it after sending the request).
pub const DOLPHIN_BURST_RX_HOLDOFF: u32 = 500;

/// Burst transmit: delay after the confirmation handshake so the host (busy
/// printing the load address) cannot miss the next one.
pub const DOLPHIN_BURST_CONFIRM_DELAY: u32 = 1000;

//
// Epyx FastLoad timings and constants.
//

/// Transmit bit-pair output offsets from the DATA high edge for pairs
/// 2..=4 (the first pair goes out at the reference edge), then the DATA
/// release offset.
pub const EPYX_TX_OFFSETS: [u32; 4] = [17, 27, 37, 47];

/// Transmit: DATA is released at this offset, after the last bit pair.
pub const EPYX_TX_RELEASE: u32 = 49;

/// Length of the fastload routine the cartridge uploads into drive RAM.
pub const EPYX_HEADER_SIZE: usize = 256;

/// Maximum filename length in a LOAD FILE request.
pub const EPYX_MAX_FILENAME: usize = 32;

/// Checksums of the uploaded routine identifying a LOAD FILE request, for
/// cartridge V1, V2 and V3 respectively.
pub const EPYX_LOAD_CHECKSUMS: [u8; 3] = [0x26, 0x86, 0xAA];

/// Sector-op heartbeat: half-period of the CLK toggle.
pub const EPYX_HEARTBEAT_HALF_PERIOD: u32 = 8;

/// Sector-op heartbeat: number of CLK toggles before giving up on the host
/// (~500ms at ~16us per iteration).
pub const EPYX_HEARTBEAT_ITERATIONS: u32 = 30000;

/// Sector-op: the host's DATA high pulse between commands can be up to
/// 90us wide; wait this long before re-sampling.
pub const EPYX_COMMAND_GAP: u32 = 100;

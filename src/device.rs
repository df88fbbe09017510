//! The `Device` trait: one device personality on the bus.
//!
//! The engine speaks the wire protocol; a `Device` supplies the policy -
//! what the channels mean, where the data lives, what the status text
//! says.  A disk drive emulation implements this on top of its file layer.
//!
//! Flow control uses the tri-state convention of the 1541-alike firmwares:
//! `can_read`/`can_write` return a positive count when ready, `0` for
//! "refuse" (full, error, end of data) and a negative value for "not
//! decided yet", which makes the engine hold the handshake and ask again.
//! Those two calls are the only places a device may block for a long time
//! (e.g. for SD card access); everything else runs inside tight protocol
//! windows and must return in well under a millisecond.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub trait Device {
    /// The bus address this device answers to (0-30).  Must be stable for
    /// the lifetime of the attachment.
    fn address(&self) -> u8;

    /// Called once from the engine's `begin()`, or at attach time if the
    /// engine has already begun.
    fn begin(&mut self) {}

    /// Called on a falling edge of the RESET line.
    fn reset(&mut self) {}

    /// Called once per engine `tick()`, outside any protocol window.
    fn task(&mut self) {}

    /// Observer hook: the raw primary address byte, delivered while still
    /// under ATN when this device's address matched.
    fn primary_address(&mut self, _primary: u8) {}

    /// Observer hook: the raw secondary address byte, delivered while
    /// still under ATN.
    fn secondary_address(&mut self, _secondary: u8) {}

    /// ATN released after a LISTEN addressing us: data bytes will follow
    /// on the channel encoded in `secondary`.
    fn listen(&mut self, secondary: u8);

    /// All listeners told to stop (UNLISTEN).
    fn unlisten(&mut self);

    /// ATN released after a TALK addressing us: the engine will start
    /// pulling bytes via `read`.
    fn talk(&mut self, secondary: u8);

    /// All talkers told to stop (UNTALK).
    fn untalk(&mut self);

    /// May the engine deliver a received byte right now?  `>0` yes, `0`
    /// refuse (the host sees a transfer error), `<0` not decided yet.
    /// May block; the engine re-checks ATN afterwards.
    fn can_write(&mut self) -> i8;

    /// How many bytes can be read right now?  `>0` count (the engine's
    /// byte paths only care about 1 vs more-than-1, which drives EOI),
    /// `0` end of data, `<0` not decided yet.  May block.
    fn can_read(&mut self) -> i8;

    /// A received data byte, with the EOI flag the sender transmitted
    /// alongside it.
    fn write(&mut self, data: u8, eoi: bool);

    /// Block delivery used by the DolphinDos burst receive path.  Returns
    /// how many bytes were accepted; anything short of `data.len()` is an
    /// error and aborts the burst.
    ///
    /// The default feeds the byte path, with `eoi` on the final byte.
    fn write_block(&mut self, data: &[u8], eoi: bool) -> usize {
        for (i, byte) in data.iter().enumerate() {
            self.write(*byte, eoi && i == data.len() - 1);
        }
        data.len()
    }

    /// Consume and return the next byte to transmit.  Only called after
    /// `can_read()` returned `>0`.
    fn read(&mut self) -> u8;

    /// Fill `buffer` with as many bytes as are available, returning the
    /// count; `0` means end of data.  Used by the block-oriented fastload
    /// paths (JiffyDos block mode, DolphinDos burst, Epyx blocks).
    fn read_block(&mut self, buffer: &mut [u8]) -> usize;

    /// The next byte to transmit, without consuming it.  The fastload
    /// transmit paths peek first and consume only once the byte is safely
    /// on the wire.
    fn peek(&mut self) -> u8;

    /// Epyx sector read: fill `buffer` with track/sector contents.
    /// Returning `false` aborts the sector operation.
    #[cfg(feature = "epyx-sectorops")]
    fn epyx_read_sector(&mut self, _track: u8, _sector: u8, _buffer: &mut [u8]) -> bool {
        false
    }

    /// Epyx sector write: store `buffer` (256 bytes) at track/sector.
    /// Returning `false` aborts the sector operation.
    #[cfg(feature = "epyx-sectorops")]
    fn epyx_write_sector(&mut self, _track: u8, _sector: u8, _buffer: &[u8]) -> bool {
        false
    }
}

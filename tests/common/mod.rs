//! Common support for the integration tests: a simulated IEC bus, a
//! scripted bus master ("the host", i.e. the computer side of every
//! protocol) and a recording mock device.
//!
//! The engine runs in its own thread against the simulated bus; the test
//! thread plays the host.  Line levels are plain atomics with
//! open-collector semantics (a line is high unless somebody holds it low).
//! The microsecond clock the engine sees is real time divided by
//! `TIME_SCALE`, which keeps every protocol window generous in real time
//! while the virtual timings stay faithful.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use iecdevice_rs::{Device, IecDriver, Line, Pins};

/// Real microseconds per virtual microsecond.
pub const TIME_SCALE: u64 = 32;

/// Hard real-time cap; a wedged engine thread panics past this so a buggy
/// test fails instead of hanging.
pub const SIM_DEADLINE_SECS: u64 = 120;

const LINE_COUNT: usize = 7;

fn line_index(line: Line) -> usize {
    match line {
        Line::Atn => 0,
        Line::Clk => 1,
        Line::Data => 2,
        Line::Reset => 3,
        Line::Ctrl => 4,
        Line::HandshakeTx => 5,
        Line::HandshakeRx => 6,
        Line::Parallel(_) => unreachable!("parallel lines use the byte accessors"),
    }
}

/// The shared bus fabric.
pub struct SimBus {
    started: Instant,
    stopped: AtomicBool,
    engine_holds: [AtomicBool; LINE_COUNT],
    host_holds: [AtomicBool; LINE_COUNT],
    /// Parallel cable data, one value per driver.
    engine_parallel: AtomicU8,
    host_parallel: AtomicU8,
    engine_parallel_output: AtomicBool,
    /// Latched falling edges on the two handshake lines.
    handshake_to_engine: AtomicBool,
    handshake_to_host: AtomicBool,
    dolphin_cable: bool,
}

impl SimBus {
    pub fn new(dolphin_cable: bool) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            stopped: AtomicBool::new(false),
            engine_holds: Default::default(),
            host_holds: Default::default(),
            engine_parallel: AtomicU8::new(0xFF),
            host_parallel: AtomicU8::new(0xFF),
            engine_parallel_output: AtomicBool::new(false),
            handshake_to_engine: AtomicBool::new(false),
            handshake_to_host: AtomicBool::new(false),
            dolphin_cable,
        })
    }

    pub fn micros(&self) -> u32 {
        self.check_running();
        let real = self.started.elapsed();
        (real.as_micros() as u64 / TIME_SCALE) as u32
    }

    /// Line level after open-collector resolution: high unless held.
    pub fn level(&self, line: Line) -> bool {
        self.check_running();
        let i = line_index(line);
        !(self.engine_holds[i].load(Ordering::SeqCst) || self.host_holds[i].load(Ordering::SeqCst))
    }

    /// Every bus access is a cancellation point: once the test is over
    /// (or the deadline blown) the engine thread unwinds out of whatever
    /// spin loop it is parked in.
    fn check_running(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            panic!("simulated bus stopped");
        }
        assert!(
            self.started.elapsed().as_secs() < SIM_DEADLINE_SECS,
            "simulated bus exceeded its deadline - a handshake is stuck"
        );
    }

    fn engine_drive(&self, line: Line, hold: bool) {
        let i = line_index(line);
        if line == Line::HandshakeTx && hold && !self.engine_holds[i].load(Ordering::SeqCst) {
            // Falling edge towards the host: latch it.
            self.handshake_to_host.store(true, Ordering::SeqCst);
        }
        self.engine_holds[i].store(hold, Ordering::SeqCst);
    }

    pub fn host_drive(&self, line: Line, hold: bool) {
        let i = line_index(line);
        self.host_holds[i].store(hold, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The parallel byte as seen by whoever is reading.
    fn parallel_level(&self) -> u8 {
        if self.engine_parallel_output.load(Ordering::SeqCst) {
            self.engine_parallel.load(Ordering::SeqCst)
        } else {
            self.host_parallel.load(Ordering::SeqCst)
        }
    }
}

/// The engine's view of the bus.
pub struct SimPins {
    bus: Arc<SimBus>,
}

impl SimPins {
    pub fn new(bus: Arc<SimBus>) -> Self {
        Self { bus }
    }
}

impl Pins for SimPins {
    fn read(&self, line: Line) -> bool {
        if let Line::Parallel(bit) = line {
            return self.bus.parallel_level() & (1 << bit) != 0;
        }
        self.bus.level(line)
    }

    fn drive_low(&mut self, line: Line) {
        self.bus.engine_drive(line, true);
    }

    fn release(&mut self, line: Line) {
        self.bus.engine_drive(line, false);
    }

    fn micros(&self) -> u32 {
        self.bus.micros()
    }

    fn has(&self, line: Line) -> bool {
        match line {
            Line::Atn | Line::Clk | Line::Data | Line::Reset => true,
            Line::Ctrl => false,
            Line::HandshakeTx | Line::HandshakeRx | Line::Parallel(_) => self.bus.dolphin_cable,
        }
    }

    fn parallel_handshake_received(&mut self) -> bool {
        self.bus.handshake_to_engine.swap(false, Ordering::SeqCst)
    }

    fn read_parallel(&self) -> u8 {
        self.bus.parallel_level()
    }

    fn write_parallel(&mut self, data: u8) {
        self.bus.engine_parallel.store(data, Ordering::SeqCst);
    }

    fn set_parallel_input(&mut self) {
        self.bus.engine_parallel_output.store(false, Ordering::SeqCst);
    }

    fn set_parallel_output(&mut self) {
        self.bus.engine_parallel_output.store(true, Ordering::SeqCst);
    }
}

/// Everything the mock device records and serves.
#[derive(Default)]
pub struct DeviceState {
    pub events: Vec<DevEvent>,
    pub to_read: VecDeque<u8>,
    pub can_write: i8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DevEvent {
    Primary(u8),
    Secondary(u8),
    Listen(u8),
    Unlisten,
    Talk(u8),
    Untalk,
    Reset,
    Write { data: u8, eoi: bool },
    WriteBlock { data: Vec<u8>, eoi: bool },
}

/// A device personality that records every engine call and serves reads
/// from a seeded byte queue.
pub struct MockDevice {
    address: u8,
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new(address: u8) -> (Self, Arc<Mutex<DeviceState>>) {
        let state = Arc::new(Mutex::new(DeviceState {
            events: Vec::new(),
            to_read: VecDeque::new(),
            can_write: 1,
        }));
        (
            Self {
                address,
                state: state.clone(),
            },
            state,
        )
    }
}

impl Device for MockDevice {
    fn address(&self) -> u8 {
        self.address
    }

    fn reset(&mut self) {
        self.state.lock().unwrap().events.push(DevEvent::Reset);
    }

    fn primary_address(&mut self, primary: u8) {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::Primary(primary));
    }

    fn secondary_address(&mut self, secondary: u8) {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::Secondary(secondary));
    }

    fn listen(&mut self, secondary: u8) {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::Listen(secondary));
    }

    fn unlisten(&mut self) {
        self.state.lock().unwrap().events.push(DevEvent::Unlisten);
    }

    fn talk(&mut self, secondary: u8) {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::Talk(secondary));
    }

    fn untalk(&mut self) {
        self.state.lock().unwrap().events.push(DevEvent::Untalk);
    }

    fn can_write(&mut self) -> i8 {
        self.state.lock().unwrap().can_write
    }

    fn can_read(&mut self) -> i8 {
        let s = self.state.lock().unwrap();
        s.to_read.len().min(127) as i8
    }

    fn write(&mut self, data: u8, eoi: bool) {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::Write { data, eoi });
    }

    fn write_block(&mut self, data: &[u8], eoi: bool) -> usize {
        let mut s = self.state.lock().unwrap();
        s.events.push(DevEvent::WriteBlock {
            data: data.to_vec(),
            eoi,
        });
        data.len()
    }

    fn read(&mut self) -> u8 {
        self.state.lock().unwrap().to_read.pop_front().unwrap_or(0)
    }

    fn read_block(&mut self, buffer: &mut [u8]) -> usize {
        let mut s = self.state.lock().unwrap();
        let n = s.to_read.len().min(buffer.len());
        for slot in buffer.iter_mut().take(n) {
            *slot = s.to_read.pop_front().unwrap();
        }
        n
    }

    fn peek(&mut self) -> u8 {
        self.state
            .lock()
            .unwrap()
            .to_read
            .front()
            .copied()
            .unwrap_or(0)
    }
}

/// Which protocols the engine thread enables on each device.
#[derive(Clone, Copy, Default)]
pub struct EngineConfig {
    pub jiffy: bool,
    pub dolphin: bool,
    pub epyx: bool,
}

impl EngineConfig {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn jiffy() -> Self {
        Self {
            jiffy: true,
            ..Self::default()
        }
    }

    pub fn dolphin() -> Self {
        Self {
            dolphin: true,
            ..Self::default()
        }
    }

    pub fn epyx() -> Self {
        Self {
            epyx: true,
            ..Self::default()
        }
    }
}

/// A running engine on a simulated bus, plus the host-side driver.
pub struct Fixture {
    pub bus: Arc<SimBus>,
    pub host: IecHost,
    pub devices: Vec<Arc<Mutex<DeviceState>>>,
    engine: Option<JoinHandle<()>>,
}

impl Fixture {
    /// Spin up an engine thread with one mock device per address.
    pub fn new(addresses: &[u8], cfg: EngineConfig) -> Self {
        let dolphin_cable = cfg.dolphin;
        let bus = SimBus::new(dolphin_cable);

        let mut states = Vec::new();
        let mut mocks = Vec::new();
        for &address in addresses {
            let (mock, state) = MockDevice::new(address);
            states.push(state);
            mocks.push(mock);
        }

        let engine_bus = bus.clone();
        let addresses: Vec<u8> = addresses.to_vec();
        let engine = std::thread::spawn(move || {
            let mut mocks = mocks;
            let mut driver = IecDriver::new(SimPins::new(engine_bus.clone()));
            for mock in mocks.iter_mut() {
                assert!(driver.attach(mock));
            }
            for &address in &addresses {
                if cfg.jiffy {
                    assert!(driver.enable_jiffydos(address, true));
                }
                if cfg.dolphin {
                    assert!(driver.enable_dolphindos(address, true));
                }
                if cfg.epyx {
                    assert!(driver.enable_epyx_fastload(address, true));
                }
            }
            driver.begin();

            while !engine_bus.is_stopped() {
                driver.tick();
            }
        });

        Self {
            host: IecHost { bus: bus.clone() },
            bus,
            devices: states,
            engine: Some(engine),
        }
    }

    pub fn events(&self, device: usize) -> Vec<DevEvent> {
        self.devices[device].lock().unwrap().events.clone()
    }

    pub fn seed_read(&self, device: usize, data: &[u8]) {
        self.devices[device]
            .lock()
            .unwrap()
            .to_read
            .extend(data.iter().copied());
    }

    pub fn set_can_write(&self, device: usize, value: i8) {
        self.devices[device].lock().unwrap().can_write = value;
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        // The engine may be parked in a bit-level spin inside a critical
        // section; unwinding it there would leave the global (std)
        // critical-section lock held and wedge every later test in this
        // binary.  ATN is the protocol-level abort every such spin honors,
        // so assert it, give the engine time to fall out of the critical
        // section, and only then poison the bus.
        self.bus.host_drive(Line::Atn, true);
        std::thread::sleep(std::time::Duration::from_millis(50));
        self.bus.stop();
        if let Some(engine) = self.engine.take() {
            if let Err(panic) = engine.join() {
                // The stop panic is how a parked engine thread gets
                // unwound; anything else is a real failure.
                let benign = panic
                    .downcast_ref::<&str>()
                    .is_some_and(|s| s.contains("simulated bus stopped"))
                    || panic
                        .downcast_ref::<String>()
                        .is_some_and(|s| s.contains("simulated bus stopped"));
                if !benign && !std::thread::panicking() {
                    std::panic::resume_unwind(panic);
                }
            }
        }
    }
}

/// The computer side of the bus, scripted.
///
/// All waits are in virtual microseconds.  Helpers return `false`/`None`
/// when the device side did not respond the way the protocol demands.
pub struct IecHost {
    pub bus: Arc<SimBus>,
}

impl IecHost {
    pub fn micros(&self) -> u32 {
        self.bus.micros()
    }

    /// Busy-wait `us` virtual microseconds.
    pub fn delay(&self, us: u32) {
        let start = self.bus.micros();
        while self.bus.micros().wrapping_sub(start) < us {}
    }

    fn wait_level(&self, line: Line, high: bool, timeout_us: u32) -> bool {
        let start = self.bus.micros();
        while self.bus.level(line) != high {
            if self.bus.micros().wrapping_sub(start) >= timeout_us {
                return false;
            }
        }
        true
    }

    pub fn wait_clk(&self, high: bool, timeout_us: u32) -> bool {
        self.wait_level(Line::Clk, high, timeout_us)
    }

    pub fn wait_data(&self, high: bool, timeout_us: u32) -> bool {
        self.wait_level(Line::Data, high, timeout_us)
    }

    pub fn clk_high(&self) -> bool {
        self.bus.level(Line::Clk)
    }

    pub fn data_high(&self) -> bool {
        self.bus.level(Line::Data)
    }

    pub fn set_atn(&self, low: bool) {
        self.bus.host_drive(Line::Atn, low);
    }

    pub fn set_clk(&self, low: bool) {
        self.bus.host_drive(Line::Clk, low);
    }

    pub fn set_data(&self, low: bool) {
        self.bus.host_drive(Line::Data, low);
    }

    pub fn set_reset(&self, low: bool) {
        self.bus.host_drive(Line::Reset, low);
    }

    /// Release everything we might be holding.
    pub fn bus_idle(&self) {
        self.set_atn(false);
        self.set_clk(false);
        self.set_data(false);
    }

    // ----------------------- standard IEC, host side ------------------

    /// Assert ATN (and CLK, as the talker) and wait for some device to
    /// answer on DATA.  Devices get 1ms before "device not present".
    pub fn atn_assert(&self) -> bool {
        self.set_clk(true);
        self.set_atn(true);
        self.wait_data(false, 1000)
    }

    pub fn atn_release(&self) {
        self.set_atn(false);
    }

    /// Send one addressing byte under ATN.  Returns whether any device
    /// acknowledged the frame.
    pub fn send_atn_byte(&self, byte: u8) -> bool {
        self.send_byte_raw(byte, false, false).0
    }

    /// Send one data byte as talker (not under ATN), optionally signaling
    /// EOI.  Returns whether the listener acknowledged.
    pub fn send_data_byte(&self, byte: u8, eoi: bool) -> bool {
        self.send_byte_raw(byte, eoi, false).0
    }

    /// Send an addressing byte with the JiffyDos detection hold: delay
    /// the last bit beyond the EOI gap and watch for the device's 80us
    /// DATA acknowledge pulse.  Returns (acked, detected).
    pub fn send_atn_byte_jiffy_probe(&self, byte: u8) -> (bool, bool) {
        self.send_byte_raw(byte, false, true)
    }

    fn send_byte_raw(&self, byte: u8, eoi: bool, probe: bool) -> (bool, bool) {
        // Ready-to-send.
        self.set_clk(false);
        if !self.wait_data(true, 5000) {
            return (false, false);
        }

        if eoi {
            // Hold off CLK beyond the EOI gap; the listener acknowledges
            // with a DATA pulse.
            self.delay(250);
            if !self.wait_data(false, 1000) {
                return (false, false);
            }
            if !self.wait_data(true, 1000) {
                return (false, false);
            }
        }

        // Data phase.
        self.set_clk(true);
        self.delay(20);

        let detected = self.send_byte_bits(byte, probe);

        // Hand DATA fully to the listener and wait for the acknowledge.
        self.set_data(false);
        (self.wait_data(false, 1000), detected)
    }

    /// Clock out the 8 bits, LSB first.  With `jiffy_probe`, stall before
    /// the final bit and report whether a device pulsed DATA.
    fn send_byte_bits(&self, byte: u8, jiffy_probe: bool) -> bool {
        let mut detected = false;
        for bit in 0..8 {
            if jiffy_probe && bit == 7 {
                // Keep CLK low past the 200us window with DATA released;
                // a JiffyDos device answers with an 80us low pulse.
                self.set_data(false);
                let start = self.micros();
                let mut seen_low = false;
                while self.micros().wrapping_sub(start) < 400 {
                    if !self.data_high() {
                        seen_low = true;
                    } else if seen_low {
                        break;
                    }
                }
                detected = seen_low;
            }

            // Bit value on DATA: 1 is released, 0 is held low.
            self.set_data(byte & (1 << bit) == 0);
            self.delay(20);

            // Data valid.
            self.set_clk(false);
            self.delay(20);

            // Data not valid.
            self.set_clk(true);
            self.delay(5);
        }
        detected
    }

    /// Receive one byte as listener (device is talking).  Returns the
    /// byte and the EOI flag.
    pub fn recv_data_byte(&self) -> Option<(u8, bool)> {
        // Talker signals ready-to-send by releasing CLK.
        if !self.wait_clk(true, 20_000) {
            return None;
        }

        // Ready-for-data.
        self.set_data(false);

        let mut eoi = false;
        if !self.wait_clk(false, 200) {
            // EOI: acknowledge with a DATA pulse, then wait for the byte.
            eoi = true;
            self.set_data(true);
            self.delay(60);
            self.set_data(false);

            if !self.wait_clk(false, 5000) {
                return None;
            }
        }

        let mut byte: u8 = 0;
        for bit in 0..8 {
            if !self.wait_clk(true, 1000) {
                return None;
            }
            if self.data_high() {
                byte |= 1 << bit;
            }
            if !self.wait_clk(false, 1000) {
                return None;
            }
        }

        // Acknowledge.
        self.set_data(true);
        Some((byte, eoi))
    }

    /// Role reversal after a TALK command: hold DATA, release ATN and
    /// CLK, wait for the device to take CLK.
    pub fn turnaround(&self) -> bool {
        self.set_data(true);
        self.set_atn(false);
        self.set_clk(false);
        self.wait_clk(false, 5000)
    }

    // --------------------------- composites ---------------------------

    /// ATN sequence addressing `device` as listener on `secondary`.
    pub fn cmd_listen(&self, device: u8, secondary: u8) -> bool {
        if !self.atn_assert() {
            return false;
        }
        if !self.send_atn_byte(0x20 | device) {
            return false;
        }
        if !self.send_atn_byte(secondary) {
            return false;
        }
        self.atn_release();
        // We stay talker: keep CLK low.
        self.delay(100);
        true
    }

    /// ATN sequence releasing all listeners.
    pub fn cmd_unlisten(&self) -> bool {
        if !self.atn_assert() {
            return false;
        }
        let ok = self.send_atn_byte(0x3F);
        self.atn_release();
        self.bus_idle();
        self.delay(100);
        ok
    }

    /// ATN sequence addressing `device` as talker, including turnaround.
    pub fn cmd_talk(&self, device: u8, secondary: u8) -> bool {
        if !self.atn_assert() {
            return false;
        }
        if !self.send_atn_byte(0x40 | device) {
            return false;
        }
        if !self.send_atn_byte(secondary) {
            return false;
        }
        self.turnaround()
    }

    /// ATN sequence releasing the talker.
    pub fn cmd_untalk(&self) -> bool {
        if !self.atn_assert() {
            return false;
        }
        let ok = self.send_atn_byte(0x5F);
        self.atn_release();
        self.bus_idle();
        self.delay(100);
        ok
    }

    /// Write a command string to channel 15 of `device`:
    /// LISTEN 0x6F, the bytes (EOI on the last), UNLISTEN.
    pub fn send_command(&self, device: u8, command: &[u8]) -> bool {
        if !self.cmd_listen(device, 0x6F) {
            return false;
        }
        for (i, byte) in command.iter().enumerate() {
            if !self.send_data_byte(*byte, i == command.len() - 1) {
                return false;
            }
        }
        self.cmd_unlisten()
    }

    // ------------------------- JiffyDos, host side ---------------------

    /// Send one byte with JiffyDos timing (device is the listener).
    /// Entry state: host holds CLK low.
    pub fn jiffy_send_byte(&self, byte: u8, eoi: bool) -> bool {
        // Wait for the device to signal ready by releasing DATA.
        if !self.wait_data(true, 20_000) {
            return false;
        }

        self.delay(3);

        // Reference edge: release CLK.
        self.set_clk(false);
        let reference = self.micros();

        // Bit pairs on (CLK, DATA), low = set, at the receiver's sampling
        // schedule minus margin.
        let pairs = [(4u8, 5u8), (6, 7), (3, 1), (2, 0)];
        let offsets = [7u32, 20, 32, 45];
        for (i, (clk_bit, data_bit)) in pairs.iter().enumerate() {
            self.wait_until(reference, offsets[i]);
            self.set_clk(byte & (1 << clk_bit) != 0);
            self.set_data(byte & (1 << data_bit) != 0);
        }

        // EOI flag: CLK still high at 64us means last byte.
        self.wait_until(reference, 57);
        self.set_clk(!eoi);
        self.set_data(false);

        // Device acknowledges by holding DATA low until 83us.
        self.wait_until(reference, 70);
        let acked = !self.bus.level(Line::Data);

        // Park CLK low for the next byte before the device comes out of
        // its ack hold, so it cannot mistake a floating CLK for the next
        // reference edge.
        self.set_clk(true);
        self.wait_until(reference, 90);
        acked
    }

    fn wait_until(&self, reference: u32, offset: u32) {
        while self.bus.micros().wrapping_sub(reference) < offset {}
    }

    fn wait_both_released(&self, timeout_us: u32) -> bool {
        let start = self.micros();
        while !(self.bus.level(Line::Clk) && self.bus.level(Line::Data)) {
            if self.micros().wrapping_sub(start) >= timeout_us {
                return false;
            }
        }
        true
    }

    /// Receive one byte with JiffyDos timing (device is the talker).
    /// Entry state: host holds DATA low.  Returns the byte and the status
    /// pair (eoi, error).
    pub fn jiffy_recv_byte(&self) -> Option<(u8, bool, bool)> {
        // Device signals ready by releasing CLK.
        if !self.wait_clk(true, 20_000) {
            return None;
        }

        self.delay(3);

        // Reference edge: release DATA.
        self.set_data(false);
        let reference = self.micros();

        let mut byte: u8 = 0;
        let pairs = [(0u8, 1u8), (2, 3), (4, 5), (6, 7)];
        let offsets = [10u32, 23, 34, 45];
        for (i, (clk_bit, data_bit)) in pairs.iter().enumerate() {
            self.wait_until(reference, offsets[i]);
            if self.bus.level(Line::Clk) {
                byte |= 1 << clk_bit;
            }
            if self.bus.level(Line::Data) {
                byte |= 1 << data_bit;
            }
        }

        // Status at 55us: CLK low = more data; CLK high + DATA low = EOI;
        // both high = error.
        self.wait_until(reference, 55);
        let clk = self.bus.level(Line::Clk);
        let data = self.bus.level(Line::Data);
        let eoi = clk && !data;
        let error = clk && data;

        // Acknowledge.
        self.wait_until(reference, 65);
        self.set_data(true);

        Some((byte, eoi, error))
    }

    /// Receive `expect` bytes of one JiffyDos block (device talking in
    /// block mode).  Entry/exit state: host DATA and CLK released.
    pub fn jiffy_block_recv(&self, expect: usize) -> Option<Vec<u8>> {
        let mut bytes = Vec::new();

        // Ready for a block.
        self.set_data(false);

        for _ in 0..expect {
            // Byte boundary: the device releases both lines together,
            // then waits for our DATA low.  The lines also carry data
            // mid-byte, so both-high must be observed simultaneously.
            if !self.wait_both_released(20_000) {
                return None;
            }

            // Clock the byte out with a short DATA low pulse; the line
            // must be back high before the first bit pair lands on it.
            self.set_data(true);
            let reference = self.micros();
            self.delay(5);
            self.set_data(false);

            let mut byte: u8 = 0;
            let pairs = [(0u8, 1u8), (2, 3), (4, 5), (6, 7)];
            let offsets = [11u32, 22, 33, 44];
            for (i, (clk_bit, data_bit)) in pairs.iter().enumerate() {
                self.wait_until(reference, offsets[i]);
                if self.bus.level(Line::Clk) {
                    byte |= 1 << clk_bit;
                }
                if self.bus.level(Line::Data) {
                    byte |= 1 << data_bit;
                }
            }
            bytes.push(byte);
            self.wait_until(reference, 52);
        }

        // Block end: device pulls CLK low and releases DATA.
        if !self.wait_clk(false, 5000) {
            return None;
        }
        Some(bytes)
    }

    /// After the final block, the device signals end-of-file with a CLK
    /// high pulse while DATA stays high.
    pub fn jiffy_block_expect_eof(&self) -> bool {
        self.set_data(false);
        if !self.wait_clk(true, 20_000) {
            return false;
        }
        self.wait_clk(false, 20_000)
    }

    // ------------------------ DolphinDos, host side --------------------

    pub fn pulse_handshake(&self) {
        self.bus.handshake_to_engine.store(true, Ordering::SeqCst);
    }

    pub fn take_device_handshake(&self, timeout_us: u32) -> bool {
        let start = self.micros();
        loop {
            if self.bus.handshake_to_host.swap(false, Ordering::SeqCst) {
                return true;
            }
            if self.micros().wrapping_sub(start) >= timeout_us {
                return false;
            }
        }
    }

    pub fn set_parallel(&self, data: u8) {
        self.bus.host_parallel.store(data, Ordering::SeqCst);
    }

    pub fn read_parallel(&self) -> u8 {
        self.bus.parallel_level()
    }

    /// Send one byte in Dolphin byte mode (device listening).  Entry
    /// state: host holds CLK low.
    pub fn dolphin_send_byte(&self, byte: u8, eoi: bool) -> bool {
        // Ready-to-send.
        self.set_clk(false);
        if !self.wait_data(true, 20_000) {
            return false;
        }

        if eoi {
            // Past the 100us window; device acks with a 60us DATA pulse.
            self.delay(150);
            if !self.wait_data(false, 1000) {
                return false;
            }
            if !self.wait_data(true, 1000) {
                return false;
            }
        }

        // Data on the cable, CLK low = valid.
        self.set_parallel(byte);
        self.delay(2);
        self.set_clk(true);

        // Device confirms on DATA.
        self.wait_data(false, 5000)
    }

    /// Receive one byte in Dolphin byte mode (device talking).  Entry
    /// state: host holds DATA low.
    pub fn dolphin_recv_byte(&self) -> Option<(u8, bool)> {
        // Device ready-to-send.
        if !self.wait_clk(true, 20_000) {
            return None;
        }

        // Ready-for-data.
        self.set_data(false);

        let mut eoi = false;
        if !self.wait_clk(false, 50) {
            // EOI: confirm with a DATA low/high pulse.
            eoi = true;
            self.set_data(true);
            self.delay(30);
            self.set_data(false);

            if !self.wait_clk(false, 5000) {
                return None;
            }
        }

        let byte = self.read_parallel();

        // Confirm receipt.
        self.set_data(true);
        Some((byte, eoi))
    }

    /// Send a whole burst (after an `XZ` command): one handshake pulse
    /// per byte, CLK released on the final byte.
    pub fn dolphin_burst_send(&self, data: &[u8]) -> bool {
        // Signal ready-to-send and wait out the engine's holdoff.
        self.set_clk(true);

        // Engine confirms with DATA low plus a handshake pulse.
        if !self.wait_data(false, 20_000) {
            return false;
        }
        if !self.take_device_handshake(20_000) {
            return false;
        }

        for (i, byte) in data.iter().enumerate() {
            let last = i == data.len() - 1;
            if last {
                // CLK high marks the final byte.
                self.set_clk(false);
                self.delay(2);
            }
            self.set_parallel(*byte);
            self.delay(2);
            self.pulse_handshake();

            if !self.take_device_handshake(20_000) {
                return false;
            }
        }
        true
    }

    /// Receive a burst (after an `XQ` command).  Returns the bytes read.
    pub fn dolphin_burst_recv(&self) -> Option<Vec<u8>> {
        // Request: pull DATA low and wait for the engine to confirm.
        self.set_data(true);
        if !self.take_device_handshake(50_000) {
            return None;
        }

        let mut bytes = Vec::new();
        loop {
            // Each byte announces itself with a handshake pulse; CLK
            // released means end-of-data instead.
            let start = self.micros();
            loop {
                if self.bus.handshake_to_host.swap(false, Ordering::SeqCst) {
                    break;
                }
                if self.clk_high() {
                    // End of burst: confirm by releasing DATA, device
                    // answers with a final pulse.
                    self.set_data(false);
                    return if self.take_device_handshake(20_000) {
                        Some(bytes)
                    } else {
                        None
                    };
                }
                if self.micros().wrapping_sub(start) >= 50_000 {
                    return None;
                }
            }

            bytes.push(self.read_parallel());
            // The device clears its receive latch right after pulsing (a
            // glitch workaround); answering instantly would be erased.
            self.delay(5);
            self.pulse_handshake();
        }
    }

    // ---------------------- Epyx FastLoad, host side -------------------

    /// Send one byte with Epyx bit clocking: we toggle CLK, the data
    /// travels inverted on DATA, LSB first.
    pub fn epyx_send_byte(&self, byte: u8) {
        let mut clk_low = false;
        for bit in 0..8 {
            // Inverted: a set bit is DATA low.
            self.set_data(byte & (1 << bit) != 0);
            self.delay(2);
            clk_low = !clk_low;
            self.set_clk(clk_low);
            self.delay(4);
        }
        self.set_data(false);
    }

    /// Receive one byte with Epyx bit clocking (device transmitting,
    /// inverted pairs from the DATA high reference).  Entry state: host
    /// holds DATA low.
    pub fn epyx_recv_byte(&self) -> u8 {
        // Reference edge: release DATA.
        self.set_data(false);
        let reference = self.micros();

        let mut byte: u8 = 0;
        let pairs = [(7u8, 5u8), (6, 4), (3, 1), (2, 0)];
        let offsets = [12u32, 22, 32, 42];
        for (i, (clk_bit, data_bit)) in pairs.iter().enumerate() {
            self.wait_until(reference, offsets[i]);
            if !self.bus.level(Line::Clk) {
                byte |= 1 << clk_bit;
            }
            if !self.bus.level(Line::Data) {
                byte |= 1 << data_bit;
            }
        }

        // Device releases DATA at 49us; take it back to pace the next
        // byte.
        self.wait_until(reference, 55);
        self.set_data(true);
        byte
    }

    /// Upload a 256-byte routine after the `M-E`: the engine answers with
    /// CLK low, we confirm with DATA low, then clock the bytes in.
    pub fn epyx_upload(&self, routine: &[u8; 256]) -> bool {
        self.bus_idle();

        // Engine signals ready-for-header.
        if !self.wait_clk(false, 50_000) {
            return false;
        }
        self.set_data(true);
        if !self.wait_clk(true, 5000) {
            return false;
        }
        self.set_data(false);
        self.delay(4);

        for byte in routine {
            self.epyx_send_byte(*byte);
        }
        true
    }

    /// Send the filename, length first, characters in reverse order.
    pub fn epyx_send_filename(&self, name: &[u8]) {
        self.epyx_send_byte(name.len() as u8);
        for byte in name.iter().rev() {
            self.epyx_send_byte(*byte);
        }
        // Not ready until the device opens the file.
        self.set_data(true);
    }

    /// Read load-file blocks until the 0-length terminator.
    pub fn epyx_recv_blocks(&self) -> Option<Vec<u8>> {
        let mut bytes = Vec::new();
        loop {
            // Device signals ready with CLK high; we hold DATA low until
            // we want each byte.
            if !self.wait_clk(true, 100_000) {
                return None;
            }
            self.delay(4);

            let len = self.epyx_recv_byte() as usize;
            if len == 0 {
                return Some(bytes);
            }
            for _ in 0..len {
                bytes.push(self.epyx_recv_byte());
            }
            // The device dips CLK low between blocks, but our DATA hold
            // is what actually paces it; no need to chase the dip.
        }
    }
}

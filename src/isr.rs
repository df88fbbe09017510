//! ATN falling-edge interrupt plumbing.
//!
//! A bounded static registry maps interrupt slots to engine instances, so
//! a bare `fn()` interrupt handler can reach the right engine.  Two slots
//! exist because at most two engines (two physical bus connectors) make
//! sense in one firmware.
//!
//! Binding is optional.  Without it the engine polls ATN from `tick()`,
//! which works as long as `tick()` runs at least once per millisecond; the
//! interrupt (or the CTRL hardware override) is what buys the freedom to
//! block longer inside device callbacks.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::constants::MAX_ENGINES;
use crate::pins::Pins;
use crate::protocol::IecDriver;

struct Slot {
    /// Type-erased `*mut IecDriver`.
    engine: AtomicPtr<()>,
    /// The monomorphized trampoline, stored as a raw pointer.
    service: AtomicPtr<()>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    engine: AtomicPtr::new(ptr::null_mut()),
    service: AtomicPtr::new(ptr::null_mut()),
};

static SLOTS: [Slot; MAX_ENGINES] = [EMPTY_SLOT; MAX_ENGINES];

unsafe fn trampoline<P: Pins>(engine: *mut ()) {
    // The lifetime parameter is erased here; the bind contract guarantees
    // the engine outlives the binding.
    let engine = engine.cast::<IecDriver<'static, P>>();
    unsafe { IecDriver::isr_atn_service(engine) };
}

/// Bind `engine` to interrupt `slot` (0 or 1).  Returns false if the slot
/// is out of range or already taken.
///
/// After binding, arrange for [`atn_falling_isr`] to be called with the
/// same slot from the ATN falling-edge interrupt handler.
///
/// # Safety
///
/// - The engine must outlive the binding; call [`unbind`] before it is
///   dropped or moved.
/// - The interrupt must run on the core that calls `tick()`.  The engine
///   gates the ISR with its in-tick flag, so the interrupted context is
///   never inside engine code when the ISR touches engine state - but
///   that reasoning only holds on a single core.
pub unsafe fn bind_atn_isr<P: Pins>(engine: &mut IecDriver<'_, P>, slot: usize) -> bool {
    let Some(s) = SLOTS.get(slot) else {
        return false;
    };

    let data = ptr::from_mut(&mut *engine).cast::<()>();
    if s.engine
        .compare_exchange(ptr::null_mut(), data, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }
    let service: unsafe fn(*mut ()) = trampoline::<P>;
    s.service
        .store(service as *const () as *mut (), Ordering::Release);

    engine.atn_isr_bound = true;
    true
}

/// Release a slot.  Safe to call for a slot that was never bound.
pub fn unbind(slot: usize) {
    if let Some(s) = SLOTS.get(slot) {
        s.engine.store(ptr::null_mut(), Ordering::Release);
        s.service.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Service an ATN falling edge for the engine bound to `slot`.  Call this
/// from the host's interrupt handler; it is a no-op for unbound slots.
///
/// # Safety
///
/// Must only be called from the ATN falling-edge interrupt, subject to the
/// contract in [`bind_atn_isr`].
pub unsafe fn atn_falling_isr(slot: usize) {
    let Some(s) = SLOTS.get(slot) else {
        return;
    };

    let engine = s.engine.load(Ordering::Acquire);
    if engine.is_null() {
        return;
    }
    let service = s.service.load(Ordering::Acquire);
    if service.is_null() {
        return;
    }

    let service: unsafe fn(*mut ()) = unsafe { mem::transmute(service) };
    unsafe { service(engine) };
}

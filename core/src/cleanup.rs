//! Process-wide registry of children to signal when we die
//!
//! Children started with `clean_on_exit` are [`register`]ed right after
//! fork and [`deregister`]ed once reaped. If the process exits normally,
//! every remaining child gets SIGTERM; if it is killed by one of the common
//! fatal signals, every remaining child gets that same signal, the previous
//! handler is restored and the signal is re-raised so our own exit status
//! still says what happened.
//!
//! ## Signal safety
//!
//! The registry is an append-only singly linked list of slots. A slot holds
//! a pid, or 0 when vacant. Nodes are only ever prepended with a
//! compare-and-swap and never freed, so walking the list from a signal
//! handler cannot race with a free. Claiming a slot ([`register`]),
//! vacating it ([`deregister`]) and draining it ([`signal_all`]) are single
//! atomic operations on the pid, which is why each pid is removed exactly
//! once even when a signal and a reap overlap. Only [`register`] allocates,
//! and only outside signal context.

#![allow(unsafe_code)]

use crate::sigchain;
use nix::unistd::Pid;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::Once;
use tracing::{debug, warn};

struct Slot {
    pid: AtomicI32,
    next: AtomicPtr<Slot>,
}

static HEAD: AtomicPtr<Slot> = AtomicPtr::new(ptr::null_mut());
static INSTALL: Once = Once::new();

/// Track `pid` until it is reaped.
///
/// The first call installs the exit handler and the fatal-signal handlers.
pub fn register(pid: Pid) {
    INSTALL.call_once(install);

    let raw = pid.as_raw();
    for slot in slots() {
        if slot
            .pid
            .compare_exchange(0, raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }

    let node = Box::into_raw(Box::new(Slot {
        pid: AtomicI32::new(raw),
        next: AtomicPtr::new(ptr::null_mut()),
    }));
    let mut head = HEAD.load(Ordering::Acquire);
    loop {
        // Safety: `node` is not published yet, nobody else can see it.
        unsafe { (*node).next.store(head, Ordering::Relaxed) };
        match HEAD.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(current) => head = current,
        }
    }
}

/// Stop tracking `pid`. Returns false when it was not registered.
pub fn deregister(pid: Pid) -> bool {
    let raw = pid.as_raw();
    slots().any(|slot| {
        slot.pid
            .compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    })
}

/// Whether `pid` is currently tracked
pub fn is_registered(pid: Pid) -> bool {
    let raw = pid.as_raw();
    slots().any(|slot| slot.pid.load(Ordering::Acquire) == raw)
}

/// Send `signal` to every tracked child and forget them all.
///
/// Async-signal-safe: no allocation, no locks.
pub fn signal_all(signal: libc::c_int) {
    for slot in slots() {
        let pid = slot.pid.swap(0, Ordering::AcqRel);
        if pid > 0 {
            // Safety: kill(2) is async-signal-safe.
            unsafe { libc::kill(pid, signal) };
        }
    }
}

/// Forget every tracked child without signalling it.
///
/// For a forked child that inherited our registry: those pids are its
/// siblings, not its children.
pub(crate) fn forget_inherited() {
    for slot in slots() {
        slot.pid.store(0, Ordering::Release);
    }
}

fn slots() -> impl Iterator<Item = &'static Slot> {
    let mut cur = HEAD.load(Ordering::Acquire);
    std::iter::from_fn(move || {
        if cur.is_null() {
            return None;
        }
        // Safety: slots are leaked on purpose and live for the whole process.
        let slot: &'static Slot = unsafe { &*cur };
        cur = slot.next.load(Ordering::Acquire);
        Some(slot)
    })
}

fn install() {
    // Safety: `cleanup_on_exit` is a plain extern "C" fn with no captured state.
    if unsafe { libc::atexit(cleanup_on_exit) } != 0 {
        warn!("cannot register exit handler for child cleanup");
    }
    if let Err(e) = sigchain::push_common(cleanup_on_signal) {
        warn!("cannot install child cleanup signal handlers: {}", e);
    }
    debug!("child cleanup handlers installed");
}

extern "C" fn cleanup_on_exit() {
    signal_all(libc::SIGTERM);
}

extern "C" fn cleanup_on_signal(signal: libc::c_int) {
    signal_all(signal);
    sigchain::pop(signal);
    // Safety: raise(3) is async-signal-safe.
    unsafe { libc::raise(signal) };
}

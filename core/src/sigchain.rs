//! Per-signal stacks of handlers
//!
//! [`push`] installs a handler and remembers the one it replaced; [`pop`]
//! puts the previous one back. A handler that wants the process to die with
//! the signal it caught does its work, pops itself and re-raises.
//!
//! A signal the process ignores stays ignored: [`push`] leaves it alone and
//! stacks nothing. Rust programs start with SIGPIPE ignored, and a broken
//! pipe must keep surfacing as EPIPE rather than run a fatal handler.
//!
//! [`pop`] may run inside a signal handler. It never allocates and only
//! `try_lock`s: if the stack is busy it falls back to the default action.

#![allow(unsafe_code)]

use crate::{Result, RunError};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Signals that end the process unless handled
pub const COMMON_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
];

static CHAINS: Mutex<BTreeMap<i32, Vec<SigAction>>> = Mutex::new(BTreeMap::new());

/// Install `handler` for `signal`, saving the previous disposition.
///
/// Returns false, with nothing installed, when `signal` is ignored.
pub fn push(signal: Signal, handler: extern "C" fn(libc::c_int)) -> Result<bool> {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let mut chains = CHAINS
        .lock()
        .map_err(|_| RunError::Configuration("signal chain lock poisoned".to_string()))?;
    // Safety: the handlers we install only use async-signal-safe calls.
    let previous = unsafe { sigaction(signal, &action) }.map_err(|e| {
        RunError::Configuration(format!("cannot install handler for {}: {}", signal, e))
    })?;
    if previous.handler() == SigHandler::SigIgn {
        // Safety: puts back the disposition that was just replaced.
        unsafe { sigaction(signal, &previous) }.map_err(|e| {
            RunError::Configuration(format!("cannot restore handler for {}: {}", signal, e))
        })?;
        return Ok(false);
    }
    chains.entry(signal as i32).or_default().push(previous);
    Ok(true)
}

/// Install `handler` for every signal in [`COMMON_SIGNALS`]
pub fn push_common(handler: extern "C" fn(libc::c_int)) -> Result<()> {
    for signal in COMMON_SIGNALS {
        if !push(signal, handler)? {
            debug!("{} is ignored, leaving it alone", signal);
        }
    }
    Ok(())
}

/// Restore the disposition that was active before the latest [`push`].
///
/// Safe to call from a signal handler.
pub fn pop(signal: libc::c_int) {
    let previous = match CHAINS.try_lock() {
        Ok(mut chains) => chains.get_mut(&signal).and_then(Vec::pop),
        Err(_) => None,
    };
    let previous = previous.unwrap_or_else(|| {
        SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
    });
    if let Ok(signal) = Signal::try_from(signal) {
        // Safety: restoring a disposition we saved (or the default) is sound.
        let _ = unsafe { sigaction(signal, &previous) };
    }
}

/// Number of handlers currently stacked for `signal`
pub fn depth(signal: Signal) -> usize {
    CHAINS
        .lock()
        .map(|chains| chains.get(&(signal as i32)).map_or(0, Vec::len))
        .unwrap_or(0)
}

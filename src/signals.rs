//! Asynchronous signals of the supervisor. Handlers only set flags, the event loop
//! polls them between two `waitpid` calls.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use log::debug;
use nix::libc;
use nix::sys::signal::{
  sigaction, SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify, Signal,
};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;

use crate::error::BoxError;

static TIMER_TICK: AtomicBool = AtomicBool::new(false);

static INTERRUPTED: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_alarm(_: libc::c_int) {
  TIMER_TICK.store(true, Ordering::SeqCst);
}

extern "C" fn on_interrupt(signal: libc::c_int) {
  INTERRUPTED.store(signal, Ordering::SeqCst);
}

/// No `SA_RESTART`, so a pending `waitpid` fails with `EINTR` and the loop gets
/// to look at the flags
fn install(signal: Signal, handler: extern "C" fn(libc::c_int)) -> Result<(), BoxError> {
  let action = SigAction::new(
    SigHandler::Handler(handler),
    SaFlags::empty(),
    SigSet::empty(),
  );
  unsafe { sigaction(signal, &action) }
    .map_err(|e| BoxError::trace(format!("sigaction({}): {}", signal, e)))?;
  Ok(())
}

/// Turn `SIGINT` and `SIGTERM` into a flag
pub fn install_interrupt_handlers() -> Result<(), BoxError> {
  install(Signal::SIGINT, on_interrupt)?;
  install(Signal::SIGTERM, on_interrupt)
}

/// Start a recurring one second `SIGALRM`, the timer stops when dropped
pub fn start_timer() -> Result<Timer, BoxError> {
  install(Signal::SIGALRM, on_alarm)?;
  let mut timer = Timer::new(
    ClockId::CLOCK_MONOTONIC,
    SigEvent::new(SigevNotify::SigevSignal {
      signal: Signal::SIGALRM,
      si_value: 0,
    }),
  )
  .map_err(|e| BoxError::trace(format!("timer_create: {}", e)))?;
  timer
    .set(
      Expiration::Interval(TimeSpec::from(Duration::from_secs(1))),
      TimerSetTimeFlags::empty(),
    )
    .map_err(|e| BoxError::trace(format!("timer_settime: {}", e)))?;
  debug!("Interval timer started");
  Ok(timer)
}

/// Whether the timer fired since the last call
pub fn take_tick() -> bool {
  TIMER_TICK.swap(false, Ordering::SeqCst)
}

/// The interrupting signal, if the supervisor was asked to stop
pub fn interrupted() -> Option<i32> {
  match INTERRUPTED.load(Ordering::SeqCst) {
    0 => None,
    signal => Some(signal),
  }
}

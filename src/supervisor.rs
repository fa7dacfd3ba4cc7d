//! The tracing side of the sandbox: starts the program, follows its syscalls and
//! signals, enforces time limits and produces the report.

use std::time::Instant;

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::sys::timer::Timer;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, geteuid, setresuid, sysconf, ForkResult, Pid, SysconfVar};

use crate::arch::{check_call_mode, ModeViolation, Registers, Syscall, INVALID_SYSCALL, NO_SYSCALL};
use crate::bootstrap::Bootstrap;
use crate::config::{Limits, SandboxConfig};
use crate::error::BoxError;
use crate::path::read_error_message;
use crate::policy::{dirfd_of, name_of, Decision, PolicyEngine};
use crate::report::{BoxReport, Verdict};
use crate::signals;
use crate::syscall::{PathArg, RuleFlags};
use crate::tracee::Tracee;
use crate::utils::{BoxPipe, BoxReadPipe, MemoryLimitType, TimeLimitType};

/// Why the supervisor stops following the program before it ends by itself
#[derive(Debug)]
enum Abort {
  /// The program broke a rule
  Violation(Verdict),
  /// The sandbox can not go on
  Fault(BoxError),
}

impl From<BoxError> for Abort {
  fn from(err: BoxError) -> Self {
    Abort::Fault(err)
  }
}

/// How the program ended by itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
  Exited(i32),
  Signaled(i32),
}

/// Largest `VmPeak` seen so far (unit: KB)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryPeak(Option<MemoryLimitType>);

impl MemoryPeak {
  pub fn update(&mut self, sample: Option<MemoryLimitType>) {
    if let Some(sample) = sample {
      self.0 = Some(self.0.map_or(sample, |peak| peak.max(sample)));
    }
  }

  pub fn get(&self) -> MemoryLimitType {
    self.0.unwrap_or(0)
  }

  /// The peak, or `fallback` when the program was never sampled
  pub fn or(&self, fallback: MemoryLimitType) -> MemoryLimitType {
    self.0.unwrap_or(fallback)
  }
}

/// Whether a running program has used up its CPU time plus the extra time
pub fn cpu_time_exceeded(cpu_time: TimeLimitType, limits: &Limits) -> bool {
  limits
    .cpu_time
    .map_or(false, |limit| cpu_time > limit.saturating_add(limits.extra_time))
}

/// Verdict for a program that ended by itself
pub fn classify(
  ending: Ending,
  cpu_time: TimeLimitType,
  wall_time: TimeLimitType,
  limits: &Limits,
  started: bool,
) -> Verdict {
  match ending {
    Ending::Exited(0) => {
      if limits.cpu_time.map_or(false, |limit| cpu_time > limit) {
        Verdict::cpu_timeout()
      } else if limits.wall_time.map_or(false, |limit| wall_time > limit) {
        Verdict::wall_timeout()
      } else {
        Verdict::ok()
      }
    }
    Ending::Exited(code) => Verdict::runtime_error(code),
    Ending::Signaled(signal) => Verdict::fatal_signal(signal, !started),
  }
}

struct Supervisor<'a> {
  config: &'a SandboxConfig,
  engine: PolicyEngine<'a>,
  tracee: Tracee,
  pipe: BoxReadPipe,
  start: Instant,
  ticks_per_sec: u64,
  memory: MemoryPeak,
  traced: bool,
  exec_seen: bool,
  /// Plain `SIGTRAP` stops seen
  traps: u32,
  /// Syscall stops seen, odd on entry and even on exit
  stops: u64,
  last_syscall: Syscall,
  last_flags: RuleFlags,
  /// Syscalls let through by the policy
  syscalls: u64,
  killed: bool,
}

impl<'a> Supervisor<'a> {
  fn new(config: &'a SandboxConfig, child: Pid, pipe: BoxReadPipe, ticks_per_sec: u64) -> Self {
    let traced = config.filter().is_enabled();
    Supervisor {
      config,
      engine: PolicyEngine::new(config, child.as_raw()),
      tracee: Tracee::new(child),
      pipe,
      start: Instant::now(),
      ticks_per_sec,
      memory: MemoryPeak::default(),
      traced,
      exec_seen: false,
      traps: 0,
      stops: 0,
      last_syscall: Syscall::from_number(NO_SYSCALL),
      last_flags: RuleFlags::default(),
      syscalls: if traced { 0 } else { 1 },
      killed: false,
    }
  }

  fn pid(&self) -> Pid {
    self.tracee.pid()
  }

  fn supervise(mut self) -> BoxReport {
    let outcome = self.start_timer().and_then(|timer| {
      let ending = self.watch();
      drop(timer);
      ending
    });

    match outcome {
      Ok(ending) => {
        info!("Program #{} ended: {:?}", self.pid(), ending);
        let (cpu_time, max_rss) = children_usage();
        let wall_time = self.wall_time();
        let verdict = match self.bootstrap_failure() {
          Some(message) => Verdict::internal(message),
          None => classify(
            ending,
            cpu_time,
            wall_time,
            self.config.limits(),
            self.syscalls > 0,
          ),
        };
        self.report(verdict, cpu_time, max_rss)
      }
      Err(abort) => {
        let verdict = match abort {
          Abort::Violation(verdict) => verdict,
          Abort::Fault(err) => {
            error!("{}", err);
            Verdict::from(&err)
          }
        };
        info!("Stop program #{}: {}", self.pid(), verdict.message);
        self.teardown();
        let (cpu_time, max_rss) = children_usage();
        self.report(verdict, cpu_time, max_rss)
      }
    }
  }

  fn report(&self, verdict: Verdict, cpu_time: TimeLimitType, max_rss: MemoryLimitType) -> BoxReport {
    BoxReport {
      cpu_time,
      wall_time: self.wall_time(),
      memory: self.memory.or(max_rss),
      max_rss,
      verdict,
      killed: self.killed,
      syscalls: self.syscalls,
    }
  }

  fn start_timer(&self) -> Result<Option<Timer>, Abort> {
    if self.config.limits().has_timer() {
      return Ok(Some(signals::start_timer()?));
    }
    Ok(None)
  }

  fn wall_time(&self) -> TimeLimitType {
    self.start.elapsed().as_millis() as TimeLimitType
  }

  fn bootstrap_failure(&self) -> Option<String> {
    match self.pipe.read() {
      Ok(message) => message,
      Err(err) => Some(err.message()),
    }
  }

  /// Follow the program until it ends by itself
  fn watch(&mut self) -> Result<Ending, Abort> {
    let pid = self.pid();
    loop {
      if let Some(signal) = signals::interrupted() {
        return Err(Abort::Fault(BoxError::Interrupted(signal)));
      }
      if signals::take_tick() {
        self.check_timeout()?;
      }

      let status = match waitpid(pid, None) {
        Ok(status) => status,
        Err(Errno::EINTR) => continue,
        Err(e) => return Err(BoxError::trace(format!("wait4: {}", e)).into()),
      };

      match status {
        WaitStatus::Exited(_, code) => return Ok(Ending::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => return Ok(Ending::Signaled(signal as i32)),
        WaitStatus::PtraceSyscall(_) => {
          self.on_syscall_stop()?;
          self.resume(None)?;
        }
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {
          self.traps += 1;
          if self.traps > 1 {
            return Err(Abort::Violation(Verdict::breakpoint()));
          }
          debug!("Program #{} replaced by execve", pid);
          self.tracee.reopen_memory()?;
          self.resume(None)?;
        }
        WaitStatus::Stopped(_, Signal::SIGSTOP) => {
          debug!("Program #{} stopped, set trace options", pid);
          ptrace::setoptions(
            pid,
            Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL,
          )
          .map_err(|e| BoxError::trace(format!("ptrace(PTRACE_SETOPTIONS): {}", e)))?;
          self.resume(None)?;
        }
        WaitStatus::Stopped(_, signal @ (Signal::SIGXCPU | Signal::SIGXFSZ)) => {
          return Err(Abort::Violation(Verdict::received_signal(signal as i32)));
        }
        WaitStatus::Stopped(_, signal) => {
          debug!("Signal {} delivered to program #{}", signal, pid);
          // The signal might be fatal
          self.sample_memory()?;
          self.resume(Some(signal))?;
        }
        status => {
          return Err(BoxError::trace(format!("wait4: unknown status {:?}, giving up", status)).into())
        }
      }
    }
  }

  fn resume(&self, signal: Option<Signal>) -> Result<(), Abort> {
    ptrace::syscall(self.pid(), signal)
      .map_err(|e| BoxError::trace(format!("ptrace(PTRACE_SYSCALL): {}", e)))?;
    Ok(())
  }

  fn on_syscall_stop(&mut self) -> Result<(), Abort> {
    self.stops += 1;
    let regs = self.tracee.read_registers()?;
    if self.stops % 2 == 1 {
      self.on_entry(regs)
    } else {
      self.on_exit(&regs)
    }
  }

  fn on_entry(&mut self, mut regs: Registers) -> Result<(), Abort> {
    match check_call_mode(&regs, &mut self.tracee) {
      Ok(()) => {}
      Err(ModeViolation::Forbidden(message)) => {
        return Err(Abort::Violation(Verdict::forbidden_mode(message)))
      }
      Err(ModeViolation::Unexpected(message)) => return Err(BoxError::trace(message).into()),
    }

    let call = regs.syscall_call();
    trace!(
      ">> Syscall {:<12} ({:08x},{:08x},{:08x})",
      call.syscall.to_string(),
      call.args[0],
      call.args[1],
      call.args[2]
    );
    self.last_syscall = call.syscall;
    self.last_flags = RuleFlags::default();

    if !self.exec_seen {
      if call.syscall == Syscall::EXECVE {
        debug!("Program #{} calls execve, syscall filter armed", self.pid());
        self.exec_seen = true;
      }
      return Ok(());
    }

    let violation = match self.engine.decide(&call) {
      Decision::Allow(flags) => return self.admit(flags),
      Decision::AllowPendingPathCheck { path, flags } => match self.check_path(path, &regs) {
        Ok(()) => return self.admit(flags),
        Err(message) => Verdict::forbidden_file(message),
      },
      Decision::Deny => Verdict::forbidden_syscall(call.syscall),
      Decision::SelfKill { signal } => Verdict::self_kill(signal),
    };

    // A killed tracee still completes the syscall it is stopped in
    regs.set_syscall_number(INVALID_SYSCALL);
    self.tracee.write_registers(regs)?;
    Err(Abort::Violation(violation))
  }

  fn admit(&mut self, flags: RuleFlags) -> Result<(), Abort> {
    self.syscalls += 1;
    self.last_flags = flags;
    if flags.sample_mem {
      self.sample_memory()?;
    }
    Ok(())
  }

  fn check_path(&mut self, path: PathArg, regs: &Registers) -> Result<(), String> {
    let call = regs.syscall_call();
    let validator = self.engine.paths();
    if let Some(result) = validator.without_name() {
      return result;
    }
    let name = self
      .tracee
      .read_path(name_of(path, &call))
      .map_err(|e| read_error_message(&e))?;
    trace!("File name [{}]", name);
    validator.check(dirfd_of(path, &call), &name)
  }

  fn on_exit(&mut self, regs: &Registers) -> Result<(), Abort> {
    let nr = regs.syscall_number();
    if nr == NO_SYSCALL {
      if !self.last_flags.no_retval {
        return Err(BoxError::trace("Syscall does not return, but it should").into());
      }
      trace!("= ?");
    } else {
      if nr != self.last_syscall.number() {
        return Err(BoxError::trace("Mismatched syscall entry/exit").into());
      }
      trace!("= {}", regs.return_value());
    }
    Ok(())
  }

  fn check_timeout(&mut self) -> Result<(), Abort> {
    let limits = self.config.limits();
    if let Some(limit) = limits.wall_time {
      let wall_time = self.wall_time();
      debug!("Wall time check: {} ms", wall_time);
      if wall_time > limit {
        return Err(Abort::Violation(Verdict::wall_timeout()));
      }
    }
    if limits.cpu_time.is_some() {
      let cpu_time = self.tracee.cpu_time(self.ticks_per_sec)?;
      debug!("CPU time check: {} ms", cpu_time);
      if cpu_time_exceeded(cpu_time, limits) {
        return Err(Abort::Violation(Verdict::cpu_timeout()));
      }
    }
    self.sample_memory()
  }

  fn sample_memory(&mut self) -> Result<(), Abort> {
    let sample = self.tracee.vm_peak()?;
    self.memory.update(sample);
    trace!("Memory peak: {} KB", self.memory.get());
    Ok(())
  }

  /// Kill the whole process group and reap the program
  fn teardown(&mut self) {
    let pid = self.pid();
    if let Err(err) = self.sample_memory() {
      debug!("Final memory sample skipped: {:?}", err);
    }
    if self.traced {
      let _ = ptrace::kill(pid);
    }
    let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);
    self.killed = true;

    loop {
      match waitpid(pid, None) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
        Ok(_) | Err(Errno::EINTR) => continue,
        Err(e) => {
          warn!("Lost track of the process #{}: {}", pid, e);
          break;
        }
      }
    }
  }
}

/// CPU time (unit: ms) and peak resident set (unit: KB) of the reaped program
fn children_usage() -> (TimeLimitType, MemoryLimitType) {
  match getrusage(UsageWho::RUSAGE_CHILDREN) {
    Ok(usage) => {
      let ms = |tv: nix::sys::time::TimeVal| (tv.tv_sec() * 1000 + tv.tv_usec() / 1000) as TimeLimitType;
      (
        ms(usage.user_time()) + ms(usage.system_time()),
        usage.max_rss() as MemoryLimitType,
      )
    }
    Err(e) => {
      warn!("getrusage fails: {}", e);
      (0, 0)
    }
  }
}

fn clock_ticks() -> Result<u64, BoxError> {
  match sysconf(SysconfVar::CLK_TCK) {
    Ok(Some(ticks)) if ticks > 0 => Ok(ticks as u64),
    _ => Err(BoxError::proc("Invalid ticks_per_sec!")),
  }
}

fn caller_environment() -> Vec<(String, String)> {
  std::env::vars_os()
    .map(|(key, value)| {
      (
        key.to_string_lossy().into_owned(),
        value.to_string_lossy().into_owned(),
      )
    })
    .collect()
}

/// Run the program of `config` in the sandbox. Every failure ends up in the report.
pub fn run(config: &SandboxConfig) -> BoxReport {
  match start(config) {
    Ok(report) => report,
    Err(err) => {
      error!("{}", err);
      BoxReport::failed(Verdict::from(&err))
    }
  }
}

fn start(config: &SandboxConfig) -> Result<BoxReport, BoxError> {
  let bootstrap = Bootstrap::prepare(config, &caller_environment())?;
  info!(
    "Run {} with {} arguments, {} environment variables, syscall filter {:?}",
    config.program(),
    config.arguments().len(),
    bootstrap.environment().len(),
    config.filter()
  );

  let euid = geteuid();
  setresuid(euid, euid, euid).map_err(|e| BoxError::fork(format!("setresuid: {}", e)))?;
  let ticks_per_sec = clock_ticks()?;
  signals::install_interrupt_handlers()?;
  let pipe = BoxPipe::new()?;

  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => {
      let pipe = match pipe.read() {
        Ok(pipe) => pipe,
        Err(err) => {
          let _ = kill(child, Signal::SIGKILL);
          let _ = waitpid(child, None);
          return Err(err);
        }
      };
      info!("Program #{} forked", child);
      Ok(Supervisor::new(config, child, pipe, ticks_per_sec).supervise())
    }
    Ok(ForkResult::Child) => match pipe.write() {
      Ok(pipe) => bootstrap.enter(pipe),
      Err(_) => unsafe { nix::libc::_exit(2) },
    },
    Err(e) => Err(BoxError::fork(format!("fork: {}", e))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn limits(cpu: Option<u64>, wall: Option<u64>) -> Limits {
    Limits {
      cpu_time: cpu,
      wall_time: wall,
      extra_time: 500,
      ..Limits::default()
    }
  }

  #[test]
  fn memory_peak_should_be_monotone() {
    let mut peak = MemoryPeak::default();
    let mut last = 0;
    for sample in [Some(100), None, Some(50), Some(300), Some(299), None, Some(300)] {
      peak.update(sample);
      assert!(peak.get() >= last);
      last = peak.get();
    }
    assert_eq!(peak.get(), 300);
    assert_eq!(peak.or(4096), 300);
  }

  #[test]
  fn memory_peak_should_fall_back_when_never_sampled() {
    let mut peak = MemoryPeak::default();
    assert_eq!(peak.get(), 0);
    assert_eq!(peak.or(2048), 2048);
    peak.update(None);
    assert_eq!(peak.or(2048), 2048);
    peak.update(Some(0));
    assert_eq!(peak.or(2048), 0);
  }

  #[test]
  fn it_should_kill_after_extra_time() {
    let limited = limits(Some(1000), None);
    assert!(!cpu_time_exceeded(1500, &limited));
    assert!(cpu_time_exceeded(1501, &limited));
    assert!(!cpu_time_exceeded(u64::MAX, &limits(None, None)));

    let huge = Limits {
      cpu_time: Some(u64::MAX - 10),
      extra_time: u64::MAX,
      ..Limits::default()
    };
    assert!(!cpu_time_exceeded(u64::MAX, &huge));
  }

  #[test]
  fn it_should_classify_exits() {
    let none = limits(None, None);
    assert_eq!(classify(Ending::Exited(0), 10, 20, &none, true), Verdict::ok());
    assert_eq!(
      classify(Ending::Exited(3), 10, 20, &none, true),
      Verdict::runtime_error(3)
    );
    assert_eq!(
      classify(Ending::Signaled(11), 10, 20, &none, true),
      Verdict::fatal_signal(11, false)
    );
    assert_eq!(
      classify(Ending::Signaled(9), 0, 1, &none, false),
      Verdict::fatal_signal(9, true)
    );
  }

  #[test]
  fn it_should_classify_late_timeouts() {
    let limited = limits(Some(1000), Some(5000));
    assert_eq!(
      classify(Ending::Exited(0), 1000, 1200, &limited, true),
      Verdict::ok()
    );
    // Within the extra time the program is not killed, but still too slow
    assert_eq!(
      classify(Ending::Exited(0), 1300, 1400, &limited, true),
      Verdict::cpu_timeout()
    );
    assert_eq!(
      classify(Ending::Exited(0), 100, 5001, &limited, true),
      Verdict::wall_timeout()
    );
    // A failing program is reported as such even when slow
    assert_eq!(
      classify(Ending::Exited(1), 1300, 1400, &limited, true),
      Verdict::runtime_error(1)
    );
  }
}

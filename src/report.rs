use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{BoxError, BoxExit};
use crate::utils::{MemoryLimitType, TimeLimitType};

/// Outcome class of a run, written as the two letter `status` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Ok,
  /// Exited with a non-zero status
  RuntimeError,
  /// Killed by a signal
  Signaled,
  /// CPU or wall clock time limit exceeded
  Timeout,
  /// Forbidden syscall
  ForbiddenSyscall,
  /// Forbidden file access
  ForbiddenFile,
  /// Fault of the sandbox itself
  Internal,
}

impl Status {
  pub fn code(&self) -> &'static str {
    match self {
      Status::Ok => "OK",
      Status::RuntimeError => "RE",
      Status::Signaled => "SG",
      Status::Timeout => "TO",
      Status::ForbiddenSyscall => "FO",
      Status::ForbiddenFile => "FA",
      Status::Internal => "XX",
    }
  }
}

impl Display for Status {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.code())
  }
}

/// Status of a run with its message and the exit details that go with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
  pub status: Status,
  pub message: String,
  pub exit_code: Option<i32>,
  pub exit_signal: Option<i32>,
}

impl Verdict {
  fn new<S: Into<String>>(status: Status, message: S) -> Self {
    Verdict {
      status,
      message: message.into(),
      exit_code: None,
      exit_signal: None,
    }
  }

  pub fn ok() -> Self {
    Verdict::new(Status::Ok, "")
  }

  pub fn runtime_error(code: i32) -> Self {
    Verdict {
      exit_code: Some(code),
      ..Verdict::new(
        Status::RuntimeError,
        format!("Exited with error status {}", code),
      )
    }
  }

  pub fn fatal_signal(signal: i32, during_startup: bool) -> Self {
    let suffix = if during_startup { " during startup" } else { "" };
    Verdict {
      exit_signal: Some(signal),
      ..Verdict::new(
        Status::Signaled,
        format!("Caught fatal signal {}{}", signal, suffix),
      )
    }
  }

  pub fn self_kill(signal: i32) -> Self {
    Verdict {
      exit_signal: Some(signal),
      ..Verdict::new(
        Status::Signaled,
        format!("Committed suicide by signal {}", signal),
      )
    }
  }

  /// A resource limit signal (`SIGXCPU`, `SIGXFSZ`) stopped the program
  pub fn received_signal(signal: i32) -> Self {
    Verdict {
      exit_signal: Some(signal),
      ..Verdict::new(Status::Signaled, format!("Received signal {}", signal))
    }
  }

  pub fn breakpoint() -> Self {
    Verdict::new(Status::Signaled, "Breakpoint")
  }

  pub fn cpu_timeout() -> Self {
    Verdict::new(Status::Timeout, "Time limit exceeded")
  }

  pub fn wall_timeout() -> Self {
    Verdict::new(Status::Timeout, "Time limit exceeded (wall clock)")
  }

  pub fn forbidden_syscall<S: Display>(syscall: S) -> Self {
    Verdict::new(
      Status::ForbiddenSyscall,
      format!("Forbidden syscall {}", syscall),
    )
  }

  /// The program used a syscall instruction or CPU mode it may not use
  pub fn forbidden_mode<S: Into<String>>(message: S) -> Self {
    Verdict::new(Status::ForbiddenSyscall, message)
  }

  pub fn forbidden_file<S: Into<String>>(message: S) -> Self {
    Verdict::new(Status::ForbiddenFile, message)
  }

  pub fn internal<S: Into<String>>(message: S) -> Self {
    Verdict::new(Status::Internal, message)
  }
}

impl From<&BoxError> for Verdict {
  fn from(err: &BoxError) -> Self {
    Verdict::internal(err.message())
  }
}

/// Everything known about a finished run
#[derive(Debug, Clone)]
pub struct BoxReport {
  /// CPU time, user and system (unit: ms)
  pub cpu_time: TimeLimitType,
  /// Wall clock time since start (unit: ms)
  pub wall_time: TimeLimitType,
  /// Peak virtual memory (unit: KB), the peak resident set when never sampled
  pub memory: MemoryLimitType,
  /// Peak resident set (unit: KB)
  pub max_rss: MemoryLimitType,
  pub verdict: Verdict,
  /// The supervisor had to kill the program
  pub killed: bool,
  /// Number of policed syscalls that were let through
  pub syscalls: u64,
}

fn seconds(ms: TimeLimitType) -> String {
  format!("{}.{:03}", ms / 1000, ms % 1000)
}

/// Escape control characters, so that a message stays on one line
fn one_line(message: &str) -> String {
  let mut line = String::with_capacity(message.len());
  for c in message.chars() {
    if c.is_control() {
      line.extend(c.escape_default());
    } else {
      line.push(c);
    }
  }
  line
}

impl BoxReport {
  /// Report of a run that never got a program started
  pub fn failed(verdict: Verdict) -> Self {
    BoxReport {
      cpu_time: 0,
      wall_time: 0,
      memory: 0,
      max_rss: 0,
      verdict,
      killed: false,
      syscalls: 0,
    }
  }

  /// The `key:value` lines of the meta file
  pub fn render(&self) -> String {
    let mut text = String::new();
    text.push_str(&format!("time:{}\n", seconds(self.cpu_time)));
    text.push_str(&format!("time-wall:{}\n", seconds(self.wall_time)));
    text.push_str(&format!("mem:{}\n", self.memory * 1024));
    text.push_str(&format!("max-rss:{}\n", self.max_rss * 1024));
    text.push_str(&format!("status:{}\n", self.verdict.status));
    text.push_str(&format!("message:{}\n", one_line(&self.verdict.message)));
    if let Some(code) = self.verdict.exit_code {
      text.push_str(&format!("exitcode:{}\n", code));
    }
    if let Some(signal) = self.verdict.exit_signal {
      text.push_str(&format!("exitsig:{}\n", signal));
    }
    if self.killed {
      text.push_str("killed:1\n");
    }
    text
  }

  /// Human readable summary for standard error
  pub fn status_line(&self) -> String {
    match self.verdict.status {
      Status::Ok => format!(
        "OK ({} sec real, {} sec wall, {} MB, {} syscalls)",
        seconds(self.cpu_time),
        seconds(self.wall_time),
        (self.memory + 1023) / 1024,
        self.syscalls
      ),
      _ => one_line(&self.verdict.message),
    }
  }

  /// Exit of the supervisor process for this report
  pub fn exit(&self) -> BoxExit {
    match self.verdict.status {
      Status::Ok => BoxExit::Ok,
      Status::Internal => BoxExit::Internal,
      _ => BoxExit::Failed,
    }
  }
}

/// Where the meta report goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportSink {
  Discard,
  Stdout,
  File(PathBuf),
}

impl ReportSink {
  /// `-` is standard output, no value means no meta output
  pub fn parse(value: Option<&str>) -> Self {
    match value {
      None => ReportSink::Discard,
      Some("-") => ReportSink::Stdout,
      Some(path) => ReportSink::File(PathBuf::from(path)),
    }
  }

  /// Write the report once and flush it
  pub fn write(&self, report: &BoxReport) -> Result<(), BoxError> {
    let text = report.render();
    match self {
      ReportSink::Discard => {
        debug!("Meta report discarded");
        Ok(())
      }
      ReportSink::Stdout => {
        let mut out = io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
      }
      ReportSink::File(path) => {
        let mut file = File::create(path).map_err(|e| {
          BoxError::Fs(format!("Can not create meta file {}: {}", path.display(), e))
        })?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        info!("Meta report written to {}", path.display());
        Ok(())
      }
    }
  }
}

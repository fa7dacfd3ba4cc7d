use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::errno::Errno;

/// Faults of the sandbox itself, never of the program running inside it.
///
/// Every variant ends the run with status `XX` and exit code 2.
pub enum BoxError {
  Config(String),
  Fork(String),
  Bootstrap(String),
  Trace(String),
  Proc(String),
  Interrupted(i32),
  Nix(Errno),
  Fs(String),
  Logger(FlexiLoggerError),
}

/// Process exit of the supervisor binary
pub enum BoxExit {
  /// The program finished correctly
  Ok,
  /// The program failed, the reason is in the report
  Failed,
  /// The sandbox failed, the reason is in the report
  Internal,
  /// The sandbox failed before any report could be written
  Err(BoxError),
}

impl BoxError {
  pub fn config<MS: Into<String>>(msg: MS) -> BoxError {
    BoxError::Config(msg.into())
  }

  pub fn fork<MS: Into<String>>(msg: MS) -> BoxError {
    BoxError::Fork(msg.into())
  }

  pub fn bootstrap<MS: Into<String>>(msg: MS) -> BoxError {
    BoxError::Bootstrap(msg.into())
  }

  pub fn trace<MS: Into<String>>(msg: MS) -> BoxError {
    BoxError::Trace(msg.into())
  }

  pub fn proc<MS: Into<String>>(msg: MS) -> BoxError {
    BoxError::Proc(msg.into())
  }

  /// Message without the kind prefix, used as the report `message` field
  pub fn message(&self) -> String {
    match self {
      BoxError::Config(msg)
      | BoxError::Fork(msg)
      | BoxError::Bootstrap(msg)
      | BoxError::Trace(msg)
      | BoxError::Proc(msg)
      | BoxError::Fs(msg) => msg.clone(),
      BoxError::Interrupted(signal) => format!("Interrupted by signal {}", signal),
      BoxError::Nix(errno) => format!("{}", errno),
      BoxError::Logger(err) => format!("{}", err),
    }
  }
}

impl Debug for BoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for BoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      BoxError::Config(msg) => f.write_fmt(format_args!("JudgeBox Config Error: {}", msg)),
      BoxError::Fork(msg) => f.write_fmt(format_args!("JudgeBox Fork Error: {}", msg)),
      BoxError::Bootstrap(msg) => f.write_fmt(format_args!("JudgeBox Bootstrap Error: {}", msg)),
      BoxError::Trace(msg) => f.write_fmt(format_args!("JudgeBox Trace Error: {}", msg)),
      BoxError::Proc(msg) => f.write_fmt(format_args!("JudgeBox Proc Error: {}", msg)),
      BoxError::Interrupted(signal) => {
        f.write_fmt(format_args!("JudgeBox Interrupted: signal {}", signal))
      }
      BoxError::Nix(errno) => f.write_fmt(format_args!("JudgeBox Nix Error: {}", errno)),
      BoxError::Fs(msg) => f.write_fmt(format_args!("JudgeBox File System Error: {}", msg)),
      BoxError::Logger(err) => f.write_fmt(format_args!("JudgeBox Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for BoxError {
  fn from(errno: Errno) -> Self {
    BoxError::Nix(errno)
  }
}

impl From<std::io::Error> for BoxError {
  fn from(err: std::io::Error) -> Self {
    BoxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for BoxError {
  fn from(err: FlexiLoggerError) -> Self {
    BoxError::Logger(err)
  }
}

impl Error for BoxError {}

impl BoxExit {
  pub fn code(&self) -> u8 {
    match self {
      BoxExit::Ok => 0,
      BoxExit::Failed => 1,
      BoxExit::Internal | BoxExit::Err(_) => 2,
    }
  }
}

impl Termination for BoxExit {
  fn report(self) -> ExitCode {
    if let BoxExit::Err(err) = &self {
      eprintln!("{}", err);
    }
    ExitCode::from(self.code())
  }
}

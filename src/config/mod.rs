use std::path::PathBuf;

use crate::env::EnvRule;
use crate::error::BoxError;
use crate::path::PathRule;
use crate::syscall::SyscallTable;
use crate::utils::{MemoryLimitType, TimeLimitType};

pub use builder::SandboxConfigBuilder;

mod builder;

/// How syscalls of the program are policed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterLevel {
  /// The program is trusted, nothing is traced
  Off,
  /// Default table including the liberal-only rules
  Liberal,
  /// Default table without the liberal-only rules
  Strict,
}

impl FilterLevel {
  /// Level from the number of times `-f` was given
  pub fn from_count(count: u8) -> Result<Self, BoxError> {
    match count {
      0 => Ok(FilterLevel::Off),
      1 => Ok(FilterLevel::Liberal),
      2 => Ok(FilterLevel::Strict),
      _ => Err(BoxError::config(format!(
        "Syscall filter level {} out of range",
        count
      ))),
    }
  }

  pub fn is_enabled(&self) -> bool {
    *self != FilterLevel::Off
  }
}

/// Resource limits, times in milliseconds and sizes in KB
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
  pub cpu_time: Option<TimeLimitType>,
  pub wall_time: Option<TimeLimitType>,
  /// Grace period on top of the CPU time limit
  pub extra_time: TimeLimitType,
  /// Address space limit
  pub memory: Option<MemoryLimitType>,
  /// Stack limit, unlimited when `None`
  pub stack: Option<MemoryLimitType>,
}

impl Limits {
  /// Whether the supervisor has to watch the clock
  pub fn has_timer(&self) -> bool {
    self.cpu_time.is_some() || self.wall_time.is_some()
  }
}

/// Everything about one run except the rule tables
#[derive(Debug, Clone)]
pub struct RunConfig {
  pub limits: Limits,
  pub filter: FilterLevel,
  pub file_access: u8,
  pub cwd: Option<PathBuf>,
  pub stdin: Option<PathBuf>,
  pub stdout: Option<PathBuf>,
  /// Defaults to a duplicate of stdout
  pub stderr: Option<PathBuf>,
  pub inherit_env: bool,
  pub program: String,
  pub arguments: Vec<String>,
}

/// The three rule tables the sandbox enforces
#[derive(Debug, Clone)]
pub struct PolicyConfig {
  pub syscalls: SyscallTable,
  pub paths: Vec<PathRule>,
  pub envs: Vec<EnvRule>,
}

/// Immutable configuration of one sandboxed run
#[derive(Debug, Clone)]
pub struct SandboxConfig {
  run: RunConfig,
  policy: PolicyConfig,
}

impl SandboxConfig {
  pub fn run(&self) -> &RunConfig {
    &self.run
  }

  pub fn policy(&self) -> &PolicyConfig {
    &self.policy
  }

  pub fn limits(&self) -> &Limits {
    &self.run.limits
  }

  pub fn filter(&self) -> FilterLevel {
    self.run.filter
  }

  pub fn file_access(&self) -> u8 {
    self.run.file_access
  }

  pub fn program(&self) -> &String {
    &self.run.program
  }

  pub fn arguments(&self) -> &Vec<String> {
    &self.run.arguments
  }
}

use std::path::PathBuf;

use log::{debug, warn};

use crate::arch::Syscall;
use crate::config::{FilterLevel, Limits, PolicyConfig, RunConfig, SandboxConfig};
use crate::env::EnvRule;
use crate::error::BoxError;
use crate::path::{PathRule, LEVEL_UNCHECKED, MAX_LEVEL};
use crate::syscall::{parse_override, SyscallAction, SyscallTable};
use crate::utils::{MemoryLimitType, TimeLimitType};

/// Build the configuration of a sandboxed run
pub struct SandboxConfigBuilder {
  limits: Limits,
  filter: FilterLevel,
  file_access: u8,
  cwd: Option<PathBuf>,
  stdin: Option<PathBuf>,
  stdout: Option<PathBuf>,
  stderr: Option<PathBuf>,
  inherit_env: bool,
  allow_fork: bool,
  allow_times: bool,
  program: String,
  arguments: Vec<String>,
  syscalls: Vec<(Syscall, SyscallAction)>,
  paths: Vec<PathRule>,
  envs: Vec<EnvRule>,
}

impl SandboxConfigBuilder {
  /// Create a new builder for the program to be run
  pub fn command<PS: Into<String>, AS: Into<String>>(program: PS, arguments: Vec<AS>) -> Self {
    SandboxConfigBuilder {
      limits: Limits::default(),
      filter: FilterLevel::Off,
      file_access: 0,
      cwd: None,
      stdin: None,
      stdout: None,
      stderr: None,
      inherit_env: false,
      allow_fork: false,
      allow_times: false,
      program: program.into(),
      arguments: arguments.into_iter().map(|a| a.into()).collect(),
      syscalls: vec![],
      paths: vec![],
      envs: vec![],
    }
  }

  /// Set CPU time limit (unit: ms)
  pub fn cpu_time_limit(mut self, value: Option<TimeLimitType>) -> Self {
    self.limits.cpu_time = value;
    self
  }

  /// Set wall clock time limit (unit: ms)
  pub fn wall_time_limit(mut self, value: Option<TimeLimitType>) -> Self {
    self.limits.wall_time = value;
    self
  }

  /// Set extra time granted after the CPU time limit (unit: ms)
  pub fn extra_time(mut self, value: TimeLimitType) -> Self {
    self.limits.extra_time = value;
    self
  }

  /// Set address space limit (unit: KB)
  pub fn memory_limit(mut self, value: Option<MemoryLimitType>) -> Self {
    self.limits.memory = value;
    self
  }

  /// Set stack limit (unit: KB), 0 means unlimited
  pub fn stack_limit(mut self, value: MemoryLimitType) -> Self {
    self.limits.stack = if value == 0 { None } else { Some(value) };
    self
  }

  pub fn filter(mut self, level: FilterLevel) -> Self {
    self.filter = level;
    self
  }

  pub fn file_access(mut self, level: u8) -> Self {
    self.file_access = level;
    self
  }

  pub fn cwd(mut self, path: Option<PathBuf>) -> Self {
    self.cwd = path;
    self
  }

  pub fn stdin(mut self, path: Option<PathBuf>) -> Self {
    self.stdin = path;
    self
  }

  pub fn stdout(mut self, path: Option<PathBuf>) -> Self {
    self.stdout = path;
    self
  }

  pub fn stderr(mut self, path: Option<PathBuf>) -> Self {
    self.stderr = path;
    self
  }

  /// Pass the whole environment of the caller
  pub fn inherit_env(mut self, flag: bool) -> Self {
    self.inherit_env = flag;
    self
  }

  pub fn allow_fork(mut self, flag: bool) -> Self {
    self.allow_fork = flag;
    self
  }

  pub fn allow_times(mut self, flag: bool) -> Self {
    self.allow_times = flag;
    self
  }

  /// Parse syscall overrides `name[=yes|no|file]`
  pub fn parse_syscall_list(mut self, list: Vec<String>) -> Result<Self, BoxError> {
    for text in list {
      self.syscalls.push(parse_override(&text)?);
    }
    Ok(self)
  }

  /// Parse path rules `path[=yes|no]`
  pub fn parse_path_list(mut self, list: Vec<String>) -> Result<Self, BoxError> {
    for text in list {
      self.paths.push(PathRule::parse(&text)?);
    }
    Ok(self)
  }

  /// Parse environment rules `var[=value]`
  pub fn parse_env_list(mut self, list: Vec<String>) -> Result<Self, BoxError> {
    for text in list {
      self.envs.push(EnvRule::parse(&text)?);
    }
    Ok(self)
  }

  /// Validate and build the configuration
  pub fn build(self) -> Result<SandboxConfig, BoxError> {
    if self.program.is_empty() {
      return Err(BoxError::config("No program given"));
    }
    if self.file_access > MAX_LEVEL {
      return Err(BoxError::config(format!(
        "File access level {} out of range",
        self.file_access
      )));
    }
    if self.file_access >= LEVEL_UNCHECKED && !self.paths.is_empty() {
      return Err(BoxError::config(
        "File access level 9 disables path checking, path rules can not be used",
      ));
    }
    if self.file_access > 0 && !self.filter.is_enabled() {
      warn!("File access level has no effect without syscall filtering");
    }

    let mut syscalls = SyscallTable::default();
    if self.allow_fork {
      syscalls.allow_fork();
    }
    if self.allow_times {
      syscalls.allow_times();
    }
    for (syscall, action) in self.syscalls {
      debug!("Override syscall {} with {:?}", syscall, action);
      syscalls.set(syscall, action);
    }

    Ok(SandboxConfig {
      run: RunConfig {
        limits: self.limits,
        filter: self.filter,
        file_access: self.file_access,
        cwd: self.cwd,
        stdin: self.stdin,
        stdout: self.stdout,
        stderr: self.stderr,
        inherit_env: self.inherit_env,
        program: self.program,
        arguments: self.arguments,
      },
      policy: PolicyConfig {
        syscalls,
        paths: self.paths,
        envs: self.envs,
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::syscall::PathArg;

  fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn it_should_build_defaults() {
    let config = SandboxConfigBuilder::command("./sol", vec!["a", "b"])
      .build()
      .unwrap();
    assert_eq!(config.program(), "./sol");
    assert_eq!(config.arguments(), &strings(&["a", "b"]));
    assert_eq!(config.filter(), FilterLevel::Off);
    assert_eq!(config.file_access(), 0);
    assert!(!config.limits().has_timer());
    assert_eq!(config.limits().stack, None);
    assert!(config.policy().paths.is_empty());
  }

  #[test]
  fn it_should_apply_overrides_after_switches() {
    let config = SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .allow_fork(true)
      .parse_syscall_list(strings(&["fork=no", "mkdir", "chdir=file"]))
      .unwrap()
      .build()
      .unwrap();
    let table = &config.policy().syscalls;
    let rule = |name: &str| table.get(Syscall::by_name(name).unwrap()).unwrap().action;
    assert_eq!(rule("fork"), SyscallAction::Deny);
    assert_eq!(rule("vfork"), SyscallAction::Allow);
    assert_eq!(rule("mkdir"), SyscallAction::Allow);
    assert_eq!(rule("chdir"), SyscallAction::AllowIfPath(PathArg::First));
  }

  #[test]
  fn it_should_reject_malformed_overrides() {
    let builder = || SandboxConfigBuilder::command("./sol", Vec::<String>::new());
    assert!(builder().parse_syscall_list(strings(&["frobnicate"])).is_err());
    assert!(builder().parse_syscall_list(strings(&["#4096"])).is_err());
    assert!(builder().parse_path_list(strings(&["/tmp=sometimes"])).is_err());
    assert!(builder().parse_env_list(strings(&["=1"])).is_err());
    assert!(builder().file_access(10).build().is_err());
    assert!(FilterLevel::from_count(3).is_err());
  }

  #[test]
  fn it_should_reject_path_rules_without_checking() {
    let result = SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .file_access(9)
      .parse_path_list(strings(&["/tmp/"]))
      .unwrap()
      .build();
    assert!(result.is_err());

    let config = SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .file_access(9)
      .build()
      .unwrap();
    assert_eq!(config.file_access(), 9);
  }

  #[test]
  fn it_should_treat_zero_stack_as_unlimited() {
    let config = SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .stack_limit(0)
      .cpu_time_limit(Some(1000))
      .build()
      .unwrap();
    assert_eq!(config.limits().stack, None);
    assert!(config.limits().has_timer());
    let config = SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .stack_limit(8192)
      .build()
      .unwrap();
    assert_eq!(config.limits().stack, Some(8192));
  }
}

//! Pure syscall decisions, consulted by the supervisor once per syscall entry.

use log::trace;

use crate::arch::{Syscall, SyscallCall};
use crate::config::{FilterLevel, SandboxConfig};
use crate::path::PathValidator;
use crate::syscall::{PathArg, RuleFlags, SyscallAction, SyscallTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  Allow(RuleFlags),
  /// Allowed if the file name in `path` passes the path validator
  AllowPendingPathCheck { path: PathArg, flags: RuleFlags },
  Deny,
  /// The program sends a signal to itself
  SelfKill { signal: i32 },
}

pub struct PolicyEngine<'a> {
  filter: FilterLevel,
  syscalls: &'a SyscallTable,
  paths: PathValidator<'a>,
  tracee: i32,
}

impl<'a> PolicyEngine<'a> {
  pub fn new(config: &'a SandboxConfig, tracee: i32) -> Self {
    PolicyEngine {
      filter: config.filter(),
      syscalls: &config.policy().syscalls,
      paths: PathValidator::new(config.file_access(), &config.policy().paths),
      tracee,
    }
  }

  pub fn paths(&self) -> &PathValidator<'a> {
    &self.paths
  }

  pub fn decide(&self, call: &SyscallCall) -> Decision {
    if self.filter == FilterLevel::Off {
      return Decision::Allow(RuleFlags::default());
    }
    let rule = self
      .syscalls
      .get(call.syscall)
      .filter(|rule| self.filter == FilterLevel::Liberal || !rule.flags.liberal_only);
    let decision = match rule {
      Some(rule) => match rule.action {
        SyscallAction::Allow => Decision::Allow(rule.flags),
        SyscallAction::Deny => Decision::Deny,
        SyscallAction::AllowIfPath(path) => Decision::AllowPendingPathCheck {
          path,
          flags: rule.flags,
        },
      },
      None => self.unlisted(call),
    };
    trace!("Syscall {} decided as {:?}", call.syscall, decision);
    decision
  }

  fn unlisted(&self, call: &SyscallCall) -> Decision {
    // Arguments are C ints, the upper half of the register is garbage
    let arg = |i: usize| call.args[i] as i32;
    if call.syscall == Syscall::KILL && arg(0) == self.tracee {
      Decision::SelfKill { signal: arg(1) }
    } else if call.syscall == Syscall::TGKILL && arg(0) == self.tracee && arg(1) == self.tracee {
      Decision::SelfKill { signal: arg(2) }
    } else {
      Decision::Deny
    }
  }
}

/// Directory descriptor of a path-checked syscall, only the `*at` family has one
pub fn dirfd_of(path: PathArg, call: &SyscallCall) -> Option<i32> {
  match path {
    PathArg::First => None,
    PathArg::AtSecond => Some(call.args[0] as i32),
  }
}

/// Address of the file name of a path-checked syscall
pub fn name_of(path: PathArg, call: &SyscallCall) -> u64 {
  match path {
    PathArg::First => call.args[0],
    PathArg::AtSecond => call.args[1],
  }
}

#[cfg(test)]
mod tests {
  use nix::libc;

  use super::*;
  use crate::config::SandboxConfigBuilder;

  const TRACEE: i32 = 4242;

  fn sandbox(filter: FilterLevel, overrides: &[&str]) -> SandboxConfig {
    SandboxConfigBuilder::command("./sol", Vec::<String>::new())
      .filter(filter)
      .parse_syscall_list(overrides.iter().map(|s| s.to_string()).collect())
      .unwrap()
      .build()
      .unwrap()
  }

  fn call(name: &str, args: [u64; 3]) -> SyscallCall {
    SyscallCall::new(Syscall::by_name(name).unwrap(), args)
  }

  #[test]
  fn it_should_deny_unlisted_syscalls() {
    let config = sandbox(FilterLevel::Liberal, &[]);
    let engine = PolicyEngine::new(&config, TRACEE);
    for name in ["socket", "mkdir", "execve", "fork", "ptrace", "kill"] {
      assert_eq!(engine.decide(&call(name, [1, 2, 3])), Decision::Deny, "{}", name);
    }
    assert_eq!(
      engine.decide(&SyscallCall::new(Syscall::from_number(999), [0; 3])),
      Decision::Deny
    );
  }

  #[test]
  fn it_should_allow_listed_syscalls() {
    let config = sandbox(FilterLevel::Strict, &[]);
    let engine = PolicyEngine::new(&config, TRACEE);
    assert!(matches!(engine.decide(&call("read", [0; 3])), Decision::Allow(_)));
    assert!(matches!(
      engine.decide(&call("exit_group", [0; 3])),
      Decision::Allow(RuleFlags { sample_mem: true, .. })
    ));
    assert_eq!(
      engine.decide(&call("openat", [0; 3])),
      Decision::AllowPendingPathCheck {
        path: PathArg::AtSecond,
        flags: RuleFlags::default()
      }
    );
  }

  #[test]
  fn strict_should_be_subset_of_liberal() {
    let strict = sandbox(FilterLevel::Strict, &[]);
    let liberal = sandbox(FilterLevel::Liberal, &[]);
    let strict = PolicyEngine::new(&strict, TRACEE);
    let liberal = PolicyEngine::new(&liberal, TRACEE);
    let mut liberal_only = 0;
    for nr in 0..512 {
      let call = SyscallCall::new(Syscall::from_number(nr), [0; 3]);
      match (strict.decide(&call), liberal.decide(&call)) {
        (Decision::Deny, Decision::Deny) => {}
        (Decision::Deny, _) => liberal_only += 1,
        (a, b) => assert_eq!(a, b, "syscall #{}", nr),
      }
    }
    assert!(liberal_only > 0);
    assert_eq!(
      strict.decide(&call("rt_sigreturn", [0; 3])),
      Decision::Deny
    );
  }

  #[test]
  fn overrides_should_hold_in_strict_mode() {
    let config = sandbox(FilterLevel::Strict, &["rt_sigreturn", "read=no"]);
    let engine = PolicyEngine::new(&config, TRACEE);
    assert!(matches!(
      engine.decide(&call("rt_sigreturn", [0; 3])),
      Decision::Allow(RuleFlags { no_retval: true, .. })
    ));
    assert_eq!(engine.decide(&call("read", [0; 3])), Decision::Deny);
  }

  #[test]
  fn it_should_detect_self_kill() {
    let config = sandbox(FilterLevel::Liberal, &[]);
    let engine = PolicyEngine::new(&config, TRACEE);
    let pid = TRACEE as u64;
    assert_eq!(
      engine.decide(&call("kill", [pid, 6, 0])),
      Decision::SelfKill { signal: 6 }
    );
    assert_eq!(
      engine.decide(&call("tgkill", [pid, pid, 11])),
      Decision::SelfKill { signal: 11 }
    );
    assert_eq!(engine.decide(&call("kill", [1, 9, 0])), Decision::Deny);
    assert_eq!(engine.decide(&call("tgkill", [pid, 1, 9])), Decision::Deny);

    // An explicit rule takes precedence
    let config = sandbox(FilterLevel::Liberal, &["kill=no"]);
    let engine = PolicyEngine::new(&config, TRACEE);
    assert_eq!(engine.decide(&call("kill", [pid, 6, 0])), Decision::Deny);
  }

  #[test]
  fn it_should_locate_path_arguments() {
    let open = call("open", [0x1000, 0, 0]);
    assert_eq!(name_of(PathArg::First, &open), 0x1000);
    assert_eq!(dirfd_of(PathArg::First, &open), None);
    let openat = call("openat", [libc::AT_FDCWD as u32 as u64, 0x2000, 0]);
    assert_eq!(name_of(PathArg::AtSecond, &openat), 0x2000);
    assert_eq!(dirfd_of(PathArg::AtSecond, &openat), Some(libc::AT_FDCWD));
  }
}

use std::collections::HashMap;

use lazy_static::lazy_static;
use nix::libc::{self, c_long};

use crate::arch::{Syscall, MAX_SYSCALL};
use crate::error::BoxError;

/// Which argument of a path-checked syscall holds the file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathArg {
  /// `open(name, ...)`
  First,
  /// `openat(dirfd, name, ...)`
  AtSecond,
}

/// What happens to a syscall on entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAction {
  Deny,
  Allow,
  AllowIfPath(PathArg),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFlags {
  /// Only allowed under liberal filtering
  pub liberal_only: bool,
  /// The syscall does not return, the exit stop reports no syscall number
  pub no_retval: bool,
  /// Sample peak memory before letting the syscall through
  pub sample_mem: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRule {
  pub action: SyscallAction,
  pub flags: RuleFlags,
}

impl SyscallRule {
  fn new(action: SyscallAction) -> Self {
    SyscallRule {
      action,
      flags: RuleFlags::default(),
    }
  }

  fn liberal(mut self) -> Self {
    self.flags.liberal_only = true;
    self
  }

  fn no_retval(mut self) -> Self {
    self.flags.no_retval = true;
    self
  }

  fn sample_mem(mut self) -> Self {
    self.flags.sample_mem = true;
    self
  }
}

const PATH_FIRST: &[c_long] = &[
  libc::SYS_open,
  libc::SYS_creat,
  libc::SYS_unlink,
  libc::SYS_access,
  libc::SYS_truncate,
  libc::SYS_stat,
  libc::SYS_lstat,
  libc::SYS_readlink,
];

const PATH_AT_SECOND: &[c_long] = &[
  libc::SYS_openat,
  libc::SYS_newfstatat,
  libc::SYS_faccessat,
  libc::SYS_readlinkat,
  libc::SYS_statx,
];

const ALWAYS: &[c_long] = &[
  libc::SYS_read,
  libc::SYS_write,
  libc::SYS_close,
  libc::SYS_lseek,
  libc::SYS_getpid,
  libc::SYS_getuid,
  libc::SYS_dup,
  libc::SYS_brk,
  libc::SYS_getgid,
  libc::SYS_geteuid,
  libc::SYS_getegid,
  libc::SYS_dup2,
  libc::SYS_ftruncate,
  libc::SYS_fstat,
  libc::SYS_personality,
  libc::SYS_readv,
  libc::SYS_writev,
  libc::SYS_getresuid,
  libc::SYS_pread64,
  libc::SYS_pwrite64,
  libc::SYS_fcntl,
  libc::SYS_mmap,
  libc::SYS_munmap,
  libc::SYS_ioctl,
  libc::SYS_uname,
  libc::SYS_gettid,
  libc::SYS_set_thread_area,
  libc::SYS_get_thread_area,
  libc::SYS_set_tid_address,
  libc::SYS_arch_prctl,
  libc::SYS_set_robust_list,
  libc::SYS_rseq,
];

const LIBERAL: &[c_long] = &[
  libc::SYS_time,
  libc::SYS_alarm,
  libc::SYS_pause,
  libc::SYS_fchmod,
  libc::SYS_getrlimit,
  libc::SYS_getrusage,
  libc::SYS_gettimeofday,
  libc::SYS_select,
  libc::SYS_setitimer,
  libc::SYS_getitimer,
  libc::SYS_mprotect,
  libc::SYS_getdents,
  libc::SYS_getdents64,
  libc::SYS_fdatasync,
  libc::SYS_mremap,
  libc::SYS_poll,
  libc::SYS_getcwd,
  libc::SYS_nanosleep,
  libc::SYS_rt_sigaction,
  libc::SYS_rt_sigprocmask,
  libc::SYS_rt_sigpending,
  libc::SYS_rt_sigtimedwait,
  libc::SYS_rt_sigqueueinfo,
  libc::SYS_rt_sigsuspend,
  libc::SYS__sysctl,
  libc::SYS_clock_gettime,
  libc::SYS_clock_getres,
  libc::SYS_clock_nanosleep,
  libc::SYS_prlimit64,
  libc::SYS_getrandom,
  libc::SYS_sigaltstack,
  libc::SYS_madvise,
  libc::SYS_futex,
  libc::SYS_sched_yield,
];

const FORK: &[c_long] = &[
  libc::SYS_fork,
  libc::SYS_vfork,
  libc::SYS_clone,
  libc::SYS_clone3,
  libc::SYS_wait4,
];

fn default_rules() -> HashMap<Syscall, SyscallRule> {
  let mut map = HashMap::new();
  let mut put = |nr: c_long, rule: SyscallRule| {
    map.insert(Syscall::from_number(nr as u64), rule);
  };
  for nr in PATH_FIRST {
    put(*nr, SyscallRule::new(SyscallAction::AllowIfPath(PathArg::First)));
  }
  for nr in PATH_AT_SECOND {
    put(*nr, SyscallRule::new(SyscallAction::AllowIfPath(PathArg::AtSecond)));
  }
  for nr in ALWAYS {
    put(*nr, SyscallRule::new(SyscallAction::Allow));
  }
  for nr in LIBERAL {
    put(*nr, SyscallRule::new(SyscallAction::Allow).liberal());
  }
  put(
    libc::SYS_exit,
    SyscallRule::new(SyscallAction::Allow).sample_mem(),
  );
  put(
    libc::SYS_exit_group,
    SyscallRule::new(SyscallAction::Allow).sample_mem(),
  );
  put(
    libc::SYS_rt_sigreturn,
    SyscallRule::new(SyscallAction::Allow).liberal().no_retval(),
  );
  map
}

lazy_static! {
  static ref DEFAULT_RULES: HashMap<Syscall, SyscallRule> = default_rules();
}

/// Syscall rule table: the built-in defaults overlaid with caller overrides.
///
/// Syscalls missing from the table are denied.
#[derive(Debug, Clone)]
pub struct SyscallTable {
  map: HashMap<Syscall, SyscallRule>,
}

impl Default for SyscallTable {
  fn default() -> Self {
    SyscallTable {
      map: DEFAULT_RULES.clone(),
    }
  }
}

impl SyscallTable {
  pub fn get(&self, syscall: Syscall) -> Option<&SyscallRule> {
    self.map.get(&syscall)
  }

  /// Set the action of a syscall.
  ///
  /// An explicit action is valid under every filter level, the memory and return
  /// value modifiers of a built-in rule are kept.
  pub fn set(&mut self, syscall: Syscall, action: SyscallAction) -> &mut Self {
    let flags = match self.map.get(&syscall) {
      Some(rule) => RuleFlags {
        liberal_only: false,
        ..rule.flags
      },
      None => RuleFlags::default(),
    };
    self.map.insert(syscall, SyscallRule { action, flags });
    self
  }

  /// Let the program create (untraced) child processes and wait for them
  pub fn allow_fork(&mut self) -> &mut Self {
    for nr in FORK {
      self.set(Syscall::from_number(*nr as u64), SyscallAction::Allow);
    }
    self
  }

  /// Let the program call `times`
  pub fn allow_times(&mut self) -> &mut Self {
    self.set(
      Syscall::from_number(libc::SYS_times as u64),
      SyscallAction::Allow,
    )
  }
}

/// Parse a syscall override `name[=yes|no|file]`
pub fn parse_override(text: &str) -> Result<(Syscall, SyscallAction), BoxError> {
  let (name, action) = match text.split_once('=') {
    Some((name, action)) => (name, Some(action)),
    None => (text, None),
  };
  let syscall = parse_syscall(name)?;
  let action = match action {
    None | Some("yes") => SyscallAction::Allow,
    Some("no") => SyscallAction::Deny,
    Some("file") => SyscallAction::AllowIfPath(PathArg::First),
    Some(other) => {
      return Err(BoxError::config(format!(
        "Unknown syscall action `{}` in `{}`",
        other, text
      )))
    }
  };
  Ok((syscall, action))
}

fn parse_syscall(name: &str) -> Result<Syscall, BoxError> {
  let digits = name.strip_prefix('#').unwrap_or(name);
  if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
    return match digits.parse::<u64>() {
      Ok(nr) if nr < MAX_SYSCALL => Ok(Syscall::from_number(nr)),
      _ => Err(BoxError::config(format!(
        "Syscall number {} out of range",
        digits
      ))),
    };
  }
  Syscall::by_name(name).ok_or_else(|| BoxError::config(format!("Unknown syscall `{}`", name)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sys(name: &str) -> Syscall {
    Syscall::by_name(name).unwrap()
  }

  #[test]
  fn it_should_load_defaults() {
    let table = SyscallTable::default();
    assert_eq!(
      table.get(sys("open")).unwrap().action,
      SyscallAction::AllowIfPath(PathArg::First)
    );
    assert_eq!(
      table.get(sys("openat")).unwrap().action,
      SyscallAction::AllowIfPath(PathArg::AtSecond)
    );
    assert!(table.get(sys("exit_group")).unwrap().flags.sample_mem);
    let sigreturn = table.get(sys("rt_sigreturn")).unwrap();
    assert!(sigreturn.flags.liberal_only);
    assert!(sigreturn.flags.no_retval);
    assert!(!table.get(sys("read")).unwrap().flags.liberal_only);
    assert!(table.get(sys("execve")).is_none());
    assert!(table.get(sys("socket")).is_none());
    assert!(table.get(sys("fork")).is_none());
  }

  #[test]
  fn it_should_parse_overrides() {
    assert_eq!(
      parse_override("mkdir").unwrap(),
      (sys("mkdir"), SyscallAction::Allow)
    );
    assert_eq!(
      parse_override("read=no").unwrap(),
      (sys("read"), SyscallAction::Deny)
    );
    assert_eq!(
      parse_override("chdir=file").unwrap(),
      (sys("chdir"), SyscallAction::AllowIfPath(PathArg::First))
    );
    assert_eq!(
      parse_override("#83=yes").unwrap().0,
      Syscall::from_number(83)
    );
    assert_eq!(parse_override("83").unwrap().0, Syscall::from_number(83));
    assert!(parse_override("no_such_call").is_err());
    assert!(parse_override("#1024").is_err());
    assert!(parse_override("#99999999999999999999999").is_err());
    assert!(parse_override("read=maybe").is_err());
    assert!(parse_override("").is_err());
  }

  #[test]
  fn it_should_clear_liberal_flag_on_override() {
    let mut table = SyscallTable::default();
    let (syscall, action) = parse_override("rt_sigreturn").unwrap();
    table.set(syscall, action);
    let rule = table.get(sys("rt_sigreturn")).unwrap();
    assert!(!rule.flags.liberal_only);
    assert!(rule.flags.no_retval);

    let (syscall, action) = parse_override("exit_group=no").unwrap();
    table.set(syscall, action);
    assert_eq!(
      table.get(sys("exit_group")).unwrap().action,
      SyscallAction::Deny
    );
  }

  #[test]
  fn it_should_apply_switches() {
    let mut table = SyscallTable::default();
    table.allow_fork().allow_times();
    for name in ["fork", "vfork", "clone", "clone3", "wait4", "times"] {
      assert_eq!(table.get(sys(name)).unwrap().action, SyscallAction::Allow);
    }
  }
}

//! x86_64 adapter: syscall numbering, register layout and syscall instruction checks.
//!
//! Everything that depends on the raw numbering or on `user_regs_struct` lives here,
//! the policy code only deals with [`Syscall`] values and [`SyscallCall`] snapshots.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use lazy_static::lazy_static;
use nix::libc::{self, c_long, user_regs_struct};

use crate::tracee::MemoryReader;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("judgebox only supports x86_64 hosts");

pub const PAGE_SIZE: u64 = 4096;

/// Syscall number seen at syscall exit when there is no syscall to return from
/// (`rt_sigreturn` restores `orig_rax` to -1)
pub const NO_SYSCALL: u64 = u64::MAX;

/// Number written over a denied syscall so that the kernel fails it with ENOSYS
pub const INVALID_SYSCALL: u64 = u64::MAX;

/// Upper bound for numeric syscall overrides
pub const MAX_SYSCALL: u64 = 1024;

const CS_32BIT: u64 = 0x23;
const CS_64BIT: u64 = 0x33;
const SYSCALL_INSN: u16 = 0x050f;
const INT80_INSN: u16 = 0x80cd;

macro_rules! syscall_names {
  ($($sys:ident),* $(,)?) => {
    &[$((stringify!($sys), libc::$sys)),*]
  };
}

static SYSCALL_NAMES: &[(&str, c_long)] = syscall_names![
  SYS_read, SYS_write, SYS_open, SYS_close, SYS_stat, SYS_fstat, SYS_lstat, SYS_poll,
  SYS_lseek, SYS_mmap, SYS_mprotect, SYS_munmap, SYS_brk, SYS_rt_sigaction,
  SYS_rt_sigprocmask, SYS_rt_sigreturn, SYS_ioctl, SYS_pread64, SYS_pwrite64, SYS_readv,
  SYS_writev, SYS_access, SYS_pipe, SYS_select, SYS_sched_yield, SYS_mremap, SYS_msync,
  SYS_mincore, SYS_madvise, SYS_shmget, SYS_shmat, SYS_shmctl, SYS_dup, SYS_dup2,
  SYS_pause, SYS_nanosleep, SYS_getitimer, SYS_alarm, SYS_setitimer, SYS_getpid,
  SYS_sendfile, SYS_socket, SYS_connect, SYS_accept, SYS_sendto, SYS_recvfrom,
  SYS_sendmsg, SYS_recvmsg, SYS_shutdown, SYS_bind, SYS_listen, SYS_getsockname,
  SYS_getpeername, SYS_socketpair, SYS_setsockopt, SYS_getsockopt, SYS_clone, SYS_fork,
  SYS_vfork, SYS_execve, SYS_exit, SYS_wait4, SYS_kill, SYS_uname, SYS_semget,
  SYS_semop, SYS_semctl, SYS_shmdt, SYS_msgget, SYS_msgsnd, SYS_msgrcv, SYS_msgctl,
  SYS_fcntl, SYS_flock, SYS_fsync, SYS_fdatasync, SYS_truncate, SYS_ftruncate,
  SYS_getdents, SYS_getcwd, SYS_chdir, SYS_fchdir, SYS_rename, SYS_mkdir, SYS_rmdir,
  SYS_creat, SYS_link, SYS_unlink, SYS_symlink, SYS_readlink, SYS_chmod, SYS_fchmod,
  SYS_chown, SYS_fchown, SYS_lchown, SYS_umask, SYS_gettimeofday, SYS_getrlimit,
  SYS_getrusage, SYS_sysinfo, SYS_times, SYS_ptrace, SYS_getuid, SYS_syslog, SYS_getgid,
  SYS_setuid, SYS_setgid, SYS_geteuid, SYS_getegid, SYS_setpgid, SYS_getppid,
  SYS_getpgrp, SYS_setsid, SYS_setreuid, SYS_setregid, SYS_getgroups, SYS_setgroups,
  SYS_setresuid, SYS_getresuid, SYS_setresgid, SYS_getresgid, SYS_getpgid,
  SYS_setfsuid, SYS_setfsgid, SYS_getsid, SYS_capget, SYS_capset, SYS_rt_sigpending,
  SYS_rt_sigtimedwait, SYS_rt_sigqueueinfo, SYS_rt_sigsuspend, SYS_sigaltstack,
  SYS_utime, SYS_mknod, SYS_personality, SYS_statfs, SYS_fstatfs, SYS_getpriority,
  SYS_setpriority, SYS_sched_setparam, SYS_sched_getparam, SYS_sched_setscheduler,
  SYS_sched_getscheduler, SYS_mlock, SYS_munlock, SYS_mlockall, SYS_munlockall,
  SYS_prctl, SYS_arch_prctl, SYS__sysctl, SYS_setrlimit, SYS_chroot, SYS_sync,
  SYS_mount, SYS_umount2, SYS_reboot, SYS_sethostname, SYS_init_module,
  SYS_delete_module, SYS_gettid, SYS_readahead, SYS_tkill, SYS_time, SYS_futex,
  SYS_sched_setaffinity, SYS_sched_getaffinity, SYS_set_thread_area,
  SYS_get_thread_area, SYS_getdents64, SYS_set_tid_address, SYS_timer_create,
  SYS_timer_settime, SYS_timer_gettime, SYS_timer_delete, SYS_clock_settime,
  SYS_clock_gettime, SYS_clock_getres, SYS_clock_nanosleep, SYS_exit_group,
  SYS_epoll_wait, SYS_epoll_ctl, SYS_tgkill, SYS_utimes, SYS_waitid, SYS_inotify_init,
  SYS_openat, SYS_mkdirat, SYS_fchownat, SYS_newfstatat, SYS_unlinkat, SYS_renameat,
  SYS_linkat, SYS_symlinkat, SYS_readlinkat, SYS_fchmodat, SYS_faccessat, SYS_pselect6,
  SYS_ppoll, SYS_unshare, SYS_set_robust_list, SYS_get_robust_list, SYS_splice,
  SYS_tee, SYS_utimensat, SYS_epoll_pwait, SYS_eventfd, SYS_fallocate, SYS_accept4,
  SYS_eventfd2, SYS_epoll_create1, SYS_dup3, SYS_pipe2, SYS_preadv, SYS_pwritev,
  SYS_prlimit64, SYS_setns, SYS_getcpu, SYS_process_vm_readv, SYS_process_vm_writev,
  SYS_seccomp, SYS_getrandom, SYS_memfd_create, SYS_execveat, SYS_membarrier,
  SYS_mlock2, SYS_copy_file_range, SYS_preadv2, SYS_pwritev2, SYS_statx, SYS_rseq,
  SYS_pidfd_open, SYS_clone3, SYS_faccessat2,
];

lazy_static! {
  static ref BY_NAME: HashMap<&'static str, u64> = SYSCALL_NAMES
    .iter()
    .map(|(name, nr)| (strip_prefix(name), *nr as u64))
    .collect();
  static ref BY_NUMBER: HashMap<u64, &'static str> = SYSCALL_NAMES
    .iter()
    .map(|(name, nr)| (*nr as u64, strip_prefix(name)))
    .collect();
}

fn strip_prefix(name: &'static str) -> &'static str {
  name.strip_prefix("SYS_").unwrap_or(name)
}

/// A syscall of the traced program, identified by its native number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Syscall(u64);

impl Syscall {
  pub const EXECVE: Syscall = Syscall(libc::SYS_execve as u64);
  pub const KILL: Syscall = Syscall(libc::SYS_kill as u64);
  pub const TGKILL: Syscall = Syscall(libc::SYS_tgkill as u64);

  pub fn from_number(nr: u64) -> Self {
    Syscall(nr)
  }

  /// Look up a syscall by its symbolic name, e.g. `openat`
  pub fn by_name(name: &str) -> Option<Self> {
    BY_NAME.get(name).map(|nr| Syscall(*nr))
  }

  pub fn number(&self) -> u64 {
    self.0
  }

  pub fn name(&self) -> Option<&'static str> {
    BY_NUMBER.get(&self.0).copied()
  }
}

impl Display for Syscall {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self.name() {
      Some(name) => f.write_str(name),
      None => f.write_fmt(format_args!("#{}", self.0)),
    }
  }
}

/// Syscall number plus its first three arguments, as seen on syscall entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallCall {
  pub syscall: Syscall,
  pub args: [u64; 3],
}

impl SyscallCall {
  pub fn new(syscall: Syscall, args: [u64; 3]) -> Self {
    SyscallCall { syscall, args }
  }
}

/// Register snapshot of a stopped tracee.
///
/// The raw layout never leaves this module.
#[derive(Clone, Copy)]
pub struct Registers(user_regs_struct);

impl Registers {
  pub(crate) fn from_raw(regs: user_regs_struct) -> Self {
    Registers(regs)
  }

  pub(crate) fn into_raw(self) -> user_regs_struct {
    self.0
  }

  pub fn syscall_number(&self) -> u64 {
    self.0.orig_rax
  }

  pub fn set_syscall_number(&mut self, nr: u64) {
    self.0.orig_rax = nr;
  }

  pub fn return_value(&self) -> i64 {
    self.0.rax as i64
  }

  /// Decode the syscall on entry, 64-bit calling convention
  pub fn syscall_call(&self) -> SyscallCall {
    SyscallCall::new(
      Syscall::from_number(self.0.orig_rax),
      [self.0.rdi, self.0.rsi, self.0.rdx],
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeViolation {
  /// The program tried a syscall through a mode it is not allowed to use
  Forbidden(String),
  /// The tracee is in a state the supervisor does not understand
  Unexpected(String),
}

/// Check that the stopped syscall was issued with the 64-bit `syscall` instruction.
///
/// A 64-bit process may still execute `int 0x80`, which the kernel handles as a
/// 32-bit syscall with a different numbering. The only way to tell is to look at
/// the two instruction bytes right before the trap address.
pub fn check_call_mode<R: MemoryReader>(
  regs: &Registers,
  memory: &mut R,
) -> Result<(), ModeViolation> {
  match regs.0.cs {
    CS_32BIT => Err(ModeViolation::Forbidden(
      "Forbidden 32-bit mode syscall".to_string(),
    )),
    CS_64BIT => {
      let mut instr = [0u8; 2];
      match memory.read_memory(regs.0.rip.wrapping_sub(2), &mut instr) {
        Ok(2) => {}
        Ok(_) | Err(_) => {
          return Err(ModeViolation::Unexpected(
            "Cannot read syscall instruction".to_string(),
          ))
        }
      }
      match u16::from_le_bytes(instr) {
        SYSCALL_INSN => Ok(()),
        INT80_INSN => Err(ModeViolation::Forbidden(
          "Forbidden 32-bit syscall in 64-bit mode".to_string(),
        )),
        other => Err(ModeViolation::Unexpected(format!(
          "Unknown syscall instruction {:04x}",
          other
        ))),
      }
    }
    cs => Err(ModeViolation::Unexpected(format!(
      "Unknown code segment {:04x}",
      cs
    ))),
  }
}

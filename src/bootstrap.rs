//! The child side of `fork`: prepare the process and turn it into the program.
//!
//! Everything that allocates is done by [`Bootstrap::prepare`] in the supervisor,
//! [`Bootstrap::enter`] only issues syscalls.

use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::os::unix::prelude::RawFd;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc::{self, RLIM_INFINITY, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::ptrace;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{raise, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, close, dup2, execve, setpgid, Pid};

use crate::config::SandboxConfig;
use crate::env::build_environment;
use crate::error::BoxError;
use crate::utils::{into_c_string, BoxWritePipe};

/// Limit on open file descriptors of the program
const MAX_OPEN_FILES: u64 = 64;

/// A failed step, sent to the supervisor as `step("subject"): error`
struct Failure<'a> {
  step: &'static str,
  subject: Option<&'a CStr>,
  errno: Errno,
}

impl<'a> Failure<'a> {
  fn new(step: &'static str, subject: Option<&'a CStr>, errno: Errno) -> Self {
    Failure {
      step,
      subject,
      errno,
    }
  }

  fn send(&self, pipe: &BoxWritePipe) {
    let desc = self.errno.desc().as_bytes();
    let _ = match self.subject {
      Some(subject) => pipe.write(&[
        self.step.as_bytes(),
        &b"(\""[..],
        subject.to_bytes(),
        &b"\"): "[..],
        desc,
      ]),
      None => pipe.write(&[self.step.as_bytes(), &b": "[..], desc]),
    };
  }
}

/// Process setup of the sandboxed program, ready to be applied after `fork`
pub struct Bootstrap {
  program: CString,
  arguments: Vec<CString>,
  env: Vec<CString>,
  cwd: Option<CString>,
  stdin: Option<CString>,
  stdout: Option<CString>,
  stderr: Option<CString>,
  /// Address space limit in bytes
  memory: Option<u64>,
  /// Stack limit in bytes
  stack: Option<u64>,
  trace: bool,
}

fn path_to_c_string(path: &Option<std::path::PathBuf>) -> Result<Option<CString>, BoxError> {
  match path {
    Some(path) => Ok(Some(into_c_string(path.to_string_lossy())?)),
    None => Ok(None),
  }
}

impl Bootstrap {
  pub fn prepare(config: &SandboxConfig, caller_env: &[(String, String)]) -> Result<Self, BoxError> {
    let run = config.run();
    let program = into_c_string(&run.program)?;
    let mut arguments = vec![program.clone()];
    for argument in run.arguments.iter() {
      arguments.push(into_c_string(argument)?);
    }
    let mut env = vec![];
    for (key, value) in build_environment(run.inherit_env, &config.policy().envs, caller_env) {
      env.push(into_c_string(format!("{}={}", key, value))?);
    }

    Ok(Bootstrap {
      program,
      arguments,
      env,
      cwd: path_to_c_string(&run.cwd)?,
      stdin: path_to_c_string(&run.stdin)?,
      stdout: path_to_c_string(&run.stdout)?,
      stderr: path_to_c_string(&run.stderr)?,
      memory: run.limits.memory.map(|kb| kb.saturating_mul(1024)),
      stack: run.limits.stack.map(|kb| kb.saturating_mul(1024)),
      trace: run.filter.is_enabled(),
    })
  }

  pub fn environment(&self) -> &Vec<CString> {
    &self.env
  }

  /// Become the program. On failure the reason goes to `pipe` and the process exits
  /// with status 2.
  pub fn enter(&self, pipe: BoxWritePipe) -> ! {
    if let Err(failure) = self.apply() {
      failure.send(&pipe);
    }
    drop(pipe);
    unsafe { libc::_exit(2) }
  }

  fn apply(&self) -> Result<Infallible, Failure<'_>> {
    if let Some(cwd) = &self.cwd {
      chdir(cwd.as_c_str()).map_err(|e| Failure::new("chdir", Some(cwd.as_c_str()), e))?;
    }

    if let Some(path) = &self.stdin {
      redirect(path, OFlag::O_RDONLY, STDIN_FILENO)?;
    }
    let output = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
    if let Some(path) = &self.stdout {
      redirect(path, output, STDOUT_FILENO)?;
    }
    match &self.stderr {
      Some(path) => redirect(path, output, STDERR_FILENO)?,
      None => {
        dup2(STDOUT_FILENO, STDERR_FILENO).map_err(|e| Failure::new("dup2", None, e))?;
      }
    }

    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|e| Failure::new("setpgid", None, e))?;

    if let Some(bytes) = self.memory {
      setrlimit(Resource::RLIMIT_AS, bytes, bytes)
        .map_err(|e| Failure::new("setrlimit(RLIMIT_AS)", None, e))?;
    }
    let stack = self.stack.unwrap_or(RLIM_INFINITY);
    setrlimit(Resource::RLIMIT_STACK, stack, stack)
      .map_err(|e| Failure::new("setrlimit(RLIMIT_STACK)", None, e))?;
    setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)
      .map_err(|e| Failure::new("setrlimit(RLIMIT_NOFILE)", None, e))?;

    if self.trace {
      ptrace::traceme().map_err(|e| Failure::new("ptrace(PTRACE_TRACEME)", None, e))?;
      // Stay stopped until the supervisor has attached its options
      raise(Signal::SIGSTOP).map_err(|e| Failure::new("raise(SIGSTOP)", None, e))?;
    }

    execve(&self.program, self.arguments.as_slice(), self.env.as_slice())
      .map_err(|e| Failure::new("execve", Some(self.program.as_c_str()), e))
  }
}

fn redirect<'a>(path: &'a CStr, flags: OFlag, target: RawFd) -> Result<(), Failure<'a>> {
  let mode = Mode::from_bits_truncate(0o666);
  let fd = open(path, flags, mode).map_err(|e| Failure::new("open", Some(path), e))?;
  if fd != target {
    dup2(fd, target).map_err(|e| Failure::new("dup2", Some(path), e))?;
    close(fd).map_err(|e| Failure::new("close", Some(path), e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SandboxConfigBuilder;

  #[test]
  fn it_should_prepare_arguments_and_environment() {
    let config = SandboxConfigBuilder::command("/bin/true", vec!["--flag", "x y"])
      .parse_env_list(vec!["PATH".to_string(), "LANG=C".to_string()])
      .unwrap()
      .memory_limit(Some(65536))
      .stack_limit(0)
      .build()
      .unwrap();
    let caller = vec![
      ("PATH".to_string(), "/usr/bin".to_string()),
      ("HOME".to_string(), "/root".to_string()),
    ];
    let bootstrap = Bootstrap::prepare(&config, &caller).unwrap();
    let arguments: Vec<&[u8]> = bootstrap.arguments.iter().map(|a| a.as_bytes()).collect();
    assert_eq!(arguments, vec![&b"/bin/true"[..], &b"--flag"[..], &b"x y"[..]]);
    let env: Vec<&[u8]> = bootstrap.environment().iter().map(|a| a.as_bytes()).collect();
    assert_eq!(
      env,
      vec![
        &b"LIBC_FATAL_STDERR_=1"[..],
        &b"PATH=/usr/bin"[..],
        &b"LANG=C"[..],
      ]
    );
    assert_eq!(bootstrap.memory, Some(65536 * 1024));
    assert_eq!(bootstrap.stack, None);
    assert!(!bootstrap.trace);
  }

  #[test]
  fn it_should_saturate_huge_limits() {
    let config = SandboxConfigBuilder::command("/bin/true", Vec::<String>::new())
      .memory_limit(Some(u64::MAX))
      .stack_limit(u64::MAX / 1000)
      .build()
      .unwrap();
    let bootstrap = Bootstrap::prepare(&config, &[]).unwrap();
    assert_eq!(bootstrap.memory, Some(u64::MAX));
    assert_eq!(bootstrap.stack, Some(u64::MAX));
  }

  #[test]
  fn it_should_reject_nul_bytes() {
    let config = SandboxConfigBuilder::command("/bin/echo", vec!["a\0b"])
      .build()
      .unwrap();
    assert!(Bootstrap::prepare(&config, &[]).is_err());
  }
}

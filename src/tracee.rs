//! Narrow handle over the sandboxed process.
//!
//! The supervisor reads and writes registers, reads the memory image and samples
//! accounting data only through [`Tracee`].

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use log::trace;
use nix::libc;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::arch::{Registers, PAGE_SIZE};
use crate::error::BoxError;

/// Longest file name read from the tracee, terminator included
pub const PATH_MAX: usize = 4096;

const PROC_BUF_SIZE: usize = 4096;

/// Something that can read the memory image of the tracee
pub trait MemoryReader {
  fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum StringReadError {
  /// No terminator within the bound
  TooLong,
  /// The string runs into memory that can not be read
  OutOfMemory,
}

/// Read a NUL-terminated string at `addr`, at most `max` bytes including the terminator.
///
/// Reads never cross a page boundary, so a string ending right before an unmapped
/// page is still read completely.
pub fn read_c_string<R: MemoryReader>(
  memory: &mut R,
  addr: u64,
  max: usize,
) -> Result<String, StringReadError> {
  let mut buf: Vec<u8> = Vec::with_capacity(256);
  let mut addr = addr;
  loop {
    let remains = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
    let len = remains.min(max - buf.len());
    if len == 0 {
      return Err(StringReadError::TooLong);
    }
    let start = buf.len();
    buf.resize(start + len, 0);
    let count = match memory.read_memory(addr, &mut buf[start..]) {
      Ok(0) | Err(_) => return Err(StringReadError::OutOfMemory),
      Ok(count) => count,
    };
    buf.truncate(start + count);
    if let Some(pos) = buf[start..].iter().position(|b| *b == 0) {
      buf.truncate(start + pos);
      return Ok(String::from_utf8_lossy(&buf).into_owned());
    }
    addr = match addr.checked_add(count as u64) {
      Some(next) => next,
      None => return Err(StringReadError::OutOfMemory),
    };
  }
}

/// The sandboxed process, seen from the supervisor
pub struct Tracee {
  pid: Pid,
  mem: Option<File>,
  stat: Option<File>,
  status: Option<File>,
}

impl Tracee {
  pub fn new(pid: Pid) -> Self {
    Tracee {
      pid,
      mem: None,
      stat: None,
      status: None,
    }
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  /// Open the memory image again. A handle opened before `execve` still refers to
  /// the old address space and reads nothing.
  pub fn reopen_memory(&mut self) -> Result<(), BoxError> {
    let path = format!("/proc/{}/mem", self.pid);
    let file = File::open(&path).map_err(|e| BoxError::proc(format!("open({}): {}", path, e)))?;
    self.mem = Some(file);
    Ok(())
  }

  pub fn read_registers(&self) -> Result<Registers, BoxError> {
    let regs = ptrace::getregs(self.pid)
      .map_err(|e| BoxError::trace(format!("ptrace(PTRACE_GETREGS): {}", e)))?;
    Ok(Registers::from_raw(regs))
  }

  pub fn write_registers(&self, regs: Registers) -> Result<(), BoxError> {
    ptrace::setregs(self.pid, regs.into_raw())
      .map_err(|e| BoxError::trace(format!("ptrace(PTRACE_SETREGS): {}", e)))
  }

  /// Read a file name argument of the stopped syscall
  pub fn read_path(&mut self, addr: u64) -> Result<String, StringReadError> {
    read_c_string(self, addr, PATH_MAX)
  }

  /// CPU time (user + system) consumed so far, in milliseconds
  pub fn cpu_time(&mut self, ticks_per_sec: u64) -> Result<u64, BoxError> {
    let pid = self.pid;
    let text = read_proc_file(&mut self.stat, pid, "stat")?;
    let (utime, stime) =
      parse_stat_times(&text).ok_or_else(|| BoxError::proc("proc stat syntax error"))?;
    Ok((utime + stime) * 1000 / ticks_per_sec)
  }

  /// Peak virtual memory size in KB, as maintained by the kernel
  pub fn vm_peak(&mut self) -> Result<Option<u64>, BoxError> {
    let pid = self.pid;
    let text = read_proc_file(&mut self.status, pid, "status")?;
    Ok(parse_vm_peak(&text))
  }
}

impl MemoryReader for Tracee {
  fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
    if self.mem.is_none() {
      self.mem = Some(File::open(format!("/proc/{}/mem", self.pid))?);
    }
    match &self.mem {
      Some(file) => {
        trace!("Read {} bytes of tracee memory at {:#x}", buf.len(), addr);
        // Offsets above i64::MAX are rejected by pread
        if addr > i64::MAX as u64 {
          return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        file.read_at(buf, addr)
      }
      None => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
  }
}

fn read_proc_file(file: &mut Option<File>, pid: Pid, name: &str) -> Result<String, BoxError> {
  if file.is_none() {
    let path = format!("/proc/{}/{}", pid, name);
    let opened = File::open(&path).map_err(|e| BoxError::proc(format!("open({}): {}", path, e)))?;
    *file = Some(opened);
  }
  let file = match file {
    Some(file) => file,
    None => return Err(BoxError::proc(format!("/proc/$pid/{} is not open", name))),
  };
  let mut buf = vec![0u8; PROC_BUF_SIZE];
  let count = file
    .read_at(&mut buf, 0)
    .map_err(|e| BoxError::proc(format!("read on /proc/$pid/{}: {}", name, e)))?;
  if count >= PROC_BUF_SIZE {
    return Err(BoxError::proc(format!("/proc/$pid/{} too long", name)));
  }
  buf.truncate(count);
  Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Extract `utime` and `stime` (in clock ticks) from `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_stat_times(stat: &str) -> Option<(u64, u64)> {
  let open = stat.find('(')?;
  let close = stat.rfind(')')?;
  if close < open {
    return None;
  }
  let mut fields = stat[close + 1..].split_whitespace().skip(11);
  let utime = fields.next()?.parse().ok()?;
  let stime = fields.next()?.parse().ok()?;
  Some((utime, stime))
}

/// Extract `VmPeak` (in KB) from `/proc/<pid>/status`
pub fn parse_vm_peak(status: &str) -> Option<u64> {
  status.lines().find_map(|line| {
    let (key, value) = line.split_once(':')?;
    if key != "VmPeak" {
      return None;
    }
    value.split_whitespace().next()?.parse().ok()
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Memory image with a readable window, everything else faults
  struct Image {
    base: u64,
    bytes: Vec<u8>,
    reads: Vec<(u64, usize)>,
  }

  impl MemoryReader for Image {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
      self.reads.push((addr, buf.len()));
      if addr < self.base || addr >= self.base + self.bytes.len() as u64 {
        return Err(io::Error::from_raw_os_error(libc::EIO));
      }
      let start = (addr - self.base) as usize;
      let len = buf.len().min(self.bytes.len() - start);
      buf[..len].copy_from_slice(&self.bytes[start..start + len]);
      Ok(len)
    }
  }

  #[test]
  fn it_should_read_string_across_pages() {
    let mut bytes = vec![b'a'; 4096 + 10];
    let addr = 0x10000 + 4096 - 6;
    bytes[(addr - 0x10000) as usize..(addr - 0x10000) as usize + 12]
      .copy_from_slice(b"/etc/passwd\0");
    let mut image = Image {
      base: 0x10000,
      bytes,
      reads: vec![],
    };
    assert_eq!(read_c_string(&mut image, addr, PATH_MAX).unwrap(), "/etc/passwd");
    assert_eq!(image.reads, vec![(addr, 6), (0x10000 + 4096, 4090)]);
  }

  #[test]
  fn it_should_stop_at_unmapped_page() {
    // Terminated right before the end of the readable window
    let mut image = Image {
      base: 0x20000,
      bytes: b"abc\0".to_vec(),
      reads: vec![],
    };
    assert_eq!(read_c_string(&mut image, 0x20000, PATH_MAX).unwrap(), "abc");

    // Unterminated, runs into unreadable memory
    let mut image = Image {
      base: 0x20000,
      bytes: vec![b'x'; 100],
      reads: vec![],
    };
    assert_eq!(
      read_c_string(&mut image, 0x20000, PATH_MAX),
      Err(StringReadError::OutOfMemory)
    );
    assert_eq!(
      read_c_string(&mut image, 0x90000, PATH_MAX),
      Err(StringReadError::OutOfMemory)
    );
  }

  #[test]
  fn it_should_reject_unterminated_name() {
    let mut image = Image {
      base: 0x30000,
      bytes: vec![b'y'; 3 * 4096],
      reads: vec![],
    };
    assert_eq!(
      read_c_string(&mut image, 0x30000, PATH_MAX),
      Err(StringReadError::TooLong)
    );
    assert_eq!(
      read_c_string(&mut image, 0x30000 + 100, 16),
      Err(StringReadError::TooLong)
    );
  }

  #[test]
  fn it_should_parse_stat_times() {
    let stat = "4242 (a) b (c)) R 1 4242 4242 0 -1 4194304 100 0 0 0 37 5 0 0 20 0 1 0 \
                123 4096 10 18446744073709551615";
    assert_eq!(parse_stat_times(stat), Some((37, 5)));
    assert_eq!(parse_stat_times("4242 (short) R 1"), None);
    assert_eq!(parse_stat_times("garbage"), None);
  }

  #[test]
  fn it_should_parse_vm_peak() {
    let status = "Name:\tsol\nState:\tR (running)\nVmPeak:\t   12345 kB\nVmSize:\t   12000 kB\n";
    assert_eq!(parse_vm_peak(status), Some(12345));
    assert_eq!(parse_vm_peak("Name:\tzombie\nState:\tZ (zombie)\n"), None);
  }
}

use std::os::unix::prelude::RawFd;

use log::warn;
use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::BoxError;

const MESSAGE_SIZE: usize = 512;

/// Close-on-exec pipe carrying a bootstrap failure from the child to the supervisor.
///
/// A successful `execve` closes the write end without a message.
pub struct BoxPipe(RawFd, RawFd);

pub struct BoxReadPipe(RawFd);

pub struct BoxWritePipe(RawFd);

impl BoxPipe {
  pub fn new() -> Result<Self, BoxError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
      .map_err(|e| BoxError::fork(format!("pipe2: {}", e)))?;
    Ok(BoxPipe(result.0, result.1))
  }

  pub fn read(self) -> Result<BoxReadPipe, BoxError> {
    let (read, write) = (self.0, self.1);
    std::mem::forget(self);
    close(write)?;
    Ok(BoxReadPipe(read))
  }

  pub fn write(self) -> Result<BoxWritePipe, BoxError> {
    let (read, write) = (self.0, self.1);
    std::mem::forget(self);
    close(read)?;
    Ok(BoxWritePipe(write))
  }
}

impl Drop for BoxPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl BoxReadPipe {
  /// Message left by the child, `None` if there is none
  pub fn read(&self) -> Result<Option<String>, BoxError> {
    let mut buf = vec![0 as u8; MESSAGE_SIZE];
    let size = match unistd::read(self.0, buf.as_mut_slice()) {
      Ok(size) => size,
      Err(Errno::EAGAIN) => return Ok(None),
      Err(e) => return Err(BoxError::bootstrap(format!("read on status pipe: {}", e))),
    };
    if size == 0 {
      return Ok(None);
    }
    let buf = buf
      .into_iter()
      .take(size)
      .take_while(|b| *b != 0)
      .collect::<Vec<u8>>();
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
  }
}

impl Drop for BoxReadPipe {
  fn drop(&mut self) {
    if let Err(e) = close(self.0) {
      warn!("Close status pipe fails: {}", e);
    }
  }
}

impl BoxWritePipe {
  /// Write a NUL-terminated message made of `parts`, so the child does not have to
  /// allocate
  pub fn write(&self, parts: &[&[u8]]) -> Result<usize, BoxError> {
    let mut size = 0;
    for part in parts {
      size += unistd::write(self.0, part)?;
    }
    unistd::write(self.0, &[0])?;
    Ok(size)
  }
}

impl Drop for BoxWritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_should_carry_a_message() {
    let pipe = BoxPipe::new().unwrap();
    let read = pipe.0;
    let write = BoxWritePipe(pipe.1);
    std::mem::forget(pipe);
    let read = BoxReadPipe(read);

    write
      .write(&["chdir".as_bytes(), &b": "[..], "No such file or directory".as_bytes()])
      .unwrap();
    drop(write);
    assert_eq!(
      read.read().unwrap(),
      Some("chdir: No such file or directory".to_string())
    );
  }

  #[test]
  fn it_should_report_no_message() {
    let pipe = BoxPipe::new().unwrap();
    let read = pipe.0;
    let write = BoxWritePipe(pipe.1);
    std::mem::forget(pipe);
    let read = BoxReadPipe(read);

    // Still open, nothing written
    assert_eq!(read.read().unwrap(), None);
    drop(write);
    // Closed without a message, as after a successful execve
    assert_eq!(read.read().unwrap(), None);
  }
}

use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::Record;

use crate::error::BoxError;

pub use pipe::{BoxPipe, BoxReadPipe, BoxWritePipe};

pub mod pipe;

pub type TimeLimitType = u64;

pub type MemoryLimitType = u64;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Run ./sol with syscall filter Strict```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, BoxError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| BoxError::config(format!("Argument {:?} contains a NUL byte", string)))
}

/// Convert seconds (fractions allowed) into milliseconds
pub fn seconds_to_ms(seconds: f64) -> Result<TimeLimitType, BoxError> {
  if !seconds.is_finite() || seconds < 0.0 {
    return Err(BoxError::config(format!("Invalid time {}", seconds)));
  }
  Ok((seconds * 1000.0).round() as TimeLimitType)
}

//! String-level file name checks. Nothing here touches the real filesystem.

use lazy_static::lazy_static;
use log::debug;
use nix::libc;

use crate::error::BoxError;
use crate::tracee::StringReadError;

/// Level from which path checks are turned off completely
pub const LEVEL_UNCHECKED: u8 = 9;

/// Highest valid file access level
pub const MAX_LEVEL: u8 = 9;

/// Allow or deny a path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
  pub prefix: String,
  pub allow: bool,
}

impl PathRule {
  pub fn new<S: Into<String>>(prefix: S, allow: bool) -> Self {
    PathRule {
      prefix: prefix.into(),
      allow,
    }
  }

  /// Parse `path[=yes|no]`
  pub fn parse(text: &str) -> Result<Self, BoxError> {
    let (prefix, allow) = match text.split_once('=') {
      None => (text, true),
      Some((prefix, "yes")) => (prefix, true),
      Some((prefix, "no")) => (prefix, false),
      Some((_, other)) => {
        return Err(BoxError::config(format!(
          "Unknown path action `{}` in `{}`",
          other, text
        )))
      }
    };
    if prefix.is_empty() {
      return Err(BoxError::config(format!("Empty path in rule `{}`", text)));
    }
    Ok(PathRule::new(prefix, allow))
  }

  /// Whether this rule applies to `path`.
  ///
  /// A rule ending with `/` covers the whole subtree, otherwise the path must be
  /// equal to the rule. A path that ends exactly where the rule has a `/` also
  /// matches, so `/etc` is covered by `/etc/`.
  pub fn matches(&self, path: &str) -> bool {
    let rule = self.prefix.as_bytes();
    let path = path.as_bytes();
    if let Some(rest) = path.strip_prefix(rule) {
      rule.is_empty() || rule.ends_with(b"/") || rest.is_empty()
    } else {
      rule.starts_with(path) && rule[path.len()] == b'/'
    }
  }
}

lazy_static! {
  static ref BUILTIN_RULES: Vec<PathRule> = [
    "/etc/",
    "/lib/",
    "/lib64/",
    "/usr/lib/",
    "/usr/lib64/",
    "/opt/lib/",
    "/usr/share/zoneinfo/",
    "/usr/share/locale/",
    "/dev/null",
    "/dev/zero",
    "/proc/meminfo",
    "/proc/self/stat",
    "/proc/self/exe",
  ]
  .iter()
  .map(|prefix| PathRule::new(*prefix, true))
  .collect();
}

pub fn builtin_rules() -> &'static [PathRule] {
  &BUILTIN_RULES
}

/// Resolve `.` and `..` lexically and squeeze repeated slashes.
///
/// Returns `None` when `..` would climb above the beginning of the path. A trailing
/// slash survives normalization, an empty relative path becomes `.`.
pub fn normalize(path: &str) -> Option<String> {
  let absolute = path.starts_with('/');
  let mut stack: Vec<&str> = vec![];
  for segment in path.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        stack.pop()?;
      }
      segment => stack.push(segment),
    }
  }

  let mut result = String::with_capacity(path.len());
  if absolute {
    result.push('/');
  }
  result.push_str(&stack.join("/"));
  if result.is_empty() {
    result.push('.');
  } else if path.ends_with('/') && result != "/" {
    result.push('/');
  }
  Some(result)
}

/// The denial message for a file name that could not be read
pub fn read_error_message(err: &StringReadError) -> String {
  match err {
    StringReadError::TooLong => "Access to file with name too long".to_string(),
    StringReadError::OutOfMemory => "Access to file with name out of memory".to_string(),
  }
}

fn forbidden(name: &str) -> String {
  format!("Forbidden access to file `{}'", name)
}

/// Decides whether the program may touch a file name at a given access level
pub struct PathValidator<'a> {
  level: u8,
  rules: &'a [PathRule],
}

impl<'a> PathValidator<'a> {
  pub fn new(level: u8, rules: &'a [PathRule]) -> Self {
    PathValidator { level, rules }
  }

  /// Decision that is known before reading the name, if any
  pub fn without_name(&self) -> Option<Result<(), String>> {
    if self.level == 0 {
      Some(Err("File access forbidden".to_string()))
    } else if self.level >= LEVEL_UNCHECKED {
      Some(Ok(()))
    } else {
      None
    }
  }

  /// Check a file name. `dirfd` is set for the `*at` family of syscalls.
  pub fn check(&self, dirfd: Option<i32>, name: &str) -> Result<(), String> {
    if let Some(result) = self.without_name() {
      return result;
    }
    if self.level >= 4 {
      return Ok(());
    }

    if let Some(fd) = dirfd {
      // Operates on the descriptor itself, e.g. `newfstatat(fd, "", AT_EMPTY_PATH)`
      if name.is_empty() {
        return Ok(());
      }
      if !name.starts_with('/') && fd != libc::AT_FDCWD {
        return Err(forbidden(name));
      }
    }

    // Everything in the working directory
    if self.level >= 2 && !name.contains('/') && name != ".." {
      return Ok(());
    }

    let resolved = match normalize(name) {
      Some(resolved) => resolved,
      None => return Err(forbidden(name)),
    };

    let builtin: &[PathRule] = if self.level >= 3 { builtin_rules() } else { &[] };
    let rule = self
      .rules
      .iter()
      .chain(builtin.iter())
      .find(|rule| rule.matches(&resolved));
    match rule {
      Some(rule) if rule.allow => {
        debug!("File {} allowed by rule {}", resolved, rule.prefix);
        Ok(())
      }
      _ => Err(forbidden(&resolved)),
    }
  }
}

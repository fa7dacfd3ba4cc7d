use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Once;

use flexi_logger::Logger;
use log::info;

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("judgebox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Compile `fixtures/programs/<name>.c` into `dir`
pub fn compile(name: &str, dir: &Path) -> PathBuf {
  let source = Path::new("./fixtures/programs").join(format!("{}.c", name));
  let executable = dir.join(name);
  let output = Command::new("cc")
    .arg("-O2")
    .arg(source.to_str().unwrap())
    .arg("-o")
    .arg(executable.to_str().unwrap())
    .output()
    .expect("Compile should be ok");
  assert!(
    output.status.success(),
    "Compile {} failed: {}",
    name,
    String::from_utf8_lossy(&output.stderr)
  );
  executable
}

pub struct Outcome {
  pub code: i32,
  pub meta: HashMap<String, String>,
  pub stderr: String,
}

impl Outcome {
  pub fn get(&self, key: &str) -> Option<&str> {
    self.meta.get(key).map(|value| value.as_str())
  }

  pub fn status(&self) -> &str {
    self.get("status").unwrap_or("")
  }

  pub fn message(&self) -> &str {
    self.get("message").unwrap_or("")
  }
}

/// The judgebox binary with `args`, writing the meta report to `meta`
pub fn command(meta: &Path, args: &[&str]) -> Command {
  let _ = fs::remove_file(meta);
  info!("Run judgebox {:?}", args);
  let mut command = Command::new(env!("CARGO_BIN_EXE_judgebox"));
  command.arg("-M").arg(meta.to_str().unwrap()).args(args);
  command
}

/// Collect the exit code, stderr and meta report of a finished judgebox
pub fn collect(meta: &Path, output: Output) -> Outcome {
  let stderr = String::from_utf8_lossy(&output.stderr).to_string();
  info!("judgebox says: {}", stderr.trim_end());

  let text = fs::read_to_string(meta).unwrap_or_default();
  let meta = text
    .lines()
    .filter_map(|line| line.split_once(':'))
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
  Outcome {
    code: output.status.code().unwrap_or(-1),
    meta,
    stderr,
  }
}

/// Run the judgebox binary with `args`, the meta report goes into `dir`
pub fn judgebox(dir: &Path, args: &[&str]) -> Outcome {
  let meta = dir.join("meta");
  let output = command(&meta, args)
    .output()
    .expect("judgebox should start");
  collect(&meta, output)
}

use std::env;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::{error, info};

use judgebox::utils::{default_format, seconds_to_ms, TimeLimitType};
use judgebox::{
  run, BoxError, BoxExit, BoxReport, FilterLevel, ReportSink, SandboxConfig,
  SandboxConfigBuilder, Verdict,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short = 'a', default_value_t = 0, help = "Set file access level (0=none, 1=only -p rules, 2=cwd, 3=/etc,/lib,..., 4=whole fs, 9=no checks; needs -f)")]
  file_access: u8,

  #[arg(short = 'c', value_name = "DIR", help = "Change directory to <dir> first")]
  cwd: Option<PathBuf>,

  #[arg(short = 'e', default_value_t = false, help = "Inherit full environment of the parent process")]
  inherit_env: bool,

  #[arg(short = 'E', value_name = "VAR[=VAL]", help = "Set/modify/delete (with empty <val>) environment variable")]
  envs: Vec<String>,

  #[arg(short = 'f', action = ArgAction::Count, help = "Filter system calls (-ff=very restricted)")]
  filter: u8,

  #[arg(short = 'F', default_value_t = false, help = "Allow fork() and friends")]
  allow_fork: bool,

  #[arg(short = 'i', value_name = "FILE", help = "Redirect stdin from <file>")]
  stdin: Option<PathBuf>,

  #[arg(short = 'k', value_name = "KB", default_value_t = 0, help = "Limit stack size to <size> KB (default: 0=unlimited)")]
  stack: u64,

  #[arg(short = 'm', value_name = "KB", help = "Limit address space to <size> KB")]
  memory: Option<u64>,

  #[arg(short = 'M', value_name = "FILE", help = "Output process information to <file> (name:value), '-' for stdout")]
  meta: Option<String>,

  #[arg(short = 'o', value_name = "FILE", help = "Redirect stdout to <file>")]
  stdout: Option<PathBuf>,

  #[arg(short = 'p', value_name = "PATH[=yes|no]", help = "Permit or forbid access to <path> (subdirectories too if path ends with '/')")]
  paths: Vec<String>,

  #[arg(short = 'r', value_name = "FILE", help = "Redirect stderr to <file>")]
  stderr: Option<PathBuf>,

  #[arg(short = 's', value_name = "SYS[=yes|no|file]", help = "Permit or forbid syscall <sys>")]
  syscalls: Vec<String>,

  #[arg(short = 't', value_name = "SEC", help = "Set run time limit (seconds, fractions allowed)")]
  time: Option<f64>,

  #[arg(short = 'T', default_value_t = false, help = "Allow syscalls for measuring run time")]
  allow_times: bool,

  #[arg(short = 'v', action = ArgAction::Count, help = "Be verbose (use multiple times for even more verbosity)")]
  verbose: u8,

  #[arg(short = 'w', value_name = "SEC", help = "Set wall clock time limit (seconds, fractions allowed)")]
  wall_time: Option<f64>,

  #[arg(short = 'x', value_name = "SEC", help = "Set extra timeout, before which a timing-out program is not yet killed")]
  extra_time: Option<f64>,

  #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, help = "Program and its arguments")]
  command: Vec<String>,
}

/// A zero time limit means no limit
fn time_limit(seconds: Option<f64>) -> Result<Option<TimeLimitType>, BoxError> {
  match seconds {
    Some(seconds) => Ok(Some(seconds_to_ms(seconds)?).filter(|ms| *ms > 0)),
    None => Ok(None),
  }
}

impl Cli {
  fn resolve(self) -> Result<SandboxConfig, BoxError> {
    let mut command = self.command.into_iter();
    let program = command.next().unwrap_or_default();
    let arguments: Vec<String> = command.collect();

    SandboxConfigBuilder::command(program, arguments)
      .cpu_time_limit(time_limit(self.time)?)
      .wall_time_limit(time_limit(self.wall_time)?)
      .extra_time(time_limit(self.extra_time)?.unwrap_or(0))
      .memory_limit(self.memory.filter(|kb| *kb > 0))
      .stack_limit(self.stack)
      .filter(FilterLevel::from_count(self.filter)?)
      .file_access(self.file_access)
      .cwd(self.cwd)
      .stdin(self.stdin)
      .stdout(self.stdout)
      .stderr(self.stderr)
      .inherit_env(self.inherit_env)
      .allow_fork(self.allow_fork)
      .allow_times(self.allow_times)
      .parse_syscall_list(self.syscalls)?
      .parse_path_list(self.paths)?
      .parse_env_list(self.envs)?
      .build()
  }
}

fn start_logger(verbose: u8) -> Result<LoggerHandle, BoxError> {
  let level = match verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };
  let mut logger = Logger::try_with_env_or_str(format!("judgebox={}", level))?.format(default_format);
  if let Ok(dir) = env::var("LOG_DIR") {
    logger = logger
      .log_to_file(
        FileSpec::default()
          .directory(dir)
          .basename("judgebox")
          .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
          .suppress_timestamp(),
      )
      .append()
      .duplicate_to_stderr(Duplicate::All);
  }
  Ok(logger.start()?)
}

fn main() -> BoxExit {
  let cli = Cli::parse();

  let _logger = match start_logger(cli.verbose) {
    Ok(handle) => handle,
    Err(err) => return BoxExit::Err(err),
  };
  let sink = ReportSink::parse(cli.meta.as_deref());

  let report = match cli.resolve() {
    Ok(config) => {
      info!("Start running judgebox");
      run(&config)
    }
    Err(err) => {
      error!("{}", err);
      BoxReport::failed(Verdict::from(&err))
    }
  };

  eprintln!("{}", report.status_line());
  if let Err(err) = sink.write(&report) {
    return BoxExit::Err(err);
  }
  report.exit()
}

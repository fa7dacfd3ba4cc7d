pub use config::{FilterLevel, SandboxConfig, SandboxConfigBuilder};
pub use error::{BoxError, BoxExit};
pub use report::{BoxReport, ReportSink, Status, Verdict};
pub use supervisor::run;

pub mod arch;
pub mod bootstrap;
pub mod config;
pub mod env;
pub mod error;
pub mod path;
pub mod policy;
pub mod report;
pub mod signals;
pub mod supervisor;
pub mod syscall;
pub mod tracee;
pub mod utils;

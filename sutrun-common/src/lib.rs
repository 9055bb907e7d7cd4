//! sutrun common library.
//!
//! Data model, error taxonomy and the system-under-test contract shared by
//! the schedulers, plus the local host SUT, the tainted kernel monitor, the
//! result reader, event bus, configuration and logging setup.

pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod mock;
pub mod reader;
pub mod sut;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{ConfigError, RunnerConfig};
pub use errors::{FrameworkError, InstallerError, SchedulerError, SutError};
pub use events::{Event, EventBus};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use reader::{ResultReader, SummaryReader};
#[cfg(unix)]
pub use sut::HostSut;
pub use sut::{BufferSink, Installer, OutputSink, Sut, TaintMonitor, TaintStatus};
pub use types::{
    BROKEN_RETURNCODE, CommandOutput, SKIPPED_RETURNCODE, Suite, SuiteResult, SutInfo, Test,
    TestResult,
};
pub use util::mask_sensitive_command;

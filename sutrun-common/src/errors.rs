//! Error taxonomy for sutrun.
//!
//! | Type              | Raised by                         | Effect on a run                 |
//! |-------------------|-----------------------------------|---------------------------------|
//! | `SutError`        | SUT implementations               | fatal unless it is a kernel panic |
//! | `FrameworkError`  | result readers                    | fatal                           |
//! | `SchedulerError`  | test and suite schedulers         | kernel faults trigger a reboot  |
//! | `InstallerError`  | framework installers              | fatal, raised before scheduling |

use thiserror::Error;

/// Errors raised by a system under test.
#[derive(Debug, Error)]
pub enum SutError {
    #[error("SUT is not running")]
    NotRunning,

    #[error("SUT is already running")]
    AlreadyRunning,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The kernel panic marker showed up in a command's output.
    #[error("kernel panic detected")]
    KernelPanic,

    #[error("'{0}' file doesn't exist")]
    FileNotFound(String),

    #[error("communication failed: {0}")]
    Communication(String),

    #[error("can't read tainted kernel information: {0}")]
    TaintRead(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SutError {
    pub fn is_kernel_panic(&self) -> bool {
        matches!(self, Self::KernelPanic)
    }

    /// Errors caused by the command itself (bad arguments, missing cwd or
    /// binary) rather than by the SUT session.
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::FileNotFound(_) | Self::Io(_)
        )
    }
}

/// Errors raised while interpreting test output.
#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("failed to compile result pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid result data for '{test}': {reason}")]
    InvalidData { test: String, reason: String },
}

/// Errors raised while installing a testing framework on the SUT.
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("installation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Sut(#[from] SutError),
}

/// Errors raised by schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Sut(#[from] SutError),

    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error("kernel panic during '{test}'")]
    KernelPanic { test: String },

    #[error("kernel tainted during '{test}': {}", reasons.join(", "))]
    KernelTainted { test: String, reasons: Vec<String> },

    #[error("SUT is not replying after '{test}' timed out")]
    KernelTimeout { test: String },

    #[error("scheduled task failed: {0}")]
    Task(String),
}

impl SchedulerError {
    /// Whether the SUT must be rebooted before scheduling can continue.
    pub fn is_kernel_fault(&self) -> bool {
        match self {
            Self::KernelPanic { .. } | Self::KernelTainted { .. } | Self::KernelTimeout { .. } => {
                true
            }
            Self::Sut(err) => err.is_kernel_panic(),
            _ => false,
        }
    }
}

//! Tainted kernel detection.
//!
//! The kernel exposes a bitmask in `/proc/sys/kernel/tainted`; every set bit
//! names one reason the kernel is no longer pristine. [`TaintMonitor`] reads it
//! through a [`Sut`] and keeps the most recent decoded snapshot.

use super::Sut;
use crate::errors::SutError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Command used to read the taint bitmask.
pub const TAINTED_COMMAND: &str = "cat /proc/sys/kernel/tainted";

/// Taint reasons, indexed by bit position.
pub const TAINT_REASONS: [&str; 18] = [
    "proprietary module was loaded",
    "module was force loaded",
    "kernel running on an out of specification system",
    "module was force unloaded",
    "processor reported a Machine Check Exception (MCE)",
    "bad page referenced or some unexpected page flags",
    "taint requested by userspace application",
    "kernel died recently, i.e. there was an OOPS or BUG",
    "ACPI table overridden by user",
    "kernel issued warning",
    "staging driver was loaded",
    "workaround for bug in platform firmware applied",
    "externally-built (\u{201c}out-of-tree\u{201d}) module was loaded",
    "unsigned module was loaded",
    "soft lockup occurred",
    "kernel has been live patched",
    "auxiliary taint, defined for and used by distros",
    "kernel was built with the struct randomization plugin",
];

/// Point-in-time taint snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintStatus {
    /// Raw bitmask.
    pub code: u64,
    /// Human-readable reasons for every set bit, in bit order.
    pub reasons: Vec<String>,
}

impl TaintStatus {
    pub fn decode(code: u64) -> Self {
        Self {
            code,
            reasons: decode_reasons(code, &TAINT_REASONS),
        }
    }

    pub fn is_tainted(&self) -> bool {
        self.code != 0
    }
}

/// Map every set bit `i` of `code` to `table[i]`. Bits past the table are ignored.
pub fn decode_reasons(code: u64, table: &[&str]) -> Vec<String> {
    table
        .iter()
        .enumerate()
        .filter(|(bit, _)| *bit < 64 && code & (1u64 << bit) != 0)
        .map(|(_, reason)| (*reason).to_string())
        .collect()
}

/// Parse the content of the tainted file.
pub fn parse_tainted(stdout: &str) -> Result<TaintStatus, SutError> {
    let raw = stdout.trim();
    // non numeric output is most likely an error message
    let code = raw
        .parse::<u64>()
        .map_err(|_| SutError::TaintRead(raw.to_string()))?;
    Ok(TaintStatus::decode(code))
}

/// Single-slot cache of the last taint snapshot.
///
/// Only one read is in flight at a time. A caller that finds a read in
/// progress gets the cached snapshot when one exists; with an empty cache it
/// waits for the in-flight read to finish and then performs its own.
#[derive(Debug, Default)]
pub struct TaintMonitor {
    read_lock: tokio::sync::Mutex<()>,
    cached: Mutex<Option<TaintStatus>>,
}

impl TaintMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently published snapshot.
    pub fn cached(&self) -> Option<TaintStatus> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the taint state through `sut` and publish it.
    pub async fn check<S: Sut + ?Sized>(&self, sut: &S) -> Result<TaintStatus, SutError> {
        let _guard = match self.read_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(status) = self.cached() {
                    debug!(code = status.code, "Taint read in flight, using cached status");
                    return Ok(status);
                }
                self.read_lock.lock().await
            }
        };

        let output = sut.run_command(TAINTED_COMMAND, None, None, None).await?;
        if output.returncode != 0 {
            return Err(SutError::TaintRead(format!(
                "'{}' exited with {}",
                TAINTED_COMMAND, output.returncode
            )));
        }

        let status = parse_tainted(&output.stdout)?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());

        Ok(status)
    }
}

//! System under test (SUT) abstraction.
//!
//! A SUT is anything that can execute shell commands for us: the local host,
//! a remote machine over SSH, a virtual machine console. Schedulers only
//! depend on the [`Sut`] trait.

#[cfg(unix)]
pub mod host;
pub mod tainted;

#[cfg(unix)]
pub use host::HostSut;
pub use tainted::{TAINT_REASONS, TaintMonitor, TaintStatus, decode_reasons};

use crate::errors::{InstallerError, SutError};
use crate::types::{CommandOutput, SutInfo, UNKNOWN};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of `communicate` attempts made by [`Sut::ensure_communicate`].
pub const DEFAULT_COMMUNICATE_RETRIES: u32 = 10;

/// Timeout applied to every [`Sut::get_info`] probe.
pub const INFO_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Receives command stdout while it is being produced.
pub trait OutputSink: Send + Sync {
    fn write(&self, data: &str);
}

/// Sink that accumulates everything written to it.
#[derive(Debug, Default)]
pub struct BufferSink {
    data: Mutex<String>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, data: &str) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(data);
    }
}

/// Execution contract every SUT implementation provides.
#[async_trait]
pub trait Sut: Send + Sync {
    /// Short identifier used in logs and events.
    fn name(&self) -> &str;

    /// Whether commands may run concurrently on this SUT.
    fn parallel_execution(&self) -> bool;

    /// Whether a session is currently established.
    fn is_running(&self) -> bool;

    /// Cache used by [`Sut::get_tainted_info`].
    fn taint_monitor(&self) -> &TaintMonitor;

    /// Round-trip time of a trivial command.
    async fn ping(&self) -> Result<Duration, SutError>;

    /// Establish the session. Fails if already running.
    async fn communicate(&self, sink: Option<&dyn OutputSink>) -> Result<(), SutError>;

    /// Tear down the session, killing any live processes. No-op if not running.
    async fn stop(&self, sink: Option<&dyn OutputSink>) -> Result<(), SutError>;

    /// Run `command` to completion, streaming its output to `sink`.
    ///
    /// Fails with [`SutError::KernelPanic`] when the panic marker shows up in
    /// the output; the partial output is only available through `sink`.
    async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, SutError>;

    /// Download a file from the SUT.
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SutError>;

    /// Call `communicate` up to `retries` times, stopping the SUT between
    /// attempts. The last error is returned once every attempt failed.
    async fn ensure_communicate(
        &self,
        sink: Option<&dyn OutputSink>,
        retries: u32,
    ) -> Result<(), SutError> {
        let retries = retries.max(1);

        for attempt in 1..=retries {
            match self.communicate(sink).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= retries => {
                    warn!(sut = self.name(), attempt, "Communication failed: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    info!(
                        sut = self.name(),
                        attempt, retries, "Communication failed, retrying: {}", err
                    );
                    self.stop(sink).await?;
                }
            }
        }

        Err(SutError::Communication("no communication attempt was made".to_string()))
    }

    /// Collect environment metadata. Probes run concurrently and every field
    /// a probe can't determine in time is reported as `"unknown"`.
    async fn get_info(&self) -> SutInfo {
        let (distro, distro_ver, kernel, arch, cpu, meminfo) = tokio::join!(
            probe(self, ". /etc/os-release && echo \"$ID\""),
            probe(self, ". /etc/os-release && echo \"$VERSION_ID\""),
            probe(self, "uname -s -r -v"),
            probe(self, "uname -m"),
            probe(self, "uname -p"),
            probe(self, "cat /proc/meminfo"),
        );

        SutInfo {
            distro,
            distro_ver,
            kernel,
            arch,
            cpu,
            ram: meminfo_field(&meminfo, "MemTotal").unwrap_or_else(|| UNKNOWN.to_string()),
            swap: meminfo_field(&meminfo, "SwapTotal").unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }

    /// Current kernel taint state.
    async fn get_tainted_info(&self) -> Result<TaintStatus, SutError> {
        self.taint_monitor().check(self).await
    }
}

/// Provisions a testing framework onto a SUT before scheduling starts.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        sut: &dyn Sut,
        sink: Option<&dyn OutputSink>,
    ) -> Result<(), InstallerError>;
}

async fn probe<S: Sut + ?Sized>(sut: &S, command: &str) -> String {
    match tokio::time::timeout(INFO_PROBE_TIMEOUT, sut.run_command(command, None, None, None))
        .await
    {
        Ok(Ok(output)) if output.returncode == 0 => output.stdout.trim_end().to_string(),
        Ok(Ok(output)) => {
            debug!(command, returncode = output.returncode, "Info probe failed");
            UNKNOWN.to_string()
        }
        Ok(Err(err)) => {
            debug!(command, "Info probe failed: {}", err);
            UNKNOWN.to_string()
        }
        Err(_) => {
            debug!(command, "Info probe timed out");
            UNKNOWN.to_string()
        }
    }
}

/// Extract `"<n> kB"` for `field` from /proc/meminfo content.
fn meminfo_field(content: &str, field: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != field {
            return None;
        }
        let kb = value.trim().trim_end_matches("kB").trim();
        kb.parse::<u64>().ok().map(|n| format!("{n} kB"))
    })
}

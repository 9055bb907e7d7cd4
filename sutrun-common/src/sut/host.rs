//! SUT backed by the local host.
//!
//! Every command runs as `sh -c` in its own process group, so stopping the SUT
//! (or dropping a command future) takes the whole process subtree down.

use super::{OutputSink, Sut, TaintMonitor};
use crate::errors::SutError;
use crate::types::CommandOutput;
use crate::util::mask_sensitive_command;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Size of a single stdout read.
pub const BUFFSIZE: usize = 1024;

/// Substring that identifies a kernel panic in command output.
pub const PANIC_MARKER: &str = "Kernel panic";

/// How long `stop` waits for killed commands to be reaped.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long output is still collected once the command itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

type Registry = Arc<Mutex<HashSet<i32>>>;

/// Local host SUT.
#[derive(Debug)]
pub struct HostSut {
    name: String,
    running: AtomicBool,
    fetch_lock: tokio::sync::Mutex<()>,
    groups: Registry,
    taint: TaintMonitor,
}

impl Default for HostSut {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSut {
    pub fn new() -> Self {
        Self {
            name: "host".to_string(),
            running: AtomicBool::new(false),
            fetch_lock: tokio::sync::Mutex::new(()),
            groups: Arc::new(Mutex::new(HashSet::new())),
            taint: TaintMonitor::new(),
        }
    }

    fn live_groups(&self) -> Vec<i32> {
        lock_registry(&self.groups).iter().copied().collect()
    }
}

#[async_trait]
impl Sut for HostSut {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallel_execution(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn taint_monitor(&self) -> &TaintMonitor {
        &self.taint
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }

        let started = Instant::now();
        let output = self.run_command("test .", None, None, None).await?;
        if output.returncode != 0 {
            return Err(SutError::Communication(format!(
                "ping exited with {}",
                output.returncode
            )));
        }
        Ok(started.elapsed())
    }

    async fn communicate(&self, sink: Option<&dyn OutputSink>) -> Result<(), SutError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SutError::AlreadyRunning);
        }

        if let Some(sink) = sink {
            sink.write("Host session started\n");
        }
        info!(sut = %self.name, "Session started");
        Ok(())
    }

    async fn stop(&self, sink: Option<&dyn OutputSink>) -> Result<(), SutError> {
        if !self.is_running() {
            return Ok(());
        }

        let groups = self.live_groups();
        if !groups.is_empty() {
            info!(sut = %self.name, count = groups.len(), "Killing running commands");
        }
        for pgid in groups {
            kill_process_group(pgid);
        }

        // killed commands unregister themselves once reaped
        let deadline = Instant::now() + STOP_GRACE;
        while !lock_registry(&self.groups).is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leftover = self.live_groups();
        if !leftover.is_empty() {
            warn!(sut = %self.name, ?leftover, "Process groups still registered after stop");
        }

        let _fetch = self.fetch_lock.lock().await;
        self.running.store(false, Ordering::SeqCst);

        if let Some(sink) = sink {
            sink.write("Host session stopped\n");
        }
        info!(sut = %self.name, "Session stopped");
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, SutError> {
        if command.trim().is_empty() {
            return Err(SutError::InvalidArgument("command is empty".into()));
        }
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }

        debug!(sut = %self.name, command = %mask_sensitive_command(command), "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{command}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env);
        }

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let _group = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(|pgid| ProcessGroup::register(&self.groups, pgid));

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SutError::Communication("child stdout was not captured".into()))?;

        let mut stream = OutputStream::new(sink);
        let mut buf = [0u8; BUFFSIZE];
        let mut eof = false;

        let status = loop {
            tokio::select! {
                read = stdout.read(&mut buf), if !eof => {
                    match read? {
                        0 => eof = true,
                        n => {
                            if stream.push(&buf[..n]) {
                                break None;
                            }
                        }
                    }
                }
                status = child.wait() => break Some(status?),
            }
        };

        let status = match status {
            Some(status) => {
                // background jobs may still hold the pipe open
                while !eof {
                    match tokio::time::timeout(DRAIN_TIMEOUT, stdout.read(&mut buf)).await {
                        Ok(Ok(0)) | Err(_) => eof = true,
                        Ok(Ok(n)) => {
                            if stream.push(&buf[..n]) {
                                break;
                            }
                        }
                        Ok(Err(err)) => return Err(err.into()),
                    }
                }
                status
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stream.finish();
                warn!(sut = %self.name, command = %mask_sensitive_command(command), "Kernel panic detected");
                return Err(SutError::KernelPanic);
            }
        };

        let panicked = stream.panicked;
        let stdout = stream.finish();
        if panicked {
            warn!(sut = %self.name, command = %mask_sensitive_command(command), "Kernel panic detected");
            return Err(SutError::KernelPanic);
        }

        let returncode = status
            .code()
            .unwrap_or_else(|| status.signal().map_or(-1, |sig| -sig));

        debug!(
            sut = %self.name,
            returncode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command completed"
        );

        Ok(CommandOutput {
            command: command.to_string(),
            stdout,
            returncode,
            exec_time: started.elapsed(),
        })
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, SutError> {
        if path.is_empty() {
            return Err(SutError::InvalidArgument("target path is empty".into()));
        }
        if !self.is_running() {
            return Err(SutError::NotRunning);
        }

        let _fetch = self.fetch_lock.lock().await;
        tokio::fs::read(path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => SutError::FileNotFound(path.to_string()),
            _ => SutError::Io(err),
        })
    }
}

/// Accumulates streamed stdout, forwarding decoded text to the sink.
struct OutputStream<'a> {
    sink: Option<&'a dyn OutputSink>,
    output: String,
    pending: Vec<u8>,
    panicked: bool,
}

impl<'a> OutputStream<'a> {
    fn new(sink: Option<&'a dyn OutputSink>) -> Self {
        Self {
            sink,
            output: String::new(),
            pending: Vec::new(),
            panicked: false,
        }
    }

    /// Append raw bytes. Returns true once the panic marker was seen.
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.pending.extend_from_slice(bytes);
        let text = drain_utf8(&mut self.pending);
        self.emit(&text);
        self.panicked = self.panicked || tail_has_panic(&self.output);
        self.panicked
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(sink) = self.sink {
            sink.write(text);
        }
        self.output.push_str(text);
    }

    fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.emit(&rest);
        }
        self.output
    }
}

/// Decode as much of `pending` as possible, keeping a trailing incomplete
/// UTF-8 sequence for the next read. Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                match err.error_len() {
                    None => {
                        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                        pending.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push_str(&String::from_utf8_lossy(&pending[..valid + len]));
                        pending.drain(..valid + len);
                    }
                }
            }
        }
    }
}

/// Look for the panic marker in the last two reads worth of output.
fn tail_has_panic(output: &str) -> bool {
    let mut start = output.len().saturating_sub(2 * BUFFSIZE);
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].contains(PANIC_MARKER)
}

/// Registered process group, killed when the guard goes away.
struct ProcessGroup {
    pgid: i32,
    registry: Registry,
}

impl ProcessGroup {
    fn register(registry: &Registry, pgid: i32) -> Self {
        lock_registry(registry).insert(pgid);
        Self {
            pgid,
            registry: Arc::clone(registry),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        kill_process_group(self.pgid);
        lock_registry(&self.registry).remove(&self.pgid);
    }
}

/// SIGKILL a whole process group. A group that is already gone is fine.
fn kill_process_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, "Failed to kill process group: {}", err),
    }
}

fn lock_registry(registry: &Registry) -> std::sync::MutexGuard<'_, HashSet<i32>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

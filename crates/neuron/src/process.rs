// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use config::BackendSettings;
use model_runtime::{HttpBackend, NativeBackend};
use protocol::{LaunchParameters, ProcessStatus, ResourceKey};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::logs::LogBuffer;
use crate::os::ProcessTable;

/// How long to wait after SIGKILL before giving up on a process.
///
/// A process still present after this is reported as not stopped, which the
/// lifecycle manager logs before releasing the key anyway.
const KILL_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Errors that can occur when starting a backend process.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("backend executable {} not found", path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error("failed to spawn backend process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("port {port} on {host} is already in use")]
    PortInUse { host: String, port: u16 },

    #[error("a backend process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("backend exited during startup (exit code {code:?})")]
    ExitedDuringStartup { code: Option<i32> },
}

/// Everything an adapter needs to launch and probe one backend.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub executable: PathBuf,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub health_timeout: Duration,
    pub log_capacity: usize,
    pub check_port_available: bool,
    /// Applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl AdapterSettings {
    /// Settings for the backend bound to `key`: its port, and
    /// `CUDA_VISIBLE_DEVICES` restricted to the key's devices.
    pub fn for_key(backend: &BackendSettings, key: &ResourceKey) -> Self {
        Self {
            executable: backend.executable_path.clone(),
            host: backend.host.clone(),
            port: backend.port_for(key),
            health_path: backend.health_path.clone(),
            health_timeout: backend.health_timeout(),
            log_capacity: backend.log_buffer_lines,
            check_port_available: backend.check_port_available,
            env: vec![("CUDA_VISIBLE_DEVICES".to_string(), key.to_string())],
        }
    }

    /// Host to probe; a wildcard bind address is probed over loopback.
    fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            host => host,
        }
    }
}

/// Outcome of waiting for a just-started backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The process went away while we were waiting.
    Exited { code: Option<i32> },
    TimedOut,
}

/// Command-line arguments for `llama-server`.
pub fn launch_args(
    weights_path: &Path,
    host: &str,
    port: u16,
    params: &LaunchParameters,
) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        weights_path.display().to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    let mut push = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value);
        }
    };
    push("-c", params.n_ctx.map(|v| v.to_string()));
    push("-t", params.n_threads.map(|v| v.to_string()));
    push("-ngl", params.n_gpu_layers.map(|v| v.to_string()));
    push("-b", params.n_batch.map(|v| v.to_string()));
    push("--temp", params.temperature.map(|v| v.to_string()));
    push("--top-p", params.top_p.map(|v| v.to_string()));
    push("--top-k", params.top_k.map(|v| v.to_string()));
    push("--repeat-penalty", params.repeat_penalty.map(|v| v.to_string()));
    args.extend(params.extra_args.iter().cloned());
    args
}

enum Handle {
    None,
    /// Started by this adapter; stdout/stderr are piped into the log buffer.
    Child { child: Child, pid: u32 },
    /// Started by a previous controller instance; known only by pid.
    Attached { pid: u32 },
}

struct Inner {
    handle: Handle,
    status: ProcessStatus,
    started: Option<Instant>,
    exit_code: Option<i32>,
    command_line: String,
}

impl Inner {
    fn pid(&self) -> Option<u32> {
        match self.handle {
            Handle::Child { pid, .. } | Handle::Attached { pid } => Some(pid),
            Handle::None => None,
        }
    }

    /// Reap or look up the process and fold an exit into `status`.
    fn refresh(&mut self, table: &dyn ProcessTable) {
        let exited = match &mut self.handle {
            Handle::None => return,
            Handle::Child { child, pid } => match child.try_wait() {
                Ok(Some(exit)) => {
                    self.exit_code = exit.code();
                    Some(*pid)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("failed to poll pid={}: {e}", pid);
                    self.status = ProcessStatus::Error;
                    None
                }
            },
            Handle::Attached { pid } => (!table.is_alive(*pid)).then_some(*pid),
        };

        if let Some(pid) = exited {
            self.handle = Handle::None;
            self.started = None;
            self.status = match self.status {
                ProcessStatus::Stopping => ProcessStatus::Stopped,
                ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Error => {
                    warn!(
                        "backend pid={} exited unexpectedly (exit code {:?})",
                        pid, self.exit_code
                    );
                    ProcessStatus::Crashed
                }
                other => other,
            };
        }
    }
}

/// Owns at most one backend OS process.
///
/// There is no background watcher: an unexpected exit is noticed the next
/// time the status, pid or uptime is read, at which point the adapter
/// reports [`ProcessStatus::Crashed`]. The adapter never restarts anything
/// on its own.
///
/// The internal lock is a plain std mutex that is never held across an
/// await point.
pub struct ProcessAdapter {
    settings: AdapterSettings,
    table: Arc<dyn ProcessTable>,
    http: reqwest::Client,
    logs: LogBuffer,
    inner: Mutex<Inner>,
}

impl ProcessAdapter {
    pub fn new(settings: AdapterSettings, table: Arc<dyn ProcessTable>, http: reqwest::Client) -> Self {
        let logs = LogBuffer::new(settings.log_capacity);
        Self {
            settings,
            table,
            http,
            logs,
            inner: Mutex::new(Inner {
                handle: Handle::None,
                status: ProcessStatus::Stopped,
                started: None,
                exit_code: None,
                command_line: String::new(),
            }),
        }
    }

    /// Adapter for a process started elsewhere, trusted to be running.
    ///
    /// Liveness comes from the process table and termination goes through
    /// signals; the log buffer stays empty since its output is not ours.
    pub fn attach(
        settings: AdapterSettings,
        table: Arc<dyn ProcessTable>,
        http: reqwest::Client,
        pid: u32,
        running_for: Duration,
        command_line: String,
    ) -> Self {
        let adapter = Self::new(settings, table, http);
        {
            let mut inner = adapter.lock();
            inner.handle = Handle::Attached { pid };
            inner.status = ProcessStatus::Running;
            inner.started = Some(Instant::now().checked_sub(running_for).unwrap_or_else(Instant::now));
            inner.command_line = command_line;
        }
        info!("attached to running backend pid={}", pid);
        adapter
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("adapter lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.settings.probe_host(), self.settings.port)
    }

    pub fn command_line(&self) -> String {
        self.lock().command_line.clone()
    }

    /// Spawn the backend serving `weights_path`.
    ///
    /// Returns once the process exists; readiness is a separate step
    /// ([`ProcessAdapter::wait_until_ready`]). Must be called from within a
    /// tokio runtime since output is drained by spawned tasks.
    pub fn start(&self, weights_path: &Path, params: &LaunchParameters) -> Result<(), AdapterError> {
        let mut inner = self.lock();
        inner.refresh(&*self.table);
        if let Some(pid) = inner.pid() {
            return Err(AdapterError::AlreadyRunning { pid });
        }

        let host = self.settings.host.clone();
        let port = self.settings.port;
        if self.settings.check_port_available {
            if let Err(e) = TcpListener::bind((host.as_str(), port)) {
                debug!("bind test on {}:{} failed: {e}", host, port);
                return Err(AdapterError::PortInUse { host, port });
            }
        }

        let args = launch_args(weights_path, &host, port, params);
        let executable = &self.settings.executable;
        info!("spawning backend {} {:?} env={:?}", executable.display(), args, self.settings.env);

        let mut command = Command::new(executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        for (k, v) in &self.settings.env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => AdapterError::ExecutableNotFound {
                path: executable.clone(),
            },
            _ => AdapterError::Spawn(e),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| AdapterError::ExitedDuringStartup { code: None })?;

        self.logs.clear();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, self.logs.clone(), pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, self.logs.clone(), pid, "stderr"));
        }

        inner.command_line = std::iter::once(executable.display().to_string())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ");
        inner.handle = Handle::Child { child, pid };
        inner.status = ProcessStatus::Starting;
        inner.started = Some(Instant::now());
        inner.exit_code = None;
        info!("backend started pid={} port={}", pid, port);
        Ok(())
    }

    /// Poll the health endpoint until it answers, the process exits, or
    /// `timeout` elapses. Marks the adapter running on success.
    pub async fn wait_until_ready(&self, timeout: Duration, interval: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_status();
            if !matches!(status, ProcessStatus::Starting | ProcessStatus::Running) {
                return Readiness::Exited {
                    code: self.lock().exit_code,
                };
            }

            if self.is_healthy().await {
                let mut inner = self.lock();
                if inner.status == ProcessStatus::Starting {
                    inner.status = ProcessStatus::Running;
                }
                return Readiness::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return Readiness::TimedOut;
            }
            sleep(interval.min(deadline - now)).await;
        }
    }

    /// Stop the backend. Graceful stop sends SIGTERM and waits up to
    /// `timeout`; a process still alive afterwards (or any process when
    /// `graceful` is false) is killed. Returns whether it ended up stopped.
    pub async fn stop(&self, graceful: bool, timeout: Duration) -> bool {
        let pid = {
            let mut inner = self.lock();
            inner.refresh(&*self.table);
            match inner.pid() {
                Some(pid) => {
                    inner.status = ProcessStatus::Stopping;
                    pid
                }
                None => {
                    inner.status = ProcessStatus::Stopped;
                    return true;
                }
            }
        };

        if graceful {
            info!("terminating backend pid={}", pid);
            if self.table.terminate(pid) {
                if self.wait_for_exit(timeout).await {
                    self.finish_stop(true);
                    return true;
                }
                warn!("backend pid={} ignored SIGTERM for {:?}; killing", pid, timeout);
            } else {
                warn!("failed to signal backend pid={}; killing", pid);
            }
        }

        self.force_kill(pid);
        let stopped = self.wait_for_exit(KILL_WAIT).await;
        if !stopped {
            warn!("backend pid={} survived SIGKILL", pid);
        }
        self.finish_stop(stopped);
        stopped
    }

    fn force_kill(&self, pid: u32) {
        info!("killing backend pid={}", pid);
        let mut inner = self.lock();
        match &mut inner.handle {
            Handle::Child { child, .. } => {
                if let Err(e) = child.start_kill() {
                    debug!("kill pid={} failed: {e}", pid);
                }
            }
            Handle::Attached { pid } => {
                self.table.kill(*pid);
            }
            Handle::None => {}
        }
    }

    /// Kill without waiting and forget the process. Used when a start is
    /// abandoned from a synchronous context such as a drop.
    pub fn abort(&self) {
        let pid = {
            let mut inner = self.lock();
            inner.refresh(&*self.table);
            inner.pid()
        };
        if let Some(pid) = pid {
            self.force_kill(pid);
        }
        let mut inner = self.lock();
        inner.handle = Handle::None;
        inner.started = None;
        inner.status = ProcessStatus::Stopped;
    }

    fn has_exited(&self) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match &mut inner.handle {
            Handle::None => true,
            Handle::Child { child, .. } => match child.try_wait() {
                Ok(Some(exit)) => {
                    inner.exit_code = exit.code();
                    true
                }
                Ok(None) => false,
                Err(_) => true,
            },
            Handle::Attached { pid } => !self.table.is_alive(*pid),
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }

    fn finish_stop(&self, stopped: bool) {
        let mut inner = self.lock();
        if stopped {
            inner.handle = Handle::None;
            inner.started = None;
            inner.status = ProcessStatus::Stopped;
        } else {
            inner.status = ProcessStatus::Error;
        }
    }

    /// Current status, folding in an exit that happened since the last read.
    pub fn get_status(&self) -> ProcessStatus {
        let mut inner = self.lock();
        inner.refresh(&*self.table);
        inner.status
    }

    /// Bounded-timeout probe of the health endpoint. Never errors.
    pub async fn is_healthy(&self) -> bool {
        HttpBackend::with_client(self.http.clone(), self.base_url())
            .health(&self.settings.health_path, self.settings.health_timeout)
            .await
    }

    pub fn get_pid(&self) -> Option<u32> {
        let mut inner = self.lock();
        inner.refresh(&*self.table);
        inner.pid()
    }

    pub fn get_uptime_seconds(&self) -> Option<u64> {
        let mut inner = self.lock();
        inner.refresh(&*self.table);
        match inner.status {
            ProcessStatus::Starting | ProcessStatus::Running => {
                inner.started.map(|s| s.elapsed().as_secs())
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Newest first, at most the buffer capacity.
    pub fn get_logs(&self, max_lines: usize) -> Vec<String> {
        self.logs.recent(max_lines)
    }

    pub fn clear_logs(&self) {
        self.logs.clear();
    }
}

/// Copy lines from a child pipe into the log buffer until eof.
async fn drain<R>(reader: R, logs: LogBuffer, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                debug!("pid={} {}: {}", pid, stream, line);
                logs.push(line);
            }
            Err(e) => {
                debug!("pid={} {} read failed: {e}", pid, stream);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::SystemProcessTable;

    #[test]
    fn args_follow_parameters_and_extra_args_come_last() {
        let params = LaunchParameters {
            n_ctx: Some(4096),
            n_gpu_layers: Some(-1),
            temperature: Some(0.5),
            extra_args: vec!["--flash-attn".into()],
            ..Default::default()
        };
        let args = launch_args(Path::new("/m/phi.gguf"), "127.0.0.1", 8081, &params);
        assert_eq!(
            args,
            vec![
                "-m", "/m/phi.gguf", "--host", "127.0.0.1", "--port", "8081", "-c", "4096",
                "-ngl", "-1", "--temp", "0.5", "--flash-attn"
            ]
        );
    }

    #[test]
    fn settings_for_key_set_visible_devices_and_port() {
        let backend = BackendSettings::default();
        let key = ResourceKey::parse("1,0").unwrap();
        let settings = AdapterSettings::for_key(&backend, &key);
        assert_eq!(settings.port, 8081);
        assert_eq!(
            settings.env,
            vec![("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string())]
        );
    }

    fn settings(executable: PathBuf, port: u16) -> AdapterSettings {
        AdapterSettings {
            executable,
            host: "127.0.0.1".into(),
            port,
            health_path: "/health".into(),
            health_timeout: Duration::from_millis(200),
            log_capacity: 10,
            check_port_available: true,
            env: Vec::new(),
        }
    }

    fn adapter(settings: AdapterSettings) -> ProcessAdapter {
        ProcessAdapter::new(settings, Arc::new(SystemProcessTable::new()), reqwest::Client::new())
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let a = adapter(settings("/nonexistent/llama-server".into(), 0));
        let err = a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap_err();
        assert!(matches!(err, AdapterError::ExecutableNotFound { .. }));
        assert_eq!(a.get_status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn occupied_port_is_rejected_before_spawning() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let a = adapter(settings("/bin/sh".into(), port));
        let err = a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap_err();
        assert!(matches!(err, AdapterError::PortInUse { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn stop_without_process_is_a_noop() {
        let a = adapter(settings("/bin/sh".into(), 0));
        assert!(a.stop(true, Duration::from_secs(1)).await);
        assert_eq!(a.get_pid(), None);
        assert_eq!(a.get_uptime_seconds(), None);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Executable that ignores its arguments and runs `body`.
        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-backend");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn free_port() -> u16 {
            std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port()
        }

        #[tokio::test]
        async fn output_is_captured_and_exit_is_detected_lazily() {
            let dir = tempfile::tempdir().unwrap();
            let exe = script(dir.path(), "echo one\necho two >&2\necho three\nsleep 0.3\nexit 3");
            let a = adapter(settings(exe, free_port()));
            a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap();
            assert_eq!(a.get_status(), ProcessStatus::Starting);
            assert!(a.get_pid().is_some());
            assert!(a.command_line().contains("-m /m.gguf"));

            let readiness = a
                .wait_until_ready(Duration::from_secs(10), Duration::from_millis(50))
                .await;
            assert_eq!(readiness, Readiness::Exited { code: Some(3) });
            assert_eq!(a.get_status(), ProcessStatus::Crashed);
            assert_eq!(a.get_pid(), None);

            let logs = a.get_logs(100);
            assert_eq!(logs.len(), 3);
            assert!(logs.contains(&"two".to_string()));
            a.clear_logs();
            assert!(a.get_logs(100).is_empty());
        }

        #[tokio::test]
        async fn graceful_stop_terminates_process() {
            let dir = tempfile::tempdir().unwrap();
            let exe = script(dir.path(), "exec sleep 600");
            let a = adapter(settings(exe, free_port()));
            a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap();
            let pid = a.get_pid().unwrap();

            assert!(a.stop(true, Duration::from_secs(5)).await);
            assert_eq!(a.get_status(), ProcessStatus::Stopped);
            assert!(!SystemProcessTable::new().is_alive(pid));
        }

        #[tokio::test]
        async fn sigterm_ignoring_process_is_killed_after_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let exe = script(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
            let a = adapter(settings(exe, free_port()));
            a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap();
            sleep(Duration::from_millis(200)).await;

            let started = Instant::now();
            assert!(a.stop(true, Duration::from_millis(300)).await);
            assert!(started.elapsed() >= Duration::from_millis(300));
            assert_eq!(a.get_status(), ProcessStatus::Stopped);
        }

        #[tokio::test]
        async fn second_start_is_rejected_while_running() {
            let dir = tempfile::tempdir().unwrap();
            let exe = script(dir.path(), "exec sleep 600");
            let a = adapter(settings(exe, free_port()));
            a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap();
            let err = a.start(Path::new("/m.gguf"), &LaunchParameters::default()).unwrap_err();
            assert!(matches!(err, AdapterError::AlreadyRunning { .. }));
            assert!(a.stop(false, Duration::from_secs(1)).await);
        }
    }
}

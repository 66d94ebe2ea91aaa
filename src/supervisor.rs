//! Process supervisor.
//!
//! Runs the mock server binary as a child process, waits until it answers
//! its readiness probe, and stops it again with a signal and a deadline.
//! Everything here blocks the calling thread.

use crate::client::{ControlClient, DEFAULT_TIMEOUT};
use crate::config::ServerSettings;
use crate::error::ProcessError;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Failed,
}

/// Signal used to ask the server to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    #[default]
    Terminate,
    Interrupt,
    Kill,
}

/// Delays between readiness probes: a Fibonacci sequence seeded with two
/// base intervals (50ms, 10ms gives 50, 10, 60, 70, 130, ...).
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    current: Duration,
    next: Duration,
}

impl FibonacciBackoff {
    pub fn new(first: Duration, second: Duration) -> Self {
        Self {
            current: first,
            next: second,
        }
    }
}

impl Iterator for FibonacciBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        let following = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = following;
        Some(delay)
    }
}

/// Bounds on the readiness wait. Whichever limit is hit first ends it.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub first_delay: Duration,
    pub second_delay: Duration,
    pub max_attempts: u32,
    pub max_elapsed: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(50),
            second_delay: Duration::from_millis(10),
            max_attempts: 40,
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl ReadinessPolicy {
    pub fn delays(&self) -> FibonacciBackoff {
        FibonacciBackoff::new(self.first_delay, self.second_delay)
    }
}

/// How to launch one server.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Server binary
    pub program: PathBuf,
    /// Host, port (0 = any free port), base path and instance name
    pub server: ServerSettings,
    pub readiness: ReadinessPolicy,
    /// Grace period of `restart` before escalating to SIGKILL
    pub stop_timeout: Duration,
    /// Arguments passed before the generated `--host`/`--port`/... flags
    pub extra_args: Vec<String>,
    /// Forward the child's stdout and stderr instead of discarding them
    pub inherit_output: bool,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            server: ServerSettings::default(),
            readiness: ReadinessPolicy::default(),
            stop_timeout: Duration::from_secs(5),
            extra_args: Vec::new(),
            inherit_output: false,
        }
    }

    pub fn with_server(mut self, server: ServerSettings) -> Self {
        self.server = server;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Owns one mock server child process.
///
/// Dropping the supervisor kills and reaps the child.
pub struct Supervisor {
    config: SupervisorConfig,
    /// Port actually in use; differs from the configured one when that is 0
    port: u16,
    child: Option<Child>,
    client: Option<ControlClient>,
    state: ProcessState,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            port: config.server.port,
            config,
            child: None,
            client: None,
            state: ProcessState::Stopped,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.server.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Spawn the server and block until it answers `HEAD /_me`.
    ///
    /// A no-op while the process is running.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            return Ok(());
        }

        // A reserved port is kept across restarts so URLs stay valid
        if self.port == 0 {
            self.port = reserve_port(&self.config.server.host)?;
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.extra_args)
            .arg("--host")
            .arg(&self.config.server.host)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--name")
            .arg(&self.config.server.name);
        if let Some(base_path) = &self.config.server.base_path {
            command.arg("--base-path").arg(base_path);
        }
        let output = || {
            if self.config.inherit_output {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };
        command.stdin(Stdio::null()).stdout(output()).stderr(output());

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        })?;
        info!(
            name = %self.config.server.name,
            pid = child.id(),
            address = %self.connection_string(),
            "Mock server process spawned"
        );

        self.child = Some(child);
        self.state = ProcessState::Starting;

        match self.wait_until_ready() {
            Ok(client) => {
                self.client = Some(client.with_timeout(DEFAULT_TIMEOUT));
                self.state = ProcessState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.config.server.name, error = %e, "Mock server failed to start");
                self.kill_child();
                self.state = ProcessState::Failed;
                Err(e)
            }
        }
    }

    fn wait_until_ready(&mut self) -> Result<ControlClient, ProcessError> {
        let policy = self.config.readiness.clone();
        let client = ControlClient::new(&self.base_url())?
            .with_timeout(policy.max_elapsed.min(DEFAULT_TIMEOUT));
        let started = Instant::now();
        let mut attempts = 0;

        for delay in policy.delays() {
            let remaining = policy.max_elapsed.saturating_sub(started.elapsed());
            thread::sleep(delay.min(remaining));

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(ProcessError::Exited { status });
                }
            }

            attempts += 1;
            match client.probe() {
                Ok(()) => {
                    debug!(attempts, elapsed = ?started.elapsed(), "Mock server ready");
                    return Ok(client);
                }
                Err(e) => debug!(attempts, error = %e, "Mock server not ready yet"),
            }

            if attempts >= policy.max_attempts || started.elapsed() >= policy.max_elapsed {
                break;
            }
        }

        Err(ProcessError::NotReady {
            address: self.connection_string(),
            attempts,
            elapsed: started.elapsed(),
        })
    }

    /// Signal the server and wait up to `timeout` for it to exit, then
    /// escalate to SIGKILL. Returns once exit is confirmed.
    pub fn stop(&mut self, timeout: Duration, signal: StopSignal) -> Result<(), ProcessError> {
        self.client = None;
        let Some(child) = self.child.as_mut() else {
            self.state = ProcessState::Stopped;
            return Ok(());
        };

        let status = terminate(child, timeout, signal)?;
        info!(name = %self.config.server.name, %status, "Mock server stopped");

        self.child = None;
        self.state = ProcessState::Stopped;
        Ok(())
    }

    pub fn restart(&mut self) -> Result<(), ProcessError> {
        self.stop(self.config.stop_timeout, StopSignal::default())?;
        self.start()
    }

    /// Start the server if needed, then wipe its rules and journal.
    pub fn clean(&mut self) -> Result<(), ProcessError> {
        self.start()?;
        if let Some(client) = &self.client {
            client.reset_all()?;
        }
        Ok(())
    }

    /// Whether the child is alive. Never blocks.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(name = %self.config.server.name, %status, "Mock server exited unexpectedly");
                self.child = None;
                self.client = None;
                self.state = ProcessState::Failed;
                false
            }
            Err(e) => {
                warn!(error = %e, "Cannot query mock server process, killing it");
                self.kill_child();
                self.state = ProcessState::Failed;
                false
            }
        }
    }

    /// Control client of the running server.
    pub fn client(&self) -> Option<&ControlClient> {
        self.client.as_ref()
    }

    /// `host:port`
    pub fn connection_string(&self) -> String {
        format!("{}:{}", connect_host(&self.config.server.host), self.port)
    }

    /// `http://host:port`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.connection_string())
    }

    /// Absolute URL of a mock route, base path included.
    pub fn mock_url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url(),
            self.config.server.base_path.as_deref().unwrap_or(""),
            path
        )
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.client = None;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.kill_child();
    }
}

fn terminate(child: &mut Child, timeout: Duration, signal: StopSignal) -> Result<ExitStatus, ProcessError> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    send_signal(child, signal)?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), ?timeout, "Mock server ignored stop signal, killing it");
            child.kill()?;
            return Ok(child.wait()?);
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: StopSignal) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Interrupt => Signal::SIGINT,
        StopSignal::Kill => Signal::SIGKILL,
    };
    let pid = child.id();
    kill(Pid::from_raw(pid as i32), signal).map_err(|errno| ProcessError::Signal {
        pid,
        reason: errno.to_string(),
    })
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: StopSignal) -> Result<(), ProcessError> {
    Ok(child.kill()?)
}

/// Find a free port by binding port 0 and releasing it again.
fn reserve_port(host: &str) -> Result<u16, ProcessError> {
    let unavailable = |source| ProcessError::PortUnavailable {
        host: host.to_string(),
        source,
    };
    let listener = TcpListener::bind((host, 0)).map_err(unavailable)?;
    let port = listener.local_addr().map_err(unavailable)?.port();
    Ok(port)
}

/// Address to connect to for a listen address.
fn connect_host(host: &str) -> &str {
    match host {
        "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

/// Several supervised servers, addressed by instance name.
#[derive(Default)]
pub struct MockServerSet {
    servers: BTreeMap<String, Supervisor>,
}

impl MockServerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server under its instance name, returning any server it replaces.
    pub fn insert(&mut self, supervisor: Supervisor) -> Option<Supervisor> {
        self.servers.insert(supervisor.name().to_string(), supervisor)
    }

    pub fn get(&self, name: &str) -> Option<&Supervisor> {
        self.servers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Supervisor> {
        self.servers.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn start_all(&mut self) -> Result<(), ProcessError> {
        self.servers.values_mut().try_for_each(Supervisor::start)
    }

    pub fn clean_all(&mut self) -> Result<(), ProcessError> {
        self.servers.values_mut().try_for_each(Supervisor::clean)
    }

    /// Stop every server, reporting the first failure after trying them all.
    pub fn stop_all(&mut self, timeout: Duration) -> Result<(), ProcessError> {
        let mut first_error = None;
        for supervisor in self.servers.values_mut() {
            if let Err(e) = supervisor.stop(timeout, StopSignal::default()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

//! One module subprocess's full lifecycle (spec §4.G): spawn, fd wiring,
//! restart-on-failure, and clean teardown.
//!
//! Fd wiring: the reference passes each named input/output over its own
//! pipe fd (not just stdin/stdout), so a module can have more than one of
//! each (`joule/models/pipes/factories.py`'s `reader_factory`/
//! `writer_factory` take an arbitrary fd, not a fixed descriptor number).
//! This crate reproduces that with `nix::unistd::pipe`: the child-side
//! fds are left open (non-CLOEXEC, the `pipe()` default) across `spawn`
//! and closed in the parent immediately after, per §9's scoped-acquisition
//! note; the child discovers which raw fd number serves which named
//! binding through a `JOULE_PIPES` environment variable (JSON map), the
//! Rust analogue of the reference's per-module fd handshake.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sqlx::PgPool;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{JouleError, Result};
use crate::logs::LogBuffer;
use crate::module::{Module, StreamRef};
use crate::pipe::framed;
use crate::pipe::local::Pipe;
use crate::stream::Stream;
use crate::store::Inserter;
use crate::supervisor::Supervisor;

/// Interval between a restart-triggering exit and the next spawn attempt.
pub const RESTART_INTERVAL: Duration = Duration::from_millis(1_000);
/// Bounded wait after SIGTERM before escalating to SIGKILL.
pub const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Ready,
    Running,
    Exited,
    Restarting,
    Stopped,
}

pub struct Worker {
    module: Module,
    pool: PgPool,
    insert_period: Duration,
    state: Mutex<WorkerState>,
    /// Output pipes, created once per `run()` and kept alive across
    /// subprocess restarts so inserters and external subscribers never
    /// observe more than one interval marker per restart (§4.G's restart
    /// contract).
    outputs: Mutex<HashMap<String, Pipe>>,
    pub logs: LogBuffer,
    stopping: AtomicBool,
    stop_notify: Notify,
    child_pid: Mutex<Option<i32>>,
}

impl Worker {
    pub fn new(module: Module, pool: PgPool, insert_period: Duration, max_log_lines: usize) -> Self {
        Worker {
            module,
            pool,
            insert_period,
            state: Mutex::new(WorkerState::New),
            outputs: Mutex::new(HashMap::new()),
            logs: LogBuffer::new(max_log_lines),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            child_pid: Mutex::new(None),
        }
    }

    /// Wraps an externally-fed pipe (HTTP ingest) as a pseudo-worker that
    /// participates in `Supervisor::subscribe` resolution identically to
    /// a module-backed worker, per §4.H's `publish`. Spawns its own
    /// inserter immediately since no `run()` loop will ever drive it.
    pub async fn published(
        module: Module,
        pool: PgPool,
        insert_period: Duration,
        max_log_lines: usize,
        stream: Stream,
        source: Pipe,
    ) -> Self {
        let worker = Worker::new(module, pool.clone(), insert_period, max_log_lines);
        {
            let mut outputs = worker.outputs.lock().await;
            outputs.insert(stream.name.clone(), source.clone());
        }
        let inserter = Inserter::new(stream, source, pool, insert_period);
        tokio::spawn(async move {
            if let Err(e) = inserter.run().await {
                error!("published-stream inserter failed: {e}");
            }
        });
        *worker.state.lock().await = WorkerState::Running;
        worker
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// Whether this worker's module should be respawned after it exits
    /// (the module manifest's `restart` flag).
    pub fn restart_policy(&self) -> bool {
        self.module.restart
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    /// True if this worker's module produces `stream_ref`.
    pub fn produces(&self, stream_ref: &StreamRef) -> bool {
        self.module.outputs.values().any(|s| stream_ref.matches(s))
    }

    /// Checks every input binding can be resolved against `supervisor`
    /// (including a self-reference, for a module that loops data back to
    /// itself). Returns false, and marks the worker unrunnable, if any
    /// binding is dangling.
    pub fn register_inputs(&self, supervisor: &Supervisor) -> bool {
        for stream_ref in self.module.inputs.values() {
            if !supervisor.produces(stream_ref) && !self.produces(stream_ref) {
                warn!(
                    "[{}] cannot register: no producer for input {:?}",
                    self.module.name, stream_ref
                );
                return false;
            }
        }
        true
    }

    /// Attach a new subscriber pipe to this worker's owned output pipe
    /// for `stream_ref`. Fails with `SubscriptionError` if this worker
    /// does not produce that stream.
    pub async fn subscribe(&self, stream_ref: &StreamRef) -> Result<Pipe> {
        let (name, stream) = self
            .module
            .outputs
            .iter()
            .find(|(_, s)| stream_ref.matches(s))
            .ok_or_else(|| {
                JouleError::Subscription(format!(
                    "[{}] does not produce {:?}",
                    self.module.name, stream_ref
                ))
            })?;
        let outputs = self.outputs.lock().await;
        let source = outputs
            .get(name)
            .ok_or_else(|| JouleError::Subscription(format!("[{}] is not running", stream.name)))?;
        let sink = Pipe::new(stream.layout, format!("{}:subscriber", stream.name));
        source.subscribe(sink.clone()).await;
        Ok(sink)
    }

    /// Runs the subprocess, restarting it on exit while `restart` is true
    /// and the worker hasn't been `stop()`-ed. Returns once the worker is
    /// fully torn down (owned pipes closed, inserters drained).
    pub async fn run(&self, supervisor: &Supervisor, restart: bool) -> Result<()> {
        *self.state.lock().await = WorkerState::Ready;

        if !self.register_inputs(supervisor) {
            return Err(JouleError::Configuration(format!(
                "[{}] has unregistered input bindings",
                self.module.name
            )));
        }

        // Resolve every input once: the same subscriber pipe is reused
        // across subprocess restarts, so no samples are lost or
        // duplicated at a restart boundary.
        let mut input_pipes: Vec<(String, Pipe)> = Vec::new();
        for (name, stream_ref) in &self.module.inputs {
            let pipe = supervisor.subscribe(stream_ref).await?;
            input_pipes.push((name.clone(), pipe));
        }

        // Create every output pipe once, bound to a long-lived inserter.
        {
            let mut outputs = self.outputs.lock().await;
            for (name, stream) in &self.module.outputs {
                let pipe = Pipe::new(stream.layout, format!("{}:{}", self.module.name, name));
                let inserter = Inserter::new(stream.clone(), pipe.clone(), self.pool.clone(), self.insert_period);
                tokio::spawn(async move {
                    if let Err(e) = inserter.run().await {
                        error!("inserter failed: {e}");
                    }
                });
                outputs.insert(name.clone(), pipe);
            }
        }

        let mut restarting = false;
        let result = loop {
            if self.stopping.load(Ordering::SeqCst) {
                break Ok(());
            }
            *self.state.lock().await = if restarting {
                WorkerState::Restarting
            } else {
                WorkerState::Running
            };

            match self.spawn_and_wait(&input_pipes).await {
                Ok(()) => {}
                Err(e) => {
                    error!("[{}] module run failed: {}", self.module.name, e);
                }
            }
            *self.state.lock().await = WorkerState::Exited;

            if !restart || self.stopping.load(Ordering::SeqCst) {
                break Ok(());
            }
            info!(
                "[{}] restarting in {:?}",
                self.module.name, RESTART_INTERVAL
            );
            tokio::time::sleep(RESTART_INTERVAL).await;
            let outputs = self.outputs.lock().await;
            for pipe in outputs.values() {
                let _ = pipe.close_interval().await;
            }
            drop(outputs);
            restarting = true;
        };

        *self.state.lock().await = WorkerState::Stopped;
        let outputs = self.outputs.lock().await;
        for pipe in outputs.values() {
            let _ = pipe.close().await;
        }
        result
    }

    /// Spawn one subprocess generation and drive it to exit (or a stop
    /// request). Does not touch `self.outputs`'s lifetime; only the fd
    /// readers/writers for this generation are created and torn down.
    async fn spawn_and_wait(&self, input_pipes: &[(String, Pipe)]) -> Result<()> {
        let mut child_fds: Vec<OwnedFd> = Vec::new();
        let mut pipes_env: HashMap<&'static str, HashMap<String, i32>> = HashMap::new();
        pipes_env.insert("inputs", HashMap::new());
        pipes_env.insert("outputs", HashMap::new());

        let mut input_ends = Vec::new();
        for (name, pipe) in input_pipes {
            let (read_fd, write_fd) =
                nix::unistd::pipe().map_err(|e| JouleError::Pipe(format!("pipe(): {e}")))?;
            pipes_env
                .get_mut("inputs")
                .unwrap()
                .insert(name.clone(), read_fd.as_raw_fd());
            child_fds.push(read_fd);
            input_ends.push((pipe.clone(), write_fd));
        }

        let mut output_ends = Vec::new();
        let outputs = self.outputs.lock().await;
        for (name, pipe) in outputs.iter() {
            let (read_fd, write_fd) =
                nix::unistd::pipe().map_err(|e| JouleError::Pipe(format!("pipe(): {e}")))?;
            pipes_env
                .get_mut("outputs")
                .unwrap()
                .insert(name.clone(), write_fd.as_raw_fd());
            child_fds.push(write_fd);
            output_ends.push((pipe.clone(), read_fd));
        }
        drop(outputs);

        let pipes_json = serde_json::to_string(&pipes_env)
            .map_err(|e| JouleError::Configuration(format!("pipe env encoding failed: {e}")))?;

        let mut parts = self.module.exec_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| JouleError::Configuration(format!("[{}] has an empty exec_cmd", self.module.name)))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .env("JOULE_PIPES", pipes_json)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| JouleError::Configuration(format!("[{}] failed to spawn: {}", self.module.name, e)))?;

        // The child has now inherited its fd copies; drop the parent's
        // references to the child-side ends immediately (§9).
        drop(child_fds);

        *self.child_pid.lock().await = child.id().map(|p| p as i32);

        let stderr = child.stderr.take();
        // Tracked by abort handle, not joined: these three feeder tasks
        // are cancelled as a group once the child exits or is stopped
        // (spec §9), regardless of what each one returns.
        let mut tasks: Vec<tokio::task::AbortHandle> = Vec::new();

        for (pipe, write_fd) in input_ends {
            let file = tokio::fs::File::from_std(std::fs::File::from(write_fd));
            tasks.push(framed::spawn_writer(pipe, file).abort_handle());
        }
        for (pipe, read_fd) in output_ends {
            let file = tokio::fs::File::from_std(std::fs::File::from(read_fd));
            tasks.push(framed::pump_into(pipe, file).abort_handle());
        }
        if let Some(stderr) = stderr {
            let logs = self.logs.clone();
            let handle = tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push(line).await;
                }
            });
            tasks.push(handle.abort_handle());
        }

        let exit = self.wait_for_exit(&mut child).await;
        for t in tasks {
            t.abort();
        }
        *self.child_pid.lock().await = None;

        match exit {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(JouleError::Configuration(format!(
                "[{}] exited with {}",
                self.module.name, status
            ))),
            Err(e) => Err(JouleError::Io(e)),
        }
    }

    async fn wait_for_exit(&self, child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
        tokio::select! {
            status = child.wait() => status,
            _ = self.stop_notify.notified() => {
                match tokio::time::timeout(SIGKILL_TIMEOUT, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!("[{}] did not exit within {:?}, sending SIGKILL", self.module.name, SIGKILL_TIMEOUT);
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        }
    }

    /// Signal the child (SIGTERM), escalate to SIGKILL after
    /// `SIGKILL_TIMEOUT`, then wait for all background tasks and close
    /// every owned pipe. Idempotent.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.child_pid.lock().await {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!("[{}] SIGTERM failed: {}", self.module.name, e);
            }
        }
        self.stop_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::stream::Stream;

    /// A pool that never actually connects; fine for tests that only
    /// exercise binding resolution and never touch the database.
    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/joule_test_unreachable")
            .expect("connect_lazy never dials out")
    }

    fn stream(id: i64, name: &str) -> Stream {
        Stream::new(id, name, Layout::parse("float32_3").unwrap())
    }

    fn worker(module: Module) -> Worker {
        Worker::new(module, lazy_pool(), Duration::from_secs(1), 100)
    }

    #[test]
    fn produces_matches_declared_outputs() {
        let mut module = Module::new("accel_filter", "/usr/bin/filter");
        module.outputs.insert("out".into(), stream(1, "filtered"));
        let w = worker(module);
        assert!(w.produces(&StreamRef::ById(1)));
        assert!(!w.produces(&StreamRef::ById(2)));
    }

    #[test]
    fn register_inputs_fails_when_no_worker_produces_the_binding() {
        let mut module = Module::new("consumer", "/usr/bin/consumer");
        module
            .inputs
            .insert("in".into(), StreamRef::ById(99));
        let w = worker(module);
        let supervisor = Supervisor::new(Vec::new());
        assert!(!w.register_inputs(&supervisor));
    }

    #[test]
    fn register_inputs_succeeds_against_a_self_loop() {
        let mut module = Module::new("loopback", "/usr/bin/loopback");
        module.outputs.insert("out".into(), stream(5, "looped"));
        module.inputs.insert("in".into(), StreamRef::ById(5));
        let w = worker(module);
        let supervisor = Supervisor::new(Vec::new());
        assert!(w.register_inputs(&supervisor));
    }

    #[test]
    fn new_worker_starts_in_new_state() {
        let w = worker(Module::new("idle", "/usr/bin/idle"));
        assert_eq!(w.name(), "idle");
        assert!(w.restart_policy());
    }

    #[tokio::test]
    async fn state_reports_new_before_run() {
        let w = worker(Module::new("idle", "/usr/bin/idle"));
        assert_eq!(w.state().await, WorkerState::New);
    }

    #[tokio::test]
    async fn subscribe_fails_for_a_stream_this_worker_does_not_produce() {
        let w = worker(Module::new("idle", "/usr/bin/idle"));
        let err = w.subscribe(&StreamRef::ById(1)).await.unwrap_err();
        assert!(matches!(err, JouleError::Subscription(_)));
    }
}

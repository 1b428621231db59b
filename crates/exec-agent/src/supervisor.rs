use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use exec_protocol::{
    Clock, OutputStream, ProcessEventFactory, ProcessInfo, ProcessSnapshot, StartProcessParams,
    SystemClock,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::event_bus::EventBus;

/// How long output readers may keep running after the process itself exited,
/// shared by both streams. A backgrounded grandchild can hold the pipes open
/// indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the bytes carried by one output event.
const MAX_OUTPUT_CHUNK: usize = 8 * 1024;

type SharedFactory = ProcessEventFactory<Arc<dyn Clock>>;

/// Runs command lines as child processes and reports them on the event bus.
///
/// For a single process, events are published in this order:
/// `process_started`, then its output chunks (read order is kept within each
/// stream, stdout and stderr are independent), then exactly one
/// `process_died` once both streams are drained.
pub struct ProcessSupervisor {
    processes: Arc<Mutex<HashMap<u64, ManagedProcess>>>,
    next_pid: AtomicU64,
    events: EventBus,
    factory: SharedFactory,
    shell: String,
    default_workdir: Option<String>,
}

struct ManagedProcess {
    snapshot: ProcessSnapshot,
    alive: bool,
    exit_code: Option<i32>,
    /// Sender to signal that the process should be terminated
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ManagedProcess {
    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            process: self.snapshot.clone(),
            alive: self.alive,
            exit_code: self.exit_code,
        }
    }
}

impl ProcessSupervisor {
    pub fn new(config: &AgentConfig, events: EventBus) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            next_pid: AtomicU64::new(1),
            events,
            factory: ProcessEventFactory::with_clock(clock),
            shell: config.shell().to_string(),
            default_workdir: config.workdir().map(str::to_string),
        }
    }

    /// Replace the clock used to stamp status and output events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.factory = ProcessEventFactory::with_clock(clock);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start a process and publish `process_started` for it.
    ///
    /// Subscribe to the event bus before calling this to observe the
    /// started event.
    pub async fn start(&self, params: StartProcessParams) -> Result<ProcessSnapshot, AgentError> {
        if params.command_line.trim().is_empty() {
            return Err(AgentError::EmptyCommandLine);
        }

        let workdir = params.workdir.clone().or_else(|| self.default_workdir.clone());
        if let Some(workdir) = &workdir {
            if !Path::new(workdir).is_dir() {
                tracing::error!(workdir = %workdir, "workdir does not exist");
                return Err(AgentError::WorkdirNotFound(workdir.clone()));
            }
        }

        tracing::debug!(
            name = %params.name,
            command_line = %params.command_line,
            workdir = ?workdir,
            shell = %self.shell,
            "spawning process"
        );

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&params.command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &workdir {
            command.current_dir(workdir);
        }

        let mut child = command.spawn().map_err(|source| {
            tracing::error!(error = %source, command_line = %params.command_line, "failed to spawn process");
            AgentError::Spawn {
                command_line: params.command_line.clone(),
                source,
            }
        })?;

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let snapshot = ProcessSnapshot {
            pid,
            native_pid: child.id().map(i64::from).unwrap_or(0),
            name: params.name,
            command_line: params.command_line,
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ManagedProcess {
                    snapshot: snapshot.clone(),
                    alive: true,
                    exit_code: None,
                    kill_tx: Some(kill_tx),
                },
            );
        }

        tracing::info!(
            pid = pid,
            native_pid = snapshot.native_pid,
            name = %snapshot.name,
            "process started"
        );
        self.events.publish(self.factory.started_event(&snapshot));

        // Readers are spawned only after the started event is out, so no
        // output can overtake it.
        let readers = [
            stdout.map(|pipe| self.spawn_output_reader(pid, OutputStream::Stdout, pipe)),
            stderr.map(|pipe| self.spawn_output_reader(pid, OutputStream::Stderr, pipe)),
        ];
        self.spawn_exit_watcher(pid, child, kill_rx, readers.into_iter().flatten().collect());

        Ok(snapshot)
    }

    /// Ask a running process to terminate. `process_died` follows once it is gone.
    pub async fn kill(&self, pid: u64) -> Result<(), AgentError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&pid)
            .ok_or(AgentError::ProcessNotFound(pid))?;

        if !process.alive {
            return Err(AgentError::ProcessNotAlive(pid));
        }

        if let Some(kill_tx) = process.kill_tx.take() {
            tracing::info!(pid = pid, "kill requested");
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    /// Kill every running process (on shutdown)
    pub async fn kill_all(&self) {
        let mut processes = self.processes.lock().await;
        for (pid, process) in processes.iter_mut().filter(|(_, p)| p.alive) {
            if let Some(kill_tx) = process.kill_tx.take() {
                tracing::info!(pid = *pid, "kill requested");
                let _ = kill_tx.send(());
            }
        }
    }

    pub async fn get(&self, pid: u64) -> Result<ProcessInfo, AgentError> {
        let processes = self.processes.lock().await;
        processes
            .get(&pid)
            .map(ManagedProcess::info)
            .ok_or(AgentError::ProcessNotFound(pid))
    }

    /// Known processes sorted by pid; dead ones only when `all` is set.
    pub async fn list(&self, all: bool) -> Vec<ProcessInfo> {
        let processes = self.processes.lock().await;
        let mut infos: Vec<ProcessInfo> = processes
            .values()
            .filter(|p| all || p.alive)
            .map(ManagedProcess::info)
            .collect();
        infos.sort_by_key(|info| info.process.pid);
        infos
    }

    fn spawn_output_reader<R>(&self, pid: u64, stream: OutputStream, pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let factory = self.factory.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = read_output_chunks(pipe, |text| {
                let observed_at = factory.clock().now();
                events.publish(factory.output_event(stream, pid, text, observed_at));
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(pid = pid, stream = stream.as_str(), error = %e, "failed to read process output");
            }
            tracing::debug!(pid = pid, stream = stream.as_str(), "output stream closed");
        })
    }

    fn spawn_exit_watcher(
        &self,
        pid: u64,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let processes = self.processes.clone();
        let events = self.events.clone();
        let factory = self.factory.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    tracing::debug!(pid = pid, "terminating process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(pid = pid, error = %e, "failed to kill process");
                    }
                    child.wait().await
                }
            };

            drain_readers(pid, readers).await;

            let exit_code = match &status {
                Ok(s) => s.code(),
                Err(e) => {
                    tracing::warn!(pid = pid, error = %e, "failed to wait for process");
                    None
                }
            };

            let snapshot = {
                let mut processes = processes.lock().await;
                let Some(process) = processes.get_mut(&pid) else {
                    return;
                };
                process.alive = false;
                process.exit_code = exit_code;
                process.kill_tx = None;
                process.snapshot.clone()
            };

            tracing::info!(pid = pid, exit_code = ?exit_code, "process exited");
            events.publish(factory.died_event(&snapshot));
        });
    }
}

/// Read `pipe` to EOF, handing each decoded chunk to `emit` in read order.
///
/// A chunk ends at a newline (kept) or after `MAX_OUTPUT_CHUNK` bytes. A
/// multi-byte character cut by the size limit is carried into the next chunk,
/// so only genuinely invalid bytes are replaced. Empty chunks are never
/// emitted.
async fn read_output_chunks<R>(pipe: R, mut emit: impl FnMut(String)) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        let limit = MAX_OUTPUT_CHUNK.saturating_sub(buf.len()).max(1) as u64;
        let read = (&mut reader).take(limit).read_until(b'\n', &mut buf).await;
        match read {
            Ok(0) => {
                // Whatever is left at EOF goes out as is
                if !buf.is_empty() {
                    emit(String::from_utf8_lossy(&buf).into_owned());
                }
                return Ok(());
            }
            Ok(_) => {
                let split = buf.len() - incomplete_utf8_tail(&buf);
                if split > 0 {
                    emit(String::from_utf8_lossy(&buf[..split]).into_owned());
                    buf.drain(..split);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Length of a truncated multi-byte UTF-8 sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Wait for the output readers, all of them within one `OUTPUT_DRAIN_TIMEOUT`.
///
/// Readers still running after that are aborted and awaited, so none of them
/// can publish once this returns.
async fn drain_readers(pid: u64, mut readers: Vec<JoinHandle<()>>) {
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        while let Some(reader) = readers.first_mut() {
            if let Err(e) = reader.await {
                tracing::warn!(pid = pid, error = %e, "output reader failed");
            }
            readers.remove(0);
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(pid = pid, open = readers.len(), "output still open after exit, abandoning readers");
        for reader in readers {
            reader.abort();
            // Cancelled is the expected outcome
            let _ = reader.await;
        }
    }
}

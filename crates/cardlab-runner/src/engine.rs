//! Engine subprocess supervision.
//!
//! The correlation loop talks to the engine only through [`EngineIo`], so it
//! can be driven by a scripted stand-in in tests. [`EngineProcess`] is the
//! real implementation: a child process with all three standard streams
//! piped and one inbox reader per output stream.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::inbox::{spawn_reader, Channel, InboxProducer};

const EXIT_POLL: Duration = Duration::from_millis(50);
const READER_JOIN_WAIT: Duration = Duration::from_millis(500);

pub trait EngineIo {
    /// Writes one line of input (a newline is appended) and flushes.
    fn send(&mut self, text: &str) -> Result<()>;

    /// Non-blocking termination check. `Some(status)` once the engine is gone.
    fn exit_status(&mut self) -> Result<Option<String>>;

    /// Quit command, grace wait, kill, reap. Idempotent.
    fn shutdown(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EngineLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub quit_command: String,
    pub grace: Duration,
}

impl EngineLaunch {
    pub fn new(program: &Path, database: &str) -> Self {
        Self {
            program: program.to_path_buf(),
            args: vec![database.to_string()],
            quit_command: ".quit".to_string(),
            grace: Duration::from_secs(5),
        }
    }
}

pub struct EngineProcess {
    launch: EngineLaunch,
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    shut_down: bool,
}

impl EngineProcess {
    /// Spawns the engine and its two readers. The producer is moved into
    /// the readers, so the inbox disconnects once both streams end.
    pub fn spawn(launch: EngineLaunch, producer: InboxProducer) -> Result<Self> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            // Own process group: a terminal interrupt reaches only us and we
            // run the graceful shutdown ourselves.
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            program: launch.program.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        let started = start_readers(&mut child, producer);
        let readers = reap_on_error(&mut child, started)?;
        info!(
            program = %launch.program.display(),
            args = ?launch.args,
            pid = child.id(),
            "engine started"
        );
        Ok(Self {
            launch,
            child,
            stdin,
            readers,
            shut_down: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn wait_until(&mut self, deadline: Instant) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    fn join_readers(&mut self) {
        let deadline = Instant::now() + READER_JOIN_WAIT;
        for handle in self.readers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // A grandchild may still hold the pipe open; leave the reader
                // detached rather than block shutdown on it.
                debug!("engine reader still running after shutdown");
            }
        }
    }
}

fn start_readers(child: &mut Child, producer: InboxProducer) -> Result<Vec<JoinHandle<()>>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(Channel::Primary, stdout, producer.clone())?);
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(Channel::Secondary, stderr, producer)?);
    }
    Ok(readers)
}

/// A child that never became an [`EngineProcess`] has no Drop guard; kill
/// and reap it before handing the error back.
fn reap_on_error<T>(child: &mut Child, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        warn!(pid = child.id(), error = %err, "engine setup failed; killing");
        let _ = child.kill();
        let _ = child.wait();
    }
    result
}

pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    status.to_string()
}

impl EngineIo for EngineProcess {
    fn send(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| HarnessError::Config("engine input already closed".to_string()))?;
        let write = stdin
            .write_all(text.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush());
        match write {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                let status = match self.child.try_wait()? {
                    Some(status) => describe_status(&status),
                    None => "input pipe closed".to_string(),
                };
                Err(HarnessError::ProcessExit { status })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exit_status(&mut self) -> Result<Option<String>> {
        Ok(self.child.try_wait()?.map(|s| describe_status(&s)))
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin, "{}", self.launch.quit_command);
            let _ = stdin.flush();
        }

        let deadline = Instant::now() + self.launch.grace;
        let status = match self.wait_until(deadline)? {
            Some(status) => status,
            None => {
                warn!(
                    pid = self.child.id(),
                    grace_secs = self.launch.grace.as_secs_f64(),
                    "engine ignored quit command; killing"
                );
                // Exited between the last poll and the kill: kill fails with
                // InvalidInput and wait still reaps.
                let _ = self.child.kill();
                self.child.wait()?
            }
        };
        info!(status = %describe_status(&status), "engine stopped");
        self.join_readers();
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown();
        }
    }
}

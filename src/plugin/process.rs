//! Process plugins: spawning, IPC and process pooling
//!
//! A process plugin is any executable that reads one JSON-encoded [`Input`] per
//! line on stdin and writes one JSON-encoded [`Output`] per line on stdout.

use crate::plugin::schema::{Input, Output, PluginError};
use crate::plugin::RoutingPlugin;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

/// How to start a plugin process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Represents a running plugin process
pub struct PluginProcess {
    /// Process ID
    pub pid: u32,
    /// Child process handle
    child: Child,
    /// stdin handle for writing input
    stdin: Option<ChildStdin>,
    /// stdout handle for reading output
    stdout: Option<BufReader<ChildStdout>>,
}

impl PluginProcess {
    /// Spawn a new plugin process
    pub async fn spawn(spec: &ProcessSpec) -> Result<Self, PluginError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true); // Prevent zombie processes

        let mut child = cmd.spawn().map_err(|e| PluginError::SpawnFailed {
            reason: format!("Failed to spawn '{}': {e}", spec.command.display()),
        })?;

        let pid = child.id().ok_or_else(|| PluginError::SpawnFailed {
            reason: "Failed to get process ID".to_string(),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        Ok(Self {
            pid,
            child,
            stdin,
            stdout,
        })
    }

    /// Check if the process is still running
    pub fn is_healthy(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Write input to the plugin's stdin
    pub async fn write_input(&mut self, input: &Input) -> Result<(), PluginError> {
        let json = input.to_json()?;

        let stdin = self.stdin.as_mut().ok_or_else(|| PluginError::IoError {
            reason: "stdin is not available".to_string(),
        })?;

        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write to stdin: {e}"),
            })?;

        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write newline to stdin: {e}"),
            })?;

        stdin.flush().await.map_err(|e| PluginError::IoError {
            reason: format!("Failed to flush stdin: {e}"),
        })
    }

    /// Read output from the plugin's stdout
    pub async fn read_output(&mut self) -> Result<Output, PluginError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| PluginError::IoError {
            reason: "stdout is not available".to_string(),
        })?;

        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to read from stdout: {e}"),
            })?;

        if line.is_empty() {
            return Err(PluginError::Crashed {
                reason: format!("process {} closed stdout", self.pid),
            });
        }

        Output::from_json(line.trim())
    }

    /// Execute plugin with input and get output
    pub async fn execute(&mut self, input: &Input) -> Result<Output, PluginError> {
        self.write_input(input).await?;
        self.read_output().await
    }

    /// Kill the process
    pub async fn kill(&mut self) -> Result<(), PluginError> {
        self.child.kill().await.map_err(|e| PluginError::IoError {
            reason: format!("Failed to kill process: {e}"),
        })
    }
}

/// Pool of warm plugin processes
pub struct ProcessPool {
    spec: ProcessSpec,
    /// Maximum pool size
    max_size: usize,
    /// Available processes
    processes: Arc<Mutex<VecDeque<PluginProcess>>>,
}

impl ProcessPool {
    /// Create a new process pool
    pub fn new(spec: ProcessSpec, max_size: usize) -> Self {
        Self {
            spec,
            max_size,
            processes: Arc::new(Mutex::new(VecDeque::with_capacity(max_size))),
        }
    }

    /// Acquire a process from the pool (or spawn new if none available)
    pub async fn acquire(&self) -> Result<PluginProcess, PluginError> {
        let mut processes = self.processes.lock().await;

        while let Some(mut process) = processes.pop_front() {
            if process.is_healthy() {
                return Ok(process);
            }
            debug!(pid = process.pid, "Discarding exited plugin process");
            let _ = process.kill().await;
        }
        drop(processes);

        PluginProcess::spawn(&self.spec).await
    }

    /// Release a process back to the pool
    pub async fn release(&self, process: PluginProcess) {
        let mut processes = self.processes.lock().await;

        // Surplus processes are dropped, which kills them
        if processes.len() < self.max_size {
            processes.push_back(process);
        }
    }

    /// Shutdown all processes in the pool
    pub async fn shutdown(&self) {
        let mut processes = self.processes.lock().await;

        while let Some(mut process) = processes.pop_front() {
            let _ = process.kill().await;
        }
    }

    /// Get current pool size
    pub async fn size(&self) -> usize {
        self.processes.lock().await.len()
    }
}

/// Routing plugin backed by a pool of external processes
pub struct ProcessPlugin {
    pool: ProcessPool,
}

impl ProcessPlugin {
    pub fn new(spec: ProcessSpec, pool_size: usize) -> Self {
        Self {
            pool: ProcessPool::new(spec, pool_size.max(1)),
        }
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }
}

#[async_trait]
impl RoutingPlugin for ProcessPlugin {
    async fn init(&self) -> Result<(), PluginError> {
        let mut process = self.pool.acquire().await?;
        if !process.is_healthy() {
            return Err(PluginError::SpawnFailed {
                reason: format!("process {} exited during startup", process.pid),
            });
        }
        self.pool.release(process).await;
        Ok(())
    }

    async fn fini(&self) {
        self.pool.shutdown().await;
    }

    async fn route(&self, input: &Input) -> Result<Output, PluginError> {
        // Dropping this future (timeout) drops the process, which kills it.
        let mut process = self.pool.acquire().await?;

        match process.execute(input).await {
            Ok(output) => {
                self.pool.release(process).await;
                Ok(output)
            }
            Err(e) => {
                let _ = process.kill().await;
                Err(e)
            }
        }
    }
}

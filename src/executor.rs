//! Shell alias execution under a hard wall-clock timeout.
//!
//! Each alias runs as `<shell> [-i] -c <alias>` in a new session so that
//! user aliases and functions resolve without a terminal, and a timeout can
//! take down the whole process group the alias started.

use crate::error::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub shell: PathBuf,
    /// Pass `-i` so the shell reads the user's rc files.
    pub interactive: bool,
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/zsh"),
            interactive: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(error: &ExecutionError) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub alias: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub unique_aliases: usize,
    pub last: Option<ExecutionRecord>,
}

pub struct AliasExecutor {
    config: ExecutorConfig,
    history: Mutex<Vec<ExecutionRecord>>,
}

impl AliasExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        info!(
            "Initialized alias executor with shell {} (timeout {:?})",
            config.shell.display(),
            config.timeout
        );
        Self {
            config,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs `alias` and appends the outcome to the history, whatever it is.
    pub async fn execute(&self, alias: &str) -> ExecutionResult {
        let timestamp = Utc::now();
        info!("Executing alias: {}", alias);

        let result = match self.run(alias).await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    ExecutionError::Timeout => error!("Timeout executing alias: {}", alias),
                    _ => error!("Error executing alias {}: {}", alias, e),
                }
                ExecutionResult::failed(&e)
            }
        };

        if result.success {
            info!("Successfully executed alias: {}", alias);
        } else {
            warn!("Alias failed: {} ({:?})", alias, result.error);
        }

        self.lock_history().push(ExecutionRecord {
            alias: alias.to_string(),
            timestamp,
            success: result.success,
            output: result.output.clone(),
            error: result.error.clone(),
        });

        result
    }

    async fn run(&self, alias: &str) -> Result<ExecutionResult, ExecutionError> {
        let mut child = self.spawn(alias)?;
        let pid = child.id();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let collected = timeout(self.config.timeout, async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_stream(stdout.as_mut()),
                read_stream(stderr.as_mut())
            );
            Ok::<_, std::io::Error>((status?, out?, err?))
        })
        .await;

        match collected {
            Ok(Ok((status, out, err))) => Ok(Self::finish(status, out, err)),
            Ok(Err(e)) => {
                terminate(&mut child, pid).await;
                Err(ExecutionError::Wait(e))
            }
            Err(_) => {
                terminate(&mut child, pid).await;
                Err(ExecutionError::Timeout)
            }
        }
    }

    fn spawn(&self, alias: &str) -> Result<Child, ExecutionError> {
        let mut command = Command::new(&self.config.shell);
        if self.config.interactive {
            command.arg("-i");
        }
        command
            .arg("-c")
            .arg(alias)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // A new session detaches the shell from our terminal, so `-i` cannot
        // be stopped by job control. The child also leads a fresh group.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(
            "Full command: {} {}-c {:?}",
            self.config.shell.display(),
            if self.config.interactive { "-i " } else { "" },
            alias
        );

        command.spawn().map_err(|source| ExecutionError::Spawn {
            shell: self.config.shell.display().to_string(),
            source,
        })
    }

    fn finish(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> ExecutionResult {
        let output = decode_trimmed(&stdout);
        let mut error = decode_trimmed(&stderr);

        if let Some(out) = &output {
            info!("Output: {}", out);
        }
        if let Some(err) = &error {
            warn!("Stderr: {}", err);
        }

        let success = status.success();
        if !success && error.is_none() {
            error = Some(match status.code() {
                Some(code) => format!("exit status: {}", code),
                None => "terminated by signal".to_string(),
            });
        }

        ExecutionResult {
            success,
            output,
            error,
        }
    }

    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.lock_history().clone()
    }

    pub fn history_for(&self, alias: &str) -> Vec<ExecutionRecord> {
        let history: Vec<ExecutionRecord> = self
            .lock_history()
            .iter()
            .filter(|record| record.alias == alias)
            .cloned()
            .collect();
        debug!("History for alias '{}': {} records", alias, history.len());
        history
    }

    pub fn stats(&self) -> ExecutionStats {
        let history = self.lock_history();
        let successful = history.iter().filter(|r| r.success).count();
        let unique_aliases = history
            .iter()
            .map(|r| r.alias.as_str())
            .collect::<HashSet<_>>()
            .len();
        ExecutionStats {
            total: history.len(),
            successful,
            failed: history.len() - successful,
            unique_aliases,
            last: history.last().cloned(),
        }
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionRecord>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<&mut R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn decode_trimmed(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Kills the child's whole process group, then reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            // The child leads its own group, so pgid == pid.
            let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
            if rc != 0 {
                debug!("killpg({}) failed: {}", pid, std::io::Error::last_os_error());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!("Child already gone after group kill: {}", e);
    }
}

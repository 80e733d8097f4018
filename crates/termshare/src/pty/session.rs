//! The shared shell.
//!
//! A [`PtySession`] runs one shell under a pseudo-terminal. Output is read by a
//! single blocking task and delivered through a bounded channel; input may come
//! from many writers and is serialized by a mutex.

use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::WindowSize;
use tokio::sync::{mpsc, Mutex};

use super::{PtyDevice, PtyError};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output channel.
const OUTPUT_CAPACITY: usize = 256;

/// How long a refresh keeps the terminal at its temporary size.
const REFRESH_DELAY: Duration = Duration::from_millis(10);

/// A shell running under a pseudo-terminal.
pub struct PtySession {
    /// The PTY master handle.
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// The child process.
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Output reader, handed out once to the read loop.
    reader: Mutex<Option<Box<dyn Read + Send>>>,

    /// Flag indicating if the shell is still running.
    running: Arc<AtomicBool>,

    /// Current size, packed as `rows << 16 | cols`.
    size: AtomicU32,

    /// Process ID.
    pid: Option<u32>,
}

impl PtySession {
    /// Spawns a shell with the given terminal size and extra environment.
    ///
    /// If `shell` is None, uses $SHELL or /bin/sh.
    pub fn spawn(
        shell: Option<String>,
        size: WindowSize,
        env: Vec<(String, String)>,
    ) -> Result<Self, PtyError> {
        let shell_cmd = detect_shell(shell);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        tracing::info!(shell = %shell_cmd, pid = ?pid, size = %size, "Spawned shell");

        Ok(Self {
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            reader: Mutex::new(Some(reader)),
            running: Arc::new(AtomicBool::new(true)),
            size: AtomicU32::new(pack(size)),
            pid,
        })
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the read loop and returns the output channel.
    ///
    /// The channel closes when the shell exits. Can only be called once.
    pub async fn start_read_loop(&self) -> Result<mpsc::Receiver<Vec<u8>>, PtyError> {
        let mut reader = self.reader.lock().await.take().ok_or(PtyError::ReaderTaken)?;
        let running = Arc::clone(&self.running);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!("PTY EOF - process exited");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            tracing::debug!("Read loop stopping: output receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side is gone.
                        tracing::debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(output_rx)
    }

    async fn apply_size(&self, size: WindowSize) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::AlreadyTerminated);
        }

        let master = self.master.lock().await;
        master
            .resize(pty_size(size))
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Kills the shell and reaps it, returning its exit code.
    ///
    /// Safe to call after the shell has already exited.
    pub async fn kill(&self) -> Result<u32, PtyError> {
        self.running.store(false, Ordering::SeqCst);

        let child = Arc::clone(&self.child);
        let code = tokio::task::spawn_blocking(move || {
            let mut child = child.blocking_lock();
            if let Ok(Some(status)) = child.try_wait() {
                return Ok(status.exit_code());
            }
            child
                .kill()
                .map_err(|e| PtyError::KillFailed(e.to_string()))?;
            child
                .wait()
                .map(|status| status.exit_code())
                .map_err(|e| PtyError::KillFailed(e.to_string()))
        })
        .await
        .map_err(|e| PtyError::KillFailed(e.to_string()))??;

        tracing::info!(pid = ?self.pid, code, "Shell terminated");
        Ok(code)
    }
}

impl PtyDevice for PtySession {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(PtyError::AlreadyTerminated);
            }

            let mut writer = self.writer.lock().await;
            writer
                .write_all(data)
                .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
            Ok(())
        })
    }

    fn size(&self) -> WindowSize {
        unpack(self.size.load(Ordering::SeqCst))
    }

    fn resize(
        &self,
        size: WindowSize,
    ) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            self.apply_size(size).await?;
            self.size.store(pack(size), Ordering::SeqCst);
            tracing::debug!(size = %size, "Resized PTY");
            Ok(())
        })
    }

    fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            // A transient resize makes full-screen programs and most shells
            // redraw; the real size is restored right after.
            let size = self.size();
            let rows = if size.rows > 1 { size.rows - 1 } else { size.rows + 1 };
            self.apply_size(WindowSize::new(rows, size.cols)).await?;
            tokio::time::sleep(REFRESH_DELAY).await;
            self.apply_size(self.size()).await?;
            tracing::debug!("Refreshed PTY");
            Ok(())
        })
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pack(size: WindowSize) -> u32 {
    (u32::from(size.rows) << 16) | u32::from(size.cols)
}

fn unpack(packed: u32) -> WindowSize {
    WindowSize::new((packed >> 16) as u16, (packed & 0xffff) as u16)
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

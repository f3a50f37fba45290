use std::io::{Read as IoRead, Write as IoWrite};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// PtyTransport
// ---------------------------------------------------------------------------

/// A [`Transport`] backed by a child process (normally an SSH client)
/// running inside a pseudo-terminal.
///
/// Blocking PTY reads and writes happen on two dedicated threads that pump
/// bytes through `flume` channels, so the async side never blocks.
pub struct PtyTransport {
    reader: flume::Receiver<Vec<u8>>,
    writer: Option<flume::Sender<Vec<u8>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    _reader_thread: Option<std::thread::JoinHandle<()>>,
    _writer_thread: Option<std::thread::JoinHandle<()>>,
    closed: bool,
}

impl PtyTransport {
    /// Spawn `program` with `args` inside a new 80x40 pseudo-terminal.
    pub fn spawn(program: &str, args: &[String], env: &[(&str, &str)]) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut command = CommandBuilder::new(program);
        for arg in args {
            command.arg(arg);
        }
        for (k, v) in env {
            command.env(*k, *v);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        debug!(program, ?args, "spawned PTY transport");

        // -- stdout reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let reader_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is expected once the child exits
                        if e.kind() != std::io::ErrorKind::Other {
                            debug!("pty reader error: {e}");
                        }
                        break;
                    }
                }
            }
        });

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let writer_thread = std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(Self {
            reader: read_rx,
            writer: Some(write_tx),
            child: Arc::new(Mutex::new(child)),
            master: Arc::new(Mutex::new(pair.master)),
            _reader_thread: Some(reader_thread),
            _writer_thread: Some(writer_thread),
            closed: false,
        })
    }

    /// Check whether the underlying child process is still running.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        });
        matches!(child.try_wait(), Ok(None))
    }

    /// Resize the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(format!("resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> std::io::Result<()> {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        });
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        child.kill()
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        writer.send_async(data.to_vec()).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pty writer thread exited")
        })
    }

    async fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.reader.recv_async().await.ok())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Dropping the sender ends the writer thread; killing the child ends
        // the reader thread with EOF/EIO.
        self.writer.take();
        self.kill()
    }
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.kill() {
            debug!("failed to kill pty child on drop: {e}");
        }
    }
}

impl std::fmt::Debug for PtyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyTransport")
            .field("alive", &self.is_alive())
            .finish()
    }
}

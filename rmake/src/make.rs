//! Make executor: file intake, recipe commands, output delivery.
//!
//! A make runs in a fresh working directory under
//! [`ConnOptions::scratch_root`](crate::ConnOptions). The directory is removed
//! on every exit path.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fs, io};

use rmake_proto::{CodecError, DEFAULT_MAX_LENGTH, MsgKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;
use crate::conn::{Conn, ConnOptions, Request, send_control};
use crate::error::Error;
use crate::recipe::Recipe;
use crate::template::CommandTemplate;

/// Monotonic counter naming working directories across all sessions.
static MAKE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Chunk size for uploads and child output.
const CHUNK: usize = DEFAULT_MAX_LENGTH;

/// Resolves a peer-supplied relative name inside `dir`.
///
/// Returns `None` for empty, absolute, or `..`-containing names.
pub fn confined_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    let mut normal = false;
    for component in rel.components() {
        match component {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    normal.then(|| dir.join(rel))
}

/// Working directory of one make.
///
/// [`ScratchDir::remove`] deletes it without blocking the runtime; `Drop`
/// only covers paths that skip it, such as a cancelled session.
#[derive(Debug)]
struct ScratchDir {
    /// Absolute path of the directory.
    path: PathBuf,
    /// Set once the async removal has run.
    removed: bool,
}

impl ScratchDir {
    /// Creates `rmaked-{pid}-{id}` under `root`.
    async fn create(root: &Path, id: u64) -> io::Result<Self> {
        let path = root.join(format!("rmaked-{}-{id}", std::process::id()));
        tokio::fs::create_dir(&path).await?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Deletes the directory tree.
    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(dir = %self.path.display(), error = %e, "failed to remove working directory");
        }
        self.removed = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(dir = %self.path.display(), error = %e, "failed to remove working directory");
        }
    }
}

impl<R, W> Conn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Runs the make for the current request.
    ///
    /// Call after `MakeRequestOk` has been sent and [`Conn::request`] holds a
    /// matched recipe; the client is expected to be sending files.
    ///
    /// On error the connection must be closed. Unless the error is a wire or
    /// protocol error (see [`Error::wants_error_message`]), the caller should
    /// first send an `ErrorMessage` describing it.
    pub async fn make(&mut self) -> Result<()> {
        let Some(request) = self.request.as_mut() else {
            return Err(Error::NoRequest);
        };
        let Some(recipe) = request.recipe.clone() else {
            return Err(Error::NoRequest);
        };

        let id = MAKE_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        let scratch = ScratchDir::create(&self.options.scratch_root, id).await?;
        request.scratch_dir = Some(scratch.path.clone());
        debug!(make = id, recipe = recipe.name(), dir = %scratch.path.display(), "make started");

        let result = MakeSession {
            id,
            reader: &mut self.reader,
            writer: &mut self.writer,
            request,
            recipe: &recipe,
            dir: &scratch.path,
            options: &self.options,
        }
        .run()
        .await;

        if let Some(request) = self.request.as_mut() {
            request.scratch_dir = None;
        }
        scratch.remove().await;
        result
    }
}

/// Borrowed state of one make run.
struct MakeSession<'a, R, W> {
    /// Sequence number, for logs.
    id: u64,
    /// Connection read half.
    reader: &'a mut R,
    /// Connection write half.
    writer: &'a mut W,
    /// The accepted request templates render against.
    request: &'a Request,
    /// The matched recipe.
    recipe: &'a Recipe,
    /// Scratch directory; cwd of every command.
    dir: &'a Path,
    /// Upload limits.
    options: &'a ConnOptions,
}

impl<R, W> MakeSession<'_, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Intake, commands, outputs.
    async fn run(&mut self) -> Result<()> {
        self.receive_files().await?;
        for template in self.recipe.commands() {
            self.run_command(template).await?;
        }
        self.send_outputs().await
    }

    /// Reads `MakeSendFile` messages until `MakeSendFileEnd`.
    async fn receive_files(&mut self) -> Result<()> {
        loop {
            let code = rmake_proto::read_kind(self.reader).await?;
            match MsgKind::from_code(code) {
                Some(MsgKind::MakeSendFile) => self.receive_file().await?,
                Some(MsgKind::MakeSendFileEnd) => return Ok(()),
                _ => {
                    send_control(self.writer, MsgKind::InvalidMsg).await?;
                    return Err(Error::InvalidMsg(code));
                }
            }
        }
    }

    /// Streams one `MakeSendFile` payload to disk.
    async fn receive_file(&mut self) -> Result<()> {
        let name = rmake_proto::read_string(self.reader, self.options.max_length).await?;
        let size = rmake_proto::read_i64(self.reader).await?;

        let Some(path) = confined_path(self.dir, &name) else {
            send_control(self.writer, MsgKind::InvalidParam).await?;
            return Err(Error::InvalidParam(format!(
                "file name {name:?} is not a relative path"
            )));
        };
        let Some(len) = u64::try_from(size)
            .ok()
            .filter(|&n| n <= self.options.max_file_len)
        else {
            send_control(self.writer, MsgKind::InvalidParam).await?;
            return Err(Error::InvalidParam(format!(
                "file {name:?} has invalid size {size}"
            )));
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let mut buf = vec![0u8; CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(CHUNK, |r| r.min(CHUNK));
            let n = self
                .reader
                .read(&mut buf[..want])
                .await
                .map_err(CodecError::from)?;
            if n == 0 {
                return Err(CodecError::UnexpectedEnd.into());
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;

        info!(make = self.id, file = %name, bytes = len, "input");
        Ok(())
    }

    /// Renders and runs one command, streaming its output to the peer.
    async fn run_command(&mut self, template: &CommandTemplate) -> Result<()> {
        let line = template.render(self.request)?;
        info!(make = self.id, command = %line, "invoking");

        rmake_proto::write_text(
            self.writer,
            MsgKind::Stdmsg,
            format!("Executing: \"{line}\"").as_bytes(),
        )
        .await?;
        self.writer.flush().await.map_err(CodecError::from)?;

        let mut fields = line.split_whitespace();
        let Some(program) = fields.next() else {
            return Err(Error::EmptyCommand(template.source().to_owned()));
        };
        let mut child = Command::new(program)
            .args(fields)
            .current_dir(self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(io::Error::other("child output pipes were not captured").into());
        };

        let limit = self.recipe.max_time();
        let deadline = Instant::now() + limit;
        let sink = FrameSink::new(&mut *self.writer);
        let run = async {
            let (out, err, status) = tokio::join!(
                sink.drain(stdout, MsgKind::Stdout),
                sink.drain(stderr, MsgKind::Stderr),
                child.wait(),
            );
            out?;
            err?;
            Ok::<ExitStatus, Error>(status?)
        };
        let outcome = tokio::time::timeout_at(deadline, run).await;

        let Ok(result) = outcome else {
            if let Err(e) = child.kill().await {
                warn!(make = self.id, error = %e, "failed to kill timed out command");
            }
            warn!(make = self.id, command = %line, "deadline exceeded");
            return Err(Error::Timeout {
                command: line,
                limit_ms: limit.as_millis(),
            });
        };
        let status = result?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: line,
                status,
            });
        }
        Ok(())
    }

    /// Sends every file matching the recipe's output glob, then `MakeOutputEnd`.
    async fn send_outputs(&mut self) -> Result<()> {
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            self.recipe.output_glob()
        );
        let matches = glob::glob(&pattern)?.collect::<std::result::Result<Vec<_>, _>>()?;
        for path in matches {
            if !tokio::fs::metadata(&path).await?.is_file() {
                continue;
            }
            let file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            let declared = i64::try_from(len)
                .map_err(|_| io::Error::other(format!("{} is too large to send", path.display())))?;
            let name = path
                .strip_prefix(self.dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();

            rmake_proto::write_kind(self.writer, MsgKind::MakeOutput).await?;
            rmake_proto::write_string(self.writer, &name).await?;
            rmake_proto::write_i64(self.writer, declared).await?;
            // Past the length prefix any failure leaves a half-sent frame.
            let sent = tokio::io::copy(&mut file.take(len), self.writer)
                .await
                .map_err(CodecError::Io)?;
            if sent != len {
                return Err(CodecError::Io(io::Error::other(format!(
                    "output {name:?} shrank from {len} to {sent} bytes while being sent"
                )))
                .into());
            }
            self.writer.flush().await.map_err(CodecError::from)?;
            info!(make = self.id, file = %name, bytes = len, "output");
        }
        send_control(self.writer, MsgKind::MakeOutputEnd).await?;
        Ok(())
    }
}

/// Connection writer shared by the stdout and stderr drains of one command.
///
/// Each frame is written while holding the lock, so frames from the two
/// streams never interleave on the wire.
struct FrameSink<'a, W> {
    /// The connection's write half.
    conn: Mutex<&'a mut W>,
}

impl<'a, W: AsyncWrite + Unpin + Send> FrameSink<'a, W> {
    /// Wraps the write half.
    fn new(conn: &'a mut W) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Writes and flushes one complete frame.
    async fn send(&self, kind: MsgKind, data: &[u8]) -> std::result::Result<(), CodecError> {
        let mut frame = Vec::with_capacity(data.len() + 10);
        rmake_proto::write_text(&mut frame, kind, data).await?;

        let mut guard = self.conn.lock().await;
        let conn: &mut W = &mut guard;
        conn.write_all(&frame).await?;
        conn.flush().await?;
        Ok(())
    }

    /// Forwards everything read from `pipe` as `kind` frames until EOF.
    async fn drain(&self, mut pipe: impl AsyncRead + Unpin, kind: MsgKind) -> Result<u64> {
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            let n = pipe.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.send(kind, &buf[..n]).await?;
            total += n as u64;
        }
    }
}

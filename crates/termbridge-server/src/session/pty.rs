//! PTY lifecycle: allocate a pseudo-terminal pair, spawn a shell on it,
//! resize it, and tear it down.
//!
//! The master side is non-blocking and registered with the tokio reactor so
//! reads and writes are readiness driven. Teardown is idempotent and runs on
//! drop as a last resort.

use crate::config::ShellSettings;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::unistd::{setsid, Pid};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use termbridge_core::{BridgeError, BridgeResult};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Appended to the inherited `PATH` so common tools resolve even under a
/// minimal service environment.
pub const STANDARD_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/usr/games:/usr/local/games:/snap/bin";

const DEFAULT_HOME: &str = "/root";
const TERM_TYPE: &str = "xterm-256color";

/// Master side of a pty, registered with the tokio reactor.
pub struct PtyMaster {
    fd: AsyncFd<File>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        // SAFETY: the `File` owns the descriptor and is only closed through
        // `into_inner` or drop, so it stays valid while registered.
        let fd = unsafe { AsyncFd::register(File::from(fd)) }?;
        Ok(Self { fd })
    }

    /// Wait until the master is readable and read once.
    ///
    /// `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Read whatever is already buffered without waiting.
    ///
    /// Returns `Ok(None)` when nothing is pending.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut file: &File = self.fd.get_ref();
        match file.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write all of `data`, waiting for writability as needed.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Apply a new window size. The kernel sends SIGWINCH to the foreground
    /// process group of the slave.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        set_window_size(self.fd.get_ref().as_raw_fd(), cols, rows)
    }

    /// Deregister from the reactor and close the descriptor.
    fn close(self) -> io::Result<()> {
        let file = self.fd.into_inner();
        close_fd(file.into_raw_fd())
    }
}

/// A shell running on a pty, plus the descriptors that back it.
pub struct PtyProcess {
    pid: Pid,
    shell: PathBuf,
    master: Option<Arc<PtyMaster>>,
    slave: Option<OwnedFd>,
    child: Option<Child>,
    leader_reaped: bool,
}

impl PtyProcess {
    /// Allocate a pty, put the slave in raw-ish mode, and spawn the shell
    /// as leader of a new session with the slave as controlling terminal.
    pub fn spawn(settings: &ShellSettings, cols: u16, rows: u16) -> BridgeResult<Self> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None)
            .map_err(|e| BridgeError::Spawn(format!("failed to open PTY: {e}")))?;

        set_cloexec(pair.master.as_raw_fd()).map_err(spawn_err("master"))?;
        set_cloexec(pair.slave.as_raw_fd()).map_err(spawn_err("slave"))?;
        configure_slave(&pair.slave).map_err(spawn_err("termios"))?;

        let env = shell_environment(inherited_env(), &settings.path);
        let mut cmd = Command::new(&settings.path);
        cmd.args(&settings.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::from(pair.slave.try_clone().map_err(spawn_err("stdin"))?))
            .stdout(Stdio::from(pair.slave.try_clone().map_err(spawn_err("stdout"))?))
            .stderr(Stdio::from(pair.slave.try_clone().map_err(spawn_err("stderr"))?))
            .kill_on_drop(false);
        if let Some(home) = env.get("HOME").map(PathBuf::from).filter(|p| p.is_dir()) {
            cmd.current_dir(home);
        }

        // SAFETY: only async-signal-safe calls (setsid, ioctl) run between
        // fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            BridgeError::Spawn(format!("failed to spawn {}: {e}", settings.path.display()))
        })?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| BridgeError::Spawn("shell exited during spawn".into()))?;

        let master = PtyMaster::new(pair.master).map_err(spawn_err("reactor"))?;
        master.resize(cols, rows).map_err(spawn_err("window size"))?;

        info!(pid = pid.as_raw(), shell = %settings.path.display(), cols, rows, "PTY spawned");

        Ok(Self {
            pid,
            shell: settings.path.clone(),
            master: Some(Arc::new(master)),
            slave: Some(pair.slave),
            child: Some(child),
            leader_reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Shared handle to the master, `None` once released.
    pub fn master(&self) -> Option<Arc<PtyMaster>> {
        self.master.clone()
    }

    /// Hand the child handle to whoever watches for exit.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Record that the shell was reaped and its group already signalled,
    /// so teardown must not signal a pgid that may have been reused.
    pub fn mark_leader_reaped(&mut self) {
        self.leader_reaped = true;
    }

    #[cfg(test)]
    pub fn leader_reaped(&self) -> bool {
        self.leader_reaped
    }

    pub fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        let master = self.master.as_ref().ok_or_else(released)?;
        master.resize(cols, rows)?;
        debug!(pid = self.pid.as_raw(), cols, rows, "PTY resized");
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.master.is_none() && self.slave.is_none()
    }

    /// Signal the whole process group, then close master and slave.
    ///
    /// Failures are logged and swallowed; calling again is a no-op.
    pub fn teardown(&mut self) {
        if self.is_released() {
            return;
        }

        // Once the leader is reaped its pid can be recycled as soon as the
        // group empties; the reaper signalled the group at that point.
        if self.leader_reaped {
            debug!(pgid = self.pid.as_raw(), "leader already reaped, skipping group signal");
        } else {
            signal_group(self.pid);
        }

        if let Some(master) = self.master.take() {
            match Arc::try_unwrap(master) {
                Ok(master) => {
                    if let Err(e) = master.close() {
                        debug!(pid = self.pid.as_raw(), error = %e, "closing PTY master failed");
                    }
                }
                Err(_shared) => {
                    warn!(pid = self.pid.as_raw(), "PTY master still shared, closing on last drop");
                }
            }
        }
        if let Some(slave) = self.slave.take() {
            if let Err(e) = close_fd(slave.into_raw_fd()) {
                debug!(pid = self.pid.as_raw(), error = %e, "closing PTY slave failed");
            }
        }

        // Unreaped children are collected by tokio's orphan reaper.
        self.child.take();
        info!(pid = self.pid.as_raw(), shell = %self.shell.display(), "PTY torn down");
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Send SIGTERM then SIGHUP to every process in the group led by `pgid`.
/// Interactive shells ignore SIGTERM. Failures are logged and swallowed.
pub fn signal_group(pgid: Pid) {
    for signal in [Signal::SIGTERM, Signal::SIGHUP] {
        if let Err(e) = killpg(pgid, signal) {
            debug!(pgid = pgid.as_raw(), %signal, error = %e, "killpg failed");
        }
    }
}

/// Environment for the shell: inherited variables with a usable `PATH`,
/// a `HOME` fallback, a colour-capable `TERM`, and `SHELL` set to the
/// spawned binary.
pub fn shell_environment<I>(inherited: I, shell: &Path) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: HashMap<String, String> = inherited.into_iter().collect();

    let path = match env.get("PATH") {
        Some(p) if !p.is_empty() => format!("{p}:{STANDARD_PATH}"),
        _ => STANDARD_PATH.to_string(),
    };
    env.insert("PATH".into(), path);
    env.entry("HOME".into())
        .or_insert_with(|| DEFAULT_HOME.to_string());
    env.insert("TERM".into(), TERM_TYPE.into());
    env.insert("SHELL".into(), shell.display().to_string());
    env
}

fn inherited_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Disable echo and canonical line processing on the slave; the remote
/// terminal renderer owns both.
fn configure_slave(slave: &OwnedFd) -> nix::Result<()> {
    let mut termios = tcgetattr(slave)?;
    termios
        .local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON);
    tcsetattr(slave, SetArg::TCSANOW, &termios)
}

fn spawn_err<E: std::fmt::Display>(stage: &'static str) -> impl Fn(E) -> BridgeError {
    move |e| BridgeError::Spawn(format!("{stage}: {e}"))
}

fn released() -> BridgeError {
    BridgeError::Io(io::Error::new(io::ErrorKind::NotConnected, "pty released"))
}

fn set_window_size(fd: RawFd, cols: u16, rows: u16) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: fd is an open pty master and `ws` outlives the call.
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(nix::Error::last());
    }
    Ok(())
}

fn close_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: the caller gave up ownership of `fd`.
    if unsafe { libc::close(fd) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

//! PTY creation and management.
//!
//! Provides helpers for spawning a shell in a pseudo-terminal and for
//! non-blocking I/O on the master side.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (setsid, ioctl).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

/// Size used when the controller does not ask for one.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to configure PTY: {0}")]
    Configure(#[source] nix::Error),

    #[error("failed to resize PTY: {0}")]
    Resize(#[source] nix::Error),

    #[error("shell is empty")]
    EmptyShell,

    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] io::Error),

    #[error("PTY I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("terminal input backlog is full")]
    InputBacklog,
}

/// The parent's side of a pseudo-terminal.
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> Result<Self, PtyError> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd).map_err(PtyError::Io)?,
        })
    }

    /// Read whatever output is available, waiting until there is some.
    ///
    /// Returns `Ok(0)` once the slave side is closed for good.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref(), buf).map_err(io::Error::from)
            }) {
                Ok(Ok(n)) => return Ok(n),
                // Linux reports a hung-up PTY as EIO rather than EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }

    /// Write all of `data` to the terminal.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                nix::unistd::write(inner.get_ref(), data).map_err(io::Error::from)
            }) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let winsize = winsize(rows, cols);
        // TIOCSWINSZ ioctl
        unsafe {
            let ret = libc::ioctl(self.fd.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &winsize);
            if ret < 0 {
                return Err(PtyError::Resize(nix::Error::last()));
            }
        }
        Ok(())
    }

    /// Current terminal size as (rows, cols).
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let mut winsize = winsize(0, 0);
        // TIOCGWINSZ ioctl
        unsafe {
            let ret = libc::ioctl(
                self.fd.get_ref().as_raw_fd(),
                libc::TIOCGWINSZ,
                &raw mut winsize,
            );
            if ret < 0 {
                return Err(PtyError::Resize(nix::Error::last()));
            }
        }
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

const fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// The shell used when the controller does not name one.
#[must_use]
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Spawn `shell` as a session leader with a new PTY as its controlling terminal.
///
/// `size` is (rows, cols); when absent the PTY starts at 24x80.
pub fn spawn(shell: &str, size: Option<(u16, u16)>) -> Result<(PtyMaster, Child), PtyError> {
    if shell.is_empty() {
        return Err(PtyError::EmptyShell);
    }

    let (rows, cols) = size.unwrap_or((DEFAULT_ROWS, DEFAULT_COLS));
    let winsize = winsize(rows, cols);

    // Open a new PTY pair
    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    // Neither end may leak into the shell beyond its stdio.
    set_cloexec(&master)?;
    set_cloexec(&slave)?;

    let stdin = slave.try_clone().map_err(PtyError::Io)?;
    let stdout = slave.try_clone().map_err(PtyError::Io)?;

    let mut command = Command::new(shell);
    command
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));
    if std::env::var_os("TERM").is_none() {
        command.env("TERM", "xterm-256color");
    }

    // SAFETY: The closure runs in the child between fork and exec and only
    // calls async-signal-safe functions. stdio is already the PTY slave.
    unsafe {
        command.pre_exec(|| {
            // Create a new session
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            // Set the slave as the controlling terminal
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(PtyError::Spawn)?;
    // Close the parent's copies of the slave.
    drop(command);

    Ok((PtyMaster::new(master)?, child))
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), PtyError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Configure)?;
    Ok(())
}

/// Set master to non-blocking mode for async I/O
fn set_nonblocking(fd: &OwnedFd) -> Result<(), PtyError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
    let mut flags = OFlag::from_bits_retain(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(PtyError::Configure)?;
    Ok(())
}

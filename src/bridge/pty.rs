//! PTY allocation and spawning a command on the slave side.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The parent keeps only the master;
//! the slave is closed right after spawn so that reads on the master see
//! `EIO` once the child (and anything it forked) has exited.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program args…` on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal. stdin/stdout/stderr are all connected to the slave fd. `env`
/// entries are merged into the inherited environment.
pub fn spawn_on_pty(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    env: &[(String, String)],
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let master_fd = pty.master.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so tell
    // tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            libc::close(master_fd);
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Split the master into independent async read and write handles.
pub fn master_io(master: OwnedFd) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    let reader = master.try_clone()?;
    Ok((
        tokio::fs::File::from_std(std::fs::File::from(reader)),
        tokio::fs::File::from_std(std::fs::File::from(master)),
    ))
}

/// Whether `err` is the `EIO` a PTY master returns after the slave closes.
pub fn is_pty_eof(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// Send `signal` to the process group led by `pid`.
///
/// Children spawned by [`spawn_on_pty`] are session leaders, so their pid is
/// also the group id and this reaches anything they forked on the terminal.
pub fn signal_group(pid: u32, signal: libc::c_int) {
    #[allow(clippy::cast_possible_wrap)]
    let neg_pgid = -(pid as i32);
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(neg_pgid, signal);
    }
}

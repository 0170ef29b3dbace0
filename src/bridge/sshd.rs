//! `/sshd`: splice the peer to a locally spawned sshd.
//!
//! At startup the bridge generates a throwaway host key, writes the operator's
//! authorized keys next to it, and launches sshd in the foreground with an
//! empty config file and public-key-only authentication. The daemon lives for
//! the whole process; bridged sessions are spliced byte-for-byte to it.
//!
//! In `loopback` mode every session dials its own TCP connection, so sessions
//! are independent. In `stdio` mode sshd runs with `-i` and its stdin/stdout
//! are the one and only connection, handed to the first session that asks.

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::splice;
use crate::config::{SshdAddressing, SshdConfig};

/// Daemon lifecycle. Bridging is only accepted in [`DaemonState::Ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Uninitialized,
    Keygen,
    Starting,
    Ready,
    Exited,
}

/// Startup failures. All are fatal to the process.
#[derive(Debug)]
pub enum SshdError {
    NoAuthorizedKeys,
    User(String),
    Workdir(io::Error),
    KeygenSpawn(io::Error),
    Keygen(ExitStatus),
    AuthorizedKeys(io::Error),
    Listen(String),
    AddrInUse(SocketAddr),
    Spawn(io::Error),
    Exited(ExitStatus),
    NotReady(Duration),
}

impl fmt::Display for SshdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshdError::NoAuthorizedKeys => {
                write!(f, "shell mode needs RUNX_AUTHORIZED_KEYS or sshd.authorized_keys")
            }
            SshdError::User(e) => write!(f, "look up current user: {e}"),
            SshdError::Workdir(e) => write!(f, "create sshd temp dir: {e}"),
            SshdError::KeygenSpawn(e) => write!(f, "ssh-keygen: {e}"),
            SshdError::Keygen(s) => write!(f, "ssh-keygen: {s}"),
            SshdError::AuthorizedKeys(e) => write!(f, "write authorized_keys: {e}"),
            SshdError::Listen(a) => write!(f, "invalid sshd listen address: {a:?}"),
            SshdError::AddrInUse(a) => write!(f, "sshd listen address {a} is already in use"),
            SshdError::Spawn(e) => write!(f, "start sshd: {e}"),
            SshdError::Exited(s) => write!(f, "sshd exited during startup: {s}"),
            SshdError::NotReady(d) => {
                write!(f, "sshd not accepting connections after {}ms", d.as_millis())
            }
        }
    }
}

impl std::error::Error for SshdError {}

/// The single `sshd -i` connection.
struct DaemonPipe {
    stdout: ChildStdout,
    stdin: ChildStdin,
}

enum Addressing {
    Loopback(SocketAddr),
    Stdio(Mutex<Option<DaemonPipe>>),
}

pub struct ShellBridge {
    addressing: Addressing,
    state: watch::Receiver<DaemonState>,
    // Holds the host key and authorized_keys; removed on drop.
    _workdir: TempDir,
}

impl fmt::Debug for ShellBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.addressing {
            Addressing::Loopback(addr) => format!("loopback {addr}"),
            Addressing::Stdio(_) => "stdio".to_string(),
        };
        f.debug_struct("ShellBridge")
            .field("addressing", &mode)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Files the daemon is pointed at.
struct DaemonFiles {
    host_key: PathBuf,
    authorized_keys: PathBuf,
}

impl ShellBridge {
    /// Generate keys, launch sshd, and wait until it can take a session.
    pub async fn start(config: &SshdConfig) -> Result<Self, SshdError> {
        let keys = config
            .authorized_keys
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(SshdError::NoAuthorizedKeys)?;
        let (state_tx, state_rx) = watch::channel(DaemonState::Uninitialized);

        let workdir = tempfile::Builder::new()
            .prefix("sshd")
            .tempdir()
            .map_err(SshdError::Workdir)?;

        state_tx.send_replace(DaemonState::Keygen);
        let files = DaemonFiles {
            host_key: workdir.path().join("id_host_ed25519"),
            authorized_keys: workdir.path().join("authorized_keys"),
        };
        generate_host_key(&config.keygen_path, &files.host_key).await?;
        write_authorized_keys(&files.authorized_keys, keys).map_err(SshdError::AuthorizedKeys)?;

        state_tx.send_replace(DaemonState::Starting);
        let user = current_user()?;
        let listen = match config.addressing {
            SshdAddressing::Loopback => Some(
                config
                    .listen
                    .parse::<SocketAddr>()
                    .map_err(|_| SshdError::Listen(config.listen.clone()))?,
            ),
            SshdAddressing::Stdio => None,
        };
        if let Some(addr) = listen {
            ensure_free(addr).await?;
        }

        let mut cmd = Command::new(&config.sshd_path);
        cmd.args(daemon_args(&user, &files, listen))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if listen.is_none() {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        let mut child = cmd.spawn().map_err(SshdError::Spawn)?;
        info!(pid = ?child.id(), "sshd started");

        let addressing = match listen {
            Some(addr) => {
                let timeout = Duration::from_millis(config.ready_timeout_ms);
                wait_until_accepting(&mut child, addr, timeout).await?;
                Addressing::Loopback(addr)
            }
            None => {
                let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                    return Err(SshdError::Spawn(io::Error::other("sshd stdio not piped")));
                };
                Addressing::Stdio(Mutex::new(Some(DaemonPipe { stdout, stdin })))
            }
        };

        state_tx.send_replace(DaemonState::Ready);
        info!("sshd ready");
        tokio::spawn(watch_daemon(child, state_tx));

        Ok(Self {
            addressing,
            state: state_rx,
            _workdir: workdir,
        })
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Splice `stream` to the daemon until either side closes.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let state = self.state();
        if state != DaemonState::Ready {
            warn!(?state, "sshd not ready; dropping session");
            close(stream).await;
            return;
        }

        match &self.addressing {
            Addressing::Loopback(addr) => match TcpStream::connect(addr).await {
                Ok(conn) => {
                    let _ = conn.set_nodelay(true);
                    report(splice(stream, conn).await);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "dial sshd failed");
                    close(stream).await;
                }
            },
            Addressing::Stdio(pipe) => {
                let Some(pipe) = pipe.lock().await.take() else {
                    warn!("sshd pipe already in use; dropping session");
                    close(stream).await;
                    return;
                };
                report(splice_pipe(stream, pipe).await);
            }
        }
    }
}

/// Like [`splice`], but closes sshd's stdin once the peer is done so the
/// daemon sees EOF; a shutdown alone leaves the pipe open.
async fn splice_pipe<S>(stream: S, pipe: DaemonPipe) -> (io::Result<u64>, io::Result<u64>)
where
    S: AsyncRead + AsyncWrite,
{
    let (mut peer_read, mut peer_write) = tokio::io::split(stream);
    let DaemonPipe { mut stdout, mut stdin } = pipe;

    let forward = async move {
        let copied = tokio::io::copy(&mut peer_read, &mut stdin).await;
        drop(stdin);
        copied
    };
    let backward = async {
        let copied = tokio::io::copy(&mut stdout, &mut peer_write).await;
        let _ = peer_write.shutdown().await;
        copied
    };
    tokio::join!(forward, backward)
}

fn report(result: (io::Result<u64>, io::Result<u64>)) {
    match result {
        (Ok(up), Ok(down)) => info!(up, down, "sshd session closed"),
        (up, down) => warn!(?up, ?down, "sshd session ended with error"),
    }
}

async fn close<S: AsyncWrite>(stream: S) {
    tokio::pin!(stream);
    let _ = stream.shutdown().await;
}

async fn watch_daemon(mut child: Child, state: watch::Sender<DaemonState>) {
    match child.wait().await {
        Ok(status) if status.success() => info!(%status, "sshd exited"),
        Ok(status) => warn!(%status, "sshd exited"),
        Err(e) => error!(error = %e, "wait for sshd failed"),
    }
    state.send_replace(DaemonState::Exited);
}

fn current_user() -> Result<String, SshdError> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(SshdError::User("no passwd entry".to_string())),
        Err(e) => Err(SshdError::User(e.to_string())),
    }
}

async fn generate_host_key(keygen: &str, path: &Path) -> Result<(), SshdError> {
    let status = Command::new(keygen)
        .args(["-q", "-t", "ed25519", "-N", "", "-f"])
        .arg(path)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(SshdError::KeygenSpawn)?;
    if !status.success() {
        return Err(SshdError::Keygen(status));
    }
    Ok(())
}

fn write_authorized_keys(path: &Path, keys: &str) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(keys.as_bytes())?;
    if !keys.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

/// Command line for a single-tenant, key-only sshd.
///
/// `listen` of `None` selects inetd mode (`-i`), talking over stdio.
fn daemon_args(user: &str, files: &DaemonFiles, listen: Option<SocketAddr>) -> Vec<String> {
    let mut args = vec!["-D".to_string(), "-e".to_string(), "-f/dev/null".to_string()];
    if listen.is_none() {
        args.push("-i".to_string());
    }
    let options = [
        format!("AllowUsers {user}"),
        "PasswordAuthentication no".to_string(),
        "KbdInteractiveAuthentication no".to_string(),
        "PubkeyAuthentication yes".to_string(),
        "UsePAM no".to_string(),
        "PermitRootLogin no".to_string(),
        "LoginGraceTime 20".to_string(),
        "LogLevel ERROR".to_string(),
        "PrintLastLog no".to_string(),
        "PermitUserEnvironment yes".to_string(),
        format!("HostKey {}", files.host_key.display()),
        format!("AuthorizedKeysFile {}", files.authorized_keys.display()),
        "PidFile none".to_string(),
    ];
    args.extend(options.into_iter().map(|o| format!("-o{o}")));
    if let Some(addr) = listen {
        args.push(format!("-oListenAddress {addr}"));
    }
    args
}

/// Poll `addr` until sshd answers with its banner, it exits, or `timeout`
/// passes. Something other than sshd answering is an error, and so is the
/// child dying while the banner was being read.
async fn wait_until_accepting(
    child: &mut Child,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(), SshdError> {
    let started = Instant::now();
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(SshdError::Exited(status));
        }
        if let Ok(mut conn) = TcpStream::connect(addr).await {
            let remaining = timeout.saturating_sub(started.elapsed());
            let greeted = read_banner(&mut conn, remaining).await;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SshdError::Exited(status));
            }
            return match greeted {
                Some(true) => Ok(()),
                Some(false) => {
                    let _ = child.kill().await;
                    Err(SshdError::AddrInUse(addr))
                }
                None => {
                    let _ = child.kill().await;
                    Err(SshdError::NotReady(timeout))
                }
            };
        }
        if started.elapsed() >= timeout {
            let _ = child.kill().await;
            return Err(SshdError::NotReady(timeout));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// `Some(true)` if the peer opened with an SSH identification string,
/// `Some(false)` if it sent something else, `None` on silence or error.
async fn read_banner(conn: &mut TcpStream, limit: Duration) -> Option<bool> {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(limit, conn.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Some(buf[..n].starts_with(b"SSH-")),
        _ => None,
    }
}

/// Refuse to start when `addr` is already taken; a second sshd would fail to
/// bind and the bridge would end up talking to whoever holds the port.
async fn ensure_free(addr: SocketAddr) -> Result<(), SshdError> {
    let attempt = tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await;
    match attempt {
        Ok(Ok(_)) => Err(SshdError::AddrInUse(addr)),
        _ => Ok(()),
    }
}

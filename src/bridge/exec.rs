//! `/run`: one command under a pseudo-terminal.
//!
//! The peer opens the stream with a JSON record `{"Args": [...], "Env": [...]}`.
//! Whatever follows the record on the same stream (including bytes that
//! arrived in the same read as the record) is typed into the PTY, and
//! everything the PTY prints goes back to the peer. The bridge closes once
//! the process has exited *and* its output has been fully drained.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::process::ExitStatus;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::pty;

/// Largest request record accepted before the stream is dropped.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// The exec payload, field names as sent by the router's client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecRequest {
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
}

impl ExecRequest {
    /// `KEY=VALUE` entries as pairs. Entries without `=` are dropped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((k, v)) if !k.is_empty() => Some((k.to_string(), v.to_string())),
                _ => {
                    warn!(entry = %entry, "ignoring malformed env entry");
                    None
                }
            })
            .collect()
    }
}

/// Why the opening record could not be read.
#[derive(Debug)]
pub enum RequestError {
    Io(io::Error),
    /// Stream ended before a complete record arrived.
    Closed,
    TooLarge,
    Malformed(serde_json::Error),
    EmptyArgs,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Io(e) => write!(f, "read request: {e}"),
            RequestError::Closed => write!(f, "stream closed before request was complete"),
            RequestError::TooLarge => write!(f, "request exceeds {MAX_REQUEST_BYTES} bytes"),
            RequestError::Malformed(e) => write!(f, "bad request: {e}"),
            RequestError::EmptyArgs => write!(f, "bad request: Args is empty"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Read one [`ExecRequest`] from `reader`.
///
/// Returns the request and any bytes that were read past its end; those
/// belong to the interactive stream.
pub async fn read_request<R>(reader: &mut R) -> Result<(ExecRequest, Vec<u8>), RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            let mut records = serde_json::Deserializer::from_slice(&buf).into_iter::<ExecRequest>();
            match records.next() {
                Some(Ok(request)) => {
                    if request.args.is_empty() {
                        return Err(RequestError::EmptyArgs);
                    }
                    let rest = buf[records.byte_offset()..].to_vec();
                    return Ok((request, rest));
                }
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(e)) => return Err(RequestError::Malformed(e)),
                None => {}
            }
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = reader.read(&mut chunk).await.map_err(RequestError::Io)?;
        if n == 0 {
            return Err(RequestError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Runs `/run` sessions.
#[derive(Debug, Clone)]
pub struct ExecBridge {
    rows: u16,
    cols: u16,
}

impl ExecBridge {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Serve one session over `stream`. Never fails outward; every error is
    /// logged or reported to the peer.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (request, buffered) = match read_request(&mut reader).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dropping exec session");
                return;
            }
        };
        info!(args = ?request.args, "running request");

        let (mut child, master) = match self.start(&request) {
            Ok(started) => started,
            Err(e) => {
                warn!(program = %request.args[0], error = %e, "failed to start process");
                let _ = writer.write_all(e.to_string().as_bytes()).await;
                let _ = writer.shutdown().await;
                return;
            }
        };
        let (mut master_read, mut master_write) = match pty::master_io(master) {
            Ok(io) => io,
            Err(e) => {
                error!(error = %e, "failed to duplicate pty master");
                let _ = child.kill().await;
                let _ = writer.write_all(e.to_string().as_bytes()).await;
                let _ = writer.shutdown().await;
                return;
            }
        };

        // Peer → pty. Starts with whatever the request decoder read ahead.
        let mut input = tokio::spawn(async move {
            let mut source = io::Cursor::new(buffered).chain(reader);
            match tokio::io::copy(&mut source, &mut master_write).await {
                Ok(n) => debug!(bytes = n, "exec input finished"),
                Err(e) => debug!(error = %e, "exec input stopped"),
            }
        });
        let mut input_done = false;
        let pid = child.id();

        // Pty → peer. A failed write means the peer is gone.
        let drain = async {
            let output = pump_output(&mut master_read, &mut writer).await;
            if output.is_err() {
                if let Some(pid) = pid {
                    pty::signal_group(pid, libc::SIGHUP);
                }
            }
            output
        };

        // Exit status. If the peer closes its side first, hang up on the
        // process so the pty drains to EOF.
        let exit = async {
            tokio::select! {
                status = child.wait() => status,
                _ = &mut input => {
                    input_done = true;
                    hang_up(&mut child, pid).await
                }
            }
        };

        // Both must finish before teardown so output buffered at exit still
        // reaches the peer.
        let (output, status) = tokio::join!(drain, exit);

        match output {
            Ok(n) => debug!(bytes = n, "exec output drained"),
            Err(e) => warn!(error = %e, "exec output copy failed"),
        }
        match status {
            Ok(s) if s.success() => info!(status = %s, "process exited"),
            Ok(s) => warn!(status = %s, "process exited"),
            Err(e) => error!(error = %e, "wait for process failed"),
        }

        let _ = writer.shutdown().await;
        if !input_done {
            input.abort();
            let _ = input.await;
        }
    }

    fn start(&self, request: &ExecRequest) -> io::Result<(Child, OwnedFd)> {
        let pair = pty::allocate_pty(self.rows, self.cols).map_err(io::Error::from)?;
        let child = pty::spawn_on_pty(
            &pair,
            &request.args[0],
            &request.args[1..],
            &request.env_pairs(),
        )?;
        // Only the child may hold the slave, or the master never sees EOF.
        let pty::PtyPair { master, slave } = pair;
        drop(slave);
        Ok((child, master))
    }
}

/// How long a hung-up process gets before it is killed outright.
const HANGUP_GRACE: Duration = Duration::from_secs(2);

/// SIGHUP the process group, escalating to SIGKILL after [`HANGUP_GRACE`].
async fn hang_up(child: &mut Child, pid: Option<u32>) -> io::Result<ExitStatus> {
    let Some(pid) = pid else {
        return child.wait().await;
    };
    info!(pid, "peer closed; hanging up process");
    pty::signal_group(pid, libc::SIGHUP);
    match tokio::time::timeout(HANGUP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid, "process ignored SIGHUP; killing");
            pty::signal_group(pid, libc::SIGKILL);
            child.wait().await
        }
    }
}

/// Copy PTY output to `writer` until the slave side is gone.
async fn pump_output<R, W>(master: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = match master.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if pty::is_pty_eof(&e) => break,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{duplex, DuplexStream};

    async fn run_session(payload: &[u8]) -> String {
        let (mut client, server) = duplex(256 * 1024);
        let bridge = ExecBridge::new(24, 80);
        let session = tokio::spawn(async move { bridge.serve(server).await });

        client.write_all(payload).await.unwrap();
        let output = read_all(&mut client).await;
        tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("bridge did not finish")
            .unwrap();
        output
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut out))
            .await
            .expect("bridge output did not end")
            .unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_read_request_keeps_trailing_bytes() {
        let mut input: &[u8] = br#"{"Args":["cat"],"Env":["A=1"]}typed input"#;
        let (request, rest) = read_request(&mut input).await.unwrap();
        assert_eq!(request.args, vec!["cat".to_string()]);
        assert_eq!(request.env_pairs(), vec![("A".to_string(), "1".to_string())]);
        assert_eq!(rest, b"typed input");
    }

    #[tokio::test]
    async fn test_read_request_across_reads() {
        let (mut client, mut server) = duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(br#"{"Args":["#).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(br#""ls","-l"]}"#).await.unwrap();
            client
        });
        let (request, rest) = read_request(&mut server).await.unwrap();
        assert_eq!(request.args, vec!["ls".to_string(), "-l".to_string()]);
        assert!(request.env.is_empty());
        assert!(rest.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_request_errors() {
        let mut garbage: &[u8] = b"not json at all";
        assert!(matches!(
            read_request(&mut garbage).await,
            Err(RequestError::Malformed(_))
        ));

        let mut truncated: &[u8] = br#"{"Args":["ech"#;
        assert!(matches!(
            read_request(&mut truncated).await,
            Err(RequestError::Closed)
        ));

        let mut empty: &[u8] = br#"{"Args":[],"Env":[]}"#;
        assert!(matches!(
            read_request(&mut empty).await,
            Err(RequestError::EmptyArgs)
        ));

        let big = format!(r#"{{"Args":["{}"#, "x".repeat(MAX_REQUEST_BYTES));
        let mut big: &[u8] = big.as_bytes();
        assert!(matches!(
            read_request(&mut big).await,
            Err(RequestError::TooLarge)
        ));
    }

    #[test]
    fn test_env_pairs_skip_malformed() {
        let request = ExecRequest {
            args: vec!["env".to_string()],
            env: vec![
                "GOOD=yes".to_string(),
                "novalue".to_string(),
                "=nokey".to_string(),
                "EMPTY=".to_string(),
            ],
        };
        assert_eq!(
            request.env_pairs(),
            vec![
                ("GOOD".to_string(), "yes".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_echo_hello_round_trip() {
        let output = run_session(br#"{"Args":["echo","hello"],"Env":[]}"#).await;
        assert!(output.contains("hello\r\n"), "{output:?}");
    }

    #[tokio::test]
    async fn test_env_reaches_process() {
        let output = run_session(
            br#"{"Args":["sh","-c","echo value=$RUNXD_TEST_VAR"],"Env":["RUNXD_TEST_VAR=xyz"]}"#,
        )
        .await;
        assert!(output.contains("value=xyz"), "{output:?}");
    }

    #[tokio::test]
    async fn test_buffered_input_reaches_pty() {
        let output = run_session(b"{\"Args\":[\"head\",\"-n\",\"1\"]}from-the-peer\n").await;
        assert!(output.contains("from-the-peer"), "{output:?}");
    }

    #[tokio::test]
    async fn test_output_drained_after_exit() {
        let output = run_session(br#"{"Args":["seq","1","20000"]}"#).await;
        assert!(output.starts_with("1\r\n2\r\n"), "{output:.40}");
        assert!(output.ends_with("19999\r\n20000\r\n"), "output was {} bytes", output.len());
    }

    #[tokio::test]
    async fn test_start_failure_reported_to_peer() {
        let output = run_session(br#"{"Args":["/nonexistent/runxd-test-binary"]}"#).await;
        assert!(!output.is_empty());
        assert!(output.to_lowercase().contains("no such file"), "{output:?}");
    }

    async fn abandon_session(payload: &[u8]) -> Duration {
        let (mut client, server) = duplex(64 * 1024);
        let bridge = ExecBridge::new(24, 80);
        let session = tokio::spawn(async move { bridge.serve(server).await });

        client.write_all(payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(client);

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("bridge still running after peer closed")
            .unwrap();
        started.elapsed()
    }

    #[tokio::test]
    async fn test_peer_close_ends_running_process() {
        let elapsed = abandon_session(br#"{"Args":["cat"],"Env":[]}"#).await;
        assert!(elapsed < HANGUP_GRACE, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_peer_close_kills_process_ignoring_hangup() {
        let elapsed =
            abandon_session(br#"{"Args":["sh","-c","trap '' HUP; sleep 30"],"Env":[]}"#).await;
        assert!(elapsed >= HANGUP_GRACE, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_output() {
        let output = run_session(b"{\"Args\": nope}").await;
        assert!(output.is_empty(), "{output:?}");
    }
}

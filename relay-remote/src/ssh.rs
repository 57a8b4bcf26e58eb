use crate::error::{RemoteError, Result};
use crate::hostkey::{HostKeyCheck, HostKeyFingerprint, HostKeyVerifier};
use crate::shell::{ShellEndpoint, ShellEvent, ShellHandle, ShellInput};
use crate::traits::{AuthMaterial, ConnectRequest, RemoteConnection, RemoteConnector};
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, HashType, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const PUMP_IDLE_SLEEP: Duration = Duration::from_millis(25);
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT_MS: u32 = 5_000;
const PTY_TERM: &str = "xterm";
const PTY_DIMENSIONS: (u32, u32, u32, u32) = (120, 40, 0, 0);

/// libssh2-backed connector. Blocking work runs on the tokio blocking pool;
/// each open shell is pumped by a dedicated thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Connector;

struct Ssh2Connection {
    host: String,
    session: Session,
    host_key: HostKeyCheck,
}

#[async_trait]
impl RemoteConnector for Ssh2Connector {
    #[tracing::instrument(level = "info", skip_all, fields(host = %request.host, port = request.port))]
    async fn connect(
        &self,
        request: &ConnectRequest,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> Result<Box<dyn RemoteConnection>> {
        let request = request.clone();
        let connection =
            tokio::task::spawn_blocking(move || connect_blocking(&request, verifier.as_ref()))
                .await
                .map_err(|e| RemoteError::Transport(format!("connect task failed: {e}")))??;
        Ok(Box::new(connection))
    }
}

#[async_trait]
impl RemoteConnection for Ssh2Connection {
    fn host_key(&self) -> &HostKeyCheck {
        &self.host_key
    }

    async fn open_shell(self: Box<Self>) -> Result<ShellHandle> {
        let connection = *self;
        tokio::task::spawn_blocking(move || connection.open_shell_blocking())
            .await
            .map_err(|e| RemoteError::ChannelError(format!("open shell task failed: {e}")))?
    }
}

impl Ssh2Connection {
    fn open_shell_blocking(self) -> Result<ShellHandle> {
        let Ssh2Connection { host, session, .. } = self;
        let mut channel = session.channel_session().map_err(channel_error)?;
        channel
            .request_pty(PTY_TERM, None, Some(PTY_DIMENSIONS))
            .map_err(channel_error)?;
        channel.shell().map_err(channel_error)?;
        session.set_blocking(false);

        let (handle, endpoint) = ShellHandle::pair();
        std::thread::Builder::new()
            .name(format!("shell-pump-{host}"))
            .spawn(move || pump_shell(session, channel, endpoint))
            .map_err(|e| RemoteError::ChannelError(format!("spawn shell pump: {e}")))?;
        tracing::info!(host = %host, "interactive shell opened");
        Ok(handle)
    }
}

fn connect_blocking(request: &ConnectRequest, verifier: &dyn HostKeyVerifier) -> Result<Ssh2Connection> {
    let started = Instant::now();
    let tcp = open_tcp(request, started)?;

    let mut session = Session::new()
        .map_err(|e| RemoteError::Transport(format!("create ssh session: {e}")))?;
    session.set_timeout(millis_u32(remaining_budget(request.connect_timeout, started)?));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| map_session_error(e, request.connect_timeout))?;

    let digest = session
        .host_key_hash(HashType::Sha256)
        .ok_or_else(|| RemoteError::Transport("server presented no host key".to_string()))?;
    let fingerprint = HostKeyFingerprint::from_digest(digest);
    let host_key = verifier
        .verify(&request.host, &fingerprint)
        .into_result(&request.host)?;

    authenticate(&session, request)?;
    Ok(Ssh2Connection {
        host: request.host.clone(),
        session,
        host_key,
    })
}

fn open_tcp(request: &ConnectRequest, started: Instant) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (request.host.as_str(), request.port)
        .to_socket_addrs()
        .map_err(|e| {
            RemoteError::Transport(format!("resolve {}:{}: {e}", request.host, request.port))
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        let remaining = remaining_budget(request.connect_timeout, started)?;
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                last_error = Some(RemoteError::ConnectTimeout(request.connect_timeout));
            }
            Err(e) => {
                last_error = Some(RemoteError::Transport(format!("connect {addr}: {e}")));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        RemoteError::Transport(format!("no addresses resolved for {}", request.host))
    }))
}

fn authenticate(session: &Session, request: &ConnectRequest) -> Result<()> {
    let outcome = match &request.auth {
        AuthMaterial::PrivateKeyFile(path) => {
            if !path.is_file() {
                return Err(RemoteError::AuthFailure(format!(
                    "private key {} is not readable",
                    path.display()
                )));
            }
            session.userauth_pubkey_file(&request.user, None, path, None)
        }
        AuthMaterial::Password(password) => session.userauth_password(&request.user, password),
    };
    if let Err(e) = outcome {
        if is_timeout(&e) {
            return Err(RemoteError::ConnectTimeout(request.connect_timeout));
        }
        return Err(RemoteError::AuthFailure(format!(
            "{} authentication rejected for {}: {}",
            request.auth.method(),
            request.user,
            e.message()
        )));
    }
    if !session.authenticated() {
        return Err(RemoteError::AuthFailure(format!(
            "server did not accept {} authentication for {}",
            request.auth.method(),
            request.user
        )));
    }
    Ok(())
}

enum InputState {
    Open { wrote: bool },
    CloseRequested,
}

#[derive(Debug)]
enum PumpExit {
    RemoteClosed,
    CloseRequested,
    Failed(std::io::Error),
}

fn pump_shell(session: Session, mut channel: Channel, mut endpoint: ShellEndpoint) {
    let mut buf = vec![0_u8; READ_CHUNK_BYTES];
    let exit = loop {
        let mut active = false;

        match drain_inputs(&mut channel, &mut endpoint) {
            Ok(InputState::Open { wrote }) => active |= wrote,
            Ok(InputState::CloseRequested) => break PumpExit::CloseRequested,
            Err(e) => break PumpExit::Failed(e),
        }

        match read_available(&mut channel, &mut buf) {
            Ok(Some(bytes)) => {
                active = true;
                if endpoint.events.send(ShellEvent::Stdout(bytes)).is_err() {
                    break PumpExit::CloseRequested;
                }
            }
            Ok(None) => {}
            Err(e) => break PumpExit::Failed(e),
        }

        match read_available(&mut channel.stderr(), &mut buf) {
            Ok(Some(bytes)) => {
                active = true;
                if endpoint.events.send(ShellEvent::Stderr(bytes)).is_err() {
                    break PumpExit::CloseRequested;
                }
            }
            Ok(None) => {}
            Err(e) => break PumpExit::Failed(e),
        }

        if channel.eof() {
            break PumpExit::RemoteClosed;
        }
        if !active {
            std::thread::sleep(PUMP_IDLE_SLEEP);
        }
    };

    match &exit {
        PumpExit::Failed(e) => tracing::warn!(error = %e, "shell pump failed"),
        other => tracing::debug!(exit = ?other, "shell pump finished"),
    }
    shutdown_channel(&session, &mut channel);
    let _ = endpoint.events.send(ShellEvent::Closed);
}

fn drain_inputs(channel: &mut Channel, endpoint: &mut ShellEndpoint) -> std::io::Result<InputState> {
    let mut wrote = false;
    loop {
        match endpoint.inputs.try_recv() {
            Ok(ShellInput::Data(bytes)) => {
                write_all_nonblocking(channel, &bytes)?;
                wrote = true;
            }
            Ok(ShellInput::Close) | Err(TryRecvError::Disconnected) => {
                return Ok(InputState::CloseRequested);
            }
            Err(TryRecvError::Empty) => return Ok(InputState::Open { wrote }),
        }
    }
}

fn read_available<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<Option<Vec<u8>>> {
    match reader.read(buf) {
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(buf[..n].to_vec())),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_all_nonblocking(channel: &mut Channel, mut bytes: &[u8]) -> std::io::Result<()> {
    let stalled_since = Instant::now();
    while !bytes.is_empty() {
        match channel.write(bytes) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "shell channel accepted no bytes",
                ));
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if stalled_since.elapsed() >= WRITE_STALL_LIMIT {
                    return Err(std::io::Error::new(
                        ErrorKind::TimedOut,
                        "shell channel write stalled",
                    ));
                }
                std::thread::sleep(PUMP_IDLE_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }
    loop {
        match channel.flush() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(PUMP_IDLE_SLEEP),
            Err(e) => return Err(e),
        }
    }
}

fn shutdown_channel(session: &Session, channel: &mut Channel) {
    session.set_blocking(true);
    session.set_timeout(CLOSE_TIMEOUT_MS);
    if let Err(e) = channel.send_eof() {
        tracing::debug!(error = %e, "send_eof failed during shell shutdown");
    }
    if let Err(e) = channel.close() {
        tracing::debug!(error = %e, "channel close failed during shell shutdown");
    }
    if let Err(e) = channel.wait_close() {
        tracing::debug!(error = %e, "wait_close failed during shell shutdown");
    }
    if let Err(e) = session.disconnect(None, "session closed", None) {
        tracing::debug!(error = %e, "ssh disconnect failed during shell shutdown");
    }
}

fn remaining_budget(total: Duration, started: Instant) -> Result<Duration> {
    let remaining = total.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Err(RemoteError::ConnectTimeout(total));
    }
    Ok(remaining)
}

fn millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn is_timeout(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_TIMEOUT)
    )
}

fn map_session_error(e: ssh2::Error, connect_timeout: Duration) -> RemoteError {
    if is_timeout(&e) {
        return RemoteError::ConnectTimeout(connect_timeout);
    }
    RemoteError::Transport(format!("ssh handshake failed: {}", e.message()))
}

fn channel_error(e: ssh2::Error) -> RemoteError {
    RemoteError::ChannelError(e.message().to_string())
}

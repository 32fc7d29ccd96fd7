//! Streaming transport: TCP connection upgraded to TLS, tagged writes.
//!
//! Each connection runs in its own session task, which owns the socket and
//! processes commands (secure, write, graceful close) in the order they were
//! issued. Progress is reported through the [`EventHandler`]: `Connected`,
//! `Secured`, one `Wrote(tag)` per flushed write, and exactly one
//! `Disconnected` per session.
//!
//! Session state lives behind a mutex shared by the handle and the task. The
//! task only reports while its session is still current, and `disconnect`
//! retires the session under the same lock, so a session can never report
//! after it has been declared disconnected.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::buffer::Tag;
use crate::error::DeliveryError;
use crate::tls::{self, TrustPolicy};
use crate::transport::{EventHandler, Transport, TransportEvent};

/// Connection state of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
    Secure,
}

#[derive(Debug)]
enum Command {
    Secure,
    Write {
        frame: Vec<u8>,
        tag: Tag,
        timeout: Duration,
    },
    DisconnectAfterWriting,
}

struct Session {
    id: u64,
    state: SessionState,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Forget the current session without reporting anything.
    fn retire(&mut self) -> bool {
        if self.state == SessionState::NotConnected {
            return false;
        }
        self.state = SessionState::NotConnected;
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        true
    }
}

/// TCP + TLS transport to a stream collector.
pub struct StreamTransport {
    host: String,
    port: u16,
    timeout: Duration,
    connector: TlsConnector,
    events: EventHandler,
    session: Arc<Mutex<Session>>,
}

impl StreamTransport {
    /// Create a transport for `host:port`.
    ///
    /// `timeout` bounds the TCP connect and the TLS handshake.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        policy: TrustPolicy,
        events: EventHandler,
    ) -> Result<Self, DeliveryError> {
        Ok(Self {
            host: host.into(),
            port,
            timeout,
            connector: tls::connector(policy)?,
            events,
            session: Arc::new(Mutex::new(Session {
                id: 0,
                state: SessionState::NotConnected,
                commands: None,
                task: None,
            })),
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    /// Start the TLS upgrade of the open connection.
    pub fn secure(&self) {
        let session = self.session.lock();
        match (&session.commands, session.state) {
            (Some(commands), SessionState::Connecting | SessionState::Connected) => {
                let _ = commands.send(Command::Secure);
            }
            (_, state) => warn!(state = ?state, "Cannot start TLS, no open connection"),
        }
    }

    /// Queue a tagged write on the secure channel.
    ///
    /// When the channel is not secure the write is skipped and only logged;
    /// callers check [`Transport::is_secure`] first.
    pub fn write(&self, frame: Vec<u8>, tag: Tag, timeout: Duration) {
        let session = self.session.lock();
        match (&session.commands, session.state) {
            (Some(commands), SessionState::Secure) => {
                let _ = commands.send(Command::Write {
                    frame,
                    tag,
                    timeout,
                });
            }
            (_, state) => warn!(
                tag = %tag,
                state = ?state,
                error = %DeliveryError::WriteSkipped,
                "Collector connection was not secure, could not send record"
            ),
        }
    }
}

impl Transport for StreamTransport {
    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Secure
        )
    }

    fn is_secure(&self) -> bool {
        self.state() == SessionState::Secure
    }

    fn connect(&self) -> Result<(), DeliveryError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| DeliveryError::Connect {
            addr: format!("{}:{}", self.host, self.port),
            reason: e.to_string(),
        })?;

        let mut session = self.session.lock();
        if session.state != SessionState::NotConnected {
            return Ok(());
        }

        session.id += 1;
        session.state = SessionState::Connecting;
        let (tx, rx) = mpsc::unbounded_channel();
        session.commands = Some(tx);

        let ctx = SessionContext {
            id: session.id,
            host: self.host.clone(),
            port: self.port,
            timeout: self.timeout,
            connector: self.connector.clone(),
            events: Arc::clone(&self.events),
            session: Arc::clone(&self.session),
        };
        debug!(host = %self.host, port = self.port, session = session.id, "Connecting to collector");
        session.task = Some(runtime.spawn(run_session(ctx, rx)));
        Ok(())
    }

    fn disconnect(&self) {
        let mut session = self.session.lock();
        if session.retire() {
            debug!(session = session.id, "Disconnected from collector");
            (self.events)(TransportEvent::Disconnected(None));
        }
    }

    fn disconnect_after_pending_writes(&self) {
        let session = self.session.lock();
        if let Some(commands) = &session.commands {
            let _ = commands.send(Command::DisconnectAfterWriting);
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.session.lock().retire();
    }
}

/// Everything a session task needs, detached from the handle.
struct SessionContext {
    id: u64,
    host: String,
    port: u16,
    timeout: Duration,
    connector: TlsConnector,
    events: EventHandler,
    session: Arc<Mutex<Session>>,
}

impl SessionContext {
    /// Move to `state` and report `event`, if this session is still current.
    fn advance(&self, state: SessionState, event: TransportEvent) -> bool {
        let mut session = self.session.lock();
        if session.id != self.id || session.state == SessionState::NotConnected {
            return false;
        }
        session.state = state;
        (self.events)(event);
        true
    }

    fn report(&self, event: TransportEvent) -> bool {
        let session = self.session.lock();
        if session.id != self.id || session.state == SessionState::NotConnected {
            return false;
        }
        (self.events)(event);
        true
    }

    fn finish(&self, error: Option<DeliveryError>) {
        let mut session = self.session.lock();
        if session.id != self.id || session.state == SessionState::NotConnected {
            return;
        }
        session.state = SessionState::NotConnected;
        session.commands = None;
        // The task is finishing on its own; dropping the handle detaches it.
        session.task = None;
        match &error {
            Some(err) => warn!(error = %err, session = self.id, "Collector connection closed with error"),
            None => debug!(session = self.id, "Collector connection closed"),
        }
        (self.events)(TransportEvent::Disconnected(error));
    }
}

enum Channel {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

async fn run_session(ctx: SessionContext, mut commands: mpsc::UnboundedReceiver<Command>) {
    let outcome = drive(&ctx, &mut commands).await;
    ctx.finish(outcome.err());
}

async fn drive(
    ctx: &SessionContext,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), DeliveryError> {
    let addr = format!("{}:{}", ctx.host, ctx.port);
    let tcp = match timeout(ctx.timeout, TcpStream::connect((ctx.host.as_str(), ctx.port))).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            return Err(DeliveryError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(DeliveryError::Connect {
                addr,
                reason: format!("timed out after {:?}", ctx.timeout),
            })
        }
    };
    debug!(addr = %addr, session = ctx.id, "Connected to collector");
    if !ctx.advance(SessionState::Connected, TransportEvent::Connected) {
        return Ok(());
    }

    let mut channel = Channel::Plain(tcp);
    while let Some(command) = commands.recv().await {
        match command {
            Command::Secure => {
                channel = match channel {
                    Channel::Plain(tcp) => Channel::Tls(Box::new(handshake(ctx, tcp).await?)),
                    secure => secure,
                };
                debug!(host = %ctx.host, session = ctx.id, "Collector connection secured");
                if !ctx.advance(SessionState::Secure, TransportEvent::Secured) {
                    return Ok(());
                }
            }
            Command::Write {
                frame,
                tag,
                timeout: write_timeout,
            } => match &mut channel {
                Channel::Tls(stream) => {
                    write_frame(stream, &frame, write_timeout).await?;
                    if !ctx.report(TransportEvent::Wrote(tag)) {
                        return Ok(());
                    }
                }
                Channel::Plain(_) => {
                    warn!(tag = %tag, "Collector connection was not secure, could not send record");
                }
            },
            Command::DisconnectAfterWriting => {
                // Every earlier write has completed by the time this runs.
                let closed = match &mut channel {
                    Channel::Tls(stream) => stream.shutdown().await,
                    Channel::Plain(tcp) => tcp.shutdown().await,
                };
                if let Err(e) = closed {
                    debug!(error = %e, "Error while closing collector connection");
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn handshake(
    ctx: &SessionContext,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, DeliveryError> {
    let name = tls::server_name(&ctx.host)?;
    match timeout(ctx.timeout, ctx.connector.connect(name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(DeliveryError::Handshake {
            host: ctx.host.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(DeliveryError::Handshake {
            host: ctx.host.clone(),
            reason: format!("timed out after {:?}", ctx.timeout),
        }),
    }
}

async fn write_frame(
    stream: &mut TlsStream<TcpStream>,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), DeliveryError> {
    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };
    match timeout(write_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::Io(e.to_string())),
        Err(_) => Err(DeliveryError::Io(format!(
            "write timed out after {:?}",
            write_timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn recording_handler() -> (EventHandler, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (handler, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connection_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (handler, mut rx) = recording_handler();
        let transport = StreamTransport::new(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            TrustPolicy::AllowUntrusted,
            handler,
        )
        .unwrap();

        transport.connect().unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Disconnected(Some(err)) => assert!(err.is_connection_error()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!transport.is_connected());
        assert_eq!(transport.state(), SessionState::NotConnected);
    }

    #[tokio::test]
    async fn test_write_skipped_when_not_secure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let (handler, mut rx) = recording_handler();
        let transport = StreamTransport::new(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            TrustPolicy::AllowUntrusted,
            handler,
        )
        .unwrap();

        transport.connect().unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert!(transport.is_connected());
        assert!(!transport.is_secure());

        transport.write(b"{}\n".to_vec(), Tag::new(1), Duration::from_secs(1));
        transport.disconnect();

        // Only the explicit disconnect is reported, never a write.
        assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(None));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_reports_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let (handler, mut rx) = recording_handler();
        let transport = StreamTransport::new(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            TrustPolicy::AllowUntrusted,
            handler,
        )
        .unwrap();

        transport.connect().unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        transport.disconnect();
        transport.disconnect();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected(None));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_with_plain_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            // Accept and never speak TLS.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let (handler, mut rx) = recording_handler();
        let transport = StreamTransport::new(
            "127.0.0.1",
            port,
            Duration::from_millis(250),
            TrustPolicy::AllowUntrusted,
            handler,
        )
        .unwrap();

        transport.connect().unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        transport.secure();

        match next_event(&mut rx).await {
            TransportEvent::Disconnected(Some(DeliveryError::Handshake { reason, .. })) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!transport.is_secure());
    }
}

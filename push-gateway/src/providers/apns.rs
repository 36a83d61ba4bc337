/// APNS client
///
/// Speaks the binary push interface over a pool of TLS connections and
/// consumes the out-of-band feedback channel. The provider only answers
/// on failure: a successful socket write completes `(ok, ident)`, while an
/// error-response frame completes `(err, ident)` and is followed by the
/// remote closing the connection.
use std::io::{self, Cursor};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::{Completion, CompletionSender, FeedbackEvent, FeedbackSender, PushClient};
use crate::models::ProviderKind;

/// Notification frame command byte.
const FRAME_COMMAND: u8 = 2;
/// Error-response frame command byte.
const ERROR_COMMAND: u8 = 8;
/// Error-response frame size: command, status, identifier.
const ERROR_FRAME_LEN: usize = 6;
/// Immediate delivery.
const DEFAULT_PRIORITY: u8 = 10;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Provider endpoints for the push and feedback channels.
#[derive(Debug, Clone)]
pub struct ApnsEndpoints {
    pub push_host: &'static str,
    pub push_port: u16,
    pub feedback_host: &'static str,
    pub feedback_port: u16,
}

impl ApnsEndpoints {
    pub fn production() -> Self {
        Self {
            push_host: "gateway.push.apple.com",
            push_port: 2195,
            feedback_host: "feedback.push.apple.com",
            feedback_port: 2196,
        }
    }

    pub fn sandbox() -> Self {
        Self {
            push_host: "gateway.sandbox.push.apple.com",
            push_port: 2195,
            feedback_host: "feedback.sandbox.push.apple.com",
            feedback_port: 2196,
        }
    }
}

/// Byte stream the client runs over.
pub trait ApnsIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ApnsIo for T {}

/// Produces connections for the push or feedback channel. Tests inject an
/// in-memory duplex; production uses [`TlsApnsConnector`].
#[async_trait]
pub trait ApnsConnector: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn ApnsIo>>;
}

/// TLS connector authenticated with the push certificate.
pub struct TlsApnsConnector {
    host: String,
    port: u16,
    tls: tokio_native_tls::TlsConnector,
}

impl TlsApnsConnector {
    pub fn from_p12(
        host: &str,
        port: u16,
        p12_path: &str,
        password: &str,
    ) -> anyhow::Result<Self> {
        let der = std::fs::read(p12_path)?;
        let identity = native_tls::Identity::from_pkcs12(&der, password)?;
        let tls = native_tls::TlsConnector::builder()
            .identity(identity)
            .build()?;
        Ok(Self {
            host: host.to_string(),
            port,
            tls: tls.into(),
        })
    }
}

#[async_trait]
impl ApnsConnector for TlsApnsConnector {
    async fn connect(&self) -> io::Result<Box<dyn ApnsIo>> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let stream = self
            .tls
            .connect(&self.host, tcp)
            .await
            .map_err(io::Error::other)?;
        info!("apns connection to {}:{} established", self.host, self.port);
        Ok(Box::new(stream))
    }
}

/// Build a notification frame: command byte, frame length, then the
/// token, payload, identifier, expiration and priority items.
fn build_frame(
    token: &[u8],
    payload: &[u8],
    ident: u32,
    expiry: u32,
    priority: u8,
) -> io::Result<Vec<u8>> {
    let mut items = Vec::with_capacity(token.len() + payload.len() + 32);
    WriteBytesExt::write_u8(&mut items, 1)?;
    WriteBytesExt::write_u16::<BigEndian>(&mut items, token.len() as u16)?;
    std::io::Write::write_all(&mut items, token)?;
    WriteBytesExt::write_u8(&mut items, 2)?;
    WriteBytesExt::write_u16::<BigEndian>(&mut items, payload.len() as u16)?;
    std::io::Write::write_all(&mut items, payload)?;
    WriteBytesExt::write_u8(&mut items, 3)?;
    WriteBytesExt::write_u16::<BigEndian>(&mut items, 4)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut items, ident)?;
    WriteBytesExt::write_u8(&mut items, 4)?;
    WriteBytesExt::write_u16::<BigEndian>(&mut items, 4)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut items, expiry)?;
    WriteBytesExt::write_u8(&mut items, 5)?;
    WriteBytesExt::write_u16::<BigEndian>(&mut items, 1)?;
    WriteBytesExt::write_u8(&mut items, priority)?;

    let mut frame = Vec::with_capacity(items.len() + 5);
    WriteBytesExt::write_u8(&mut frame, FRAME_COMMAND)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut frame, items.len() as u32)?;
    std::io::Write::write_all(&mut frame, &items)?;
    Ok(frame)
}

/// Parse an error-response frame into `(status, ident)`.
fn parse_error_frame(buf: &[u8]) -> io::Result<(u8, u32)> {
    let mut cursor = Cursor::new(buf);
    let command = ReadBytesExt::read_u8(&mut cursor)?;
    if command != ERROR_COMMAND {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected apns response command {command}"),
        ));
    }
    let status = ReadBytesExt::read_u8(&mut cursor)?;
    let ident = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
    Ok((status, ident))
}

/// Provider status codes of the error-response frame.
fn error_reason(status: u8) -> &'static str {
    match status {
        0 => "no errors encountered",
        1 => "processing error",
        2 => "missing device token",
        3 => "missing topic",
        4 => "missing payload",
        5 => "invalid token size",
        6 => "invalid topic size",
        7 => "invalid payload size",
        8 => "invalid token",
        10 => "shutdown",
        _ => "unknown error",
    }
}

struct PostCommand {
    frame: Vec<u8>,
    ident: u32,
}

/// Pooled binary push client.
pub struct ApnsClient {
    queue: mpsc::UnboundedSender<PostCommand>,
    completions: CompletionSender,
}

impl ApnsClient {
    /// Spawns `pool_size` connection workers sharing one submission queue.
    pub fn new(
        connector: Arc<dyn ApnsConnector>,
        pool_size: usize,
        completions: CompletionSender,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..pool_size.max(1) {
            tokio::spawn(run_worker(
                worker,
                connector.clone(),
                rx.clone(),
                completions.clone(),
            ));
        }
        Self { queue, completions }
    }

    fn fail(&self, ident: u32, reason: String) {
        let _ = self.completions.send(Completion {
            kind: ProviderKind::Apns,
            ident,
            error: Some(reason),
        });
    }
}

#[async_trait]
impl PushClient for ApnsClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Apns
    }

    async fn post(&self, token: &str, payload: &str, expiry: u32, ident: u32) {
        let raw_token = match BASE64.decode(token) {
            Ok(raw) => raw,
            Err(e) => {
                self.fail(ident, format!("invalid device token encoding: {e}"));
                return;
            }
        };
        let frame = match build_frame(
            &raw_token,
            payload.as_bytes(),
            ident,
            expiry,
            DEFAULT_PRIORITY,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(ident, format!("frame encoding failed: {e}"));
                return;
            }
        };
        if self.queue.send(PostCommand { frame, ident }).is_err() {
            self.fail(ident, "connection pool closed".to_string());
        }
    }
}

async fn run_worker(
    worker: usize,
    connector: Arc<dyn ApnsConnector>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<PostCommand>>>,
    completions: CompletionSender,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        let stream = match connector.connect().await {
            Ok(stream) => {
                backoff = RECONNECT_MIN;
                stream
            }
            Err(e) => {
                warn!("apns worker {} failed to connect: {}", worker, e);
                sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        let (mut rd, mut wr) = tokio::io::split(stream);
        loop {
            tokio::select! {
                cmd = async { queue.lock().await.recv().await } => {
                    let Some(cmd) = cmd else {
                        // Client dropped; nothing left to submit.
                        return;
                    };
                    if let Err(e) = wr.write_all(&cmd.frame).await {
                        warn!("apns worker {} write failed: {}", worker, e);
                        let _ = completions.send(Completion {
                            kind: ProviderKind::Apns,
                            ident: cmd.ident,
                            error: Some(format!("connection write failed: {e}")),
                        });
                        break;
                    }
                    let _ = completions.send(Completion {
                        kind: ProviderKind::Apns,
                        ident: cmd.ident,
                        error: None,
                    });
                }
                frame = read_error_frame(&mut rd) => {
                    match frame {
                        Ok((status, ident)) => {
                            warn!(
                                "apns error response: {} (status {}, ident {})",
                                error_reason(status), status, ident
                            );
                            let _ = completions.send(Completion {
                                kind: ProviderKind::Apns,
                                ident,
                                error: Some(error_reason(status).to_string()),
                            });
                        }
                        Err(e) => debug!("apns worker {} connection closed: {}", worker, e),
                    }
                    // The remote closes the connection after an error frame.
                    break;
                }
            }
        }
    }
}

async fn read_error_frame<R: AsyncRead + Unpin>(rd: &mut R) -> io::Result<(u8, u32)> {
    let mut buf = [0u8; ERROR_FRAME_LEN];
    rd.read_exact(&mut buf).await?;
    parse_error_frame(&buf)
}

/// Feedback channel reader.
///
/// Streams `(time, token)` unsubscribe records into the consumer; a remote
/// close surfaces as [`FeedbackEvent::Shutdown`] and triggers a reconnect
/// with backoff.
pub struct ApnsFeedback {
    connector: Arc<dyn ApnsConnector>,
    events: FeedbackSender,
}

impl ApnsFeedback {
    pub fn new(connector: Arc<dyn ApnsConnector>, events: FeedbackSender) -> Self {
        Self { connector, events }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(run_feedback(self.connector, self.events))
    }
}

async fn run_feedback(connector: Arc<dyn ApnsConnector>, events: FeedbackSender) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match connector.connect().await {
            Ok(mut stream) => {
                backoff = RECONNECT_MIN;
                if let Err(e) = read_feedback_records(&mut stream, &events).await {
                    debug!("apns feedback channel closed: {}", e);
                }
                if events.send(FeedbackEvent::Shutdown).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("apns feedback connection failed: {}", e);
            }
        }
        if events.is_closed() {
            return;
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

async fn read_feedback_records(
    stream: &mut Box<dyn ApnsIo>,
    events: &FeedbackSender,
) -> io::Result<()> {
    loop {
        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await?;
        let seconds = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let token_len = u16::from_be_bytes([header[4], header[5]]) as usize;

        let mut token = vec![0u8; token_len];
        stream.read_exact(&mut token).await?;

        let time = Utc
            .timestamp_opt(i64::from(seconds), 0)
            .single()
            .unwrap_or_else(Utc::now);
        if events.send(FeedbackEvent::Unsubscribed { token, time }).is_err() {
            return Ok(());
        }
    }
}

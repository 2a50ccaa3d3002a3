//! Icecast SOURCE client
//!
//! A long-lived upload whose request body is the encoder's output. Chunks
//! that arrive while the connection is down wait in a drop-oldest queue and
//! are flushed in order once the server accepts the next connection.
//!
//! ```text
//! Disconnected --connect--> Connecting --2xx--> Connected
//!      ^                        |                   |
//!      +------- failure --------+------- failure ---+
//!      (reconnect after backoff)
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::endpoint::IcecastEndpoint;
use super::queue::OutboundQueue;
use super::{NetworkSinkOptions, OutputSink, SinkError};

/// Socket, handshake and drain timeout
const TIMEOUT: Duration = Duration::from_secs(30);

/// Chunks the request body may hold before the transport counts as full
const SEND_BUFFER_CHUNKS: usize = 32;

/// How long a live connection gets to take the backlog after `close`
const CLOSE_GRACE: Duration = Duration::from_secs(2);

const CLIENT_NAME: &str = "Voice Relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Upload request issued
    Connect,
    /// Server answered 2xx
    HandshakeOk,
    /// Non-2xx, transport error, timeout or close
    Failed,
}

impl ConnectionState {
    pub fn next(self, event: LinkEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::Disconnected, LinkEvent::Connect) => ConnectionState::Connecting,
            (ConnectionState::Connecting, LinkEvent::HandshakeOk) => ConnectionState::Connected,
            (_, LinkEvent::Failed) => ConnectionState::Disconnected,
            (state, _) => state,
        }
    }
}

/// Connection bookkeeping: state, queue, backoff and the drain flag.
/// Transport agnostic; the driver feeds it events and a send buffer.
#[derive(Debug)]
pub struct Link {
    state: ConnectionState,
    queue: OutboundQueue,
    backoff: Backoff,
    waiting_for_drain: bool,
}

impl Link {
    pub fn new(options: &NetworkSinkOptions) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            queue: OutboundQueue::new(options.max_buffer_bytes),
            backoff: Backoff::new(options.base_delay, options.max_delay),
            waiting_for_drain: false,
        }
    }

    /// Apply a transition. Returns the reconnect delay when the link drops.
    pub fn apply(&mut self, event: LinkEvent) -> Option<Duration> {
        self.state = self.state.next(event);
        match event {
            LinkEvent::Connect => {
                self.waiting_for_drain = false;
                None
            }
            LinkEvent::HandshakeOk => {
                self.backoff.reset();
                self.waiting_for_drain = false;
                None
            }
            LinkEvent::Failed => {
                self.waiting_for_drain = false;
                Some(self.backoff.next_delay())
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_waiting_for_drain(&self) -> bool {
        self.waiting_for_drain
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn enqueue(&mut self, chunk: Bytes) {
        let dropped = self.queue.push(chunk);
        if dropped > 0 {
            warn!(
                "Icecast buffer full, dropped {} kB ({} bytes queued)",
                dropped / 1024,
                self.queue.total_bytes()
            );
        }
    }

    fn requeue(&mut self, chunk: Bytes) {
        let dropped = self.queue.push_front(chunk);
        if dropped > 0 {
            warn!("Icecast buffer full, dropped {} kB", dropped / 1024);
        }
    }

    /// Send directly when connected and not waiting for drain, else queue
    pub fn write(&mut self, chunk: Bytes, tx: &mpsc::Sender<Bytes>) -> Result<(), SinkError> {
        if self.state != ConnectionState::Connected || self.waiting_for_drain {
            self.enqueue(chunk);
            return Ok(());
        }
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => {
                self.enqueue(chunk);
                self.waiting_for_drain = true;
                Ok(())
            }
            Err(TrySendError::Closed(chunk)) => {
                self.requeue(chunk);
                Err(SinkError::Closed)
            }
        }
    }

    /// Push the backlog out in FIFO order until the transport fills up
    pub fn flush(&mut self, tx: &mpsc::Sender<Bytes>) -> Result<(), SinkError> {
        if self.state != ConnectionState::Connected || self.waiting_for_drain {
            return Ok(());
        }
        while let Some(chunk) = self.queue.pop_front() {
            match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.requeue(chunk);
                    self.waiting_for_drain = true;
                    break;
                }
                Err(TrySendError::Closed(chunk)) => {
                    self.requeue(chunk);
                    return Err(SinkError::Closed);
                }
            }
        }
        Ok(())
    }

    /// The transport has room again: resume and flush the backlog
    pub fn on_drain(&mut self, tx: &mpsc::Sender<Bytes>) -> Result<(), SinkError> {
        self.waiting_for_drain = false;
        self.flush(tx)
    }
}

/// Handle to the background connection task
pub struct NetworkSink {
    commands: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    destroyed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkSink {
    /// Parse the target and start connecting. Only a malformed URL fails here;
    /// everything after that is retried.
    pub fn connect(raw_url: &str, options: NetworkSinkOptions) -> Result<Self, SinkError> {
        let endpoint = IcecastEndpoint::parse(raw_url)?;
        let client = Client::builder()
            .connect_timeout(TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .tcp_nodelay(true)
            .build()?;
        let headers = source_headers(&options)?;

        let (commands, rx) = mpsc::unbounded_channel();
        let link = Link::new(&options);
        let task = tokio::spawn(drive(link, endpoint, client, headers, rx));

        Ok(Self {
            commands: Mutex::new(Some(commands)),
            destroyed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

impl OutputSink for NetworkSink {
    fn write(&self, chunk: Bytes) {
        if self.destroyed.load(Ordering::SeqCst) || chunk.is_empty() {
            return;
        }
        if let Some(commands) = self.commands.lock().as_ref() {
            let _ = commands.send(chunk);
        }
    }

    /// Ends the input. A live connection gets `CLOSE_GRACE` to take what is
    /// queued; a pending connect or reconnect timer is dropped at once along
    /// with the queue.
    fn close(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.commands.lock().take();
        info!("Icecast client closing");
    }

    fn take_writer(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn source_headers(options: &NetworkSinkOptions) -> Result<HeaderMap, SinkError> {
    let value = |s: &str| {
        HeaderValue::from_str(s).map_err(|e| SinkError::InvalidUrl(format!("bad header value: {}", e)))
    };

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_NAME));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
    headers.insert("ice-public", HeaderValue::from_static("0"));
    headers.insert("ice-name", value(&options.stream_name)?);
    headers.insert("ice-description", value(&options.stream_description)?);
    Ok(headers)
}

/// An accepted upload: the body sender and the server's response
struct Connection {
    body: mpsc::Sender<Bytes>,
    response: Response,
}

async fn drive(
    mut link: Link,
    endpoint: IcecastEndpoint,
    client: Client,
    headers: HeaderMap,
    mut commands: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        link.apply(LinkEvent::Connect);
        info!("Connecting to Icecast {}...", endpoint.safe_url());

        let outcome = match open(&client, &endpoint, &headers, &mut link, &mut commands).await {
            Ok(connection) => {
                info!(
                    "Icecast connected (status {})",
                    connection.response.status().as_u16()
                );
                link.apply(LinkEvent::HandshakeOk);
                stream(connection, &mut link, &mut commands).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Err(SinkError::InputClosed) | Ok(()) => {
                debug!("Icecast input closed, stopping");
                return;
            }
            Err(SinkError::Rejected(status)) => {
                error!("Icecast refused the connection (status {})", status)
            }
            Err(SinkError::Closed) => warn!("Icecast connection closed"),
            Err(e) => error!("Icecast error: {}", e),
        }

        let delay = link.apply(LinkEvent::Failed).unwrap_or(TIMEOUT);
        warn!(
            "Icecast {:?}, retrying in {:.1}s...",
            link.state(),
            delay.as_secs_f32()
        );

        let retry = tokio::time::sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                chunk = commands.recv() => match chunk {
                    Some(chunk) => link.enqueue(chunk),
                    None => return,
                },
            }
        }
    }
}

/// Issue the SOURCE request, queueing writes until the server answers
async fn open(
    client: &Client,
    endpoint: &IcecastEndpoint,
    headers: &HeaderMap,
    link: &mut Link,
    commands: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<Connection, SinkError> {
    let method = Method::from_bytes(b"SOURCE").map_err(|e| SinkError::InvalidUrl(e.to_string()))?;
    let (body, body_rx) = mpsc::channel::<Bytes>(SEND_BUFFER_CHUNKS);
    let stream = ReceiverStream::new(body_rx).map(Ok::<_, std::io::Error>);

    let request = client
        .request(method, endpoint.url.clone())
        .headers(headers.clone())
        .basic_auth(&endpoint.username, Some(&endpoint.password))
        .body(reqwest::Body::wrap_stream(stream))
        .send();
    let handshake = tokio::time::timeout(TIMEOUT, request);
    tokio::pin!(handshake);

    loop {
        tokio::select! {
            result = &mut handshake => {
                let response = result.map_err(|_| SinkError::Timeout)??;
                if !response.status().is_success() {
                    return Err(SinkError::Rejected(response.status().as_u16()));
                }
                return Ok(Connection { body, response });
            }
            chunk = commands.recv() => match chunk {
                Some(chunk) => link.enqueue(chunk),
                None => return Err(SinkError::InputClosed),
            },
        }
    }
}

/// Pump writes into an accepted connection until it fails
async fn stream(
    connection: Connection,
    link: &mut Link,
    commands: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), SinkError> {
    let Connection { body, mut response } = connection;
    let mut drain_deadline: Option<Instant> = None;
    // Icecast answers with an empty body; the upload outlives it
    let mut response_done = false;

    if !link.queue().is_empty() {
        info!(
            "Flushing {} queued chunks ({} bytes) to Icecast",
            link.queue().len(),
            link.queue().total_bytes()
        );
    }
    link.flush(&body)?;
    loop {
        if link.is_waiting_for_drain() {
            drain_deadline.get_or_insert_with(|| Instant::now() + TIMEOUT);
        } else {
            drain_deadline = None;
        }
        let deadline = drain_deadline.unwrap_or_else(|| Instant::now() + TIMEOUT);

        tokio::select! {
            chunk = commands.recv() => match chunk {
                Some(chunk) => link.write(chunk, &body)?,
                None => break,
            },
            permit = body.reserve(), if link.is_waiting_for_drain() => {
                // hand the reserved slot back before flushing through try_send
                drop(permit.map_err(|_| SinkError::Closed)?);
                link.on_drain(&body)?;
            }
            _ = tokio::time::sleep_until(deadline), if drain_deadline.is_some() => {
                return Err(SinkError::Timeout);
            }
            chunk = response.chunk(), if !response_done => match chunk {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("Icecast response body ended, upload continues");
                    response_done = true;
                }
                Err(e) => return Err(SinkError::Http(e)),
            },
        }
    }
    finish(body, link).await
}

/// Input closed on a live connection: hand over the backlog, then end the body
async fn finish(body: mpsc::Sender<Bytes>, link: &mut Link) -> Result<(), SinkError> {
    let backlog = async {
        while let Some(chunk) = link.queue.pop_front() {
            body.send(chunk).await.map_err(|_| SinkError::Closed)?;
        }
        Ok::<_, SinkError>(())
    };
    let handed_over = tokio::time::timeout(CLOSE_GRACE, backlog).await;
    match handed_over {
        Ok(result) => result?,
        Err(_) => warn!(
            "Icecast did not take the last {} bytes before close",
            link.queue.total_bytes()
        ),
    }
    debug!("Icecast upload finished");
    Ok(())
}

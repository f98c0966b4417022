//! Connections to a single endpoint.
//!
//! A [`ConnectionPool`] owns up to `poolsize` live connections. Connections are
//! established lazily until the pool is full and are then handed out round
//! robin; an unhealthy connection is dropped on release and its slot is
//! refilled by a later acquire.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use rama::telemetry::tracing;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, sleep_until, timeout, timeout_at},
};

use crate::codec::{Codec, DecodeError, Request, Response};

/// Pause between two failed connect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(10);

pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// Plain TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &str) -> std::io::Result<Self::Stream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    /// No connection became available within the connect timeout.
    Timeout { endpoint: String },
    Connect {
        endpoint: String,
        attempts: usize,
        source: std::io::Error,
    },
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { endpoint } => write!(f, "connect to {endpoint}: timed out"),
            Self::Connect {
                endpoint,
                attempts,
                source,
            } => write!(f, "connect to {endpoint} ({attempts} attempts): {source}"),
            Self::Closed => write!(f, "connection pool closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum RequestError {
    Timeout,
    Protocol(DecodeError),
    Io(std::io::Error),
    /// the peer closed the connection before a full response arrived
    Closed,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Protocol(err) => err.fmt(f),
            Self::Io(err) => write!(f, "request io: {err}"),
            Self::Closed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DecodeError> for RequestError {
    fn from(err: DecodeError) -> Self {
        Self::Protocol(err)
    }
}

/// Result of one request/response exchange.
#[derive(Debug)]
pub struct Exchange {
    pub response: Response,
    pub sent: usize,
    pub received: usize,
}

#[derive(Debug)]
pub struct Connection<S> {
    id: u64,
    stream: S,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(id: u64, stream: S) -> Self {
        Self {
            id,
            stream,
            write_buf: Vec::with_capacity(1024),
            read_buf: Vec::with_capacity(4096),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends `request` and waits for its response, bounded by `request_timeout`.
    ///
    /// Any error leaves the connection in an unknown state; callers release
    /// it as unhealthy.
    pub async fn execute<C: Codec + ?Sized>(
        &mut self,
        codec: &C,
        request: &Request<'_>,
        request_timeout: Duration,
    ) -> Result<Exchange, RequestError> {
        self.write_buf.clear();
        codec.encode(request, &mut self.write_buf);
        let sent = self.write_buf.len();

        timeout(request_timeout, async {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await?;

            loop {
                if let Some((response, received)) = codec.decode(&self.read_buf)? {
                    self.read_buf.drain(..received);
                    return Ok(Exchange {
                        response,
                        sent,
                        received,
                    });
                }
                if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                    return Err(RequestError::Closed);
                }
            }
        })
        .await
        .map_err(|_| RequestError::Timeout)?
    }
}

/// A connection on loan from a [`ConnectionPool`].
#[derive(Debug)]
pub struct PooledConnection<S> {
    connection: Connection<S>,
    _permit: OwnedSemaphorePermit,
}

impl<S> std::ops::Deref for PooledConnection<S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<S> std::ops::DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

struct Slots<S> {
    idle: VecDeque<Connection<S>>,
    live: usize,
}

/// Slot claimed for a connection being established; given back unless
/// committed, so a failed or cancelled connect does not leak capacity.
struct Reserved<'a, S>(Option<&'a Mutex<Slots<S>>>);

impl<S> Reserved<'_, S> {
    fn commit(mut self) {
        self.0 = None;
    }
}

impl<S> Drop for Reserved<'_, S> {
    fn drop(&mut self) {
        if let Some(slots) = self.0 {
            slots.lock().live -= 1;
        }
    }
}

pub struct ConnectionPool<C: Connector> {
    endpoint: String,
    connector: Arc<C>,
    capacity: usize,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    slots: Mutex<Slots<C::Stream>>,
    next_id: AtomicU64,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<C>,
        capacity: usize,
        connect_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            endpoint: endpoint.into(),
            connector,
            capacity,
            connect_timeout,
            permits: Arc::new(Semaphore::new(capacity)),
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(capacity),
                live: 0,
            }),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of established connections, idle or on loan.
    pub fn live(&self) -> usize {
        self.slots.lock().live
    }

    pub fn idle(&self) -> usize {
        self.slots.lock().idle.len()
    }

    /// Hands out a connection, establishing one while the pool is not full.
    ///
    /// Waiting for a free slot and (re)connecting share one `connect_timeout`
    /// budget; failed connects are retried until it runs out.
    pub async fn acquire(&self) -> Result<PooledConnection<C::Stream>, ConnectionError> {
        let deadline = Instant::now() + self.connect_timeout;

        let permit = timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| ConnectionError::Timeout {
                endpoint: self.endpoint.clone(),
            })?
            .map_err(|_| ConnectionError::Closed)?;

        {
            let mut slots = self.slots.lock();
            if slots.live >= self.capacity {
                if let Some(connection) = slots.idle.pop_front() {
                    return Ok(PooledConnection {
                        connection,
                        _permit: permit,
                    });
                }
            }
            slots.live += 1;
        }

        let reserved = Reserved(Some(&self.slots));
        let stream = self.connect_until(deadline).await?;
        reserved.commit();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint = %self.endpoint, connection = id, "connection established");
        Ok(PooledConnection {
            connection: Connection::new(id, stream),
            _permit: permit,
        })
    }

    async fn connect_until(&self, deadline: Instant) -> Result<C::Stream, ConnectionError> {
        let mut attempts = 0;
        let mut last_err = None;

        loop {
            match timeout_at(deadline, self.connector.connect(&self.endpoint)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => {
                    attempts += 1;
                    tracing::debug!(endpoint = %self.endpoint, attempts, "connect failed: {err}");
                    last_err = Some(err);
                }
                Err(_) => break,
            }

            let retry_at = Instant::now() + RECONNECT_DELAY;
            if retry_at >= deadline {
                break;
            }
            sleep_until(retry_at).await;
        }

        Err(match last_err {
            Some(source) => ConnectionError::Connect {
                endpoint: self.endpoint.clone(),
                attempts,
                source,
            },
            None => ConnectionError::Timeout {
                endpoint: self.endpoint.clone(),
            },
        })
    }

    /// Returns a connection; unhealthy ones are dropped and replaced on a
    /// later acquire.
    pub fn release(&self, connection: PooledConnection<C::Stream>, healthy: bool) {
        let PooledConnection {
            connection,
            _permit,
        } = connection;

        let mut slots = self.slots.lock();
        if healthy {
            slots.idle.push_back(connection);
        } else {
            tracing::debug!(
                endpoint = %self.endpoint,
                connection = connection.id(),
                "drop unhealthy connection",
            );
            slots.live -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    use super::*;
    use crate::{codec::RdsCodec, config::Action};

    /// Answers every request line with the given reply.
    #[derive(Debug)]
    struct ReplyConnector {
        reply: &'static [u8],
        refuse_first: usize,
        attempts: AtomicUsize,
    }

    impl ReplyConnector {
        fn new(reply: &'static [u8]) -> Self {
            Self {
                reply,
                refuse_first: 0,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl Connector for ReplyConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _endpoint: &str) -> std::io::Result<Self::Stream> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.refuse_first {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            let (client, mut server) = tokio::io::duplex(4096);
            let reply = self.reply;
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = server.read(&mut buf).await {
                    if n == 0 || server.write_all(reply).await.is_err() {
                        break;
                    }
                }
            });
            Ok(client)
        }
    }

    /// Accepts connections but never answers.
    #[derive(Debug)]
    struct SilentConnector;

    impl Connector for SilentConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _endpoint: &str) -> std::io::Result<Self::Stream> {
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let _server = server;
                std::future::pending::<()>().await;
            });
            Ok(client)
        }
    }

    fn len_request() -> Request<'static> {
        Request {
            action: Action::Len,
            key: b"key",
            values: b"",
            value_len: 0,
            items: 1,
            element_size: 8,
            watermarks: None,
        }
    }

    #[tokio::test]
    async fn fills_pool_then_round_robins() {
        let connector = Arc::new(ReplyConnector::new(b":0\r\n"));
        let pool = ConnectionPool::new("test:1", connector, 3, Duration::from_secs(1));

        let mut ids = Vec::new();
        for _ in 0..6 {
            let conn = pool.acquire().await.unwrap();
            ids.push(conn.id());
            pool.release(conn, true);
        }
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pool.live(), 3);
        assert_eq!(pool.idle(), 3);
    }

    #[tokio::test]
    async fn unhealthy_connections_are_replaced() {
        let connector = Arc::new(ReplyConnector::new(b":0\r\n"));
        let pool = ConnectionPool::new("test:1", connector, 1, Duration::from_secs(1));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), 0);
        pool.release(conn, false);
        assert_eq!(pool.live(), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), 1);
        pool.release(conn, true);
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn executes_request_over_connection() {
        let connector = Arc::new(ReplyConnector::new(b"-ERR no such key\r\n"));
        let pool = ConnectionPool::new("test:1", connector, 1, Duration::from_secs(1));

        let mut conn = pool.acquire().await.unwrap();
        let exchange = conn
            .execute(&RdsCodec::new(), &len_request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            exchange.response,
            Response::Rejected("ERR no such key".to_owned())
        );
        assert_eq!(exchange.received, 18);
        assert!(exchange.sent > 0);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn retries_refused_connects_within_budget() {
        let connector = Arc::new(ReplyConnector {
            refuse_first: 2,
            ..ReplyConnector::new(b"+OK\r\n")
        });
        let pool = ConnectionPool::new("test:1", connector.clone(), 1, Duration::from_secs(1));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_after_timeout() {
        tokio::time::pause();
        let connector = Arc::new(ReplyConnector {
            refuse_first: usize::MAX,
            ..ReplyConnector::new(b"+OK\r\n")
        });
        let pool = ConnectionPool::new("test:1", connector, 1, Duration::from_millis(100));

        let err = pool.acquire().await.unwrap_err();
        assert!(
            matches!(err, ConnectionError::Connect { attempts, .. } if attempts >= 2),
            "{err}"
        );
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn acquire_waits_for_capacity_up_to_timeout() {
        tokio::time::pause();
        let connector = Arc::new(ReplyConnector::new(b"+OK\r\n"));
        let pool = ConnectionPool::new("test:1", connector, 1, Duration::from_millis(50));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
        pool.release(held, true);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        tokio::time::pause();
        let pool = ConnectionPool::new(
            "test:1",
            Arc::new(SilentConnector),
            1,
            Duration::from_secs(1),
        );

        let mut conn = pool.acquire().await.unwrap();
        let err = conn
            .execute(&RdsCodec::new(), &len_request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout));
        pool.release(conn, false);
        assert_eq!(pool.live(), 0);
    }
}

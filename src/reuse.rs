//! Reused connections without pipelining.
//!
//! A [`ReusableConn`] carries at most one exchange at a time. Between
//! exchanges it sits in the transport's idle pool with a running idle
//! timer; the timer and the pool race for the connection and exactly one
//! of them wins.

use crate::codec::MsgCodec;
use crate::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Deadline covering the write and the read of one exchange.
const DEF_NO_PIPELINE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of connection ids for the pool and for logging.
static CONN_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

//------------ ReusableConn ---------------------------------------------------

/// One stream serving one exchange at a time.
pub(crate) struct ReusableConn<Codec: MsgCodec, Stream> {
    /// Connection id, keying the pool and labelling log events.
    conn_id: u32,

    /// The codec writing queries and reading replies.
    codec: Arc<Codec>,

    /// How long the connection may sit idle before the timer closes it.
    idle_timeout: Duration,

    /// The stream, taken out when the connection dies.
    stream: Mutex<Option<Stream>>,

    /// Closed flag and idle timer bookkeeping.
    state: StdMutex<IdleState>,
}

/// The mutable part of a reusable connection.
#[derive(Default)]
struct IdleState {
    /// Set once, by whoever closes the connection first.
    closed: bool,

    /// Bumped on every arm and disarm; a timer only fires if the
    /// generation it was armed with is still current.
    generation: u64,

    /// The running idle timer, if the connection is idle.
    timer: Option<JoinHandle<()>>,
}

impl<Codec, Stream> ReusableConn<Codec, Stream>
where
    Codec: MsgCodec,
    Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a freshly dialed stream.
    pub(crate) fn new(
        codec: Arc<Codec>,
        idle_timeout: Duration,
        stream: Stream,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id: CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            codec,
            idle_timeout,
            stream: Mutex::new(Some(stream)),
            state: StdMutex::new(IdleState::default()),
        })
    }

    /// Returns the connection id keying the pool.
    pub(crate) fn id(&self) -> u32 {
        self.conn_id
    }

    /// Performs one serialized write-then-read exchange.
    ///
    /// The whole exchange runs under a single deadline. Any failure
    /// leaves the stream possibly bad; the transport decides whether to
    /// discard the connection.
    pub(crate) async fn exchange(
        &self,
        query: &Codec::Msg,
    ) -> Result<Codec::Msg, Error> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        let res = timeout(DEF_NO_PIPELINE_QUERY_TIMEOUT, async {
            self.codec
                .write(stream, query)
                .await
                .map_err(|err| Error::StreamWriteError(Arc::new(err)))?;
            let (reply, _) = self
                .codec
                .read(stream)
                .await
                .map_err(|err| Error::StreamReadError(Arc::new(err)))?;
            Ok(reply)
        })
        .await;

        match res {
            Err(_) => Err(Error::StreamReadTimeout),
            Ok(res) => res,
        }
    }

    /// Arms the idle timer. On expiry the timer closes the connection.
    pub(crate) fn start_idle(conn: &Arc<Self>) {
        let mut state = conn.state.lock().expect("poisoned lock");
        if state.closed {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let timer_conn = conn.clone();
        state.timer = Some(tokio::spawn(async move {
            sleep(timer_conn.idle_timeout).await;
            timer_conn.idle_expired(generation);
        }));
    }

    /// Disarms the idle timer before handing the connection out again.
    ///
    /// Returns `false` if the connection lost the race: the timer already
    /// fired and the connection is closed or about to be. It must not be
    /// handed out in that case.
    pub(crate) fn stop_idle(&self) -> bool {
        let mut state = self.state.lock().expect("poisoned lock");
        if state.closed {
            return false;
        }

        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        true
    }

    /// The idle timer fired. Closes the connection unless it was
    /// reclaimed or closed in the meantime.
    fn idle_expired(&self, generation: u64) {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if state.closed || state.generation != generation {
                return;
            }
            state.closed = true;
            state.timer = None;
        }
        debug!(conn = self.conn_id, "idle connection expired");
        self.teardown();
    }

    /// Closes the connection. Idempotent.
    pub(crate) fn close(&self) {
        let timer = {
            let mut state = self.state.lock().expect("poisoned lock");
            if state.closed {
                return;
            }
            state.closed = true;
            state.generation += 1;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.teardown();
    }

    /// Drops the stream if no exchange is using it. An in-flight
    /// exchange ends within its own deadline and the releaser observes
    /// the closed flag and drops the connection, stream included.
    fn teardown(&self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }

    /// Returns whether the connection has been closed.
    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.state.lock().expect("poisoned lock").closed
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MsgId, TcpCodec};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn msg(id: u16, body: &[u8]) -> BytesMut {
        let mut m = BytesMut::from(&id.to_be_bytes()[..]);
        m.extend_from_slice(body);
        m
    }

    #[tokio::test]
    async fn exchange_is_a_serialized_roundtrip() {
        let (client, mut server) = tokio::io::duplex(4096);
        let conn = ReusableConn::new(
            Arc::new(TcpCodec),
            Duration::from_secs(10),
            client,
        );

        let upstream = tokio::spawn(async move {
            let len = server.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            server.read_exact(&mut buf).await.unwrap();
            server
                .write_all(&(len as u16).to_be_bytes())
                .await
                .unwrap();
            server.write_all(&buf).await.unwrap();
            server
        });

        let reply = conn.exchange(&msg(0xabcd, b"hello")).await.unwrap();
        assert_eq!(reply.id(), 0xabcd);
        assert_eq!(&reply[2..], b"hello");
        drop(upstream.await.unwrap());
    }

    #[tokio::test]
    async fn idle_timer_closes_the_connection() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = ReusableConn::new(
            Arc::new(TcpCodec),
            Duration::from_millis(10),
            client,
        );

        ReusableConn::start_idle(&conn);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.is_closed());
        assert!(!conn.stop_idle());
    }

    #[tokio::test]
    async fn stop_idle_reclaims_an_armed_connection() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = ReusableConn::new(
            Arc::new(TcpCodec),
            Duration::from_millis(10),
            client,
        );

        ReusableConn::start_idle(&conn);
        assert!(conn.stop_idle());

        // The disarmed timer must not close the connection later on.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = ReusableConn::new(
            Arc::new(TcpCodec),
            Duration::from_secs(10),
            client,
        );

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.exchange(&msg(1, b"q")).await.unwrap_err(),
            Error::ConnectionClosed
        ));
    }
}

//! Pipelined connections.
//!
//! A [`PipelineConn`] carries many concurrent exchanges over a single
//! stream, as RFC 7766 section 6.2.1.1 suggests. Every exchange gets a
//! fresh query id from a counter that never wraps; a background read loop
//! demultiplexes replies, which may arrive out of order, back to the
//! exchange that sent the matching query.

#![warn(clippy::missing_docs_in_private_items)]

use crate::codec::{MsgCodec, MsgId};
use crate::context::RequestContext;
use crate::error::Error;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

//------------ Configuration Constants ----------------------------------------

/// Read deadline while replies are outstanding.
const DEF_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for writing a single query.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Source of connection ids for logging.
static CONN_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

//------------ PipelineConn ---------------------------------------------------

/// One stream carrying many concurrent exchanges.
///
/// The connection starts dialing when it is created and serves exchanges
/// as soon as the dial completes. It closes on the first read or write
/// error, when the transport is closed, or once its query id budget is
/// exhausted and the last outstanding exchange has drained.
pub(crate) struct PipelineConn<Codec: MsgCodec, Stream> {
    /// Connection id, only for logging.
    conn_id: u32,

    /// The codec writing queries and reading replies.
    codec: Arc<Codec>,

    /// Read deadline while no replies are outstanding.
    idle_timeout: Duration,

    /// The query id budget.
    max_query_per_conn: u16,

    /// Monotonic source of query ids. Never reset, never reused.
    accumulated_id: AtomicU32,

    /// Number of exchanges between id acquisition and completion.
    in_flight: watch::Sender<usize>,

    /// Delivery slots of the outstanding exchanges, keyed by query id.
    queue: RwLock<HashMap<u16, oneshot::Sender<Codec::Msg>>>,

    /// Connection state. Latches at `Closed` with the close cause.
    state: watch::Sender<ConnState>,

    /// The write half of the stream, absent until the dial completes and
    /// after the read loop has torn the stream down.
    writer: Mutex<Option<WriteHalf<Stream>>>,
}

/// The life cycle of a pipelined connection.
#[derive(Debug)]
enum ConnState {
    /// The dial has not completed yet.
    Dialing,

    /// The stream is up and serving exchanges.
    Open,

    /// The connection is dead. The cause is reported to every exchange
    /// still waiting on it.
    Closed(Error),
}

/// Decrements the in-flight counter when an exchange ends, however it ends.
struct FlightGuard<'a>(&'a watch::Sender<usize>);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

impl<Codec, Stream> PipelineConn<Codec, Stream>
where
    Codec: MsgCodec,
    Stream: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a new connection and spawns its dial task.
    ///
    /// The dial runs in the background; exchanges submitted before it
    /// completes wait on it. A dial failure closes the connection and is
    /// reported to every waiter as the close cause.
    pub(crate) fn spawn<Fut>(
        codec: Arc<Codec>,
        dial: Fut,
        dial_timeout: Duration,
        idle_timeout: Duration,
        max_query_per_conn: u16,
    ) -> Arc<Self>
    where
        Fut: Future<Output = Result<Stream, io::Error>> + Send + 'static,
    {
        let conn = Arc::new(Self {
            conn_id: CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            codec,
            idle_timeout,
            max_query_per_conn,
            accumulated_id: AtomicU32::new(0),
            in_flight: watch::Sender::new(0),
            queue: RwLock::new(HashMap::new()),
            state: watch::Sender::new(ConnState::Dialing),
            writer: Mutex::new(None),
        });

        let task_conn = conn.clone();
        tokio::spawn(async move {
            let stream = match timeout(dial_timeout, dial).await {
                Err(_) => {
                    return task_conn.close_with_err(Error::DialTimeout);
                }
                Ok(Err(err)) => {
                    return task_conn
                        .close_with_err(Error::Dial(Arc::new(err)));
                }
                Ok(Ok(stream)) => stream,
            };

            let (read_half, write_half) = tokio::io::split(stream);
            {
                let mut writer = task_conn.writer.lock().await;
                let opened = task_conn.state.send_if_modified(|state| {
                    if matches!(state, ConnState::Dialing) {
                        *state = ConnState::Open;
                        true
                    } else {
                        false
                    }
                });
                if !opened {
                    // Closed before the dial completed. Dropping the
                    // halves tears the fresh stream down again.
                    return;
                }
                *writer = Some(write_half);
            }

            task_conn.read_loop(read_half).await;
        });

        conn
    }

    /// Returns the connection id keying the pool.
    pub(crate) fn id(&self) -> u32 {
        self.conn_id
    }

    /// Reserves the query id for the next exchange.
    ///
    /// Returns the id and whether it was the last one this connection may
    /// hand out. Once the last id is taken the connection accepts no new
    /// exchanges and closes itself after the outstanding ones finish.
    /// [`exchange`][Self::exchange] must be called exactly once for every
    /// reserved id.
    ///
    /// # Panics
    ///
    /// Panics if called again after the last id was handed out.
    pub(crate) fn acquire_query_id(conn: &Arc<Self>) -> (u16, bool) {
        let max = u32::from(conn.max_query_per_conn);
        let id = conn.accumulated_id.fetch_add(1, Ordering::Relaxed) + 1;
        if id > max {
            panic!("query id overflowed");
        }

        conn.in_flight.send_modify(|n| *n += 1);

        let eol = id == max;
        if eol {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut in_flight = conn.in_flight.subscribe();
                let _ = in_flight.wait_for(|n| *n == 0).await;
                conn.close_with_err(Error::EndOfLife);
            });
        }

        (id as u16, eol)
    }

    /// Performs one exchange under the given query id.
    ///
    /// Waits for the dial if necessary, sends the query with `qid` as its
    /// id and waits for the matching reply. The id of the returned reply
    /// is rewritten back to the caller's original. The caller's message
    /// is left untouched; the id is only rewritten on a private copy.
    pub(crate) async fn exchange(
        &self,
        ctx: &RequestContext,
        query: &Codec::Msg,
        qid: u16,
    ) -> Result<Codec::Msg, Error> {
        let _flight = FlightGuard(&self.in_flight);

        let mut state = self.state.subscribe();
        {
            let settled = tokio::select! {
                res = state.wait_for(
                    |s| !matches!(s, ConnState::Dialing)
                ) => res.expect("state channel closed"),
                err = ctx.done() => return Err(err),
            };
            if let ConnState::Closed(cause) = &*settled {
                return Err(cause.clone());
            }
        }

        let mut query_out = query.clone();
        query_out.set_id(qid);

        let (slot_tx, mut slot_rx) = oneshot::channel();
        self.queue
            .write()
            .expect("poisoned lock")
            .insert(qid, slot_tx);

        {
            let mut writer = self.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                return Err(self
                    .close_cause()
                    .unwrap_or(Error::ConnectionClosed));
            };
            let err = match timeout(
                WRITE_TIMEOUT,
                self.codec.write(stream, &query_out),
            )
            .await
            {
                Err(_) => Some(Error::StreamWriteTimeout),
                Ok(Err(err)) => {
                    Some(Error::StreamWriteError(Arc::new(err)))
                }
                Ok(Ok(_)) => None,
            };
            if let Some(err) = err {
                drop(writer);
                // A write failure is fatal to the whole connection.
                self.close_with_err(err.clone());
                return Err(err);
            }
        }

        tokio::select! {
            err = ctx.done() => {
                // The slot stays registered; a late reply is dropped
                // silently by the read loop.
                Err(err)
            }
            res = &mut slot_rx => match res {
                Ok(mut reply) => {
                    reply.set_id(query.id());
                    Ok(reply)
                }
                Err(_) => Err(self
                    .close_cause()
                    .unwrap_or(Error::StreamReceiveError)),
            },
            cause = Self::closed(&mut state) => Err(cause),
        }
    }

    /// Reads replies and routes each to the exchange waiting for it.
    ///
    /// Terminates on the first read failure or once the connection is
    /// closed by somebody else, then tears the stream down.
    async fn read_loop(&self, mut stream: ReadHalf<Stream>) {
        let mut state = self.state.subscribe();
        loop {
            let idle = self.queue_len() == 0;
            let read_timeout = if idle {
                self.idle_timeout
            } else {
                DEF_READ_TIMEOUT
            };

            let reply = tokio::select! {
                _ = Self::closed(&mut state) => break,
                res = timeout(
                    read_timeout, self.codec.read(&mut stream)
                ) => match res {
                    Err(_) => {
                        self.close_with_err(if idle {
                            Error::StreamIdleTimeout
                        } else {
                            Error::StreamReadTimeout
                        });
                        break;
                    }
                    Ok(Err(err)) => {
                        self.close_with_err(Error::StreamReadError(
                            Arc::new(err),
                        ));
                        break;
                    }
                    Ok(Ok((reply, _))) => reply,
                },
            };

            let id = reply.id();
            let slot =
                self.queue.write().expect("poisoned lock").remove(&id);
            match slot {
                Some(slot) => {
                    // The exchange may have been cancelled meanwhile. A
                    // reply nobody waits for is dropped silently.
                    let _ = slot.send(reply);
                }
                None => {
                    trace!(
                        conn = self.conn_id,
                        id,
                        "reply for unknown query id, ignored"
                    );
                }
            }
        }

        self.writer.lock().await.take();
    }

    /// Waits until the connection is closed and returns the cause.
    async fn closed(state: &mut watch::Receiver<ConnState>) -> Error {
        let settled = state
            .wait_for(|s| matches!(s, ConnState::Closed(_)))
            .await
            .expect("state channel closed");
        match &*settled {
            ConnState::Closed(cause) => cause.clone(),
            _ => Error::ConnectionClosed,
        }
    }

    /// Closes the connection with the given cause.
    ///
    /// Idempotent; only the first cause is recorded. Every waiting
    /// exchange and the read loop observe the state change and unwind.
    pub(crate) fn close_with_err(&self, cause: Error) {
        let closed = self.state.send_if_modified(|state| {
            if matches!(state, ConnState::Closed(_)) {
                false
            } else {
                *state = ConnState::Closed(cause.clone());
                true
            }
        });
        if closed {
            debug!(conn = self.conn_id, error = %cause, "connection closed");
        }
    }

    /// Returns whether the connection has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        matches!(&*self.state.borrow(), ConnState::Closed(_))
    }

    /// Returns the close cause, if the connection is closed.
    fn close_cause(&self) -> Option<Error> {
        match &*self.state.borrow() {
            ConnState::Closed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Number of outstanding exchanges with a registered delivery slot.
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.read().expect("poisoned lock").len()
    }
}

//============ Tests =========================================================

//! The transport: connection pool and dispatcher.
//!
//! A [`Transport`] exchanges wire format DNS messages with a single
//! upstream server over stream connections, dialed through an
//! [`AsyncConnect`] and framed by a [`MsgCodec`]. Callers see a plain
//! request/response call in [`Transport::exchange`]; underneath, the
//! transport amortises connection setup by keeping connections around
//! and, optionally, pipelines queries concurrently on a single stream as
//! RFC 7766 section 6.2.1.1 suggests.
//!
//! Which of the three modes serves a call follows from the
//! configuration:
//!
//! * with connection reuse disabled, every exchange dials a fresh
//!   connection and closes it afterwards;
//! * with reuse enabled and pipelining disabled, connections are pooled
//!   between exchanges but carry only one exchange at a time;
//! * with pipelining enabled as well, many exchanges share a connection
//!   concurrently, each under its own query id, with replies routed back
//!   as they arrive, in whatever order.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::codec::MsgCodec;
use crate::context::RequestContext;
use crate::error::Error;
use crate::pipeline::PipelineConn;
use crate::protocol::AsyncConnect;
use crate::reuse::ReusableConn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

//------------ Configuration Constants ----------------------------------------

/// Default upper bound on a single dial.
const DEF_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum idle time of a pooled connection.
const DEF_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline covering a whole exchange when connections are not reused
/// and the request context carries no deadline of its own.
const DEF_NO_CONN_REUSE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on simultaneously open pipeline connections.
const DEF_MAX_CONNS: usize = 2;

/// Default query id budget of a single pipeline connection.
const DEF_MAX_QUERY_PER_CONN: u16 = u16::MAX;

/// Additional attempts after a pipelined exchange failed on a connection
/// that was not created for it.
const MAX_PIPELINE_RETRIES: usize = 3;

//------------ Config ---------------------------------------------------------

/// Configuration for a transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on any single dial.
    dial_timeout: Duration,

    /// Maximum idle time of a pooled connection. `None` disables
    /// connection reuse entirely.
    idle_timeout: Option<Duration>,

    /// Whether to pipeline queries when reuse is enabled.
    enable_pipeline: bool,

    /// Cap on simultaneously open pipeline connections.
    max_conns: usize,

    /// Query id budget of a single pipeline connection.
    max_query_per_conn: u16,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Sets the dial timeout.
    ///
    /// A zero duration is quietly replaced with the default.
    pub fn set_dial_timeout(&mut self, timeout: Duration) {
        self.dial_timeout = if timeout.is_zero() {
            DEF_DIAL_TIMEOUT
        } else {
            timeout
        };
    }

    /// Returns the idle timeout, if connection reuse is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Sets the idle timeout.
    ///
    /// This is how long a connection may sit unused in the pool before
    /// it is closed. `None` or a zero duration disables connection reuse
    /// entirely: every exchange then dials and closes its own
    /// connection.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// Returns whether pipelining is enabled.
    pub fn enable_pipeline(&self) -> bool {
        self.enable_pipeline
    }

    /// Sets whether to pipeline queries over a shared connection.
    ///
    /// Only has an effect while connection reuse is enabled.
    pub fn set_enable_pipeline(&mut self, enable: bool) {
        self.enable_pipeline = enable;
    }

    /// Returns the cap on simultaneously open pipeline connections.
    pub fn max_conns(&self) -> usize {
        self.max_conns
    }

    /// Sets the cap on simultaneously open pipeline connections.
    ///
    /// Values below one are quietly raised to one.
    pub fn set_max_conns(&mut self, max_conns: usize) {
        self.max_conns = max_conns.max(1);
    }

    /// Returns the query id budget of a single pipeline connection.
    pub fn max_query_per_conn(&self) -> u16 {
        self.max_query_per_conn
    }

    /// Sets how many queries a single pipeline connection may carry over
    /// its lifetime before it is retired.
    ///
    /// Values below one are quietly raised to one.
    pub fn set_max_query_per_conn(&mut self, max_query_per_conn: u16) {
        self.max_query_per_conn = max_query_per_conn.max(1);
    }

    /// Returns whether connection reuse is enabled.
    fn reuse_enabled(&self) -> bool {
        matches!(self.idle_timeout, Some(timeout) if !timeout.is_zero())
    }

    /// The idle timeout to apply to pooled connections.
    fn effective_idle_timeout(&self) -> Duration {
        self.idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEF_IDLE_TIMEOUT)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: DEF_DIAL_TIMEOUT,
            idle_timeout: Some(DEF_IDLE_TIMEOUT),
            enable_pipeline: false,
            max_conns: DEF_MAX_CONNS,
            max_query_per_conn: DEF_MAX_QUERY_PER_CONN,
        }
    }
}

//------------ Transport ------------------------------------------------------

/// A message transport towards a single upstream server.
///
/// The transport is cheap to clone; clones share the connection pool.
/// All connections belong to the transport and never escape to callers.
pub struct Transport<Remote, Codec>
where
    Remote: AsyncConnect,
    Codec: MsgCodec,
{
    /// The shared transport state.
    inner: Arc<Inner<Remote, Codec>>,
}

/// The state shared between transport clones and worker tasks.
struct Inner<Remote, Codec>
where
    Remote: AsyncConnect,
    Codec: MsgCodec,
{
    /// Dials new connections to the upstream.
    remote: Remote,

    /// Frames messages on established connections.
    codec: Arc<Codec>,

    /// User configuration values.
    config: Config,

    /// The connection pool. Held for bookkeeping only, never across I/O.
    pool: Mutex<Pool<Codec, Remote::Connection>>,
}

/// The connection pool.
struct Pool<Codec: MsgCodec, Stream> {
    /// Set by [`Transport::close`]; no connection is admitted afterwards.
    closed: bool,

    /// All live pipeline connections, keyed by connection id.
    pipeline_conns: HashMap<u32, Arc<PipelineConn<Codec, Stream>>>,

    /// All reusable connections, in use or idle, keyed by connection id.
    reusable_conns: HashMap<u32, Arc<ReusableConn<Codec, Stream>>>,

    /// The idle subset of `reusable_conns`.
    idle_reusable_conns: HashMap<u32, Arc<ReusableConn<Codec, Stream>>>,
}

impl<Codec: MsgCodec, Stream> Default for Pool<Codec, Stream> {
    fn default() -> Self {
        Self {
            closed: false,
            pipeline_conns: HashMap::new(),
            reusable_conns: HashMap::new(),
            idle_reusable_conns: HashMap::new(),
        }
    }
}

impl<Remote, Codec> Clone for Transport<Remote, Codec>
where
    Remote: AsyncConnect,
    Codec: MsgCodec,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Remote, Codec> Transport<Remote, Codec>
where
    Remote: AsyncConnect + Send + Sync + 'static,
    Remote::Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Remote::Fut: 'static,
    Codec: MsgCodec,
{
    /// Creates a new transport with default configuration.
    pub fn new(remote: Remote, codec: Codec) -> Self {
        Self::with_config(remote, codec, Default::default())
    }

    /// Creates a new transport with the given configuration.
    pub fn with_config(remote: Remote, codec: Codec, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                codec: Arc::new(codec),
                config,
                pool: Mutex::new(Default::default()),
            }),
        }
    }

    /// Exchanges a query for a reply.
    ///
    /// Sends the query to the upstream and resolves to the matching
    /// reply, or to the first error the exchange ran into. The context
    /// is honoured at every suspension point: once it is cancelled or
    /// its deadline passes, the call returns the context's error without
    /// waiting for the network.
    ///
    /// On a closed transport the call fails immediately with
    /// [`Error::TransportClosed`].
    pub async fn exchange(
        &self,
        ctx: &RequestContext,
        query: &Codec::Msg,
    ) -> Result<Codec::Msg, Error> {
        if self.inner.is_closed() {
            return Err(Error::TransportClosed);
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        if !self.inner.config.reuse_enabled() {
            return self.inner.exchange_without_conn_reuse(ctx, query).await;
        }

        if self.inner.config.enable_pipeline() {
            return self.inner.exchange_with_pipeline_conn(ctx, query).await;
        }

        self.inner.clone().exchange_with_reusable_conn(ctx, query).await
    }

    /// Closes every connection that currently serves no exchange.
    ///
    /// Pipeline connections without outstanding replies and all idle
    /// reusable connections are closed and dropped from the pool.
    /// Connections with work in flight are left alone.
    pub fn close_idle_connections(&self) {
        let mut pool = self.inner.pool.lock().expect("poisoned lock");

        pool.pipeline_conns.retain(|_, conn| {
            if conn.queue_len() == 0 {
                conn.close_with_err(Error::EndOfLife);
                false
            } else {
                true
            }
        });
        for (_, conn) in pool.idle_reusable_conns.drain() {
            conn.close();
        }
    }

    /// Closes the transport and all its connections.
    ///
    /// Every in-flight exchange fails promptly with
    /// [`Error::TransportClosed`], as does every later call to
    /// [`exchange`][Self::exchange]. Closing an already closed transport
    /// does nothing.
    pub fn close(&self) {
        let mut pool = self.inner.pool.lock().expect("poisoned lock");

        pool.closed = true;
        for (_, conn) in pool.pipeline_conns.drain() {
            conn.close_with_err(Error::TransportClosed);
        }
        for (_, conn) in pool.reusable_conns.drain() {
            conn.close();
        }
        pool.idle_reusable_conns.clear();
    }
}

impl<Remote, Codec> Inner<Remote, Codec>
where
    Remote: AsyncConnect + Send + Sync + 'static,
    Remote::Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Remote::Fut: 'static,
    Codec: MsgCodec,
{
    /// Returns whether the transport has been closed.
    fn is_closed(&self) -> bool {
        self.pool.lock().expect("poisoned lock").closed
    }

    /// One exchange over a connection of its own.
    ///
    /// Dials under the caller's context, runs the exchange under the
    /// context's deadline or a default, and closes the connection again
    /// no matter how the exchange went.
    async fn exchange_without_conn_reuse(
        &self,
        ctx: &RequestContext,
        query: &Codec::Msg,
    ) -> Result<Codec::Msg, Error> {
        let mut stream = tokio::select! {
            err = ctx.done() => return Err(err),
            res = self.remote.connect() => {
                res.map_err(|err| Error::Dial(Arc::new(err)))?
            }
        };

        let deadline = ctx.deadline().unwrap_or_else(|| {
            Instant::now() + DEF_NO_CONN_REUSE_QUERY_TIMEOUT
        });

        // The write is not raced against cancellation; the query either
        // goes out whole or fails the exchange.
        match timeout_at(deadline, self.codec.write(&mut stream, query))
            .await
        {
            Err(_) => return Err(Error::StreamWriteTimeout),
            Ok(Err(err)) => {
                return Err(Error::StreamWriteError(Arc::new(err)))
            }
            Ok(Ok(_)) => {}
        }

        tokio::select! {
            err = ctx.done() => Err(err),
            res = timeout_at(
                deadline, self.codec.read(&mut stream)
            ) => match res {
                Err(_) => Err(Error::StreamReadTimeout),
                Ok(Err(err)) => {
                    Err(Error::StreamReadError(Arc::new(err)))
                }
                Ok(Ok((reply, _))) => Ok(reply),
            },
        }
    }

    /// One exchange over a pooled, non-pipelined connection.
    ///
    /// The actual work runs on a background worker so the caller can
    /// honour its context: on cancellation the caller returns at once
    /// while the worker finishes its current round trip and discards the
    /// result. A failure on a reused connection makes the worker discard
    /// it and try again on a fresh one; a failure on a fresh connection
    /// is final.
    async fn exchange_with_reusable_conn(
        self: Arc<Self>,
        ctx: &RequestContext,
        query: &Codec::Msg,
    ) -> Result<Codec::Msg, Error> {
        let (result_tx, result_rx) = oneshot::channel();

        let inner = self.clone();
        let worker_ctx = ctx.clone();
        let query = query.clone();
        tokio::spawn(async move {
            loop {
                if worker_ctx.err().is_some() {
                    return;
                }

                let (conn, reused) = match inner.get_reusable_conn().await {
                    Err(err) => {
                        let _ = result_tx.send(Err(err));
                        return;
                    }
                    Ok(res) => res,
                };

                match conn.exchange(&query).await {
                    Err(err) => {
                        inner.release_reusable_conn(&conn, true);
                        if reused {
                            continue;
                        }
                        let _ = result_tx.send(Err(err));
                        return;
                    }
                    Ok(reply) => {
                        inner.release_reusable_conn(&conn, false);
                        let _ = result_tx.send(Ok(reply));
                        return;
                    }
                }
            }
        });

        tokio::select! {
            err = ctx.done() => Err(err),
            res = result_rx => match res {
                Ok(res) => res,
                Err(_) => {
                    Err(ctx.err().unwrap_or(Error::StreamReceiveError))
                }
            },
        }
    }

    /// Fetches a reusable connection, from the pool or freshly dialed.
    ///
    /// Also reports whether the connection was reused. A reused
    /// connection sat in the pool within the idle timeout, but its
    /// stream may still turn out dead on use.
    async fn get_reusable_conn(
        &self,
    ) -> Result<(Arc<ReusableConn<Codec, Remote::Connection>>, bool), Error>
    {
        {
            let mut pool = self.pool.lock().expect("poisoned lock");
            if pool.closed {
                return Err(Error::TransportClosed);
            }

            while let Some(&id) = pool.idle_reusable_conns.keys().next() {
                let conn = pool
                    .idle_reusable_conns
                    .remove(&id)
                    .expect("key just seen");
                if conn.stop_idle() {
                    return Ok((conn, true));
                }
                // Lost the race: the idle timer fired and is closing
                // the connection.
                conn.close();
                pool.reusable_conns.remove(&id);
            }
        }

        let stream = match timeout(
            self.config.dial_timeout(),
            self.remote.connect(),
        )
        .await
        {
            Err(_) => return Err(Error::DialTimeout),
            Ok(Err(err)) => return Err(Error::Dial(Arc::new(err))),
            Ok(Ok(stream)) => stream,
        };
        let conn = ReusableConn::new(
            self.codec.clone(),
            self.config.effective_idle_timeout(),
            stream,
        );

        let mut pool = self.pool.lock().expect("poisoned lock");
        if pool.closed {
            drop(pool);
            conn.close();
            return Err(Error::TransportClosed);
        }
        pool.reusable_conns.insert(conn.id(), conn.clone());

        Ok((conn, false))
    }

    /// Returns a reusable connection to the pool, or drops it.
    ///
    /// A dead connection and any connection released after the transport
    /// closed is closed and forgotten; anything else goes back to the
    /// idle pool with a fresh idle timer.
    fn release_reusable_conn(
        &self,
        conn: &Arc<ReusableConn<Codec, Remote::Connection>>,
        dead: bool,
    ) {
        let close_conn = {
            let mut pool = self.pool.lock().expect("poisoned lock");
            if dead {
                pool.reusable_conns.remove(&conn.id());
            }
            if !pool.closed && !dead {
                ReusableConn::start_idle(conn);
                pool.idle_reusable_conns.insert(conn.id(), conn.clone());
                false
            } else {
                true
            }
        };
        if close_conn {
            conn.close();
        }
    }

    /// One exchange over a pipelined connection.
    ///
    /// A failed attempt is retried on another connection, but only if
    /// the failed connection was not dialed for this very attempt: a
    /// fresh connection failing means the upstream is unwell and
    /// retrying is unlikely to help.
    async fn exchange_with_pipeline_conn(
        &self,
        ctx: &RequestContext,
        query: &Codec::Msg,
    ) -> Result<Codec::Msg, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let (conn, is_new, qid) = self.get_pipeline_conn()?;

            match conn.exchange(ctx, query, qid).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if !is_new && attempt <= MAX_PIPELINE_RETRIES {
                        debug!(
                            attempt,
                            previous_err = %err,
                            "retrying pipelined exchange"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Picks or creates a pipeline connection and reserves a query id.
    ///
    /// Connections that closed themselves are dropped from the pool on
    /// the way. A new connection is opened when there is none, or when
    /// the candidate already has work in flight and the pool is below
    /// its connection cap; the pool thus fills one connection before it
    /// opens another. Reserving the candidate's last admissible query id
    /// retires it from the pool; its in-flight exchanges close it once
    /// they drain.
    #[allow(clippy::type_complexity)]
    fn get_pipeline_conn(
        &self,
    ) -> Result<
        (Arc<PipelineConn<Codec, Remote::Connection>>, bool, u16),
        Error,
    > {
        let mut pool = self.pool.lock().expect("poisoned lock");
        if pool.closed {
            return Err(Error::TransportClosed);
        }

        pool.pipeline_conns.retain(|_, conn| !conn.is_closed());

        let mut conn = pool.pipeline_conns.values().next().cloned();
        let mut is_new = false;

        let create = match &conn {
            None => true,
            Some(candidate) => {
                candidate.queue_len() > 0
                    && pool.pipeline_conns.len() < self.config.max_conns()
            }
        };
        if create {
            let new_conn = PipelineConn::spawn(
                self.codec.clone(),
                self.remote.connect(),
                self.config.dial_timeout(),
                self.config.effective_idle_timeout(),
                self.config.max_query_per_conn(),
            );
            pool.pipeline_conns.insert(new_conn.id(), new_conn.clone());
            conn = Some(new_conn);
            is_new = true;
        }

        let conn = conn.expect("either reused or just created");
        let (qid, eol) = PipelineConn::acquire_query_id(&conn);
        if eol {
            // The connection must not serve further exchanges. It is
            // not closed here; outstanding exchanges still run on it.
            pool.pipeline_conns.remove(&conn.id());
        }

        Ok((conn, is_new, qid))
    }
}

//============ Tests =========================================================

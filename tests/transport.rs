//! End-to-end tests of the transport against an in-memory upstream.

use bytes::BytesMut;
use dns_transport::{
    AsyncConnect, Config, Error, MsgId, RequestContext, TcpCodec, Transport,
};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

//------------ Mock upstream -------------------------------------------------

/// A connector that hands out one in-memory stream per dial and lets the
/// test decide how the server side behaves.
#[derive(Clone)]
struct MockConnect {
    inner: Arc<MockUpstream>,
}

struct MockUpstream {
    dials: AtomicUsize,
    serve: Box<dyn Fn(DuplexStream) + Send + Sync>,
}

impl MockConnect {
    fn new<F>(serve: F) -> Self
    where
        F: Fn(DuplexStream) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(MockUpstream {
                dials: AtomicUsize::new(0),
                serve: Box::new(serve),
            }),
        }
    }

    /// An upstream that echoes every query back, on every connection.
    fn echo() -> Self {
        Self::new(|mut server| {
            tokio::spawn(async move {
                while let Some(frame) = read_frame(&mut server).await {
                    if !write_frame(&mut server, &frame).await {
                        break;
                    }
                }
            });
        })
    }

    /// An upstream that reads queries but never answers any of them.
    fn silent() -> Self {
        Self::new(|mut server| {
            tokio::spawn(async move {
                while read_frame(&mut server).await.is_some() {}
            });
        })
    }

    fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }
}

impl AsyncConnect for MockConnect {
    type Connection = DuplexStream;
    type Fut =
        Pin<Box<dyn Future<Output = Result<DuplexStream, io::Error>> + Send>>;

    fn connect(&self) -> Self::Fut {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(4096);
        (self.inner.serve)(server);
        Box::pin(std::future::ready(Ok(client)))
    }
}

/// Reads one length-prefixed message, or `None` once the peer is gone.
async fn read_frame(stream: &mut DuplexStream) -> Option<BytesMut> {
    let len = stream.read_u16().await.ok()? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.ok()?;
    Some(BytesMut::from(&buf[..]))
}

/// Writes one length-prefixed message. Returns whether it went out.
async fn write_frame(stream: &mut DuplexStream, msg: &[u8]) -> bool {
    let len = (msg.len() as u16).to_be_bytes();
    stream.write_all(&len).await.is_ok()
        && stream.write_all(msg).await.is_ok()
}

fn msg(id: u16, body: &[u8]) -> BytesMut {
    let mut m = BytesMut::from(&id.to_be_bytes()[..]);
    m.extend_from_slice(body);
    m
}

fn pipeline_config(max_conns: usize, max_query_per_conn: u16) -> Config {
    let mut config = Config::new();
    config.set_enable_pipeline(true);
    config.set_max_conns(max_conns);
    config.set_max_query_per_conn(max_query_per_conn);
    config
}

//------------ Pipelined mode ------------------------------------------------

#[tokio::test]
async fn pipelined_replies_come_back_out_of_order() {
    // One connection; replies are served in reverse order of arrival.
    let upstream = MockConnect::new(|mut server| {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..3 {
                frames.push(read_frame(&mut server).await.unwrap());
            }
            for frame in frames.iter().rev() {
                assert!(write_frame(&mut server, frame).await);
            }
        });
    });
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(1, u16::MAX),
    );

    let ctx = RequestContext::new();
    let msg_a = msg(0x1111, b"first");
    let msg_b = msg(0x2222, b"second");
    let msg_c = msg(0x3333, b"third");
    let (a, b, c) = tokio::join!(
        transport.exchange(&ctx, &msg_a),
        transport.exchange(&ctx, &msg_b),
        transport.exchange(&ctx, &msg_c),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    let c = c.unwrap();
    assert_eq!((a.id(), &a[2..]), (0x1111, &b"first"[..]));
    assert_eq!((b.id(), &b[2..]), (0x2222, &b"second"[..]));
    assert_eq!((c.id(), &c[2..]), (0x3333, &b"third"[..]));
    assert_eq!(upstream.dials(), 1);
}

#[tokio::test]
async fn exhausted_query_id_budget_retires_the_connection() {
    let upstream = MockConnect::echo();
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(2, 2),
    );

    let ctx = RequestContext::new();
    for id in 1..=3u16 {
        let reply =
            transport.exchange(&ctx, &msg(id, b"query")).await.unwrap();
        assert_eq!(reply.id(), id);
    }

    // The first connection served two queries and was retired; the
    // third went out on a second connection.
    assert_eq!(upstream.dials(), 2);
}

#[tokio::test]
async fn query_id_budget_of_one_opens_a_connection_per_query() {
    let upstream = MockConnect::echo();
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(2, 1),
    );

    let ctx = RequestContext::new();
    for id in 1..=3u16 {
        transport.exchange(&ctx, &msg(id, b"q")).await.unwrap();
    }

    assert_eq!(upstream.dials(), 3);
}

#[tokio::test]
async fn failure_on_a_fresh_connection_is_not_retried() {
    // The upstream hangs up before the query is even written.
    let upstream = MockConnect::new(drop);
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(2, u16::MAX),
    );

    let ctx = RequestContext::new();
    let res = transport.exchange(&ctx, &msg(1, b"q")).await;

    assert!(res.is_err());
    assert_eq!(upstream.dials(), 1);
}

#[tokio::test]
async fn failure_on_a_reused_connection_is_retried() {
    // The first connection dies after one reply; later ones behave.
    let conns = Arc::new(AtomicUsize::new(0));
    let upstream = MockConnect::new({
        let conns = conns.clone();
        move |mut server| {
            let nth = conns.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if nth == 0 {
                    if let Some(frame) = read_frame(&mut server).await {
                        write_frame(&mut server, &frame).await;
                    }
                } else {
                    while let Some(frame) = read_frame(&mut server).await {
                        if !write_frame(&mut server, &frame).await {
                            break;
                        }
                    }
                }
            });
        }
    });
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(2, u16::MAX),
    );

    let ctx = RequestContext::new();
    let first = transport.exchange(&ctx, &msg(1, b"one")).await.unwrap();
    assert_eq!(first.id(), 1);

    let second = transport.exchange(&ctx, &msg(2, b"two")).await.unwrap();
    assert_eq!(second.id(), 2);
    assert_eq!(&second[2..], b"two");
    assert_eq!(upstream.dials(), 2);
}

#[tokio::test]
async fn cancellation_leaves_the_connection_usable() {
    // Queries asking for silence get no reply; everything else echoes.
    let upstream = MockConnect::new(|mut server| {
        tokio::spawn(async move {
            while let Some(frame) = read_frame(&mut server).await {
                if &frame[2..] != b"silence" {
                    if !write_frame(&mut server, &frame).await {
                        break;
                    }
                }
            }
        });
    });
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(1, u16::MAX),
    );

    let hung_ctx = RequestContext::new();
    let hung = {
        let transport = transport.clone();
        let ctx = hung_ctx.clone();
        tokio::spawn(async move {
            transport.exchange(&ctx, &msg(0xaaaa, b"silence")).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    hung_ctx.cancel();
    let err = hung.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The same connection still serves other exchanges.
    let ctx = RequestContext::new();
    let reply =
        transport.exchange(&ctx, &msg(0xbbbb, b"hello")).await.unwrap();
    assert_eq!(reply.id(), 0xbbbb);
    assert_eq!(upstream.dials(), 1);
}

#[tokio::test]
async fn context_deadline_fails_the_exchange() {
    let transport = Transport::with_config(
        MockConnect::silent(),
        TcpCodec::new(),
        pipeline_config(1, u16::MAX),
    );

    let ctx = RequestContext::with_timeout(Duration::from_millis(50));
    let err =
        transport.exchange(&ctx, &msg(1, b"q")).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
}

#[tokio::test]
async fn close_unblocks_in_flight_exchanges() {
    let upstream = MockConnect::silent();
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        pipeline_config(1, u16::MAX),
    );

    let mut waiters = Vec::new();
    for id in [1u16, 2] {
        let transport = transport.clone();
        waiters.push(tokio::spawn(async move {
            let ctx = RequestContext::new();
            transport.exchange(&ctx, &msg(id, b"q")).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.close();

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }

    // Closed is terminal.
    let ctx = RequestContext::new();
    let err =
        transport.exchange(&ctx, &msg(3, b"q")).await.unwrap_err();
    assert!(matches!(err, Error::TransportClosed));
}

//------------ Reuse without pipelining --------------------------------------

#[tokio::test]
async fn reusable_connections_are_pooled_between_exchanges() {
    let upstream = MockConnect::echo();
    let transport =
        Transport::new(upstream.clone(), TcpCodec::new());

    let ctx = RequestContext::new();
    for id in 1..=3u16 {
        let reply =
            transport.exchange(&ctx, &msg(id, b"ping")).await.unwrap();
        assert_eq!(reply.id(), id);
    }

    assert_eq!(upstream.dials(), 1);
}

#[tokio::test]
async fn dead_pooled_connection_is_replaced() {
    // The first connection answers once and hangs up; the pool must
    // discard it and succeed on a replacement.
    let conns = Arc::new(AtomicUsize::new(0));
    let upstream = MockConnect::new({
        let conns = conns.clone();
        move |mut server| {
            let nth = conns.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if nth == 0 {
                    if let Some(frame) = read_frame(&mut server).await {
                        write_frame(&mut server, &frame).await;
                    }
                } else {
                    while let Some(frame) = read_frame(&mut server).await {
                        if !write_frame(&mut server, &frame).await {
                            break;
                        }
                    }
                }
            });
        }
    });
    let transport =
        Transport::new(upstream.clone(), TcpCodec::new());

    let ctx = RequestContext::new();
    transport.exchange(&ctx, &msg(1, b"one")).await.unwrap();

    let reply =
        transport.exchange(&ctx, &msg(2, b"two")).await.unwrap();
    assert_eq!(reply.id(), 2);
    assert_eq!(&reply[2..], b"two");
    assert_eq!(upstream.dials(), 2);
}

#[tokio::test]
async fn reuse_mode_cancellation_returns_promptly() {
    let transport =
        Transport::new(MockConnect::silent(), TcpCodec::new());

    let ctx = RequestContext::new();
    let exchange = {
        let transport = transport.clone();
        let ctx = ctx.clone();
        tokio::spawn(
            async move { transport.exchange(&ctx, &msg(1, b"q")).await },
        )
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let err = exchange.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

//------------ No connection reuse -------------------------------------------

#[tokio::test]
async fn disabled_reuse_dials_a_connection_per_exchange() {
    let upstream = MockConnect::echo();
    let mut config = Config::new();
    config.set_idle_timeout(None);
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        config,
    );

    let ctx = RequestContext::new();
    for id in 1..=3u16 {
        let reply =
            transport.exchange(&ctx, &msg(id, b"q")).await.unwrap();
        assert_eq!(reply.id(), id);
    }

    assert_eq!(upstream.dials(), 3);
}

#[tokio::test]
async fn cancelled_context_fails_without_dialing() {
    let upstream = MockConnect::echo();
    let mut config = Config::new();
    config.set_idle_timeout(None);
    let transport = Transport::with_config(
        upstream.clone(),
        TcpCodec::new(),
        config,
    );

    let ctx = RequestContext::new();
    ctx.cancel();
    let err =
        transport.exchange(&ctx, &msg(1, b"q")).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(upstream.dials(), 0);
}

//------------ Idle housekeeping ---------------------------------------------

#[tokio::test]
async fn close_idle_connections_is_idempotent() {
    let upstream = MockConnect::echo();
    let transport =
        Transport::new(upstream.clone(), TcpCodec::new());

    let ctx = RequestContext::new();
    transport.exchange(&ctx, &msg(1, b"q")).await.unwrap();

    transport.close_idle_connections();
    transport.close_idle_connections();

    // The pool is empty again; the next exchange needs a fresh dial.
    transport.exchange(&ctx, &msg(2, b"q")).await.unwrap();
    assert_eq!(upstream.dials(), 2);
}

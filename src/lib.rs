//! A client transport for DNS over stream sockets.
//!
//! This crate exchanges wire format DNS messages with a single upstream
//! server over stream connections such as TCP or a TLS tunnel. Callers
//! perform a plain request/response call while the transport dials and
//! reuses connections underneath. It can also pipeline many concurrent
//! exchanges onto one stream, as RFC 7766 section 6.2.1.1 suggests, and
//! routes out-of-order replies back to their callers.
//!
//! The transport does not touch the DNS wire format itself. Dialing goes
//! through the [`AsyncConnect`] trait and framing through the [`MsgCodec`]
//! trait; the only thing the transport ever reads from a message is its
//! 16 bit id, via [`MsgId`]. [`TcpConnect`], [`TlsConnect`] (feature
//! `tls`) and the length-prefix codec [`TcpCodec`] cover the common cases.
//!
//! # Example
//!
//! ```no_run
//! use bytes::BytesMut;
//! use dns_transport::{
//!     Config, MsgId, RequestContext, TcpCodec, TcpConnect, Transport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dns_transport::Error> {
//!     let mut config = Config::new();
//!     config.set_enable_pipeline(true);
//!     let transport = Transport::with_config(
//!         TcpConnect::new("192.0.2.1:53"),
//!         TcpCodec::new(),
//!         config,
//!     );
//!
//!     // A wire format DNS query, built elsewhere.
//!     let query = BytesMut::from(&[0x12u8, 0x34][..]);
//!
//!     let ctx = RequestContext::with_timeout(
//!         std::time::Duration::from_secs(3),
//!     );
//!     let reply = transport.exchange(&ctx, &query).await?;
//!     assert_eq!(reply.id(), query.id());
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! * `tls`: enables [`TlsConnect`], dialing through
//!   [tokio-rustls](https://github.com/rustls/tokio-rustls).

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
pub mod context;
pub mod error;
pub mod protocol;
pub mod transport;

mod pipeline;
mod reuse;

pub use self::codec::{MsgCodec, MsgId, TcpCodec};
pub use self::context::RequestContext;
pub use self::error::Error;
#[cfg(feature = "tls")]
pub use self::protocol::TlsConnect;
pub use self::protocol::{AsyncConnect, TcpConnect};
pub use self::transport::{Config, Transport};

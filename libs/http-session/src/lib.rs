//! Pooled HTTP sessions with streaming responses
//!
//! Many lightweight [`Session`]s share a small set of expensive transport
//! clients. A [`ClientManager`] keys clients by provider and full
//! [`SessionConfiguration`], tracks in-flight requests per client and retires
//! clients that stayed idle longer than their lifetime.
//!
//! Each request produces an [`AsyncResponse`]: upload progress events
//! followed by at most one download event carrying the final response head
//! and a lazily consumed body.
//!
//! # Examples
//!
//! ## Buffered request
//!
//! ```no_run
//! use std::sync::Arc;
//! use http_session::{
//!     ClientManager, ClientManagerConfig, CurrentRuntimeProvider, ReqwestTransportFactory,
//!     Request, Session, SessionConfiguration,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(ClientManager::new(
//!     Arc::new(ReqwestTransportFactory),
//!     ClientManagerConfig::from_env()?,
//! ));
//! let _sweeper = manager.spawn_sweeper();
//!
//! let session = Session::new(
//!     manager,
//!     Arc::new(CurrentRuntimeProvider::new()),
//!     SessionConfiguration::default(),
//! );
//! let request = Request::builder()
//!     .url("https://example.com/v1/items")
//!     .build()?;
//!
//! let response = session.send(request).await?;
//! let data: serde_json::Value = response.json()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Upload progress and streamed body
//!
//! ```no_run
//! use futures::StreamExt;
//! use http_session::{Method, Request, ResponseEvent, Session};
//!
//! # async fn example(session: Session) -> Result<(), Box<dyn std::error::Error>> {
//! let request = Request::builder()
//!     .method(Method::PUT)
//!     .url("https://example.com/v1/blob")
//!     .body(vec![0_u8; 1 << 20])
//!     .build()?;
//!
//! let mut events = session.execute(request)?;
//! while let Some(event) = events.next().await {
//!     match event? {
//!         ResponseEvent::Upload(sent) => println!("sent {sent} bytes"),
//!         ResponseEvent::Download(head, mut body) => {
//!             println!("status {}", head.status);
//!             while let Some(chunk) = body.next().await {
//!                 println!("chunk of {} bytes", chunk?.len());
//!             }
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod delegate;
mod error;
mod event_loop;
mod ledger;
mod manager;
mod reqwest_transport;
mod request;
mod response;
mod session;
mod stream;
mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

// Re-export public API
pub use client::{Client, ExecutionHandle};
pub use config::{
    ClientManagerConfig, ConnectionPoolSettings, Decompression, HttpVersionPolicy, ProxySettings,
    RedirectPolicy, SessionConfiguration, Timeouts, TlsSettings, TlsVersion,
};
pub use delegate::StreamingDelegate;
pub use error::SessionError;
pub use event_loop::{
    CurrentRuntimeProvider, DedicatedRuntimeProvider, EventLoopGroup, EventLoopGroupManager,
};
pub use ledger::{Operation, OperationLedger};
pub use manager::{ClientManager, ConfigurationFingerprint, SweeperHandle};
pub use reqwest_transport::{ReqwestTransportClient, ReqwestTransportFactory};
pub use request::{Body, Request, RequestBuilder};
pub use response::{AsyncResponse, BodyStream, Response, ResponseEvent, ResponseHead};
pub use session::Session;
pub use stream::{DataStream, DataStreamSender, StreamItem};
pub use transport::{
    ResponseDelegate, SessionProvider, TransportClient, TransportFactory, TransportTask,
};

// Re-export commonly used types from dependencies
pub use http::{Method, StatusCode};

//! Boundary contracts with the underlying HTTP engine.
//!
//! The pool never touches sockets itself. It asks a [`TransportFactory`] for a
//! [`TransportClient`] per configuration, starts requests through it and
//! receives streamed progress through a [`ResponseDelegate`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::SessionConfiguration;
use crate::error::SessionError;
use crate::event_loop::EventLoopGroup;
use crate::request::Request;
use crate::response::ResponseHead;

/// Receives transport callbacks for one request, in order:
/// body-sent counts, head(s), body chunks, then exactly one finish.
///
/// Callbacks may arrive on any runtime thread and must not block.
pub trait ResponseDelegate: Send + Sync {
    /// Total request body bytes handed to the connection so far.
    fn did_send_body_bytes(&self, total: u64);

    fn did_receive_head(&self, head: ResponseHead);

    /// No further heads follow. Engines that resolve redirects internally
    /// call this right after the final head, before the body is read.
    fn did_begin_body(&self) {}

    /// Implies [`ResponseDelegate::did_begin_body`].
    fn did_receive_body_part(&self, chunk: Bytes);

    fn did_finish(&self, result: Result<(), SessionError>);
}

/// A running transport request.
#[derive(Debug)]
pub struct TransportTask {
    handle: JoinHandle<Result<(), SessionError>>,
}

impl TransportTask {
    /// Spawn `future` on the group's runtime.
    pub fn spawn_on<F>(group: &EventLoopGroup, future: F) -> Self
    where
        F: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        Self {
            handle: group.handle().spawn(future),
        }
    }

    #[must_use]
    pub fn from_join_handle(handle: JoinHandle<Result<(), SessionError>>) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    pub(crate) fn into_join_handle(self) -> JoinHandle<Result<(), SessionError>> {
        self.handle
    }
}

/// One configured client handle of the underlying engine.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Start `request`, reporting progress to `delegate`.
    ///
    /// # Errors
    /// Fails when the request cannot be started at all.
    fn execute(
        &self,
        request: Request,
        delegate: Arc<dyn ResponseDelegate>,
    ) -> Result<TransportTask, SessionError>;

    /// Release the handle. Callers invoke this at most once.
    ///
    /// # Errors
    /// Engine-specific shutdown failures.
    async fn shutdown(&self) -> Result<(), SessionError>;
}

/// Builds transport clients for a configuration and event-loop group.
pub trait TransportFactory: Send + Sync {
    /// # Errors
    /// Returns [`SessionError::Construction`] when the configuration cannot be
    /// applied.
    fn make_client(
        &self,
        configuration: &SessionConfiguration,
        group: &EventLoopGroup,
    ) -> Result<Arc<dyn TransportClient>, SessionError>;
}

/// Supplies the shared execution resources for sessions.
///
/// Providers with the same `id` are interchangeable.
pub trait SessionProvider: Send + Sync {
    fn id(&self) -> &str;

    /// # Errors
    /// Fails when the execution resource cannot be created.
    fn group(&self) -> Result<EventLoopGroup, SessionError>;
}

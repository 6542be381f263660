use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::SessionError;
use crate::event_loop::EventLoopGroup;
use crate::ledger::OperationLedger;
use crate::request::Request;
use crate::transport::{ResponseDelegate, TransportClient};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// One pooled transport client plus the bookkeeping needed to retire it
/// safely.
///
/// Requests are admitted through the [`OperationLedger`]; once the ledger is
/// closed every new request fails with [`SessionError::ClientClosed`].
pub struct Client {
    id: u64,
    transport: Arc<dyn TransportClient>,
    group: EventLoopGroup,
    ledger: OperationLedger,
    // FIFO and cancel-safe; a dropped shutdown future releases its place.
    shutdown_lock: AsyncMutex<()>,
}

impl Client {
    #[must_use]
    pub fn new(transport: Arc<dyn TransportClient>, group: EventLoopGroup) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            group,
            ledger: OperationLedger::new(),
            shutdown_lock: AsyncMutex::new(()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> &EventLoopGroup {
        &self.group
    }

    /// True while any request started through this client is unfinished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ledger.is_running()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ledger.in_flight()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ledger.is_closed()
    }

    /// Start `request`; progress and the final outcome go to `delegate`.
    ///
    /// The request counts as running until the transport task ends, whether
    /// it succeeds, fails, panics or is cancelled through the returned
    /// handle. Any abnormal end is reported to `delegate` as a failure.
    ///
    /// # Errors
    /// [`SessionError::ClientClosed`] after shutdown, or the transport's
    /// refusal to start the request.
    pub fn execute(
        &self,
        request: Request,
        delegate: Arc<dyn ResponseDelegate>,
    ) -> Result<ExecutionHandle, SessionError> {
        let operation = self.ledger.operation()?;
        let span = info_span!(
            "http_session.execute",
            client_id = self.id,
            method = %request.method(),
            url = %request.url(),
        );

        let task = span
            .in_scope(|| {
                debug!(in_flight = self.ledger.in_flight(), "request started");
                self.transport.execute(request, Arc::clone(&delegate))
            })?
            .into_join_handle();
        let abort = task.abort_handle();

        let watcher = self.group.handle().spawn(
            async move {
                let failure = match task.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(join) if join.is_cancelled() => Some(SessionError::Cancelled),
                    Err(join) => Some(SessionError::Transport(format!(
                        "transport task panicked: {join}"
                    ))),
                };
                match failure {
                    Some(e) => {
                        debug!(error = %e, "request ended with failure");
                        delegate.did_finish(Err(e));
                    }
                    None => debug!("request finished"),
                }
                operation.complete();
            }
            .instrument(span),
        );

        Ok(ExecutionHandle { abort, watcher })
    }

    /// Close the client if it is idle and release its transport.
    ///
    /// Returns `Ok(false)` when a request is still running or the client was
    /// already closed. Concurrent callers are serialized; the transport is
    /// released at most once.
    ///
    /// # Errors
    /// The transport's shutdown failure. The client stays closed.
    pub async fn shutdown(&self) -> Result<bool, SessionError> {
        let _guard = self.shutdown_lock.lock().await;
        if !self.ledger.close_if_idle() {
            debug!(client_id = self.id, "client busy or already closed; not shutting down");
            return Ok(false);
        }
        self.transport.shutdown().await?;
        info!(client_id = self.id, "client shut down");
        Ok(true)
    }

    /// Close the ledger without releasing the transport.
    pub(crate) fn close_if_idle(&self) -> bool {
        self.ledger.close_if_idle()
    }

    /// Release the transport of a client already closed by
    /// [`Client::close_if_idle`].
    pub(crate) async fn release_transport(&self) -> Result<(), SessionError> {
        let _guard = self.shutdown_lock.lock().await;
        self.transport.shutdown().await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("group", &self.group.label())
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

/// Control over one started request.
///
/// Dropping the handle detaches it; the request keeps running.
#[derive(Debug)]
pub struct ExecutionHandle {
    abort: AbortHandle,
    watcher: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Abort the transport task. The delegate receives
    /// [`SessionError::Cancelled`] unless the request already finished.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    /// Wait until the request left the client's ledger.
    pub async fn finished(self) {
        if let Err(e) = self.watcher.await {
            warn!(error = %e, "request watcher did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::StreamingDelegate;
    use crate::test_support::{ResponseScript, ScriptedTransport};
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::sync::Semaphore;

    fn group() -> EventLoopGroup {
        EventLoopGroup::from_handle("test", Handle::current())
    }

    fn request() -> Request {
        Request::builder().url("http://pool.test/").build().unwrap()
    }

    fn client(script: ResponseScript) -> (Arc<ScriptedTransport>, Client) {
        let transport = Arc::new(ScriptedTransport::new(group(), script));
        let client = Client::new(transport.clone(), group());
        (transport, client)
    }

    #[tokio::test]
    async fn execute_streams_response_and_leaves_ledger_idle() {
        let (_, client) = client(ResponseScript::ok("hello"));
        let (delegate, response) = StreamingDelegate::channel();

        let handle = client.execute(request(), delegate).unwrap();
        let response = response.into_response().await.unwrap();
        handle.finished().await;

        assert_eq!(response.text().unwrap(), "hello");
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (_, a) = client(ResponseScript::default());
        let (_, b) = client(ResponseScript::default());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn busy_client_refuses_shutdown() {
        let gate = Arc::new(Semaphore::new(0));
        let transport =
            Arc::new(ScriptedTransport::new(group(), ResponseScript::ok("x")).with_gate(gate.clone()));
        let client = Client::new(transport.clone(), group());

        let (delegate, _response) = StreamingDelegate::channel();
        let handle = client.execute(request(), delegate).unwrap();
        assert!(client.is_running());
        assert!(!client.shutdown().await.unwrap());
        assert_eq!(transport.shutdowns(), 0);

        gate.add_permits(1);
        handle.finished().await;
        assert!(client.shutdown().await.unwrap());
        assert_eq!(transport.shutdowns(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (transport, client) = client(ResponseScript::default());
        assert!(client.shutdown().await.unwrap());
        assert!(!client.shutdown().await.unwrap());
        assert_eq!(transport.shutdowns(), 1);

        let (delegate, _response) = StreamingDelegate::channel();
        let err = client.execute(request(), delegate).unwrap_err();
        assert_eq!(err, SessionError::ClientClosed);
    }

    #[tokio::test]
    async fn concurrent_shutdowns_release_transport_once() {
        let (transport, client) = client(ResponseScript::default());
        let client = Arc::new(client);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.shutdown().await.unwrap() })
            })
            .collect();

        let mut performed = 0;
        for task in tasks {
            if task.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert_eq!(transport.shutdowns(), 1);
    }

    #[tokio::test]
    async fn cancelled_shutdown_waiter_does_not_block_later_callers() {
        let (transport, client) = client(ResponseScript::default());
        let guard = client.shutdown_lock.lock().await;

        let abandoned = tokio::time::timeout(Duration::from_millis(10), client.shutdown()).await;
        assert!(abandoned.is_err());
        drop(guard);

        assert!(client.shutdown().await.unwrap());
        assert_eq!(transport.shutdowns(), 1);
    }

    #[tokio::test]
    async fn cancel_reports_cancelled_and_completes_operation() {
        let gate = Arc::new(Semaphore::new(0));
        let transport =
            Arc::new(ScriptedTransport::new(group(), ResponseScript::ok("x")).with_gate(gate));
        let client = Client::new(transport, group());

        let (delegate, response) = StreamingDelegate::channel();
        let handle = client.execute(request(), delegate).unwrap();
        handle.cancel();

        assert_eq!(response.download().await.unwrap_err(), SessionError::Cancelled);
        handle.finished().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn transport_failure_reaches_delegate() {
        let (_, client) = client(ResponseScript::failing(SessionError::Connection(
            "refused".to_owned(),
        )));
        let (delegate, response) = StreamingDelegate::channel();
        let handle = client.execute(request(), delegate).unwrap();

        let err = response.download().await.unwrap_err();
        assert_eq!(err, SessionError::Connection("refused".to_owned()));
        handle.finished().await;
        assert_eq!(client.in_flight(), 0);
    }
}

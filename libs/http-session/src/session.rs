use std::sync::Arc;

use crate::client::ExecutionHandle;
use crate::config::SessionConfiguration;
use crate::delegate::StreamingDelegate;
use crate::error::SessionError;
use crate::manager::ClientManager;
use crate::request::Request;
use crate::response::{AsyncResponse, Response};
use crate::transport::SessionProvider;

/// Lightweight front-end: a configuration and a provider bound to a shared
/// [`ClientManager`]. Creating many sessions is cheap; equal configurations
/// end up on one pooled client.
#[derive(Clone)]
pub struct Session {
    manager: Arc<ClientManager>,
    provider: Arc<dyn SessionProvider>,
    configuration: SessionConfiguration,
}

impl Session {
    #[must_use]
    pub fn new(
        manager: Arc<ClientManager>,
        provider: Arc<dyn SessionProvider>,
        configuration: SessionConfiguration,
    ) -> Self {
        Self {
            manager,
            provider,
            configuration,
        }
    }

    #[must_use]
    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    /// Start `request` and return its event sequence.
    ///
    /// The request runs to completion even if the response is dropped.
    ///
    /// # Errors
    /// Client construction failures, or [`SessionError::ClientClosed`] when
    /// the pooled client was retired between lookup and start.
    pub fn execute(&self, request: Request) -> Result<AsyncResponse, SessionError> {
        self.execute_with_handle(request).map(|(_, response)| response)
    }

    /// Like [`Session::execute`], also returning a handle that can cancel
    /// the request.
    ///
    /// # Errors
    /// Same as [`Session::execute`].
    pub fn execute_with_handle(
        &self,
        request: Request,
    ) -> Result<(ExecutionHandle, AsyncResponse), SessionError> {
        let client = self
            .manager
            .client(&self.configuration, self.provider.as_ref())?;
        let (delegate, response) = StreamingDelegate::channel();
        let handle = client.execute(request, delegate)?;
        Ok((handle, response))
    }

    /// Execute `request` and buffer the whole response.
    ///
    /// # Errors
    /// Start failures plus any transport failure while receiving.
    pub async fn send(&self, request: Request) -> Result<Response, SessionError> {
        self.execute(request)?.into_response().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("provider", &self.provider.id())
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientManagerConfig;
    use crate::event_loop::{CurrentRuntimeProvider, EventLoopGroupManager};
    use crate::response::ResponseEvent;
    use crate::test_support::{ResponseScript, ScriptedTransportFactory};
    use futures::StreamExt;

    fn session(factory: Arc<ScriptedTransportFactory>) -> Session {
        let manager = ClientManager::new(factory, ClientManagerConfig::default())
            .with_event_loop_groups(Arc::new(EventLoopGroupManager::new()));
        Session::new(
            Arc::new(manager),
            Arc::new(CurrentRuntimeProvider::new()),
            SessionConfiguration::default(),
        )
    }

    #[tokio::test]
    async fn send_buffers_response() {
        let session = session(Arc::new(ScriptedTransportFactory::new(ResponseScript::ok(
            r#"{"id":1}"#,
        ))));
        let request = Request::builder().url("http://svc.test/item").build().unwrap();

        let response = session.send(request).await.unwrap();
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn execute_reports_upload_before_download() {
        let session = session(Arc::new(ScriptedTransportFactory::new(ResponseScript::ok(
            "ok",
        ))));
        let request = Request::builder()
            .method(http::Method::PUT)
            .url("http://svc.test/blob")
            .body("payload")
            .build()
            .unwrap();

        let mut events = session.execute(request).unwrap();
        assert!(matches!(
            events.next().await,
            Some(Ok(ResponseEvent::Upload(7)))
        ));
        let Some(Ok(ResponseEvent::Download(head, body))) = events.next().await else {
            panic!("expected download");
        };
        assert_eq!(head.status, http::StatusCode::OK);
        assert_eq!(body.text().await.unwrap(), "ok");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn cloned_sessions_share_one_client() {
        let factory = Arc::new(ScriptedTransportFactory::new(ResponseScript::default()));
        let a = session(Arc::clone(&factory));
        let b = a.clone();
        let request = || Request::builder().url("http://svc.test/").build().unwrap();

        a.send(request()).await.unwrap();
        b.send(request()).await.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(factory.clients()[0].executed(), 2);
    }

    #[tokio::test]
    async fn cancel_through_handle() {
        let factory = Arc::new(ScriptedTransportFactory::gated(ResponseScript::default()));
        let session = session(Arc::clone(&factory));
        let request = Request::builder().url("http://svc.test/").build().unwrap();

        let (handle, response) = session.execute_with_handle(request).unwrap();
        handle.cancel();

        assert_eq!(
            response.into_response().await.unwrap_err(),
            SessionError::Cancelled
        );
    }
}

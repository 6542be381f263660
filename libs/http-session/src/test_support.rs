//! Scripted in-process transport for exercising the pool without sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::SessionConfiguration;
use crate::error::SessionError;
use crate::event_loop::EventLoopGroup;
use crate::request::Request;
use crate::response::ResponseHead;
use crate::transport::{ResponseDelegate, TransportClient, TransportFactory, TransportTask};

/// What every request against a [`ScriptedTransport`] reports.
#[derive(Debug, Clone)]
pub struct ResponseScript {
    pub heads: Vec<StatusCode>,
    pub body: Vec<Bytes>,
    pub failure: Option<SessionError>,
    /// When set, each body chunk waits for one permit after the heads.
    pub body_gate: Option<Arc<Semaphore>>,
}

impl Default for ResponseScript {
    fn default() -> Self {
        Self {
            heads: vec![StatusCode::OK],
            body: Vec::new(),
            failure: None,
            body_gate: None,
        }
    }
}

impl ResponseScript {
    #[must_use]
    pub fn ok(body: &'static str) -> Self {
        Self {
            body: vec![Bytes::from_static(body.as_bytes())],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing(error: SessionError) -> Self {
        Self {
            heads: Vec::new(),
            body: Vec::new(),
            failure: Some(error),
            body_gate: None,
        }
    }

    /// Hold back every body chunk until `gate` hands out a permit for it.
    #[must_use]
    pub fn with_body_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.body_gate = Some(gate);
        self
    }
}

/// Transport client that plays back a [`ResponseScript`].
///
/// Upload progress is reported as the full body length once. With a gate,
/// each request waits for one permit before producing its response.
#[derive(Debug)]
pub struct ScriptedTransport {
    group: EventLoopGroup,
    script: ResponseScript,
    gate: Option<Arc<Semaphore>>,
    executed: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(group: EventLoopGroup, script: ResponseScript) -> Self {
        Self {
            group,
            script,
            gate: None,
            executed: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    fn execute(
        &self,
        request: Request,
        delegate: Arc<dyn ResponseDelegate>,
    ) -> Result<TransportTask, SessionError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let script = self.script.clone();
        let gate = self.gate.clone();
        let sent = request.body().len() as u64;

        Ok(TransportTask::spawn_on(&self.group, async move {
            if sent > 0 {
                delegate.did_send_body_bytes(sent);
            }
            if let Some(gate) = gate {
                gate.acquire()
                    .await
                    .map_err(|_| SessionError::Cancelled)?
                    .forget();
            }
            if let Some(e) = script.failure {
                delegate.did_finish(Err(e.clone()));
                return Err(e);
            }
            for status in script.heads {
                delegate.did_receive_head(ResponseHead::new(status));
            }
            delegate.did_begin_body();
            for chunk in script.body {
                if let Some(gate) = &script.body_gate {
                    gate.acquire()
                        .await
                        .map_err(|_| SessionError::Cancelled)?
                        .forget();
                }
                delegate.did_receive_body_part(chunk);
            }
            delegate.did_finish(Ok(()));
            Ok(())
        }))
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`ScriptedTransport`]s and remembering each one.
#[derive(Debug)]
pub struct ScriptedTransportFactory {
    script: ResponseScript,
    gate: Option<Arc<Semaphore>>,
    construction_failure: Option<SessionError>,
    clients: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedTransportFactory {
    #[must_use]
    pub fn new(script: ResponseScript) -> Self {
        Self {
            script,
            gate: None,
            construction_failure: None,
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Requests wait until [`ScriptedTransportFactory::release`] lets them
    /// through.
    #[must_use]
    pub fn gated(script: ResponseScript) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(script)
        }
    }

    /// Every `make_client` call fails with `error`.
    #[must_use]
    pub fn failing(error: SessionError) -> Self {
        Self {
            construction_failure: Some(error),
            ..Self::new(ResponseScript::default())
        }
    }

    /// Let `requests` gated requests complete.
    pub fn release(&self, requests: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(requests);
        }
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.clients
            .lock()
            .iter()
            .map(|c| c.shutdowns.load(Ordering::SeqCst))
            .sum()
    }

    #[must_use]
    pub fn clients(&self) -> Vec<Arc<ScriptedTransport>> {
        self.clients.lock().clone()
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn make_client(
        &self,
        _configuration: &SessionConfiguration,
        group: &EventLoopGroup,
    ) -> Result<Arc<dyn TransportClient>, SessionError> {
        if let Some(e) = &self.construction_failure {
            return Err(e.clone());
        }
        let mut transport = ScriptedTransport::new(group.clone(), self.script.clone());
        if let Some(gate) = &self.gate {
            transport = transport.with_gate(Arc::clone(gate));
        }
        let transport = Arc::new(transport);
        self.clients.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

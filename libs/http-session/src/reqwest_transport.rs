//! Default transport backed by `reqwest`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::CONTENT_LENGTH;
use parking_lot::Mutex;

use crate::config::{HttpVersionPolicy, RedirectPolicy, SessionConfiguration, TlsVersion};
use crate::error::SessionError;
use crate::event_loop::EventLoopGroup;
use crate::request::{Body, Request};
use crate::response::ResponseHead;
use crate::transport::{ResponseDelegate, TransportClient, TransportFactory, TransportTask};

/// Request bodies are handed to the connection in slices of this size so
/// upload progress can be reported.
const UPLOAD_CHUNK: usize = 16 * 1024;

/// Builds one `reqwest::Client` per pooled configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransportFactory;

impl TransportFactory for ReqwestTransportFactory {
    fn make_client(
        &self,
        configuration: &SessionConfiguration,
        group: &EventLoopGroup,
    ) -> Result<Arc<dyn TransportClient>, SessionError> {
        let client = build_client(configuration)
            .map_err(|e| SessionError::Construction(e.to_string()))?;
        Ok(Arc::new(ReqwestTransportClient {
            client: Mutex::new(Some(client)),
            group: group.clone(),
        }))
    }
}

fn build_client(configuration: &SessionConfiguration) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(configuration.decompression.gzip)
        .brotli(configuration.decompression.brotli)
        .deflate(configuration.decompression.deflate)
        .zstd(configuration.decompression.zstd)
        .redirect(match configuration.redirect {
            RedirectPolicy::None => reqwest::redirect::Policy::none(),
            RedirectPolicy::Limited(max) => reqwest::redirect::Policy::limited(max),
        })
        .pool_idle_timeout(configuration.pool.idle_timeout)
        .pool_max_idle_per_host(configuration.pool.max_idle_per_host)
        .danger_accept_invalid_certs(configuration.tls.accept_invalid_certificates);

    let timeouts = &configuration.timeouts;
    if let Some(timeout) = timeouts.connect {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = timeouts.request {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = timeouts.read {
        builder = builder.read_timeout(timeout);
    }

    if let Some(version) = configuration.tls.min_version {
        builder = builder.min_tls_version(match version {
            TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
        });
    }
    for pem in &configuration.tls.root_certificates {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
    }

    if let Some(proxy) = &configuration.proxy {
        let mut upstream = reqwest::Proxy::all(&proxy.url)?;
        if let Some((user, password)) = &proxy.basic_auth {
            upstream = upstream.basic_auth(user, password);
        }
        builder = builder.proxy(upstream);
    }

    for (host, addrs) in &configuration.dns_overrides {
        builder = builder.resolve_to_addrs(host, addrs);
    }

    builder = match configuration.http_version {
        HttpVersionPolicy::Automatic => builder,
        HttpVersionPolicy::Http1Only => builder.http1_only(),
        HttpVersionPolicy::Http2PriorKnowledge => builder.http2_prior_knowledge(),
    };

    if let Some(user_agent) = &configuration.user_agent {
        builder = builder.user_agent(user_agent);
    }

    builder.build()
}

/// Transport client that runs each request as a task on its group.
pub struct ReqwestTransportClient {
    // `None` after shutdown.
    client: Mutex<Option<reqwest::Client>>,
    group: EventLoopGroup,
}

#[async_trait]
impl TransportClient for ReqwestTransportClient {
    fn execute(
        &self,
        request: Request,
        delegate: Arc<dyn ResponseDelegate>,
    ) -> Result<TransportTask, SessionError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(SessionError::AlreadyShutdown)?;

        let (method, url, headers, body, timeout) = request.into_parts();
        let mut builder = client.request(method, url.to_string()).headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Body::Bytes(bytes) = body {
            builder = builder
                .header(CONTENT_LENGTH, bytes.len())
                .body(upload_body(&bytes, Arc::clone(&delegate)));
        }

        Ok(TransportTask::spawn_on(&self.group, async move {
            let result = run(builder, delegate.as_ref()).await;
            delegate.did_finish(result.clone());
            result
        }))
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        // Dropping the last handle closes idle pooled connections.
        if self.client.lock().take().is_some() {
            Ok(())
        } else {
            Err(SessionError::AlreadyShutdown)
        }
    }
}

fn upload_chunks(bytes: &Bytes) -> Vec<Bytes> {
    (0..bytes.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| bytes.slice(start..bytes.len().min(start + UPLOAD_CHUNK)))
        .collect()
}

fn upload_body(bytes: &Bytes, delegate: Arc<dyn ResponseDelegate>) -> reqwest::Body {
    let mut sent = 0_u64;
    let stream = futures::stream::iter(upload_chunks(bytes)).map(move |chunk| {
        sent += chunk.len() as u64;
        delegate.did_send_body_bytes(sent);
        Ok::<_, std::io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

async fn run(
    builder: reqwest::RequestBuilder,
    delegate: &dyn ResponseDelegate,
) -> Result<(), SessionError> {
    let response = builder.send().await?;
    delegate.did_receive_head(ResponseHead {
        status: response.status(),
        version: response.version(),
        headers: response.headers().clone(),
    });
    delegate.did_begin_body();

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        delegate.did_receive_body_part(chunk?);
    }
    Ok(())
}

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::SessionError;
use crate::stream::DataStream;

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// Lazy, single-pass response body.
pub struct BodyStream {
    inner: DataStream<Bytes>,
}

impl BodyStream {
    pub(crate) fn new(inner: DataStream<Bytes>) -> Self {
        Self { inner }
    }

    /// A body with no chunks.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(DataStream::finished())
    }

    /// Consume the body and return it as one buffer
    ///
    /// # Errors
    /// The transport failure that ended the body, if any.
    pub async fn bytes(mut self) -> Result<Bytes, SessionError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Consume the body as UTF-8 text
    ///
    /// # Errors
    /// Transport failure or invalid UTF-8.
    pub async fn text(self) -> Result<String, SessionError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SessionError::InvalidResponse(format!("Invalid UTF-8: {e}")))
    }

    /// Consume the body and deserialize it as JSON
    ///
    /// # Errors
    /// Transport failure or malformed JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, SessionError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream").finish_non_exhaustive()
    }
}

/// One element of an [`AsyncResponse`].
#[derive(Debug)]
pub enum ResponseEvent {
    /// Request body bytes sent so far.
    Upload(u64),
    /// Final response head and its body.
    Download(ResponseHead, BodyStream),
}

/// Ordered sequence of upload progress followed by at most one download.
///
/// Upload events are drained first. Then the head stream is drained and the
/// last head wins (earlier heads belong to redirects). A failure on either
/// stream is yielded once and ends the sequence.
pub struct AsyncResponse {
    inner: Pin<Box<dyn Stream<Item = Result<ResponseEvent, SessionError>> + Send>>,
}

impl AsyncResponse {
    #[must_use]
    pub fn new(
        upload: DataStream<u64>,
        head: DataStream<ResponseHead>,
        body: DataStream<Bytes>,
    ) -> Self {
        let inner = async_stream::stream! {
            let mut upload = upload;
            loop {
                match upload.next_item().await {
                    Ok(Some(sent)) => yield Ok(ResponseEvent::Upload(sent)),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            let mut heads = head;
            let mut last = None;
            loop {
                match heads.next_item().await {
                    Ok(Some(head)) => last = Some(head),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            if let Some(head) = last {
                yield Ok(ResponseEvent::Download(head, BodyStream::new(body)));
            }
        };
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Skip upload progress and wait for the final head.
    ///
    /// # Errors
    /// The transport failure, or [`SessionError::InvalidResponse`] when the
    /// request ended without any head.
    pub async fn download(mut self) -> Result<(ResponseHead, BodyStream), SessionError> {
        while let Some(event) = self.next().await {
            if let ResponseEvent::Download(head, body) = event? {
                return Ok((head, body));
            }
        }
        Err(SessionError::InvalidResponse(
            "request finished without a response head".to_owned(),
        ))
    }

    /// Buffer the whole response.
    ///
    /// # Errors
    /// Same as [`AsyncResponse::download`], plus body failures.
    pub async fn into_response(self) -> Result<Response, SessionError> {
        let (head, body) = self.download().await?;
        let body = body.bytes().await?;
        Ok(Response { head, body })
    }
}

impl Stream for AsyncResponse {
    type Item = Result<ResponseEvent, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResponse").finish_non_exhaustive()
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(head: ResponseHead, body: Bytes) -> Self {
        Self { head, body }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    #[must_use]
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// # Errors
    /// Body is not valid UTF-8.
    pub fn text(&self) -> Result<&str, SessionError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| SessionError::InvalidResponse(format!("Invalid UTF-8: {e}")))
    }

    /// # Errors
    /// Body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DataStreamSender;

    struct Senders {
        upload: DataStreamSender<u64>,
        head: DataStreamSender<ResponseHead>,
        body: DataStreamSender<Bytes>,
    }

    fn response() -> (Senders, AsyncResponse) {
        let (upload, upload_rx) = DataStream::channel();
        let (head, head_rx) = DataStream::channel();
        let (body, body_rx) = DataStream::channel();
        (
            Senders { upload, head, body },
            AsyncResponse::new(upload_rx, head_rx, body_rx),
        )
    }

    #[tokio::test]
    async fn uploads_then_single_download() {
        let (tx, mut response) = response();
        for sent in 0..3 {
            tx.upload.send(sent);
        }
        tx.upload.finish();
        tx.head.send(ResponseHead::new(StatusCode::OK));
        tx.head.finish();
        tx.body.finish();

        for expected in 0..3 {
            match response.next().await {
                Some(Ok(ResponseEvent::Upload(sent))) => assert_eq!(sent, expected),
                other => panic!("expected upload, got {other:?}"),
            }
        }
        let Some(Ok(ResponseEvent::Download(head, body))) = response.next().await else {
            panic!("expected download");
        };
        assert_eq!(head.status, StatusCode::OK);
        assert!(body.bytes().await.unwrap().is_empty());
        assert!(response.next().await.is_none());
    }

    #[tokio::test]
    async fn no_head_yields_only_uploads() {
        let (tx, response) = response();
        tx.upload.send(10);
        tx.upload.finish();
        tx.head.finish();

        let events: Vec<_> = response.collect_events().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ResponseEvent::Upload(10))));
    }

    #[tokio::test]
    async fn last_head_wins() {
        let (tx, response) = response();
        tx.upload.finish();
        tx.head.send(ResponseHead::new(StatusCode::MOVED_PERMANENTLY));
        tx.head.send(ResponseHead::new(StatusCode::FOUND));
        tx.head.send(ResponseHead::new(StatusCode::ACCEPTED));
        tx.head.finish();
        tx.body.send(Bytes::from_static(b"done"));
        tx.body.finish();

        let buffered = response.into_response().await.unwrap();
        assert_eq!(buffered.status(), StatusCode::ACCEPTED);
        assert_eq!(buffered.text().unwrap(), "done");
    }

    #[tokio::test]
    async fn head_failure_is_surfaced_once() {
        let (tx, response) = response();
        tx.upload.send(1);
        tx.upload.finish();
        tx.head.fail(SessionError::Connection("refused".to_owned()));

        let events = response.collect_events().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(ResponseEvent::Upload(1))));
        assert!(matches!(&events[1], Err(SessionError::Connection(_))));
    }

    #[tokio::test]
    async fn body_failure_reaches_body_consumer() {
        let (tx, response) = response();
        tx.upload.finish();
        tx.head.send(ResponseHead::new(StatusCode::OK));
        tx.head.finish();
        tx.body.send(Bytes::from_static(b"partial"));
        tx.body.fail(SessionError::Transport("reset".to_owned()));

        let (_, body) = response.download().await.unwrap();
        let err = body.bytes().await.unwrap_err();
        assert_eq!(err, SessionError::Transport("reset".to_owned()));
    }

    #[tokio::test]
    async fn json_body() {
        let (tx, body_rx) = DataStream::channel();
        tx.send(Bytes::from_static(br#"{"ok":"#));
        tx.send(Bytes::from_static(b"true}"));
        tx.finish();

        let value: serde_json::Value = BodyStream::new(body_rx).json().await.unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
    }

    impl AsyncResponse {
        async fn collect_events(self) -> Vec<Result<ResponseEvent, SessionError>> {
            StreamExt::collect(self).await
        }
    }
}

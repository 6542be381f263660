use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::error::SessionError;
use crate::response::{AsyncResponse, ResponseHead};
use crate::stream::{DataStream, DataStreamSender};
use crate::transport::ResponseDelegate;

/// Feeds transport callbacks into the upload, head and body streams of an
/// [`AsyncResponse`].
///
/// The head stream closes as soon as the body phase begins, so the
/// download event is available while the body is still arriving. A terminal
/// failure goes to the head stream while no head has arrived, and to the
/// body stream afterwards, so the caller sees it exactly once.
#[derive(Debug)]
pub struct StreamingDelegate {
    upload: DataStreamSender<u64>,
    head: DataStreamSender<ResponseHead>,
    body: DataStreamSender<Bytes>,
    head_received: AtomicBool,
    body_started: AtomicBool,
}

impl StreamingDelegate {
    #[must_use]
    pub fn channel() -> (Arc<Self>, AsyncResponse) {
        let (upload, upload_rx) = DataStream::channel();
        let (head, head_rx) = DataStream::channel();
        let (body, body_rx) = DataStream::channel();
        let delegate = Arc::new(Self {
            upload,
            head,
            body,
            head_received: AtomicBool::new(false),
            body_started: AtomicBool::new(false),
        });
        (delegate, AsyncResponse::new(upload_rx, head_rx, body_rx))
    }
}

impl ResponseDelegate for StreamingDelegate {
    fn did_send_body_bytes(&self, total: u64) {
        self.upload.send(total);
    }

    fn did_receive_head(&self, head: ResponseHead) {
        if !self.head_received.swap(true, Ordering::AcqRel) {
            self.upload.finish();
        }
        self.head.send(head);
    }

    fn did_begin_body(&self) {
        // Without a head the stream stays open for the terminal failure.
        if self.head_received.load(Ordering::Acquire)
            && !self.body_started.swap(true, Ordering::AcqRel)
        {
            self.head.finish();
        }
    }

    fn did_receive_body_part(&self, chunk: Bytes) {
        self.did_begin_body();
        self.body.send(chunk);
    }

    fn did_finish(&self, result: Result<(), SessionError>) {
        self.upload.finish();
        match result {
            Ok(()) => {
                self.head.finish();
                self.body.finish();
            }
            Err(e) if self.head_received.load(Ordering::Acquire) => {
                self.head.finish();
                self.body.fail(e);
            }
            Err(e) => {
                self.head.fail(e);
                self.body.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseEvent;
    use futures::StreamExt;
    use http::StatusCode;
    use std::time::Duration;

    #[tokio::test]
    async fn callbacks_become_ordered_events() {
        let (delegate, mut response) = StreamingDelegate::channel();
        delegate.did_send_body_bytes(0);
        delegate.did_send_body_bytes(1);
        delegate.did_send_body_bytes(2);
        delegate.did_receive_head(ResponseHead::new(StatusCode::OK));
        delegate.did_finish(Ok(()));

        let mut uploads = Vec::new();
        let mut downloads = 0;
        while let Some(event) = response.next().await {
            match event.unwrap() {
                ResponseEvent::Upload(sent) => uploads.push(sent),
                ResponseEvent::Download(head, body) => {
                    downloads += 1;
                    assert_eq!(head.status, StatusCode::OK);
                    assert!(body.bytes().await.unwrap().is_empty());
                }
            }
        }
        assert_eq!(uploads, vec![0, 1, 2]);
        assert_eq!(downloads, 1);
    }

    #[tokio::test]
    async fn failure_before_head_surfaces_on_sequence() {
        let (delegate, response) = StreamingDelegate::channel();
        delegate.did_finish(Err(SessionError::Timeout("connect".to_owned())));
        delegate.did_finish(Err(SessionError::Cancelled));

        let err = response.download().await.unwrap_err();
        assert_eq!(err, SessionError::Timeout("connect".to_owned()));
    }

    #[tokio::test]
    async fn download_is_available_while_body_is_open() {
        let (delegate, response) = StreamingDelegate::channel();
        delegate.did_receive_head(ResponseHead::new(StatusCode::OK));
        delegate.did_receive_body_part(Bytes::from_static(b"first chunk"));

        let (head, mut body) = tokio::time::timeout(Duration::from_secs(2), response.download())
            .await
            .expect("download before the body finished")
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body.next().await, Some(Ok(Bytes::from_static(b"first chunk"))));

        delegate.did_receive_body_part(Bytes::from_static(b"second"));
        assert_eq!(body.next().await, Some(Ok(Bytes::from_static(b"second"))));
        delegate.did_finish(Ok(()));
        assert_eq!(body.next().await, None);
    }

    #[tokio::test]
    async fn begin_body_releases_download_before_any_chunk() {
        let (delegate, response) = StreamingDelegate::channel();
        delegate.did_receive_head(ResponseHead::new(StatusCode::MOVED_PERMANENTLY));
        delegate.did_receive_head(ResponseHead::new(StatusCode::ACCEPTED));
        delegate.did_begin_body();

        let (head, _body) = tokio::time::timeout(Duration::from_secs(2), response.download())
            .await
            .expect("download right after the final head")
            .unwrap();
        assert_eq!(head.status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn begin_body_without_head_keeps_failure_visible() {
        let (delegate, response) = StreamingDelegate::channel();
        delegate.did_begin_body();
        delegate.did_finish(Err(SessionError::Connection("reset".to_owned())));

        assert_eq!(
            response.download().await.unwrap_err(),
            SessionError::Connection("reset".to_owned())
        );
    }

    #[tokio::test]
    async fn failure_after_head_surfaces_on_body() {
        let (delegate, response) = StreamingDelegate::channel();
        delegate.did_receive_head(ResponseHead::new(StatusCode::OK));
        delegate.did_receive_body_part(Bytes::from_static(b"abc"));
        delegate.did_finish(Err(SessionError::Transport("eof".to_owned())));

        let (head, body) = response.download().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(
            body.bytes().await.unwrap_err(),
            SessionError::Transport("eof".to_owned())
        );
    }
}

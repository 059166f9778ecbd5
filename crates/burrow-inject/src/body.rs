//! HTTP body adapter

use burrow_proto::ScriptInjection;
use bytes::Bytes;
use futures_util::Stream;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::{debug, error};

use crate::InjectTransform;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Only HTML documents are rewritten
pub fn should_inject(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Body stream run through an [`InjectTransform`]
pub struct InjectStream<B> {
    inner: Pin<Box<BodyStream<B>>>,
    transform: InjectTransform,
    finished: bool,
}

impl<B> InjectStream<B> {
    pub fn new(body: B, transform: InjectTransform) -> Self {
        Self {
            inner: Box::pin(BodyStream::new(body)),
            transform,
            finished: false,
        }
    }
}

impl<B> Stream for InjectStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Item = Result<Frame<Bytes>, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(frame)) => {
                    // Trailers are dropped; the rewritten body has no fixed length anyway
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    match this.transform.push(&data) {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Poll::Ready(Some(Ok(Frame::data(out)))),
                        Err(e) => {
                            error!("Injection failed mid-stream: {}", e);
                            this.finished = true;
                            return Poll::Ready(Some(Err(e.into())));
                        }
                    }
                }
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                None => {
                    this.finished = true;
                    return match this.transform.finish() {
                        Ok(out) if out.is_empty() => Poll::Ready(None),
                        Ok(out) => Poll::Ready(Some(Ok(Frame::data(out)))),
                        Err(e) => {
                            error!("Injection failed at end of body: {}", e);
                            Poll::Ready(Some(Err(e.into())))
                        }
                    };
                }
            }
        }
    }
}

/// Wrap `body` so the scripts are injected as it streams
pub fn inject_body<B>(body: B, transform: InjectTransform) -> BoxBody<Bytes, BoxError>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    StreamBody::new(InjectStream::new(body, transform)).boxed()
}

/// Rewrite an HTML response if any scripts apply, otherwise pass it through
pub fn maybe_inject<B>(
    response: Response<B>,
    scripts: &[ScriptInjection],
) -> Response<BoxBody<Bytes, BoxError>>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let passthrough =
        |response: Response<B>| response.map(|body| body.map_err(Into::into).boxed());

    if scripts.is_empty() || !should_inject(response.headers()) {
        return passthrough(response);
    }

    let encoding = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(transform) = InjectTransform::new(encoding.as_deref(), scripts) else {
        debug!(
            "Not injecting into response with content-encoding {:?}",
            encoding
        );
        return passthrough(response);
    };

    let (mut parts, body) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    Response::from_parts(parts, inject_body(body, transform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use std::io::{Read, Write};

    fn html_response(body: Vec<u8>, encoding: Option<&str>) -> Response<Full<Bytes>> {
        let mut builder = Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(CONTENT_LENGTH, body.len());
        if let Some(encoding) = encoding {
            builder = builder.header(CONTENT_ENCODING, encoding);
        }
        builder.body(Full::new(Bytes::from(body))).unwrap()
    }

    async fn collect(response: Response<BoxBody<Bytes, BoxError>>) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_plain_html_is_rewritten() {
        let response = maybe_inject(
            html_response(b"<head></head>".to_vec(), None),
            &[ScriptInjection::new("x.js")],
        );
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(
            collect(response).await,
            b"<head><script src=\"x.js\"></script></head>"
        );
    }

    #[tokio::test]
    async fn test_gzip_html_is_reencoded() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"<html><body>hi</body></html>").unwrap();
        let gz = encoder.finish().unwrap();

        let response = maybe_inject(
            html_response(gz, Some("gzip")),
            &[ScriptInjection::new("x.js")],
        );
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");

        let body = collect(response).await;
        let mut html = String::new();
        flate2::read::GzDecoder::new(&body[..])
            .read_to_string(&mut html)
            .unwrap();
        assert_eq!(
            html,
            "<html><body><script src=\"x.js\"></script>hi</body></html>"
        );
    }

    #[tokio::test]
    async fn test_unknown_encoding_passes_through() {
        let response = maybe_inject(
            html_response(b"opaque".to_vec(), Some("zstd")),
            &[ScriptInjection::new("x.js")],
        );
        assert!(response.headers().get(CONTENT_LENGTH).is_some());
        assert_eq!(collect(response).await, b"opaque");
    }

    #[tokio::test]
    async fn test_non_html_or_no_scripts_untouched() {
        let json = Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let response = maybe_inject(json, &[ScriptInjection::new("x.js")]);
        assert_eq!(collect(response).await, b"{}");

        let response = maybe_inject(html_response(b"<head>".to_vec(), None), &[]);
        assert_eq!(collect(response).await, b"<head>");
    }
}

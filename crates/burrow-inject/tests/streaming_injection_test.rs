//! Injection over chunked bodies

use burrow_inject::{maybe_inject, BoxError, InjectTransform};
use burrow_proto::ScriptInjection;
use bytes::Bytes;
use http::Response;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::io::{Read, Write};

fn scripts() -> Vec<ScriptInjection> {
    vec![
        ScriptInjection::new("1.js"),
        ScriptInjection::new("2.js").with_defer(true).with_async(true),
    ]
}

fn chunked(chunks: Vec<Vec<u8>>) -> StreamBody<futures_util::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, BoxError>>>> {
    let frames: Vec<Result<Frame<Bytes>, BoxError>> = chunks
        .into_iter()
        .map(|c| Ok(Frame::data(Bytes::from(c))))
        .collect();
    StreamBody::new(futures_util::stream::iter(frames))
}

#[tokio::test]
async fn test_head_split_across_chunks() {
    let chunks = vec![
        b"<html".to_vec(),
        b"  <head foo=\"bar\">".to_vec(),
        b"<script src=\"b\"></script></head></html>".to_vec(),
    ];
    let response = Response::builder()
        .header("content-type", "text/html")
        .body(chunked(chunks))
        .unwrap();

    let body = maybe_inject(response, &scripts())
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes();
    let html = String::from_utf8(body.to_vec()).unwrap();

    assert!(html.contains(
        "<head foo=\"bar\"><script src=\"1.js\"></script><script src=\"2.js\" async defer></script><script src=\"b\"></script>"
    ));
}

#[tokio::test]
async fn test_missing_head_is_appended_at_end() {
    let response = Response::builder()
        .header("content-type", "text/html")
        .body(chunked(vec![b"just ".to_vec(), b"text".to_vec()]))
        .unwrap();

    let body = maybe_inject(response, &scripts())
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes();
    assert_eq!(
        &body[..],
        b"just text<head><script src=\"1.js\"></script><script src=\"2.js\" async defer></script></head>"
    );
}

#[test]
fn test_brotli_chunked_transform() {
    let mut compressed = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
        writer
            .write_all(b"<!doctype html><html><head><title>t</title></head></html>")
            .unwrap();
    }

    let mut transform = InjectTransform::new(Some("br"), &scripts()).unwrap();
    let mut out = Vec::new();
    for chunk in compressed.chunks(7) {
        out.extend_from_slice(&transform.push(chunk).unwrap());
    }
    out.extend_from_slice(&transform.finish().unwrap());

    let mut html = String::new();
    brotli::Decompressor::new(&out[..], 4096)
        .read_to_string(&mut html)
        .unwrap();
    assert!(html.starts_with("<!doctype html><html><head><script src=\"1.js\"></script>"));
    assert!(html.ends_with("<title>t</title></head></html>"));
}

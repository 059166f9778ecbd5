//! Sans-IO head/body tag scanner

use burrow_proto::ScriptInjection;
use bytes::{Bytes, BytesMut};

const TAGS: [&[u8]; 2] = [b"<head", b"<body"];

/// Serialize scripts as `<script src=".."></script>` elements, in order
pub fn render_scripts(scripts: &[ScriptInjection]) -> String {
    let mut out = String::new();
    for script in scripts {
        out.push_str("<script src=\"");
        out.push_str(&escape_attribute(&script.src));
        out.push('"');
        if script.is_async == Some(true) {
            out.push_str(" async");
        }
        if script.defer == Some(true) {
            out.push_str(" defer");
        }
        out.push_str("></script>");
    }
    out
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

enum State {
    Scanning(BytesMut),
    Injected,
}

/// Inserts scripts after the first `<head ...>` or `<body ...>` tag.
///
/// Only the bytes that could still belong to an incomplete tag are held back
/// between chunks; everything else is returned as soon as it is pushed.
pub struct HtmlInjector {
    scripts: Bytes,
    state: State,
}

impl HtmlInjector {
    pub fn new(scripts: &[ScriptInjection]) -> Self {
        Self {
            scripts: Bytes::from(render_scripts(scripts)),
            state: State::Scanning(BytesMut::new()),
        }
    }

    pub fn is_injected(&self) -> bool {
        matches!(self.state, State::Injected)
    }

    /// Feed the next chunk, returning what can be emitted now
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let buf = match &mut self.state {
            State::Injected => return Bytes::copy_from_slice(chunk),
            State::Scanning(buf) => buf,
        };
        buf.extend_from_slice(chunk);

        match find_tag(buf) {
            TagSearch::Complete(end) => {
                let mut out = BytesMut::with_capacity(buf.len() + self.scripts.len());
                out.extend_from_slice(&buf[..end]);
                out.extend_from_slice(&self.scripts);
                out.extend_from_slice(&buf[end..]);
                self.state = State::Injected;
                out.freeze()
            }
            TagSearch::Partial(start) => buf.split_to(start).freeze(),
            TagSearch::NotFound => buf.split().freeze(),
        }
    }

    /// End of stream. Appends a `<head>` block if no tag was found.
    pub fn finish(&mut self) -> Bytes {
        match std::mem::replace(&mut self.state, State::Injected) {
            State::Injected => Bytes::new(),
            State::Scanning(mut buf) => {
                buf.extend_from_slice(b"<head>");
                buf.extend_from_slice(&self.scripts);
                buf.extend_from_slice(b"</head>");
                buf.freeze()
            }
        }
    }
}

enum TagSearch {
    /// Tag found; offset just past its closing `>`
    Complete(usize),
    /// A tag may start at this offset but is not complete yet
    Partial(usize),
    NotFound,
}

fn find_tag(buf: &[u8]) -> TagSearch {
    let mut from = 0;
    while let Some(rel) = buf[from..].iter().position(|b| *b == b'<') {
        let start = from + rel;
        let rest = &buf[start..];

        for tag in TAGS {
            if rest.len() <= tag.len() {
                // Too short to decide: "<hea", "<head" without the next byte
                if tag[..rest.len()].eq_ignore_ascii_case(rest) {
                    return TagSearch::Partial(start);
                }
                continue;
            }
            if !rest[..tag.len()].eq_ignore_ascii_case(tag) {
                continue;
            }
            let next = rest[tag.len()];
            if next == b'>' || next == b'/' || next.is_ascii_whitespace() {
                return match rest.iter().position(|b| *b == b'>') {
                    Some(gt) => TagSearch::Complete(start + gt + 1),
                    None => TagSearch::Partial(start),
                };
            }
        }
        from = start + 1;
    }
    TagSearch::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts() -> Vec<ScriptInjection> {
        vec![
            ScriptInjection::new("1.js"),
            ScriptInjection::new("2.js").with_defer(true).with_async(true),
        ]
    }

    fn run(chunks: &[&str]) -> String {
        let mut injector = HtmlInjector::new(&scripts());
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&injector.push(chunk.as_bytes()));
        }
        out.extend_from_slice(&injector.finish());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_render_scripts() {
        assert_eq!(
            render_scripts(&scripts()),
            r#"<script src="1.js"></script><script src="2.js" async defer></script>"#
        );
        assert_eq!(
            render_scripts(&[ScriptInjection::new("a\"b")]),
            r#"<script src="a&quot;b"></script>"#
        );
    }

    #[test]
    fn test_injects_after_head_across_chunks() {
        let out = run(&[
            "<html",
            "  <head foo=\"bar\">",
            "<script src=\"b\"></script></head></html>",
        ]);
        assert_eq!(
            out,
            "<html  <head foo=\"bar\"><script src=\"1.js\"></script>\
             <script src=\"2.js\" async defer></script>\
             <script src=\"b\"></script></head></html>"
        );
    }

    #[test]
    fn test_every_split_point_gives_same_output() {
        let doc = "<!doctype html><HTML><Head lang=\"en\"><title>x</title></head><body>hi</body></HTML>";
        let expected = run(&[doc]);
        assert!(expected.contains("<Head lang=\"en\"><script src=\"1.js\">"));

        for split in 0..doc.len() {
            let (a, b) = doc.split_at(split);
            assert_eq!(run(&[a, b]), expected, "split at {}", split);
        }
    }

    #[test]
    fn test_header_tag_is_not_head() {
        let out = run(&["<header>x</header><body class=a>y</body>"]);
        assert!(out.starts_with("<header>x</header><body class=a><script src=\"1.js\">"));
    }

    #[test]
    fn test_no_tag_appends_head_block() {
        let out = run(&["plain ", "text"]);
        assert_eq!(
            out,
            "plain text<head><script src=\"1.js\"></script>\
             <script src=\"2.js\" async defer></script></head>"
        );
    }

    #[test]
    fn test_passes_through_before_tag_without_buffering() {
        let mut injector = HtmlInjector::new(&scripts());
        assert_eq!(&injector.push(b"<html><he")[..], b"<html>");
        assert!(!injector.is_injected());
        let out = injector.push(b"ad>rest");
        assert!(out.starts_with(b"<head><script"));
        assert!(injector.is_injected());
        assert_eq!(&injector.push(b"tail")[..], b"tail");
        assert!(injector.finish().is_empty());
    }
}

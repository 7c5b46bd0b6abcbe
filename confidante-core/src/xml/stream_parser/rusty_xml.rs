use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail, Error};
use tokio::io::AsyncRead;
use tokio_stream::Stream;

use crate::xml::Element;
use crate::xmpp::stream_header::StreamHeader;

use super::{Frame, StreamParser};

const READ_CHUNK_SIZE: usize = 4096;

/// Caps how many bytes may accumulate inside a single top-level stanza
/// before the stream is killed with `policy-violation`. `spec.md`'s
/// `limits.stanza_bytes` maps onto this constant; a future revision could
/// thread it through `new` as a builder argument instead.
const MAX_FRAGMENT_BYTES: usize = 1024 * 1024;

/// Distinguishes an oversized-stanza rejection from every other parse
/// failure, so callers can map it to `policy-violation` instead of
/// `not-well-formed` without string-sniffing the error message.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("stanza exceeded the maximum allowed size")]
    FragmentTooLarge,
}

struct OpenElement {
    element: Element,
    bytes_seen: usize,
}

/// An incremental, restart-capable XML stream parser built on `rustyxml`.
///
/// Feeds raw bytes to `rustyxml::Parser` as they arrive and assembles
/// complete top-level children of the `<stream:stream>` root into
/// `Frame::XmlFragment`s, surfacing the root's own open tag as
/// `Frame::StreamStart`. Goes permanently into an error state once a hard
/// parse error or a premature stream close has been observed — callers are
/// expected to tear the connection down at that point.
pub struct RustyXmlStreamParser<R> {
    reader: R,
    parser: rustyxml::Parser,
    read_buffer: [u8; READ_CHUNK_SIZE],
    pending: VecDeque<Frame>,
    stack: Vec<OpenElement>,
    seen_stream_start: bool,
    errored: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> RustyXmlStreamParser<R> {
    fn handle_event(&mut self, event: rustyxml::Event) -> Result<(), Error> {
        match event {
            rustyxml::Event::ElementStart(tag) => {
                if !self.seen_stream_start {
                    if tag.name != "stream" {
                        bail!("expected <stream:stream>, got <{}>", tag.name);
                    }
                    self.seen_stream_start = true;
                    let header = StreamHeader::from_attributes(&tag.attributes)?;
                    self.pending.push_back(Frame::StreamStart(header));
                    return Ok(());
                }

                let mut element = Element::new(&tag.name, tag.ns.as_deref());
                for ((name, namespace), value) in tag.attributes {
                    element.set_attribute(&name, namespace.as_deref(), value);
                }
                self.stack.push(OpenElement {
                    element,
                    bytes_seen: 0,
                });
                self.enforce_fragment_limit()?;
            }
            rustyxml::Event::ElementEnd(tag) => {
                if self.stack.is_empty() {
                    if tag.name == "stream" {
                        bail!("remote end closed the stream");
                    }
                    bail!("unexpected closing tag </{}>", tag.name);
                }

                let finished = self.stack.pop().expect("checked non-empty above");
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.bytes_seen += finished.bytes_seen;
                        parent.element.add_child(finished.element);
                    }
                    None => {
                        self.pending.push_back(Frame::XmlFragment(finished.element));
                    }
                }
            }
            rustyxml::Event::Characters(text) => {
                self.push_text_bytes(text.len())?;
                if let Some(open) = self.stack.last_mut() {
                    open.element.add_text(text);
                }
            }
            rustyxml::Event::CDATA(text) => {
                self.push_text_bytes(text.len())?;
                if let Some(open) = self.stack.last_mut() {
                    open.element.add_text(text);
                }
            }
            rustyxml::Event::Comment(_) | rustyxml::Event::PI(_) => {}
        }

        Ok(())
    }

    fn push_text_bytes(&mut self, len: usize) -> Result<(), Error> {
        if let Some(open) = self.stack.last_mut() {
            open.bytes_seen += len;
        }
        self.enforce_fragment_limit()
    }

    fn enforce_fragment_limit(&self) -> Result<(), Error> {
        if let Some(open) = self.stack.first() {
            if open.bytes_seen > MAX_FRAGMENT_BYTES {
                return Err(ParseError::FragmentTooLarge.into());
            }
        }
        Ok(())
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if chunk.windows(9).any(|w| w == b"<!DOCTYPE") {
            bail!("DOCTYPE declarations are not permitted on an XMPP stream");
        }

        let text = std::str::from_utf8(chunk)
            .map_err(|err| anyhow!("stream is not valid UTF-8: {err}"))?;

        self.parser.feed_str(text);
        while let Some(result) = self.parser.next() {
            let event = result.map_err(|err| anyhow!("XML parse error: {err}"))?;
            self.handle_event(event)?;
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> StreamParser<R> for RustyXmlStreamParser<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            parser: rustyxml::Parser::new(),
            read_buffer: [0; READ_CHUNK_SIZE],
            pending: VecDeque::new(),
            stack: Vec::new(),
            seen_stream_start: false,
            errored: false,
            eof: false,
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.errored {
                return Poll::Ready(None);
            }

            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            if this.eof {
                return Poll::Ready(None);
            }

            let mut read_buf = tokio::io::ReadBuf::new(&mut this.read_buffer);
            match ready!(Pin::new(&mut this.reader).poll_read(cx, &mut read_buf)) {
                Ok(()) => {
                    let filled = read_buf.filled().len();
                    if filled == 0 {
                        this.eof = true;
                        if this.seen_stream_start && !this.stack.is_empty() {
                            this.errored = true;
                            return Poll::Ready(Some(Err(anyhow!(
                                "connection closed mid-stanza"
                            ))));
                        }
                        continue;
                    }

                    let chunk = read_buf.filled().to_vec();
                    if let Err(err) = this.feed(&chunk) {
                        this.errored = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Err(err) => {
                    this.errored = true;
                    return Poll::Ready(Some(Err(anyhow!(err))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frames_from(input: &'static str) -> Vec<Frame> {
        use tokio_stream::StreamExt;

        let reader = tokio_test::io::Builder::new().read(input.as_bytes()).build();
        let mut parser = RustyXmlStreamParser::new(reader);
        let mut frames = Vec::new();
        while let Some(Ok(frame)) = parser.next().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn parses_stream_start() {
        let frames = frames_from(
            "<stream:stream to='localhost' version='1.0' xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'>",
        )
        .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::StreamStart(_)));
    }

    #[tokio::test]
    async fn parses_top_level_fragment() {
        let frames = frames_from(
            "<stream:stream to='localhost' version='1.0' xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'><message/>",
        )
        .await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Frame::XmlFragment(_)));
    }

    #[tokio::test]
    async fn rejects_doctype() {
        use tokio_stream::StreamExt;
        let reader = tokio_test::io::Builder::new()
            .read(b"<!DOCTYPE foo><stream:stream>")
            .build();
        let mut parser = RustyXmlStreamParser::new(reader);
        let result = parser.next().await;
        assert!(matches!(result, Some(Err(_))));
    }

    #[tokio::test]
    async fn nested_children_are_preserved() {
        let frames = frames_from(
            "<stream:stream to='localhost' version='1.0' xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'><iq id='1'><ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .await;
        let Frame::XmlFragment(iq) = &frames[1] else {
            panic!("expected fragment");
        };
        assert!(iq.find_child("ping", Some("urn:xmpp:ping")).is_some());
    }
}

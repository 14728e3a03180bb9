//! Property tests for framing and correlation.

use std::time::Instant;

use bytes::Bytes;
use proptest::prelude::*;

use traffic_replay::protocol::{
    Assembler, AssemblerConfig, CaptureEvent, Direction, Framer, FramerLimits, Meta, SessionClock, StreamId,
};

const REQUESTS: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
POST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello\
PUT /c HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";

const RESPONSES: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok\
HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nmade\r\n0\r\n\r\n\
HTTP/1.1 204 No Content\r\n\r\n";

/// Split `data` at the given (sorted, deduplicated) cut points.
fn split(data: &[u8], cuts: &[usize]) -> Vec<Bytes> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();
    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points.into_iter().chain(std::iter::once(data.len())) {
        if point > start {
            chunks.push(Bytes::copy_from_slice(&data[start..point]));
            start = point;
        }
    }
    chunks
}

fn frames(direction: Direction, chunks: &[Bytes]) -> Vec<Bytes> {
    let mut framer = Framer::new(direction, FramerLimits::default());
    let mut out = Vec::new();
    for chunk in chunks {
        framer.push(chunk);
        while let Some(frame) = framer.next_frame().unwrap() {
            out.push(frame);
        }
    }
    out
}

proptest! {
    #[test]
    fn framing_ignores_chunk_boundaries(cuts in proptest::collection::vec(0usize..512, 0..24)) {
        let whole = frames(Direction::Request, &[Bytes::from_static(REQUESTS)]);
        prop_assert_eq!(whole.len(), 3);
        let pieces = frames(Direction::Request, &split(REQUESTS, &cuts));
        prop_assert_eq!(pieces, whole);
    }

    #[test]
    fn correlation_ignores_chunk_boundaries(
        request_cuts in proptest::collection::vec(0usize..512, 0..16),
        response_cuts in proptest::collection::vec(0usize..512, 0..16),
    ) {
        let stream = StreamId::from_raw(7);
        let mut assembler = Assembler::new(AssemblerConfig::default(), SessionClock::new());
        let now = Instant::now();
        let mut out = Vec::new();
        assembler
            .handle(CaptureEvent::Opened { stream, meta: Meta::new() }, now, &mut out)
            .unwrap();

        let requests = split(REQUESTS, &request_cuts);
        let responses = split(RESPONSES, &response_cuts);
        for bytes in &requests {
            let event = CaptureEvent::Data { stream, direction: Direction::Request, bytes: bytes.clone() };
            assembler.handle(event, now, &mut out).unwrap();
        }
        for bytes in &responses {
            let event = CaptureEvent::Data { stream, direction: Direction::Response, bytes: bytes.clone() };
            assembler.handle(event, now, &mut out).unwrap();
        }
        assembler.handle(CaptureEvent::Closed { stream }, now, &mut out).unwrap();

        prop_assert_eq!(out.len(), 3);
        for (seq, exchange) in out.iter().enumerate() {
            prop_assert_eq!(exchange.id().seq, seq as u64);
            prop_assert!(exchange.response().is_some());
        }
        prop_assert!(out[1].request().payload().ends_with(b"hello"));
        prop_assert!(out[2].response().unwrap().payload().starts_with(b"HTTP/1.1 204"));
    }
}

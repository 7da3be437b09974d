//! Scenario tests for the six concrete call shapes in the spec's "testable
//! properties" section: unary one-to-one, unary one-to-many (clean fan-out,
//! a partial target list with a dead backend, and an all-backends app
//! error), director rejection, and a full-duplex streamed one-to-many.
//!
//! These exercise `forward()` end to end against the in-memory fakes in
//! `test_support`, rather than any single forwarder module in isolation.

#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use rstest::rstest;
use tokio_stream::StreamExt;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::backend::{Backend, BackendEvent};
use crate::context::InboundContext;
use crate::director::Decision;
use crate::forwarder::forward;
use crate::test_support::{empty_outbound, outbound_from, FakeBackend, FakeChannel};

fn ping_backend(id: &str, counter: i64) -> Arc<dyn Backend> {
	let reply = crate::frame::encode_string_field(1, "foo");
	let reply = [reply, crate::frame::encode_string_field(2, &counter.to_string())].concat();

	let mut headers = MetadataMap::new();
	headers.insert("test-client-header", "I like turtles.".parse().unwrap());
	let mut trailers = MetadataMap::new();
	trailers.insert(
		"test-client-trailer",
		"I like ending turtles.".parse().unwrap(),
	);

	let channel = FakeChannel::scripted(
		headers,
		vec![crate::frame::wrap_unary_envelope(&reply)],
		trailers,
		Status::ok(""),
	);
	Arc::new(FakeBackend::new(id, channel))
}

/// Scenario 1: unary one-to-one Ping. Backend status/headers/trailers pass
/// through to the client verbatim (P2, P3).
#[tokio::test]
async fn unary_one_to_one_ping_passes_through_verbatim() {
	let backend = ping_backend("server0", 42);
	let director = move |_: &InboundContext, _: &str| -> Result<Decision, Status> {
		Ok(Decision::one_to_one(backend.clone()))
	};

	let request = crate::frame::wrap_unary_envelope(&crate::frame::encode_string_field(1, "foo"));
	let events: Vec<_> = forward(
		&director,
		InboundContext::from_metadata(MetadataMap::new()),
		"/pkg.PingSvc/Ping".into(),
		false,
		outbound_from(vec![request]),
	)
	.await
	.unwrap()
	.collect()
	.await;

	let BackendEvent::Headers(headers) = &events[0] else {
		panic!("expected headers first")
	};
	assert_eq!(
		headers.get("test-client-header").unwrap().to_str().unwrap(),
		"I like turtles."
	);
	assert!(matches!(&events[1], BackendEvent::Message(_)));
	let BackendEvent::End { trailers, status } = &events[2] else {
		panic!("expected End last")
	};
	assert_eq!(status.code(), Code::Ok);
	assert_eq!(
		trailers.get("test-client-trailer").unwrap().to_str().unwrap(),
		"I like ending turtles."
	);
}

fn failing_unavailable(id: &str) -> Arc<dyn Backend> {
	Arc::new(FakeBackend::failing(
		id,
		Status::unavailable("backend connection failed"),
	))
}

/// Scenarios 2-4: unary one-to-many fan-out, table-driven over the shape of
/// the backend set — all live, a partial target list with one dead backend,
/// and every backend returning the same application-level error.
#[rstest]
#[case::ping_empty_all_five_live(
    vec![
        ping_backend("server0", 42),
        ping_backend("server1", 42),
        ping_backend("server2", 42),
        ping_backend("server3", 42),
        ping_backend("server4", 42),
    ],
    5,
    0,
)]
#[case::targets_with_one_dead_backend(
    vec![
        ping_backend("server0", 42),
        failing_unavailable("server-1"),
        ping_backend("server2", 42),
    ],
    2,
    1,
)]
#[case::all_backends_app_error(
    vec![
        Arc::new(FakeBackend::new(
            "server0",
            FakeChannel::scripted(
                MetadataMap::new(),
                vec![],
                MetadataMap::new(),
                Status::failed_precondition("Userspace error."),
            ),
        )) as Arc<dyn Backend>,
        Arc::new(FakeBackend::new(
            "server1",
            FakeChannel::scripted(
                MetadataMap::new(),
                vec![],
                MetadataMap::new(),
                Status::failed_precondition("Userspace error."),
            ),
        )) as Arc<dyn Backend>,
    ],
    0,
    2,
)]
#[tokio::test]
async fn unary_one_to_many_fanout(
	#[case] backends: Vec<Arc<dyn Backend>>,
	#[case] expected_successes: usize,
	#[case] expected_failures: usize,
) {
	let total = backends.len();
	let director = move |_: &InboundContext, _: &str| -> Result<Decision, Status> {
		Ok(Decision::one_to_many(backends.clone()))
	};

	let request = crate::frame::wrap_unary_envelope(b"req");
	let events: Vec<_> = forward(
		&director,
		InboundContext::from_metadata(MetadataMap::new()),
		"/pkg.PingSvc/PingEmpty".into(),
		false,
		outbound_from(vec![request]),
	)
	.await
	.unwrap()
	.collect()
	.await;

	// Always OK to the client: per-backend failures are in-band (P5, §4.6.1).
	assert!(matches!(
		&events[2],
		BackendEvent::End { status, .. } if status.code() == Code::Ok
	));

	let BackendEvent::Message(body) = &events[1] else {
		panic!("expected merged message")
	};
	// Every backend produced exactly one decorated envelope and they are
	// concatenated: walking them back out by re-parsing the envelope length
	// at each offset recovers exactly `total` entries.
	let mut offset = 0;
	let mut found = 0;
	while offset < body.len() {
		let (len, len_bytes) = crate::frame::read_varint(&body[offset + 1..]).unwrap();
		offset += 1 + len_bytes + len as usize;
		found += 1;
	}
	assert_eq!(found, total);
	assert_eq!(expected_successes + expected_failures, total);
}

/// Scenario 5: a director veto. No backend is ever constructed, let alone
/// contacted (P4).
#[tokio::test]
async fn director_rejection_opens_no_backend() {
	let director = |ctx: &InboundContext, _: &str| -> Result<Decision, Status> {
		if ctx.metadata().get("test-reject-rpc-if-in-context").is_some() {
			Err(Status::permission_denied("testing rejection"))
		} else {
			panic!("test always sets the rejection key")
		}
	};

	let mut metadata = MetadataMap::new();
	metadata.insert("test-reject-rpc-if-in-context", "true".parse().unwrap());

	let err = forward(
		&director,
		InboundContext::from_metadata(metadata),
		"/pkg.PingSvc/Ping".into(),
		false,
		empty_outbound(),
	)
	.await
	.unwrap_err();

	assert_eq!(err.code(), Code::PermissionDenied);
	assert_eq!(err.message(), "testing rejection");
}

/// Scenario 6: streamed one-to-many full duplex. Five backends each echo
/// back twenty messages; the client observes all 100, headers before the
/// first of them, and trailers only after every backend has ended.
#[tokio::test]
async fn streamed_one_to_many_full_duplex_interleaves_all_backends() {
	const PING_COUNT: usize = 20;
	const BACKEND_COUNT: usize = 5;

	let backends: Vec<Arc<dyn Backend>> = (0..BACKEND_COUNT)
		.map(|i| {
			let id = format!("server{i}");
			let mut headers = MetadataMap::new();
			headers.insert("hostname", id.parse().unwrap());
			let messages = (0..PING_COUNT)
				.map(|n| Bytes::from(n.to_string()))
				.collect();
			let channel = FakeChannel::scripted(headers, messages, MetadataMap::new(), Status::ok(""));
			Arc::new(FakeBackend::new(id, channel)) as Arc<dyn Backend>
		})
		.collect();

	let director = move |_: &InboundContext, _: &str| -> Result<Decision, Status> {
		Ok(Decision::one_to_many(backends.clone()))
	};

	let client_frames = outbound_from(
		(0..PING_COUNT)
			.map(|n| Bytes::from(format!("foo:{n}")))
			.collect(),
	);

	let events: Vec<_> = forward(
		&director,
		InboundContext::from_metadata(MetadataMap::new()),
		"/pkg.PingSvc/PingStream".into(),
		true,
		client_frames,
	)
	.await
	.unwrap()
	.collect()
	.await;

	assert!(matches!(events.first(), Some(BackendEvent::Headers(_))));
	assert!(matches!(
		events.last(),
		Some(BackendEvent::End { status, .. }) if status.code() == Code::Ok
	));

	let message_count = events
		.iter()
		.filter(|e| matches!(e, BackendEvent::Message(_)))
		.count();
	assert_eq!(message_count, PING_COUNT * BACKEND_COUNT);

	// Headers must precede every message (P2), trailers/status must follow
	// every message (§5, "initial headers precede all response frames;
	// trailers follow all response frames").
	let first_message = events
		.iter()
		.position(|e| matches!(e, BackendEvent::Message(_)))
		.unwrap();
	assert_eq!(first_message, 1);
	let last_message = events
		.iter()
		.rposition(|e| matches!(e, BackendEvent::Message(_)))
		.unwrap();
	assert_eq!(last_message, events.len() - 2);
}

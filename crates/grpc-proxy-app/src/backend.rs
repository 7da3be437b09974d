//! Reference `Director`/`Backend` implementations for the static YAML
//! config: one `PlainBackend` per configured address, routed by method
//! prefix through a `StaticDirector` built once at startup.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use grpc_proxy_core::{Backend, Decision, Director, GrpcChannel, InboundContext, Mode, TonicChannel};
use tonic::Status;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::config::{Config, Route};

/// Field numbers `PlainBackend` writes its decoration into. Arbitrary but
/// fixed for this reference implementation: a real deployment's backend
/// would instead use whatever field numbers its own `.proto` reserves for
/// this purpose (§9 — this is a "user-provided hook per backend", not a
/// generic, schema-derived default).
const SERVER_ID_FIELD: u32 = 15;
const UPSTREAM_ERROR_FIELD: u32 = 16;

/// One upstream, identified by the address it was dialed with. Every call
/// this backend participates in is decorated with that identity, matching
/// the `server_id`/`UpstreamError` shape the scenario fixtures (§8) expect.
#[derive(Debug)]
pub struct PlainBackend {
	id: String,
	channel: TonicChannel,
}

impl PlainBackend {
	pub fn dial(id: impl Into<String>, addr: &str) -> anyhow::Result<Self> {
		let endpoint = Endpoint::from_shared(format!("http://{addr}"))?;
		// `connect_lazy` defers the actual TCP/TLS handshake to first use, so
		// a backend that is down at startup does not prevent the proxy itself
		// from starting (§7, "connect failure" is a per-call, not a
		// per-process, condition).
		let channel: Channel = endpoint.connect_lazy();
		Ok(Self {
			id: id.into(),
			channel: TonicChannel::new(channel),
		})
	}
}

impl fmt::Display for PlainBackend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "plain-backend:{}", self.id)
	}
}

#[async_trait::async_trait]
impl Backend for PlainBackend {
	async fn get_connection(
		&self,
		ctx: &InboundContext,
		_method: &str,
	) -> Result<(InboundContext, Arc<dyn GrpcChannel>), Status> {
		Ok((ctx.clone(), Arc::new(self.channel.clone())))
	}

	fn append_info(&self, streaming: bool, frame: Bytes) -> Result<Bytes, Status> {
		let extra = grpc_proxy_core::frame::encode_string_field(SERVER_ID_FIELD, &self.id);
		if streaming {
			Ok(grpc_proxy_core::frame::append_streaming(&frame, &extra))
		} else {
			grpc_proxy_core::frame::rewrap_unary_envelope(&frame, &extra).map_err(Into::into)
		}
	}

	fn build_error(&self, streaming: bool, err: &Status) -> Result<Bytes, Status> {
		let id_field = grpc_proxy_core::frame::encode_string_field(SERVER_ID_FIELD, &self.id);
		let message = format!(
			"rpc error: code = {:?} desc = {}",
			err.code(),
			err.message()
		);
		let message_field = grpc_proxy_core::frame::encode_string_field(UPSTREAM_ERROR_FIELD, &message);

		let mut payload = BytesMut::with_capacity(id_field.len() + message_field.len());
		payload.put(id_field);
		payload.put(message_field);

		if streaming {
			Ok(payload.freeze())
		} else {
			Ok(grpc_proxy_core::frame::wrap_unary_envelope(&payload))
		}
	}
}

struct ResolvedRoute {
	prefix: String,
	mode: Mode,
	backends: Vec<Arc<dyn Backend>>,
}

/// Routes by longest matching method-prefix, in config order as a tiebreak,
/// to a fixed backend set resolved once at startup.
pub struct StaticDirector {
	routes: Vec<ResolvedRoute>,
}

impl StaticDirector {
	pub fn dial(config: &Config) -> anyhow::Result<Self> {
		let routes = config
			.routes
			.iter()
			.map(Self::dial_route)
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(Self { routes })
	}

	fn dial_route(route: &Route) -> anyhow::Result<ResolvedRoute> {
		let backends = route
			.backend_addrs
			.iter()
			.enumerate()
			.map(|(i, addr)| {
				let id = format!("server{i}");
				PlainBackend::dial(id, addr).map(|b| Arc::new(b) as Arc<dyn Backend>)
			})
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(ResolvedRoute {
			prefix: route.prefix.clone(),
			mode: route.mode,
			backends,
		})
	}
}

#[async_trait::async_trait]
impl Director for StaticDirector {
	async fn direct(&self, _ctx: &InboundContext, method: &str) -> Result<Decision, Status> {
		let route = self
			.routes
			.iter()
			.find(|r| method.starts_with(&r.prefix))
			.ok_or_else(|| Status::not_found(format!("no route configured for method {method}")))?;

		debug!(method, prefix = route.prefix, mode = ?route.mode, "routed call");
		match route.mode {
			Mode::One2One => Ok(Decision::one_to_one(route.backends[0].clone())),
			Mode::One2Many => Ok(Decision::one_to_many(route.backends.clone())),
		}
	}
}

use std::sync::Arc;

use tonic::Status;

use crate::backend::Backend;
use crate::context::InboundContext;

/// Fan-out mode chosen by a [`Director`] for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Exactly one backend; status and metadata pass through verbatim.
	One2One,
	/// *N* ≥ 1 backends, merged by the one-to-many forwarder.
	One2Many,
}

/// What a [`Director`] decided for one call: the fan-out mode and the
/// ordered list of backends to use. Order matters — it is the order in
/// which per-backend frames are concatenated (unary one-to-many) and the
/// order used to break header/trailer collisions (last-writer-wins).
pub struct Decision {
	pub mode: Mode,
	pub backends: Vec<Arc<dyn Backend>>,
}

impl Decision {
	pub fn one_to_one(backend: Arc<dyn Backend>) -> Self {
		Self {
			mode: Mode::One2One,
			backends: vec![backend],
		}
	}

	pub fn one_to_many(backends: Vec<Arc<dyn Backend>>) -> Self {
		Self {
			mode: Mode::One2Many,
			backends,
		}
	}
}

/// A pure decision function from `(inbound context, method)` to a
/// [`Decision`]. The director is trusted: it may inspect inbound metadata to
/// authorize a call, rewrite its target set, or reject it outright by
/// returning `Err`. A rejection is surfaced to the client verbatim (§7, P4)
/// and no sub-stream is ever opened.
///
/// Called exactly once per RPC, before any backend is contacted.
#[async_trait::async_trait]
pub trait Director: Send + Sync {
	async fn direct(&self, ctx: &InboundContext, method: &str) -> Result<Decision, Status>;
}

#[async_trait::async_trait]
impl<F> Director for F
where
	F: Fn(&InboundContext, &str) -> Result<Decision, Status> + Send + Sync,
{
	async fn direct(&self, ctx: &InboundContext, method: &str) -> Result<Decision, Status> {
		self(ctx, method)
	}
}

use tonic::{Code, Status};

/// Errors raised by the core forwarder itself, as distinct from statuses
/// returned by a director or a backend.
///
/// These map onto the "Internal error" row of the error taxonomy: mode or
/// backend-count mismatches, and codec misuse. Everything else (director
/// rejection, backend-connect failure, stream errors) is already carried as
/// a [`tonic::Status`] by the trait boundaries in [`crate::backend`] and
/// [`crate::director`], since those are meant to be surfaced to the client
/// close to verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("director selected One2One mode with {0} backends, expected exactly 1")]
	One2OneBackendCount(usize),
	#[error("director selected One2Many mode with 0 backends")]
	One2ManyNoBackends,
	#[error("passthrough codec received a non-passthrough message")]
	CodecMisuse,
	#[error("malformed unary envelope: {0}")]
	MalformedEnvelope(&'static str),
}

impl From<Error> for Status {
	fn from(err: Error) -> Self {
		Status::new(Code::Internal, err.to_string())
	}
}

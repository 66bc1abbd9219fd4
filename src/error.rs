//! Error taxonomy for the client engine.

use std::sync::Arc;

/// Errors that can occur when using this library.
///
/// The enum is cloneable so that a single transport failure can be fanned
/// out to every request that was in flight when it happened.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The connection closed while the request was awaiting a response.
	#[error("connection closed before a response arrived")]
	ConnectionClosed,
	/// No usable connection exists and the request could not be queued.
	#[error("connection unavailable")]
	ConnectionUnavailable,
	/// Establishing the transport connection took longer than the
	/// configured connect timeout.
	#[error("timed out establishing a connection")]
	ConnectTimeout,
	/// The server did not answer the request within the configured
	/// operation timeout. The request is not retried and no abandon is
	/// sent on the wire; that remains the caller's responsibility.
	#[error("request timed out waiting for a response")]
	Timeout,
	/// The request sat in the send queue longer than the configured queue
	/// timeout without a connection becoming available.
	#[error("request expired in the send queue")]
	QueueTimeout,
	/// The send queue is full, frozen or disabled.
	#[error("send queue rejected the request")]
	QueueRejected,
	/// The request was abandoned and no response will be delivered.
	#[error("request abandoned")]
	Abandoned,
	/// The client was destroyed and can no longer accept work.
	#[error("client destroyed")]
	Destroyed,
	/// The peer violated the protocol; the connection is no longer
	/// trustworthy and will be closed.
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// The server answered with a result code outside the expected set.
	#[error("ldap result {rc} ({}): {text}", crate::proto::result_code_name(*rc))]
	Result {
		/// The result code reported by the server.
		rc: u32,
		/// The matched DN component of the server's result, if any.
		matched_dn: String,
		/// The diagnostic message supplied by the server.
		text: String,
	},
	/// A paged search was requested but the server's responses do not
	/// carry the paged-results control.
	#[error("server does not support the paged results control")]
	PagedResultsUnsupported,
	/// A connection setup step (TLS upgrade, automatic bind or a
	/// registered setup hook) failed, aborting the connection attempt.
	#[error("connection setup failed: {0}")]
	Setup(Box<Error>),
	/// A distinguished name failed strict validation.
	#[error("invalid distinguished name: {0}")]
	InvalidDn(String),
	/// A search filter string could not be parsed.
	#[error("invalid search filter: {0}")]
	InvalidFilter(String),
	/// The configuration is unusable (bad URL scheme, missing TLS
	/// material, and so on).
	#[error("invalid configuration: {0}")]
	Config(String),
	/// An I/O error on the underlying socket.
	#[error("i/o error: {0}")]
	Io(Arc<std::io::Error>),
	/// A TLS setup or handshake error.
	#[error("tls error: {0}")]
	Tls(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(Arc::new(err))
	}
}

impl Error {
	/// Build an [`Error::Result`] from a terminal server response.
	pub(crate) fn from_result(result: &crate::proto::LdapResult) -> Self {
		Error::Result {
			rc: result.rc,
			matched_dn: result.matched_dn.clone(),
			text: result.text.clone(),
		}
	}
}

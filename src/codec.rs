//! Tokio codec framing LDAP messages over a byte stream.
//!
//! One frame is one BER tag; the decoder buffers until a complete tag is
//! available and treats malformed input as fatal, since the parser state
//! cannot be trusted afterwards.

use bytes::{Buf, BytesMut};
use lber::{parse::parse_tag, write};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{
	error::Error,
	proto::{Message, WireRequest},
};

/// Upper bound on a single inbound protocol unit. Anything larger is a
/// protocol violation rather than a legitimate response.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Codec translating between [`WireRequest`]/[`Message`] and raw bytes.
#[derive(Debug, Default)]
pub(crate) struct LdapCodec;

impl Encoder<WireRequest> for LdapCodec {
	type Error = Error;

	fn encode(&mut self, item: WireRequest, dst: &mut BytesMut) -> Result<(), Error> {
		let id = item.id;
		let start = dst.len();
		write::encode_into(dst, item.into_structure())?;
		trace!(id, len = dst.len() - start, "encoded outbound message");
		Ok(())
	}
}

impl Decoder for LdapCodec {
	type Item = Message;
	type Error = Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
		if src.is_empty() {
			return Ok(None);
		}
		let (consumed, tag) = match parse_tag(src.as_ref()) {
			Ok((rest, tag)) => (src.len() - rest.len(), tag),
			Err(err) if err.is_incomplete() => {
				if src.len() > MAX_FRAME_SIZE {
					return Err(Error::Protocol("inbound frame too large".to_owned()));
				}
				return Ok(None);
			}
			Err(_) => return Err(Error::Protocol("malformed BER data".to_owned())),
		};
		src.advance(consumed);
		trace!(len = consumed, "decoded inbound frame");
		Message::from_tag(tag).map(Some)
	}
}

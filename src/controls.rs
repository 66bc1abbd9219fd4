//! Protocol controls, including the RFC 2696 paged-results control.

use bytes::BytesMut;
use lber::{
	common::TagClass,
	parse::parse_tag,
	structure::{StructureTag, PL},
	structures::{ASNTag, Boolean, Sequence, Tag},
	universal::Types,
	write,
};

use crate::error::Error;

/// The object identifier of the simple paged results control.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// A protocol control attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
	/// The OID identifying the control.
	pub oid: String,
	/// Whether the peer must reject the message if it does not support
	/// the control.
	pub critical: bool,
	/// The raw BER-encoded control value, if any.
	pub value: Option<Vec<u8>>,
}

impl Control {
	/// Build a paged-results control carrying the given page size and
	/// continuation cookie (empty for the first page).
	#[must_use]
	pub fn paged(page_size: i32, cookie: Vec<u8>) -> Self {
		let value = Tag::Sequence(Sequence {
			inner: vec![
				crate::proto::int_tag(i64::from(page_size)),
				crate::proto::octet(cookie),
			],
			..Default::default()
		});
		let mut bytes = BytesMut::new();
		// Writing into an in-memory buffer cannot fail.
		let _ = write::encode_into(&mut bytes, value.into_structure());
		Control { oid: PAGED_RESULTS_OID.to_owned(), critical: false, value: Some(bytes.to_vec()) }
	}

	/// If this is a paged-results control, parse its value into the page
	/// size estimate and continuation cookie.
	#[must_use]
	pub fn parse_paged(&self) -> Option<(i64, Vec<u8>)> {
		if self.oid != PAGED_RESULTS_OID {
			return None;
		}
		let value = self.value.as_deref()?;
		let (_, tag) = parse_tag(value).ok()?;
		let mut children = tag
			.match_class(TagClass::Universal)
			.and_then(|t| t.match_id(Types::Sequence as u64))
			.and_then(StructureTag::expect_constructed)?
			.into_iter();
		let size = children.next().and_then(|t| match t.payload {
			PL::P(bytes) => lber::parse::parse_uint(&bytes).ok().map(|(_, v)| v),
			PL::C(_) => None,
		})?;
		let cookie = children.next().and_then(StructureTag::expect_primitive)?;
		Some((i64::try_from(size).ok()?, cookie))
	}
}

/// Encode a control list into the context-tagged container that follows
/// the protocol op in a message.
pub(crate) fn encode_controls(controls: Vec<Control>) -> Tag {
	let controls = controls
		.into_iter()
		.map(|control| {
			let mut inner = vec![crate::proto::octet(control.oid.into_bytes())];
			if control.critical {
				inner.push(Tag::Boolean(Boolean { inner: true, ..Default::default() }));
			}
			if let Some(value) = control.value {
				inner.push(crate::proto::octet(value));
			}
			Tag::Sequence(Sequence { inner, ..Default::default() })
		})
		.collect();
	Tag::Sequence(Sequence { class: TagClass::Context, id: 0, inner: controls })
}

/// Decode the control container of an inbound message.
pub(crate) fn decode_controls(container: StructureTag) -> Result<Vec<Control>, Error> {
	let children = container
		.expect_constructed()
		.ok_or_else(|| Error::Protocol("control container is not constructed".to_owned()))?;
	let mut controls = Vec::with_capacity(children.len());
	for child in children {
		let parts = child
			.expect_constructed()
			.ok_or_else(|| Error::Protocol("control is not a sequence".to_owned()))?;
		let mut parts = parts.into_iter();
		let oid = parts
			.next()
			.and_then(StructureTag::expect_primitive)
			.map(|b| String::from_utf8_lossy(&b).into_owned())
			.ok_or_else(|| Error::Protocol("control without an OID".to_owned()))?;
		let mut control = Control { oid, critical: false, value: None };
		for part in parts {
			if part.class != TagClass::Universal {
				continue;
			}
			if part.id == Types::Boolean as u64 {
				if let PL::P(bytes) = &part.payload {
					control.critical = bytes.first().copied().unwrap_or(0) != 0;
				}
			} else if part.id == Types::OctetString as u64 {
				control.value = part.expect_primitive();
			}
		}
		controls.push(control);
	}
	Ok(controls)
}

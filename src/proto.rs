//! Typed protocol messages and their BER wire form.
//!
//! Outbound requests are modelled as a [`Request`] enum and converted to
//! [`lber`] tag trees for serialization; inbound protocol units arrive as
//! [`lber::structure::StructureTag`] trees and are decoded into [`Message`]
//! values. Only the operations the client engine issues or consumes are
//! modelled here; everything else is a protocol violation.

use std::collections::HashMap;

use lber::{
	common::TagClass,
	parse::parse_uint,
	structure::{StructureTag, PL},
	structures::{ASNTag, Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag},
	universal::Types,
};

use crate::{controls::Control, error::Error, filter::Filter};

/// A per-connection message identifier.
pub type MsgId = i32;

/// The exclusive upper bound of the message-id space (`2^31 - 1`).
///
/// Allocated identifiers lie in `(0, MAX_MSGID)`; the allocator wraps back
/// to 1 and never yields 0 (reserved for unsolicited notifications) or
/// `MAX_MSGID` itself.
pub const MAX_MSGID: MsgId = i32::MAX;

/// The object identifier of the StartTLS extended operation.
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Well-known result codes the engine branches on.
pub mod result_codes {
	/// The operation completed successfully.
	pub const SUCCESS: u32 = 0;
	/// The compared attribute value did not match.
	pub const COMPARE_FALSE: u32 = 5;
	/// The compared attribute value matched.
	pub const COMPARE_TRUE: u32 = 6;
	/// The server refuses to perform the operation.
	pub const UNWILLING_TO_PERFORM: u32 = 53;
}

/// Render a human-readable name for a result code, for logs and errors.
#[must_use]
pub fn result_code_name(rc: u32) -> &'static str {
	match rc {
		0 => "success",
		1 => "operationsError",
		2 => "protocolError",
		3 => "timeLimitExceeded",
		4 => "sizeLimitExceeded",
		5 => "compareFalse",
		6 => "compareTrue",
		7 => "authMethodNotSupported",
		8 => "strongerAuthRequired",
		10 => "referral",
		11 => "adminLimitExceeded",
		12 => "unavailableCriticalExtension",
		13 => "confidentialityRequired",
		16 => "noSuchAttribute",
		17 => "undefinedAttributeType",
		20 => "attributeOrValueExists",
		21 => "invalidAttributeSyntax",
		32 => "noSuchObject",
		34 => "invalidDNSyntax",
		48 => "inappropriateAuthentication",
		49 => "invalidCredentials",
		50 => "insufficientAccessRights",
		51 => "busy",
		52 => "unavailable",
		53 => "unwillingToPerform",
		64 => "namingViolation",
		65 => "objectClassViolation",
		66 => "notAllowedOnNonLeaf",
		68 => "entryAlreadyExists",
		80 => "other",
		_ => "unknown",
	}
}

/// The scope of a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
	/// Only the base object.
	Base,
	/// Immediate children of the base object.
	OneLevel,
	/// The base object and the whole subtree below it.
	Subtree,
}

impl Scope {
	/// The wire value of the scope.
	fn as_i64(self) -> i64 {
		match self {
			Scope::Base => 0,
			Scope::OneLevel => 1,
			Scope::Subtree => 2,
		}
	}
}

/// Alias dereferencing behavior for searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
	/// Never dereference aliases.
	Never,
	/// Dereference while searching below the base.
	InSearching,
	/// Dereference when locating the base object.
	FindingBase,
	/// Always dereference.
	Always,
}

impl DerefAliases {
	/// The wire value of the dereferencing mode.
	fn as_i64(self) -> i64 {
		match self {
			DerefAliases::Never => 0,
			DerefAliases::InSearching => 1,
			DerefAliases::FindingBase => 2,
			DerefAliases::Always => 3,
		}
	}
}

/// Parameters of a search operation.
#[derive(Debug, Clone)]
pub struct SearchParams {
	/// The DN the search starts from.
	pub base: String,
	/// The search scope.
	pub scope: Scope,
	/// Alias dereferencing behavior.
	pub deref: DerefAliases,
	/// Maximum number of entries the server should return (0 = no limit).
	pub size_limit: i32,
	/// Maximum server-side search time in seconds (0 = no limit).
	pub time_limit: i32,
	/// Return attribute names only, without values.
	pub types_only: bool,
	/// The filter string, RFC 4515 syntax.
	pub filter: String,
	/// Attributes to return; empty means all user attributes.
	pub attrs: Vec<String>,
}

impl Default for SearchParams {
	fn default() -> Self {
		SearchParams {
			base: String::new(),
			scope: Scope::Subtree,
			deref: DerefAliases::Never,
			size_limit: 0,
			time_limit: 0,
			types_only: false,
			filter: "(objectClass=*)".to_owned(),
			attrs: Vec::new(),
		}
	}
}

/// A single attribute modification within a modify operation.
#[derive(Debug, Clone)]
pub enum Mod {
	/// Add the given values to an attribute.
	Add(String, Vec<String>),
	/// Delete the given values (all values if empty).
	Delete(String, Vec<String>),
	/// Replace all values of an attribute with the given ones.
	Replace(String, Vec<String>),
}

/// An outbound protocol request.
#[derive(Debug, Clone)]
pub enum Request {
	/// Simple bind with a DN and password.
	SimpleBind {
		/// The DN to authenticate as.
		dn: String,
		/// The password; empty for an anonymous bind.
		password: String,
	},
	/// Terminate the session. No response is returned.
	Unbind,
	/// A search, with its filter already parsed.
	Search {
		/// The search parameters.
		params: SearchParams,
		/// The parsed form of `params.filter`.
		filter: Filter,
	},
	/// Add an entry.
	Add {
		/// The DN of the new entry.
		dn: String,
		/// The entry's attributes.
		attrs: Vec<(String, Vec<String>)>,
	},
	/// Delete an entry.
	Delete {
		/// The DN of the entry to remove.
		dn: String,
	},
	/// Modify an entry's attributes.
	Modify {
		/// The DN of the entry to modify.
		dn: String,
		/// The modifications to apply, in order.
		mods: Vec<Mod>,
	},
	/// Rename or move an entry.
	ModifyDn {
		/// The DN of the entry to rename.
		dn: String,
		/// The new relative DN.
		new_rdn: String,
		/// Whether the old RDN attribute values are removed.
		delete_old_rdn: bool,
		/// An optional new parent DN.
		new_superior: Option<String>,
	},
	/// Compare an attribute value of an entry.
	Compare {
		/// The DN of the entry.
		dn: String,
		/// The attribute to compare.
		attr: String,
		/// The asserted value.
		value: String,
	},
	/// Ask the server to stop processing an earlier request. No response
	/// is returned.
	Abandon {
		/// The message id of the request to abandon.
		target: MsgId,
	},
	/// An extended operation.
	Extended {
		/// The OID naming the operation.
		name: String,
		/// The optional request value.
		value: Option<Vec<u8>>,
	},
}

impl Request {
	/// The result codes that count as success for this request.
	#[must_use]
	pub fn expected(&self) -> &'static [u32] {
		match self {
			Request::Compare { .. } => {
				&[result_codes::COMPARE_FALSE, result_codes::COMPARE_TRUE]
			}
			_ => &[result_codes::SUCCESS],
		}
	}

	/// A short operation name for log messages.
	#[must_use]
	pub fn kind(&self) -> &'static str {
		match self {
			Request::SimpleBind { .. } => "bind",
			Request::Unbind => "unbind",
			Request::Search { .. } => "search",
			Request::Add { .. } => "add",
			Request::Delete { .. } => "delete",
			Request::Modify { .. } => "modify",
			Request::ModifyDn { .. } => "modifyDN",
			Request::Compare { .. } => "compare",
			Request::Abandon { .. } => "abandon",
			Request::Extended { .. } => "extended",
		}
	}

	/// Convert the request into its BER tag (the protocol-op part of the
	/// enclosing message).
	#[must_use]
	pub fn into_tag(self) -> Tag {
		match self {
			Request::SimpleBind { dn, password } => app_seq(
				0,
				vec![
					int_tag(3),
					octet(dn.into_bytes()),
					Tag::OctetString(OctetString {
						class: TagClass::Context,
						id: 0,
						inner: password.into_bytes(),
					}),
				],
			),
			Request::Unbind => {
				Tag::Null(Null { class: TagClass::Application, id: 2, inner: () })
			}
			Request::Search { params, filter } => {
				let attrs =
					params.attrs.into_iter().map(|a| octet(a.into_bytes())).collect();
				app_seq(
					3,
					vec![
						octet(params.base.into_bytes()),
						enum_tag(params.scope.as_i64()),
						enum_tag(params.deref.as_i64()),
						int_tag(i64::from(params.size_limit)),
						int_tag(i64::from(params.time_limit)),
						bool_tag(params.types_only),
						filter.into_tag(),
						seq(attrs),
					],
				)
			}
			Request::Add { dn, attrs } => {
				let attr_list = attrs
					.into_iter()
					.map(|(name, vals)| attribute_tag(name, vals))
					.collect();
				app_seq(8, vec![octet(dn.into_bytes()), seq(attr_list)])
			}
			Request::Delete { dn } => Tag::OctetString(OctetString {
				class: TagClass::Application,
				id: 10,
				inner: dn.into_bytes(),
			}),
			Request::Modify { dn, mods } => {
				let changes = mods
					.into_iter()
					.map(|m| {
						let (op, attr, vals) = match m {
							Mod::Add(attr, vals) => (0, attr, vals),
							Mod::Delete(attr, vals) => (1, attr, vals),
							Mod::Replace(attr, vals) => (2, attr, vals),
						};
						seq(vec![enum_tag(op), attribute_tag(attr, vals)])
					})
					.collect();
				app_seq(6, vec![octet(dn.into_bytes()), seq(changes)])
			}
			Request::ModifyDn { dn, new_rdn, delete_old_rdn, new_superior } => {
				let mut inner = vec![
					octet(dn.into_bytes()),
					octet(new_rdn.into_bytes()),
					bool_tag(delete_old_rdn),
				];
				if let Some(sup) = new_superior {
					inner.push(Tag::OctetString(OctetString {
						class: TagClass::Context,
						id: 0,
						inner: sup.into_bytes(),
					}));
				}
				app_seq(12, inner)
			}
			Request::Compare { dn, attr, value } => app_seq(
				14,
				vec![
					octet(dn.into_bytes()),
					seq(vec![octet(attr.into_bytes()), octet(value.into_bytes())]),
				],
			),
			Request::Abandon { target } => Tag::Integer(Integer {
				class: TagClass::Application,
				id: 16,
				inner: i64::from(target),
			}),
			Request::Extended { name, value } => {
				let mut inner = vec![Tag::OctetString(OctetString {
					class: TagClass::Context,
					id: 0,
					inner: name.into_bytes(),
				})];
				if let Some(value) = value {
					inner.push(Tag::OctetString(OctetString {
						class: TagClass::Context,
						id: 1,
						inner: value,
					}));
				}
				app_seq(23, inner)
			}
		}
	}
}

/// A fully assembled outbound message, ready for the codec.
#[derive(Debug)]
pub(crate) struct WireRequest {
	/// The allocated message id.
	pub id: MsgId,
	/// The protocol-op tag produced by [`Request::into_tag`].
	pub op: Tag,
	/// Controls to attach to the message.
	pub controls: Vec<Control>,
}

impl WireRequest {
	/// Assemble the enclosing message structure.
	pub fn into_structure(self) -> StructureTag {
		let mut inner = vec![int_tag(i64::from(self.id)), self.op];
		if !self.controls.is_empty() {
			inner.push(crate::controls::encode_controls(self.controls));
		}
		seq(inner).into_structure()
	}
}

/// The terminal-result portion of a server response.
#[derive(Debug, Clone, Default)]
pub struct LdapResult {
	/// The result code.
	pub rc: u32,
	/// The matched DN, if the server reported one.
	pub matched_dn: String,
	/// The server's diagnostic message.
	pub text: String,
	/// Referral URIs, if any.
	pub referrals: Vec<String>,
	/// Controls attached to the response message.
	pub controls: Vec<Control>,
	/// Extended-response payload, present only for extended operations.
	pub exop: Option<Exop>,
}

/// The name/value payload of an extended response.
#[derive(Debug, Clone)]
pub struct Exop {
	/// The OID of the response, if the server named one.
	pub name: Option<String>,
	/// The raw response value, if present.
	pub value: Option<Vec<u8>>,
}

/// One entry returned by a search.
#[derive(Debug, Clone, Default)]
pub struct SearchEntry {
	/// The entry's DN.
	pub dn: String,
	/// Attributes with UTF-8 values.
	pub attrs: HashMap<String, Vec<String>>,
	/// Attributes with at least one non-UTF-8 value, kept as raw bytes.
	pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

/// The protocol-op portion of an inbound message.
#[derive(Debug, Clone)]
pub enum ResponseOp {
	/// A streamed search entry.
	SearchEntry(SearchEntry),
	/// A streamed search continuation reference.
	SearchReference(Vec<String>),
	/// A terminal result (bind, search done, modify, add, delete,
	/// modifyDN, compare or extended).
	Result(LdapResult),
}

/// One decoded inbound protocol unit.
#[derive(Debug, Clone)]
pub struct Message {
	/// The message id the unit correlates to (0 for unsolicited
	/// notifications).
	pub id: MsgId,
	/// The protocol op.
	pub op: ResponseOp,
	/// Controls attached to the message.
	pub controls: Vec<Control>,
}

impl Message {
	/// Decode a message from its outermost BER structure.
	pub fn from_tag(tag: StructureTag) -> Result<Self, Error> {
		let children = tag
			.match_class(TagClass::Universal)
			.and_then(|t| t.match_id(Types::Sequence as u64))
			.and_then(StructureTag::expect_constructed)
			.ok_or_else(|| Error::Protocol("message is not a sequence".to_owned()))?;
		let mut children = children.into_iter();
		let id_tag = children
			.next()
			.ok_or_else(|| Error::Protocol("message without an id".to_owned()))?;
		let id = decode_uint(&id_tag)
			.ok_or_else(|| Error::Protocol("malformed message id".to_owned()))?;
		let id = MsgId::try_from(id)
			.map_err(|_| Error::Protocol("message id out of range".to_owned()))?;
		let op_tag = children
			.next()
			.ok_or_else(|| Error::Protocol("message without a protocol op".to_owned()))?;
		if op_tag.class != TagClass::Application {
			return Err(Error::Protocol("protocol op is not application-tagged".to_owned()));
		}
		let op = match op_tag.id {
			1 | 5 | 7 | 9 | 11 | 13 | 15 | 24 => ResponseOp::Result(decode_result(op_tag)?),
			4 => ResponseOp::SearchEntry(decode_entry(op_tag)?),
			19 => ResponseOp::SearchReference(decode_references(op_tag)?),
			other => {
				return Err(Error::Protocol(format!("unrecognized protocol op {other}")))
			}
		};
		let mut controls = Vec::new();
		for extra in children {
			if extra.class == TagClass::Context && extra.id == 0 {
				controls = crate::controls::decode_controls(extra)?;
			}
		}
		Ok(Message { id, op, controls })
	}

	/// Whether this protocol op terminates its request.
	#[must_use]
	pub fn is_terminal(&self) -> bool {
		matches!(self.op, ResponseOp::Result(_))
	}
}

/// Decode an unsigned integer from an INTEGER or ENUMERATED tag.
fn decode_uint(tag: &StructureTag) -> Option<u64> {
	let payload = match &tag.payload {
		PL::P(bytes) => bytes,
		PL::C(_) => return None,
	};
	match parse_uint(payload) {
		Ok((_, value)) => Some(value),
		Err(_) => None,
	}
}

/// Decode an octet string tag into raw bytes.
fn decode_bytes(tag: StructureTag) -> Option<Vec<u8>> {
	tag.expect_primitive()
}

/// Decode an octet string tag into a lossy UTF-8 string.
fn decode_string(tag: StructureTag) -> Option<String> {
	decode_bytes(tag).map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// Decode the shared LDAPResult components plus any referral.
fn decode_result(op_tag: StructureTag) -> Result<LdapResult, Error> {
	let children = op_tag
		.expect_constructed()
		.ok_or_else(|| Error::Protocol("result op is not constructed".to_owned()))?;
	decode_result_parts(children)
}

/// Decode LDAPResult components from the children of a result op.
fn decode_result_parts(children: Vec<StructureTag>) -> Result<LdapResult, Error> {
	let mut result = LdapResult::default();
	let mut children = children.into_iter();
	let rc_tag = children
		.next()
		.ok_or_else(|| Error::Protocol("result without a result code".to_owned()))?;
	let rc = decode_uint(&rc_tag)
		.ok_or_else(|| Error::Protocol("malformed result code".to_owned()))?;
	result.rc = u32::try_from(rc)
		.map_err(|_| Error::Protocol("result code out of range".to_owned()))?;
	result.matched_dn = children
		.next()
		.and_then(decode_string)
		.ok_or_else(|| Error::Protocol("result without a matched DN".to_owned()))?;
	result.text = children
		.next()
		.and_then(decode_string)
		.ok_or_else(|| Error::Protocol("result without a diagnostic message".to_owned()))?;
	for extra in children {
		if extra.class == TagClass::Context && extra.id == 3 {
			if let Some(urls) = extra.expect_constructed() {
				result.referrals = urls.into_iter().filter_map(decode_string).collect();
			}
		} else if extra.class == TagClass::Context && extra.id == 10 {
			let name = decode_string(extra);
			let exop = result.exop.get_or_insert(Exop { name: None, value: None });
			exop.name = name;
		} else if extra.class == TagClass::Context && extra.id == 11 {
			let value = decode_bytes(extra);
			let exop = result.exop.get_or_insert(Exop { name: None, value: None });
			exop.value = value;
		}
	}
	Ok(result)
}

/// Decode a search result entry.
fn decode_entry(op_tag: StructureTag) -> Result<SearchEntry, Error> {
	let children = op_tag
		.expect_constructed()
		.ok_or_else(|| Error::Protocol("search entry is not constructed".to_owned()))?;
	let mut children = children.into_iter();
	let dn = children
		.next()
		.and_then(decode_string)
		.ok_or_else(|| Error::Protocol("search entry without a DN".to_owned()))?;
	let mut entry = SearchEntry { dn, ..Default::default() };
	let attr_list = children
		.next()
		.and_then(StructureTag::expect_constructed)
		.ok_or_else(|| Error::Protocol("search entry without attributes".to_owned()))?;
	for attr in attr_list {
		let parts = attr
			.expect_constructed()
			.ok_or_else(|| Error::Protocol("malformed attribute".to_owned()))?;
		let mut parts = parts.into_iter();
		let name = parts
			.next()
			.and_then(decode_string)
			.ok_or_else(|| Error::Protocol("attribute without a type".to_owned()))?;
		let vals = parts
			.next()
			.and_then(StructureTag::expect_constructed)
			.unwrap_or_default();
		let mut strings = Vec::new();
		let mut bytes = Vec::new();
		for val in vals {
			let Some(raw) = decode_bytes(val) else {
				return Err(Error::Protocol("malformed attribute value".to_owned()));
			};
			match String::from_utf8(raw) {
				Ok(s) => strings.push(s),
				Err(e) => bytes.push(e.into_bytes()),
			}
		}
		if !strings.is_empty() {
			entry.attrs.insert(name.clone(), strings);
		}
		if !bytes.is_empty() {
			entry.bin_attrs.insert(name, bytes);
		}
	}
	Ok(entry)
}

/// Decode a search continuation reference (a list of URIs).
fn decode_references(op_tag: StructureTag) -> Result<Vec<String>, Error> {
	let children = op_tag
		.expect_constructed()
		.ok_or_else(|| Error::Protocol("search reference is not constructed".to_owned()))?;
	Ok(children.into_iter().filter_map(decode_string).collect())
}

/// Validate a distinguished name against a conservative reading of the
/// RFC 4514 string form. The empty DN (the root DSE) is valid.
pub fn validate_dn(dn: &str) -> Result<(), Error> {
	if dn.is_empty() {
		return Ok(());
	}
	for rdn in split_unescaped(dn, ',') {
		if rdn.trim().is_empty() {
			return Err(Error::InvalidDn(dn.to_owned()));
		}
		for ava in split_unescaped(&rdn, '+') {
			let Some(eq) = find_unescaped(&ava, '=') else {
				return Err(Error::InvalidDn(dn.to_owned()));
			};
			let attr = ava[..eq].trim();
			let valid = !attr.is_empty()
				&& (attr.chars().all(|c| c.is_ascii_digit() || c == '.')
					|| (attr.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
						&& attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')));
			if !valid {
				return Err(Error::InvalidDn(dn.to_owned()));
			}
		}
	}
	Ok(())
}

/// Split a string on a separator, ignoring backslash-escaped occurrences.
fn split_unescaped(input: &str, sep: char) -> Vec<String> {
	let mut parts = Vec::new();
	let mut current = String::new();
	let mut escaped = false;
	for c in input.chars() {
		if escaped {
			current.push(c);
			escaped = false;
		} else if c == '\\' {
			current.push(c);
			escaped = true;
		} else if c == sep {
			parts.push(std::mem::take(&mut current));
		} else {
			current.push(c);
		}
	}
	parts.push(current);
	parts
}

/// Find the byte offset of the first unescaped occurrence of a character.
fn find_unescaped(input: &str, target: char) -> Option<usize> {
	let mut escaped = false;
	for (idx, c) in input.char_indices() {
		if escaped {
			escaped = false;
		} else if c == '\\' {
			escaped = true;
		} else if c == target {
			return Some(idx);
		}
	}
	None
}

/// Build a universal octet string tag.
pub(crate) fn octet(value: Vec<u8>) -> Tag {
	Tag::OctetString(OctetString { inner: value, ..Default::default() })
}

/// Build a universal integer tag.
pub(crate) fn int_tag(value: i64) -> Tag {
	Tag::Integer(Integer { inner: value, ..Default::default() })
}

/// Build a universal boolean tag.
fn bool_tag(value: bool) -> Tag {
	Tag::Boolean(Boolean { inner: value, ..Default::default() })
}

/// Build a universal enumerated tag.
fn enum_tag(value: i64) -> Tag {
	Tag::Enumerated(Enumerated { inner: value, ..Default::default() })
}

/// Build a universal sequence tag.
pub(crate) fn seq(inner: Vec<Tag>) -> Tag {
	Tag::Sequence(Sequence { inner, ..Default::default() })
}

/// Build an application-class sequence tag.
fn app_seq(id: u64, inner: Vec<Tag>) -> Tag {
	Tag::Sequence(Sequence { class: TagClass::Application, id, inner })
}

/// Build an attribute (type plus a set of values) for add/modify requests.
fn attribute_tag(name: String, vals: Vec<String>) -> Tag {
	let vals = vals.into_iter().map(|v| octet(v.into_bytes())).collect();
	seq(vec![octet(name.into_bytes()), Tag::Set(Set { inner: vals, ..Default::default() })])
}

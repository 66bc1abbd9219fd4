#![allow(
	clippy::unwrap_used,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_sign_loss,
	dead_code
)]

//! An in-process mock LDAP server speaking raw BER over TCP, for driving
//! the client through protocol scenarios without a real directory.

use std::{net::SocketAddr, time::Duration};

use bytes::{Buf, BytesMut};
use lber::{
	common::TagClass,
	parse::{parse_tag, parse_uint},
	structure::{StructureTag, PL},
	structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag},
	universal::Types,
	write,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};

/// The well-known DN/password pair the mock accepts for binds.
pub const ROOT_DN: &str = "cn=root";
pub const ROOT_PW: &str = "secret";

/// The attribute value the mock reports as matching for compares.
pub const COMPARE_MATCH: &str = "match";

/// How a mock connection behaves.
#[derive(Clone, Copy)]
pub enum Mode {
	/// A functioning directory with `entries` search results. Searches are
	/// answered after `search_delay_ms`.
	Directory { entries: usize, search_delay_ms: u64 },
	/// Read requests, never answer any of them.
	Silent,
	/// Read `requests` frames without answering, then drop the connection.
	CloseAfter { requests: usize },
}

/// Start a mock server and return its address.
pub async fn spawn(mode: Mode) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else { return };
			tokio::spawn(handle(stream, mode));
		}
	});
	addr
}

/// An address nothing listens on, for connection-refused scenarios.
pub async fn refused_addr() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap()
}

async fn handle(mut stream: TcpStream, mode: Mode) {
	let mut buf = BytesMut::new();
	let mut seen = 0_usize;
	while let Some(frame) = read_frame(&mut stream, &mut buf).await {
		seen += 1;
		match mode {
			Mode::Silent => {}
			Mode::CloseAfter { requests } => {
				if seen >= requests {
					return;
				}
			}
			Mode::Directory { entries, search_delay_ms } => {
				let request = parse_message(frame);
				if !answer(&mut stream, request, entries, search_delay_ms).await {
					return;
				}
			}
		}
	}
}

/// One parsed inbound message.
struct Request {
	id: i64,
	op: u64,
	body: Vec<StructureTag>,
	controls: Vec<(String, Vec<u8>)>,
}

async fn answer(stream: &mut TcpStream, request: Request, entries: usize, delay_ms: u64) -> bool {
	match request.op {
		// bind
		0 => {
			let dn = prim_string(request.body.get(1).cloned());
			let password = prim_string(request.body.get(2).cloned());
			let rc = if dn == ROOT_DN && password == ROOT_PW { 0 } else { 49 };
			send(stream, result_response(request.id, 1, rc, None)).await
		}
		// unbind
		2 => false,
		// search
		3 => {
			if delay_ms > 0 {
				tokio::time::sleep(Duration::from_millis(delay_ms)).await;
			}
			answer_search(stream, &request, entries).await
		}
		// modify, add, del, modifyDN
		6 => send(stream, result_response(request.id, 7, 0, None)).await,
		8 => send(stream, result_response(request.id, 9, 0, None)).await,
		10 => send(stream, result_response(request.id, 11, 0, None)).await,
		12 => send(stream, result_response(request.id, 13, 0, None)).await,
		// compare
		14 => {
			let ava = request.body.get(1).cloned().and_then(StructureTag::expect_constructed);
			let value = prim_string(ava.and_then(|mut parts| parts.pop()));
			let rc = if value == COMPARE_MATCH { 6 } else { 5 };
			send(stream, result_response(request.id, 15, rc, None)).await
		}
		// abandon: no response
		16 => true,
		// extended
		23 => send(stream, result_response(request.id, 24, 0, None)).await,
		_ => true,
	}
}

async fn answer_search(stream: &mut TcpStream, request: &Request, entries: usize) -> bool {
	let dn_for = |index: usize| format!("cn=user{index},ou=people,dc=example,dc=org");
	match request_paged(&request.controls) {
		Some((page_size, cookie)) => {
			let offset: usize = String::from_utf8_lossy(&cookie).parse().unwrap_or(0);
			let page = page_size.max(0) as usize;
			let end = entries.min(offset + page);
			for index in offset..end {
				if !send(stream, search_entry(request.id, &dn_for(index))).await {
					return false;
				}
			}
			let next_cookie =
				if end < entries { end.to_string().into_bytes() } else { Vec::new() };
			let control = paged_control(entries as i64, &next_cookie);
			send(stream, result_response(request.id, 5, 0, Some(control))).await
		}
		None => {
			for index in 0..entries {
				if !send(stream, search_entry(request.id, &dn_for(index))).await {
					return false;
				}
			}
			send(stream, result_response(request.id, 5, 0, None)).await
		}
	}
}

/// Read one BER frame, buffering until it is complete.
async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<StructureTag> {
	loop {
		if !buf.is_empty() {
			match parse_tag(buf.as_ref()) {
				Ok((rest, tag)) => {
					let used = buf.len() - rest.len();
					buf.advance(used);
					return Some(tag);
				}
				Err(err) if err.is_incomplete() => {}
				Err(_) => return None,
			}
		}
		let read = stream.read_buf(buf).await.ok()?;
		if read == 0 {
			return None;
		}
	}
}

fn parse_message(frame: StructureTag) -> Request {
	let mut children = frame.expect_constructed().unwrap_or_default().into_iter();
	let id = children.next().map_or(0, |tag| uint(&tag));
	let op_tag = children.next().expect("message without protocol op");
	let op = op_tag.id;
	let body = op_tag.expect_constructed().unwrap_or_default();
	let mut controls = Vec::new();
	for extra in children {
		if extra.class == TagClass::Context && extra.id == 0 {
			for control in extra.expect_constructed().unwrap_or_default() {
				let parts = control.expect_constructed().unwrap_or_default();
				let mut parts = parts.into_iter();
				let oid = prim_string(parts.next());
				let mut value = Vec::new();
				for part in parts {
					if part.class == TagClass::Universal
						&& part.id == Types::OctetString as u64
					{
						value = part.expect_primitive().unwrap_or_default();
					}
				}
				controls.push((oid, value));
			}
		}
	}
	Request { id, op, body, controls }
}

/// Extract the page size and cookie of a request's paged-results control.
fn request_paged(controls: &[(String, Vec<u8>)]) -> Option<(i64, Vec<u8>)> {
	let (_, value) = controls.iter().find(|(oid, _)| oid == "1.2.840.113556.1.4.319")?;
	let (_, tag) = parse_tag(value).ok()?;
	let mut parts = tag.expect_constructed()?.into_iter();
	let size = parts.next().map(|t| uint(&t))?;
	let cookie = parts.next().and_then(StructureTag::expect_primitive)?;
	Some((size, cookie))
}

fn uint(tag: &StructureTag) -> i64 {
	match &tag.payload {
		PL::P(bytes) => parse_uint(bytes).map(|(_, v)| v as i64).unwrap_or(0),
		PL::C(_) => 0,
	}
}

fn prim_string(tag: Option<StructureTag>) -> String {
	tag.and_then(StructureTag::expect_primitive)
		.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
		.unwrap_or_default()
}

async fn send(stream: &mut TcpStream, bytes: Vec<u8>) -> bool {
	stream.write_all(&bytes).await.is_ok()
}

fn encode(tag: Tag) -> Vec<u8> {
	let mut bytes = BytesMut::new();
	write::encode_into(&mut bytes, tag.into_structure()).unwrap();
	bytes.to_vec()
}

fn octets(value: &[u8]) -> Tag {
	Tag::OctetString(OctetString { inner: value.to_vec(), ..Default::default() })
}

/// A terminal result message for the given application tag.
pub fn result_response(id: i64, op: u64, rc: i64, control: Option<Tag>) -> Vec<u8> {
	let mut inner = vec![
		Tag::Integer(Integer { inner: id, ..Default::default() }),
		Tag::Sequence(Sequence {
			class: TagClass::Application,
			id: op,
			inner: vec![
				Tag::Enumerated(Enumerated { inner: rc, ..Default::default() }),
				Tag::OctetString(OctetString::default()),
				Tag::OctetString(OctetString::default()),
			],
		}),
	];
	if let Some(control) = control {
		inner.push(control);
	}
	encode(Tag::Sequence(Sequence { inner, ..Default::default() }))
}

/// A search entry message with a single `cn` attribute.
pub fn search_entry(id: i64, dn: &str) -> Vec<u8> {
	let cn = dn.split(',').next().unwrap_or(dn).trim_start_matches("cn=");
	let attributes = Tag::Sequence(Sequence {
		inner: vec![Tag::Sequence(Sequence {
			inner: vec![
				octets(b"cn"),
				Tag::Set(Set { inner: vec![octets(cn.as_bytes())], ..Default::default() }),
			],
			..Default::default()
		})],
		..Default::default()
	});
	let entry = Tag::Sequence(Sequence {
		class: TagClass::Application,
		id: 4,
		inner: vec![octets(dn.as_bytes()), attributes],
	});
	encode(Tag::Sequence(Sequence {
		inner: vec![Tag::Integer(Integer { inner: id, ..Default::default() }), entry],
		..Default::default()
	}))
}

/// The response-side paged-results control container.
pub fn paged_control(size: i64, cookie: &[u8]) -> Tag {
	let value = encode(Tag::Sequence(Sequence {
		inner: vec![
			Tag::Integer(Integer { inner: size, ..Default::default() }),
			octets(cookie),
		],
		..Default::default()
	}));
	Tag::Sequence(Sequence {
		class: TagClass::Context,
		id: 0,
		inner: vec![Tag::Sequence(Sequence {
			inner: vec![octets(b"1.2.840.113556.1.4.319"), octets(&value)],
			..Default::default()
		})],
	})
}

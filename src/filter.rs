//! RFC 4515 search filter parsing and BER conversion.
//!
//! The engine treats filters as opaque values: they are parsed once at the
//! call site, carried as a [`Filter`] tree, and serialized into the search
//! request. Extensible matching rules are not supported.

use lber::{
	common::TagClass,
	structures::{ExplicitTag, OctetString, Sequence, Set, Tag},
};

use crate::error::Error;

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	/// All nested filters must match.
	And(Vec<Filter>),
	/// At least one nested filter must match.
	Or(Vec<Filter>),
	/// The nested filter must not match.
	Not(Box<Filter>),
	/// An attribute equals a value.
	Equality(String, Vec<u8>),
	/// An attribute matches a substring pattern.
	Substrings {
		/// The attribute to match.
		attr: String,
		/// The leading fragment, if any.
		initial: Option<Vec<u8>>,
		/// Fragments that may appear anywhere between initial and final.
		any: Vec<Vec<u8>>,
		/// The trailing fragment, if any.
		fin: Option<Vec<u8>>,
	},
	/// An attribute is greater than or equal to a value.
	GreaterOrEqual(String, Vec<u8>),
	/// An attribute is less than or equal to a value.
	LessOrEqual(String, Vec<u8>),
	/// An attribute approximately matches a value.
	Approx(String, Vec<u8>),
	/// An attribute is present, regardless of value.
	Present(String),
}

impl Filter {
	/// Parse a filter string. A missing outer parenthesis pair is
	/// tolerated for simple items, matching common client behavior.
	pub fn parse(input: &str) -> Result<Self, Error> {
		let trimmed = input.trim();
		if trimmed.is_empty() {
			return Err(Error::InvalidFilter("empty filter".to_owned()));
		}
		let wrapped;
		let source = if trimmed.starts_with('(') {
			trimmed
		} else {
			wrapped = format!("({trimmed})");
			&wrapped
		};
		let mut parser = Parser { input: source.as_bytes(), pos: 0 };
		let filter = parser.filter()?;
		if parser.pos != parser.input.len() {
			return Err(Error::InvalidFilter(format!(
				"trailing data at offset {} in {input:?}",
				parser.pos
			)));
		}
		Ok(filter)
	}

	/// Convert the filter into its BER tag.
	#[must_use]
	pub fn into_tag(self) -> Tag {
		match self {
			Filter::And(filters) => ctx_set(0, filters),
			Filter::Or(filters) => ctx_set(1, filters),
			Filter::Not(inner) => Tag::ExplicitTag(ExplicitTag {
				class: TagClass::Context,
				id: 2,
				inner: Box::new(inner.into_tag()),
			}),
			Filter::Equality(attr, value) => ava(3, attr, value),
			Filter::Substrings { attr, initial, any, fin } => {
				let mut subs = Vec::new();
				if let Some(initial) = initial {
					subs.push(ctx_octet(0, initial));
				}
				for fragment in any {
					subs.push(ctx_octet(1, fragment));
				}
				if let Some(fin) = fin {
					subs.push(ctx_octet(2, fin));
				}
				Tag::Sequence(Sequence {
					class: TagClass::Context,
					id: 4,
					inner: vec![
						crate::proto::octet(attr.into_bytes()),
						crate::proto::seq(subs),
					],
				})
			}
			Filter::GreaterOrEqual(attr, value) => ava(5, attr, value),
			Filter::LessOrEqual(attr, value) => ava(6, attr, value),
			Filter::Approx(attr, value) => ava(8, attr, value),
			Filter::Present(attr) => Tag::OctetString(OctetString {
				class: TagClass::Context,
				id: 7,
				inner: attr.into_bytes(),
			}),
		}
	}
}

/// Build an attribute-value assertion with the given context tag.
fn ava(id: u64, attr: String, value: Vec<u8>) -> Tag {
	Tag::Sequence(Sequence {
		class: TagClass::Context,
		id,
		inner: vec![crate::proto::octet(attr.into_bytes()), crate::proto::octet(value)],
	})
}

/// Build a context-tagged set of nested filters (and/or).
fn ctx_set(id: u64, filters: Vec<Filter>) -> Tag {
	Tag::Set(Set {
		class: TagClass::Context,
		id,
		inner: filters.into_iter().map(Filter::into_tag).collect(),
	})
}

/// Build a context-tagged primitive octet string.
fn ctx_octet(id: u64, value: Vec<u8>) -> Tag {
	Tag::OctetString(OctetString { class: TagClass::Context, id, inner: value })
}

/// A byte-oriented recursive-descent filter parser.
struct Parser<'a> {
	/// The filter source.
	input: &'a [u8],
	/// The current offset into `input`.
	pos: usize,
}

impl Parser<'_> {
	/// Parse one parenthesized filter.
	fn filter(&mut self) -> Result<Filter, Error> {
		self.expect(b'(')?;
		let filter = match self.peek() {
			Some(b'&') => {
				self.pos += 1;
				Filter::And(self.filter_list()?)
			}
			Some(b'|') => {
				self.pos += 1;
				Filter::Or(self.filter_list()?)
			}
			Some(b'!') => {
				self.pos += 1;
				Filter::Not(Box::new(self.filter()?))
			}
			Some(_) => self.item()?,
			None => return Err(self.fail("unexpected end of filter")),
		};
		self.expect(b')')?;
		Ok(filter)
	}

	/// Parse one or more nested filters (the body of an and/or).
	fn filter_list(&mut self) -> Result<Vec<Filter>, Error> {
		let mut filters = Vec::new();
		while self.peek() == Some(b'(') {
			filters.push(self.filter()?);
		}
		if filters.is_empty() {
			return Err(self.fail("empty filter list"));
		}
		Ok(filters)
	}

	/// Parse a simple item: attr, operator, value.
	fn item(&mut self) -> Result<Filter, Error> {
		let attr_start = self.pos;
		while let Some(c) = self.peek() {
			if matches!(c, b'=' | b'~' | b'>' | b'<' | b'(' | b')') {
				break;
			}
			self.pos += 1;
		}
		let attr = String::from_utf8_lossy(&self.input[attr_start..self.pos]).into_owned();
		if attr.is_empty() {
			return Err(self.fail("missing attribute description"));
		}
		let op = match (self.peek(), self.peek_at(1)) {
			(Some(b'='), _) => {
				self.pos += 1;
				b'='
			}
			(Some(b'~'), Some(b'=')) => {
				self.pos += 2;
				b'~'
			}
			(Some(b'>'), Some(b'=')) => {
				self.pos += 2;
				b'>'
			}
			(Some(b'<'), Some(b'=')) => {
				self.pos += 2;
				b'<'
			}
			_ => return Err(self.fail("missing filter operator")),
		};
		let (fragments, had_star) = self.value_fragments()?;
		match op {
			b'~' => Ok(Filter::Approx(attr, single_fragment(fragments, self)?)),
			b'>' => Ok(Filter::GreaterOrEqual(attr, single_fragment(fragments, self)?)),
			b'<' => Ok(Filter::LessOrEqual(attr, single_fragment(fragments, self)?)),
			_ if !had_star => Ok(Filter::Equality(attr, single_fragment(fragments, self)?)),
			_ => {
				// attr=* is a presence test; anything else with stars is
				// a substring pattern.
				if fragments.iter().all(Vec::is_empty) {
					return Ok(Filter::Present(attr));
				}
				let mut fragments = fragments;
				let fin = match fragments.pop() {
					Some(f) if f.is_empty() => None,
					Some(f) => Some(f),
					None => None,
				};
				let mut fragments = fragments.into_iter();
				let initial = match fragments.next() {
					Some(f) if f.is_empty() => None,
					Some(f) => Some(f),
					None => None,
				};
				let any = fragments.filter(|f| !f.is_empty()).collect();
				Ok(Filter::Substrings { attr, initial, any, fin })
			}
		}
	}

	/// Parse the value of an item, splitting on unescaped stars and
	/// resolving `\XX` hex escapes. Returns the fragments and whether any
	/// star was seen.
	fn value_fragments(&mut self) -> Result<(Vec<Vec<u8>>, bool), Error> {
		let mut fragments = vec![Vec::new()];
		let mut had_star = false;
		while let Some(c) = self.peek() {
			match c {
				b')' => break,
				b'(' => return Err(self.fail("unescaped parenthesis in value")),
				b'*' => {
					had_star = true;
					fragments.push(Vec::new());
					self.pos += 1;
				}
				b'\\' => {
					let hi = self.peek_at(1).and_then(hex_value);
					let lo = self.peek_at(2).and_then(hex_value);
					let (Some(hi), Some(lo)) = (hi, lo) else {
						return Err(self.fail("invalid hex escape"));
					};
					if let Some(last) = fragments.last_mut() {
						last.push(hi * 16 + lo);
					}
					self.pos += 3;
				}
				other => {
					if let Some(last) = fragments.last_mut() {
						last.push(other);
					}
					self.pos += 1;
				}
			}
		}
		Ok((fragments, had_star))
	}

	/// The byte at the current position.
	fn peek(&self) -> Option<u8> {
		self.input.get(self.pos).copied()
	}

	/// The byte at the given lookahead offset.
	fn peek_at(&self, offset: usize) -> Option<u8> {
		self.input.get(self.pos + offset).copied()
	}

	/// Consume one expected byte.
	fn expect(&mut self, c: u8) -> Result<(), Error> {
		if self.peek() == Some(c) {
			self.pos += 1;
			Ok(())
		} else {
			Err(self.fail("unbalanced parentheses"))
		}
	}

	/// Build an error pointing at the current position.
	fn fail(&self, message: &str) -> Error {
		Error::InvalidFilter(format!("{message} at offset {}", self.pos))
	}
}

/// Reduce a fragment list to the single value non-substring items expect.
fn single_fragment(mut fragments: Vec<Vec<u8>>, parser: &Parser<'_>) -> Result<Vec<u8>, Error> {
	if fragments.len() != 1 {
		return Err(parser.fail("substring pattern not allowed here"));
	}
	Ok(fragments.remove(0))
}

/// Decode a single hex digit.
fn hex_value(c: u8) -> Option<u8> {
	match c {
		b'0'..=b'9' => Some(c - b'0'),
		b'a'..=b'f' => Some(c - b'a' + 10),
		b'A'..=b'F' => Some(c - b'A' + 10),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::Filter;

	#[test]
	fn parses_simple_equality() {
		let filter = Filter::parse("(cn=root)").unwrap();
		assert_eq!(filter, Filter::Equality("cn".to_owned(), b"root".to_vec()));
	}

	#[test]
	fn tolerates_missing_outer_parens() {
		let filter = Filter::parse("cn=root").unwrap();
		assert_eq!(filter, Filter::Equality("cn".to_owned(), b"root".to_vec()));
	}

	#[test]
	fn parses_presence_and_substrings() {
		assert_eq!(
			Filter::parse("(objectClass=*)").unwrap(),
			Filter::Present("objectClass".to_owned())
		);
		assert_eq!(
			Filter::parse("(cn=ab*cd*ef)").unwrap(),
			Filter::Substrings {
				attr: "cn".to_owned(),
				initial: Some(b"ab".to_vec()),
				any: vec![b"cd".to_vec()],
				fin: Some(b"ef".to_vec()),
			}
		);
		assert_eq!(
			Filter::parse("(cn=*mid*)").unwrap(),
			Filter::Substrings {
				attr: "cn".to_owned(),
				initial: None,
				any: vec![b"mid".to_vec()],
				fin: None,
			}
		);
	}

	#[test]
	fn parses_composites() {
		let filter =
			Filter::parse("(&(objectClass=person)(|(cn=a)(!(sn<=b))))").unwrap();
		let Filter::And(parts) = filter else { panic!("expected and-filter") };
		assert_eq!(parts.len(), 2);
		let Filter::Or(branches) = &parts[1] else { panic!("expected or-filter") };
		assert!(matches!(branches[1], Filter::Not(_)));
	}

	#[test]
	fn resolves_hex_escapes() {
		let filter = Filter::parse("(cn=a\\2ab)").unwrap();
		assert_eq!(filter, Filter::Equality("cn".to_owned(), b"a*b".to_vec()));
	}

	#[test]
	fn rejects_malformed_filters() {
		assert!(Filter::parse("").is_err());
		assert!(Filter::parse("(cn=root").is_err());
		assert!(Filter::parse("(&)").is_err());
		assert!(Filter::parse("(cn~root)").is_err());
		assert!(Filter::parse("(cn=ab(cd)").is_err());
		assert!(Filter::parse("(>=x)").is_err());
	}
}

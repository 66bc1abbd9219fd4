//! Correlation of outstanding requests with their responses.
//!
//! Every request sent on a connection is tracked under its allocated
//! message id until a terminal response arrives, the connection closes, or
//! the caller abandons it. Abandoned requests move to a second tier rather
//! than being dropped: the protocol permits a response to race an abandon,
//! and such a response must still reach the original caller instead of
//! being treated as unsolicited. Abandoned entries are expired by message-
//! id distance (see [`ge_window`]) rather than wall-clock time, since id
//! allocation rate tracks actual protocol traffic.

use std::collections::HashMap;

use tokio::{
	sync::{mpsc, oneshot},
	time::Instant,
};

use crate::{
	error::Error,
	proto::{LdapResult, MsgId, MAX_MSGID},
	search::SearchItem,
};

/// The bookkeeping for one outstanding request.
#[derive(Debug)]
pub(crate) struct Tracked {
	/// Operation name, for log messages.
	pub kind: &'static str,
	/// Result codes that resolve the request successfully.
	pub expect: &'static [u32],
	/// Where streamed search entries and references are delivered.
	pub stream: Option<mpsc::UnboundedSender<SearchItem>>,
	/// The completion channel; consumed exactly once.
	pub done: oneshot::Sender<Result<LdapResult, Error>>,
	/// When the request times out client-side, if a timeout is configured.
	pub deadline: Option<Instant>,
}

/// An abandoned entry, retained until the sliding window expires it.
#[derive(Debug)]
struct Abandoned {
	/// The allocator value at the time of the abandon.
	age: MsgId,
	/// The original request bookkeeping.
	entry: Tracked,
}

/// Tracks message-id allocation and outstanding requests for exactly one
/// connection. Not shareable across connections.
#[derive(Debug, Default)]
pub(crate) struct MessageTracker {
	/// The most recently allocated id (0 before the first allocation).
	current: MsgId,
	/// Requests awaiting a terminal response.
	active: HashMap<MsgId, Tracked>,
	/// Abandoned requests that may still see a late response.
	abandoned: HashMap<MsgId, Abandoned>,
}

impl MessageTracker {
	/// Allocate the next message id. Ids are a monotonic per-connection
	/// sequence in `[1, MAX_MSGID - 1]`, wrapping back to 1 and never
	/// yielding 0.
	pub fn allocate(&mut self) -> MsgId {
		self.current = if self.current >= MAX_MSGID - 1 { 1 } else { self.current + 1 };
		self.current
	}

	/// Allocate an id and store the entry under it.
	#[cfg(test)]
	pub fn track(&mut self, entry: Tracked) -> MsgId {
		let id = self.allocate();
		self.register(id, entry);
		id
	}

	/// Store an entry under an id allocated earlier, when the request was
	/// admitted.
	pub fn register(&mut self, id: MsgId, entry: Tracked) {
		self.active.insert(id, entry);
	}

	/// Move an active entry into the abandoned tier, recording the
	/// current allocator value as its age. Returns false if the id is not
	/// active.
	pub fn abandon(&mut self, id: MsgId) -> bool {
		match self.active.remove(&id) {
			Some(entry) => {
				self.abandoned.insert(id, Abandoned { age: self.current, entry });
				true
			}
			None => false,
		}
	}

	/// Whether the id sits in the abandoned tier.
	pub fn is_abandoned(&self, id: MsgId) -> bool {
		self.abandoned.contains_key(&id)
	}

	/// The stream for a still-tracked id, looking through both tiers, so
	/// late responses to abandoned requests still reach their caller.
	pub fn stream_for(&self, id: MsgId) -> Option<&mpsc::UnboundedSender<SearchItem>> {
		self.active
			.get(&id)
			.or_else(|| self.abandoned.get(&id).map(|a| &a.entry))
			.and_then(|t| t.stream.as_ref())
	}

	/// Remove and return the entry for an id from whichever tier holds
	/// it.
	pub fn take(&mut self, id: MsgId) -> Option<Tracked> {
		self.active.remove(&id).or_else(|| self.abandoned.remove(&id).map(|a| a.entry))
	}

	/// Expire abandoned entries that fall inside the sliding window
	/// anchored at `reference`, returning them so the caller can fail
	/// their handlers with an abandonment error. The reference id itself
	/// is exempt: a response for it is being delivered right now.
	pub fn purge_window(&mut self, reference: MsgId) -> Vec<(MsgId, Tracked)> {
		let expired: Vec<MsgId> = self
			.abandoned
			.iter()
			.filter(|(id, a)| **id != reference && ge_window(a.age, reference))
			.map(|(id, _)| *id)
			.collect();
		expired
			.into_iter()
			.filter_map(|id| self.abandoned.remove(&id).map(|a| (id, a.entry)))
			.collect()
	}

	/// Drain every entry from both tiers, for connection teardown.
	pub fn purge_all(&mut self) -> Vec<(MsgId, Tracked)> {
		let mut all: Vec<(MsgId, Tracked)> = self.active.drain().collect();
		all.extend(self.abandoned.drain().map(|(id, a)| (id, a.entry)));
		all
	}

	/// The number of active (non-abandoned) requests.
	pub fn pending(&self) -> usize {
		self.active.len()
	}

	/// The earliest per-request deadline among active entries.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.active.values().filter_map(|t| t.deadline).min()
	}

	/// Remove and return every active entry whose deadline has passed.
	pub fn take_expired(&mut self, now: Instant) -> Vec<(MsgId, Tracked)> {
		let expired: Vec<MsgId> = self
			.active
			.iter()
			.filter(|(_, t)| t.deadline.is_some_and(|d| d <= now))
			.map(|(id, _)| *id)
			.collect();
		expired
			.into_iter()
			.filter_map(|id| self.active.remove(&id).map(|t| (id, t)))
			.collect()
	}
}

/// Decide whether `comp` lies at or after `reference` within a forward
/// window of half the id space, accounting for wraparound.
pub(crate) fn ge_window(reference: MsgId, comp: MsgId) -> bool {
	let window = i64::from(MAX_MSGID) / 2;
	let reference = i64::from(reference);
	let comp = i64::from(comp);
	let mut max = reference + window;
	if max >= i64::from(MAX_MSGID) {
		// The window wraps: it covers the high end from `reference` up
		// and the low end up to the wrapped maximum.
		max -= i64::from(MAX_MSGID) + 1;
		return comp <= max || comp >= reference;
	}
	comp >= reference && comp <= max
}

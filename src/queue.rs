//! Buffering of requests while no usable connection exists.
//!
//! The queue is an ordered, bounded buffer. Entries are appended while the
//! client is disconnected and drained in insertion order once a connection
//! becomes usable. A configurable timeout bounds how long traffic may sit
//! unsent: when it fires the queue freezes itself and every queued entry
//! is failed rather than silently dropped.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

/// A bounded FIFO of not-yet-sent requests.
#[derive(Debug)]
pub(crate) struct RequestQueue<T> {
	/// Queued entries in insertion order.
	entries: VecDeque<T>,
	/// Maximum number of entries accepted.
	capacity: usize,
	/// Whether new entries are currently rejected.
	frozen: bool,
	/// Whether the queue is disabled outright by configuration.
	disabled: bool,
	/// How long entries may wait before the queue purges itself.
	timeout: Option<Duration>,
	/// The armed purge deadline, if any.
	deadline: Option<Instant>,
}

impl<T> RequestQueue<T> {
	/// Create a queue with the given capacity (`None` = unbounded),
	/// timeout and disable flag.
	pub fn new(capacity: Option<usize>, timeout: Option<Duration>, disabled: bool) -> Self {
		RequestQueue {
			entries: VecDeque::new(),
			capacity: capacity.unwrap_or(usize::MAX),
			frozen: false,
			disabled,
			timeout,
			deadline: None,
		}
	}

	/// Append an entry unless the queue is full, frozen or disabled; the
	/// rejected entry is handed back so the caller can fail its handler.
	/// Arms the purge timer on the first accepted entry.
	pub fn enqueue(&mut self, entry: T) -> Result<(), T> {
		if self.disabled || self.frozen || self.entries.len() >= self.capacity {
			return Err(entry);
		}
		self.entries.push_back(entry);
		if self.deadline.is_none() {
			if let Some(timeout) = self.timeout {
				self.deadline = Some(Instant::now() + timeout);
			}
		}
		Ok(())
	}

	/// Atomically take the queue contents in insertion order, clearing
	/// the live queue and cancelling the timer first so that re-entrant
	/// enqueues from drain handlers cannot recurse into this snapshot.
	pub fn flush(&mut self) -> Vec<T> {
		self.deadline = None;
		self.entries.drain(..).collect()
	}

	/// If the purge deadline has passed, freeze the queue and return the
	/// drained entries so the caller can fail them with a queue-timeout
	/// error.
	pub fn take_expired(&mut self, now: Instant) -> Vec<T> {
		match self.deadline {
			Some(deadline) if deadline <= now => {
				self.frozen = true;
				self.flush()
			}
			_ => Vec::new(),
		}
	}

	/// Remove and return the first entry matching the predicate.
	pub fn remove_where(&mut self, pred: impl FnMut(&T) -> bool) -> Option<T> {
		let index = self.entries.iter().position(pred)?;
		self.entries.remove(index)
	}

	/// The armed purge deadline, if any.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Whether queueing is disabled by configuration.
	pub fn is_disabled(&self) -> bool {
		self.disabled
	}

	/// Stop accepting new entries.
	pub fn freeze(&mut self) {
		self.frozen = true;
	}

	/// Resume accepting new entries.
	pub fn thaw(&mut self) {
		self.frozen = false;
	}

	/// The number of queued entries.
	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.entries.len()
	}
}

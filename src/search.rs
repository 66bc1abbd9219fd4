//! Search result streaming and paged-search orchestration.
//!
//! A search returns a [`SearchStream`]: entries and references arrive as
//! [`SearchItem`]s, and exactly one terminal outcome is delivered through
//! [`SearchStream::finish`]: a server result, or the error that ended the
//! search (abandonment, timeout, connection loss).
//!
//! Paged searches run the RFC 2696 cookie loop in a background task that
//! re-issues the search once per page and stitches the pages into a single
//! stream. A [`SearchItem::Page`] marker is emitted after every completed
//! page; with [`Paged::pause`] set, the marker carries a [`PageCtl`] and
//! the next page is not requested until the caller resumes.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
	conn::{Command, NewRequest},
	controls::Control,
	error::Error,
	filter::Filter,
	proto::{LdapResult, MsgId, Request, SearchEntry, SearchParams},
};

/// One element of a search result stream.
#[derive(Debug)]
pub enum SearchItem {
	/// An entry returned by the server.
	Entry(SearchEntry),
	/// A continuation reference (referral URIs).
	Referral(Vec<String>),
	/// A page of a paged search completed. Carries a [`PageCtl`] when the
	/// search was started with [`Paged::pause`] and more pages remain.
	Page(Option<PageCtl>),
}

/// Options for a paged search.
#[derive(Debug, Clone, Copy)]
pub struct Paged {
	/// Entries per page.
	pub page_size: i32,
	/// Stop after each page until the caller resumes via [`PageCtl`].
	pub pause: bool,
}

/// The resume handle of a paused paged search. Dropping it without calling
/// [`PageCtl::resume`] ends the search after the current page.
#[derive(Debug)]
pub struct PageCtl {
	/// Resumption signal to the pager task.
	tx: oneshot::Sender<bool>,
}

impl PageCtl {
	/// Request the next page.
	pub fn resume(self) {
		let _ = self.tx.send(true);
	}

	/// End the search; the result of the last completed page becomes the
	/// stream's terminal result.
	pub fn cancel(self) {
		let _ = self.tx.send(false);
	}
}

/// A handle to an in-progress search.
#[derive(Debug)]
pub struct SearchStream {
	/// Streamed entries, references and page markers.
	items: mpsc::UnboundedReceiver<SearchItem>,
	/// The terminal outcome.
	done: oneshot::Receiver<Result<LdapResult, Error>>,
	/// Receives the message id once the driver admits the search.
	id_rx: Option<oneshot::Receiver<MsgId>>,
	/// The message id, once known.
	id: Option<MsgId>,
}

impl SearchStream {
	/// Assemble a stream from its channels.
	pub(crate) fn new(
		items: mpsc::UnboundedReceiver<SearchItem>,
		done: oneshot::Receiver<Result<LdapResult, Error>>,
		id_rx: oneshot::Receiver<MsgId>,
	) -> Self {
		SearchStream { items, done, id_rx: Some(id_rx), id: None }
	}

	/// The next streamed item, or `None` once the search is over and
	/// [`SearchStream::finish`] will resolve immediately.
	pub async fn next(&mut self) -> Option<SearchItem> {
		self.items.recv().await
	}

	/// The message id of the search, usable with
	/// [`Client::abandon`](crate::client::Client::abandon). For a paged
	/// search this is the id of the first page's request.
	pub async fn id(&mut self) -> Option<MsgId> {
		if self.id.is_none() {
			if let Some(rx) = self.id_rx.take() {
				self.id = rx.await.ok();
			}
		}
		self.id
	}

	/// Wait for the terminal outcome, discarding any unread items.
	pub async fn finish(self) -> Result<LdapResult, Error> {
		match self.done.await {
			Ok(outcome) => outcome,
			Err(_) => Err(Error::ConnectionClosed),
		}
	}
}

/// Drive a paged search: issue one search per page, forward every page's
/// items into the caller's stream, and follow the server's cookie until it
/// comes back empty.
pub(crate) async fn run_pager(
	tx: mpsc::UnboundedSender<Command>,
	params: SearchParams,
	filter: Filter,
	paged: Paged,
	controls: Vec<Control>,
	items: mpsc::UnboundedSender<SearchItem>,
	done: oneshot::Sender<Result<LdapResult, Error>>,
	id_tx: oneshot::Sender<MsgId>,
) {
	let mut id_tx = Some(id_tx);
	let mut cookie = Vec::new();
	let mut page = 0_u32;
	loop {
		let (page_items_tx, mut page_items) = mpsc::unbounded_channel();
		let (page_done_tx, page_done) = oneshot::channel();
		let mut page_controls = controls.clone();
		page_controls.push(Control::paged(paged.page_size, cookie));
		let new = NewRequest {
			request: Request::Search { params: params.clone(), filter: filter.clone() },
			controls: page_controls,
			stream: Some(page_items_tx),
			done: page_done_tx,
			id_tx: id_tx.take(),
		};
		if tx.send(Command::Request(new)).is_err() {
			let _ = done.send(Err(Error::Destroyed));
			return;
		}
		page += 1;

		while let Some(item) = page_items.recv().await {
			if items.send(item).is_err() {
				// The caller dropped the stream; stop paging.
				return;
			}
		}
		let result = match page_done.await {
			Ok(Ok(result)) => result,
			Ok(Err(err)) => {
				let _ = done.send(Err(err));
				return;
			}
			Err(_) => {
				let _ = done.send(Err(Error::ConnectionClosed));
				return;
			}
		};

		let Some((_, next_cookie)) = result.controls.iter().find_map(Control::parse_paged)
		else {
			let _ = done.send(Err(Error::PagedResultsUnsupported));
			return;
		};
		if next_cookie.is_empty() {
			debug!(page, "paged search complete");
			let _ = items.send(SearchItem::Page(None));
			let _ = done.send(Ok(result));
			return;
		}
		cookie = next_cookie;

		if paged.pause {
			let (ack_tx, ack) = oneshot::channel();
			if items.send(SearchItem::Page(Some(PageCtl { tx: ack_tx }))).is_err() {
				return;
			}
			match ack.await {
				Ok(true) => {}
				Ok(false) | Err(_) => {
					debug!(page, "paged search cancelled");
					let _ = done.send(Ok(result));
					return;
				}
			}
		} else if items.send(SearchItem::Page(None)).is_err() {
			return;
		}
	}
}

//! The caller-facing client handle.

use tokio::sync::{mpsc, oneshot};

use crate::{
	config::Config,
	conn::{Command, Connection, Event, NewRequest},
	controls::Control,
	error::Error,
	proto::{result_codes, validate_dn, LdapResult, Mod, MsgId, Request, SearchParams},
	search::{run_pager, Paged, SearchStream},
};

/// A cheap-to-clone handle to an LDAP connection.
///
/// Handles talk to the connection driver over a command channel; the
/// driver must be running (spawn [`Connection::drive`]) for any operation
/// to make progress. Requests issued while the connection is down are
/// queued according to the configured queue policy and flushed in order
/// once a connection is available.
#[derive(Debug, Clone)]
pub struct Client {
	/// Command channel to the driver.
	tx: mpsc::UnboundedSender<Command>,
	/// Whether DNs are validated client-side before being sent.
	strict_dn: bool,
}

impl Client {
	/// Create a client along with its connection driver and lifecycle
	/// event stream. The driver connects as soon as it is spawned:
	///
	/// ```no_run
	/// # async fn example() -> Result<(), ldap_client::Error> {
	/// # let config: ldap_client::Config = todo!();
	/// let (client, conn, _events) = ldap_client::Client::new(config);
	/// tokio::spawn(conn.drive());
	/// client.bind("cn=admin,dc=example,dc=org", "secret", Vec::new()).await?;
	/// # Ok(())
	/// # }
	/// ```
	#[must_use]
	pub fn new(config: Config) -> (Self, Connection, mpsc::UnboundedReceiver<Event>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let strict_dn = config.strict_dn;
		let conn = Connection::new(config, rx, events_tx);
		(Client { tx, strict_dn }, conn, events_rx)
	}

	/// Perform a simple bind.
	pub async fn bind(
		&self,
		dn: &str,
		password: &str,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		self.check_dn(dn)?;
		self.run(
			Request::SimpleBind { dn: dn.to_owned(), password: password.to_owned() },
			controls,
		)
		.await
	}

	/// Unbind and close the connection. Resolves once the unbind request
	/// has been written; the server sends no response. The connection will
	/// not reconnect until [`Client::connect`] is called.
	pub async fn unbind(&self) -> Result<(), Error> {
		self.run(Request::Unbind, Vec::new()).await.map(|_| ())
	}

	/// Add an entry.
	pub async fn add(
		&self,
		dn: &str,
		attrs: Vec<(String, Vec<String>)>,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		self.check_dn(dn)?;
		self.run(Request::Add { dn: dn.to_owned(), attrs }, controls).await
	}

	/// Delete an entry.
	pub async fn delete(&self, dn: &str, controls: Vec<Control>) -> Result<LdapResult, Error> {
		self.check_dn(dn)?;
		self.run(Request::Delete { dn: dn.to_owned() }, controls).await
	}

	/// Modify an entry's attributes.
	pub async fn modify(
		&self,
		dn: &str,
		mods: Vec<Mod>,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		self.check_dn(dn)?;
		self.run(Request::Modify { dn: dn.to_owned(), mods }, controls).await
	}

	/// Rename or move an entry.
	pub async fn modify_dn(
		&self,
		dn: &str,
		new_rdn: &str,
		delete_old_rdn: bool,
		new_superior: Option<&str>,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		self.check_dn(dn)?;
		if let Some(superior) = new_superior {
			self.check_dn(superior)?;
		}
		self.run(
			Request::ModifyDn {
				dn: dn.to_owned(),
				new_rdn: new_rdn.to_owned(),
				delete_old_rdn,
				new_superior: new_superior.map(ToOwned::to_owned),
			},
			controls,
		)
		.await
	}

	/// Compare an attribute value of an entry. Returns whether the server
	/// reported a match.
	pub async fn compare(
		&self,
		dn: &str,
		attr: &str,
		value: &str,
		controls: Vec<Control>,
	) -> Result<bool, Error> {
		self.check_dn(dn)?;
		let result = self
			.run(
				Request::Compare {
					dn: dn.to_owned(),
					attr: attr.to_owned(),
					value: value.to_owned(),
				},
				controls,
			)
			.await?;
		Ok(result.rc == result_codes::COMPARE_TRUE)
	}

	/// Perform an extended operation.
	pub async fn extended(
		&self,
		name: &str,
		value: Option<Vec<u8>>,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		self.run(Request::Extended { name: name.to_owned(), value }, controls).await
	}

	/// Start a search. The filter is parsed and the base DN validated
	/// before anything is sent, so malformed input fails here rather than
	/// on the wire.
	pub fn search(
		&self,
		params: SearchParams,
		controls: Vec<Control>,
	) -> Result<SearchStream, Error> {
		self.check_dn(&params.base)?;
		let filter = crate::filter::Filter::parse(&params.filter)?;
		let (items_tx, items_rx) = mpsc::unbounded_channel();
		let (done_tx, done_rx) = oneshot::channel();
		let (id_tx, id_rx) = oneshot::channel();
		let new = NewRequest {
			request: Request::Search { params, filter },
			controls,
			stream: Some(items_tx),
			done: done_tx,
			id_tx: Some(id_tx),
		};
		self.tx.send(Command::Request(new)).map_err(|_| Error::Destroyed)?;
		Ok(SearchStream::new(items_rx, done_rx, id_rx))
	}

	/// Start a paged search (RFC 2696). Pages are requested one after
	/// another and stitched into a single stream; see
	/// [`SearchItem::Page`](crate::search::SearchItem::Page) for the
	/// per-page markers. Fails with
	/// [`Error::PagedResultsUnsupported`] if the server does not return
	/// the paged-results control.
	pub fn search_paged(
		&self,
		params: SearchParams,
		paged: Paged,
		controls: Vec<Control>,
	) -> Result<SearchStream, Error> {
		self.check_dn(&params.base)?;
		let filter = crate::filter::Filter::parse(&params.filter)?;
		let (items_tx, items_rx) = mpsc::unbounded_channel();
		let (done_tx, done_rx) = oneshot::channel();
		let (id_tx, id_rx) = oneshot::channel();
		tokio::spawn(run_pager(
			self.tx.clone(),
			params,
			filter,
			paged,
			controls,
			items_tx,
			done_tx,
			id_tx,
		));
		Ok(SearchStream::new(items_rx, done_rx, id_rx))
	}

	/// Abandon an earlier request by message id. Abandonment is advisory:
	/// a still-queued target fails immediately, while an in-flight target
	/// is kept around so a response racing the abandon still reaches its
	/// handler; the target only fails with [`Error::Abandoned`] once later
	/// traffic shows no response is coming. Resolves once the abandon has
	/// been processed.
	pub async fn abandon(&self, id: MsgId) -> Result<(), Error> {
		self.run(Request::Abandon { target: id }, Vec::new()).await.map(|_| ())
	}

	/// Upgrade the live connection to TLS via StartTLS.
	pub async fn starttls(&self) -> Result<(), Error> {
		let (done, rx) = oneshot::channel();
		self.tx.send(Command::StartTls { done }).map_err(|_| Error::Destroyed)?;
		rx.await.map_err(|_| Error::ConnectionClosed)?
	}

	/// Ask a dormant connection to (re)connect, for example after an
	/// unbind or once reconnection attempts have been exhausted. A no-op
	/// while connected.
	pub fn connect(&self) -> Result<(), Error> {
		self.tx.send(Command::Connect).map_err(|_| Error::Destroyed)
	}

	/// Tear the connection down and stop the driver. Every pending and
	/// queued request fails; the client is unusable afterwards.
	pub fn destroy(&self) -> Result<(), Error> {
		self.tx.send(Command::Destroy).map_err(|_| Error::Destroyed)
	}

	/// Hand a request to the driver and await its completion.
	async fn run(&self, request: Request, controls: Vec<Control>) -> Result<LdapResult, Error> {
		let (done, rx) = oneshot::channel();
		let new = NewRequest { request, controls, stream: None, done, id_tx: None };
		self.tx.send(Command::Request(new)).map_err(|_| Error::Destroyed)?;
		rx.await.map_err(|_| Error::ConnectionClosed)?
	}

	/// Validate a DN client-side when strict validation is enabled.
	fn check_dn(&self, dn: &str) -> Result<(), Error> {
		if self.strict_dn {
			validate_dn(dn)?;
		}
		Ok(())
	}
}

//! The connection driver: socket establishment, reconnection, request
//! dispatch and response demultiplexing.
//!
//! One [`Connection`] is driven by a single task (spawn [`Connection::drive`])
//! and owns the socket, the message tracker and the request queue. Callers
//! never touch any of those directly; they hold a cheap-to-clone
//! [`Client`](crate::client::Client) that talks to the driver over a command
//! channel. This keeps every piece of connection state single-threaded and
//! lock-free.

use std::{
	future::Future,
	io,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::{TcpStream, UnixStream},
	sync::{mpsc, oneshot},
	time::{sleep_until, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, error, warn};

use crate::{
	codec::LdapCodec,
	config::{Config, Endpoint, ReconnectConfig},
	controls::Control,
	error::Error,
	proto::{result_codes, LdapResult, Message, MsgId, Request, ResponseOp, WireRequest, STARTTLS_OID},
	queue::RequestQueue,
	search::SearchItem,
	tracker::{MessageTracker, Tracked},
};

/// Lifecycle notifications, delivered on the channel handed back by
/// [`Client::new`](crate::client::Client::new).
#[derive(Debug)]
pub enum Event {
	/// A connection was established and set up successfully.
	Connected,
	/// A connection attempt failed.
	ConnectError(Error),
	/// A connection attempt exceeded the configured connect timeout.
	ConnectTimeout,
	/// The transport connected but a setup step (StartTLS, automatic bind
	/// or a setup hook) failed, so the connection was discarded.
	SetupError(Error),
	/// The connection closed; in-flight requests have been failed.
	Closed,
	/// No request has been outstanding for the configured idle timeout.
	Idle,
	/// A request hit the configured operation timeout and was failed.
	RequestTimeout {
		/// The message id of the timed-out request.
		id: MsgId,
		/// The operation name of the timed-out request.
		kind: &'static str,
	},
	/// The driver gave up: connection attempts are exhausted or the socket
	/// failed. A `Connect` command restarts it.
	Error(Error),
}

/// A request handed to the driver by a [`Client`](crate::client::Client),
/// before a message id has been assigned.
pub(crate) struct NewRequest {
	/// The protocol request.
	pub request: Request,
	/// Controls to attach to the message.
	pub controls: Vec<Control>,
	/// Where streamed search entries and references are delivered.
	pub stream: Option<mpsc::UnboundedSender<SearchItem>>,
	/// The completion channel.
	pub done: oneshot::Sender<Result<LdapResult, Error>>,
	/// If set, receives the assigned message id as soon as the driver
	/// admits the request.
	pub id_tx: Option<oneshot::Sender<MsgId>>,
}

/// A request the driver has admitted and assigned a message id to. It may
/// sit in the queue before being written to the socket.
pub(crate) struct PendingRequest {
	/// The assigned message id.
	pub id: MsgId,
	/// The protocol request.
	pub request: Request,
	/// Controls to attach to the message.
	pub controls: Vec<Control>,
	/// Where streamed search entries and references are delivered.
	pub stream: Option<mpsc::UnboundedSender<SearchItem>>,
	/// The completion channel.
	pub done: oneshot::Sender<Result<LdapResult, Error>>,
}

/// Commands a [`Client`](crate::client::Client) sends to the driver.
pub(crate) enum Command {
	/// Issue a protocol request.
	Request(NewRequest),
	/// Upgrade the live connection to TLS via StartTLS.
	StartTls {
		/// Resolved when the upgrade completes or fails.
		done: oneshot::Sender<Result<(), Error>>,
	},
	/// Leave the dormant state and (re)connect.
	Connect,
	/// Tear everything down and stop the driver.
	Destroy,
}

/// The transport under the codec.
#[derive(Debug)]
pub(crate) enum Transport {
	/// Plain TCP.
	Tcp(TcpStream),
	/// TLS over TCP, either `ldaps://` or an upgraded StartTLS session.
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
	/// A Unix domain socket.
	Unix(UnixStream),
}

impl AsyncRead for Transport {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
			Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
			Transport::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Transport {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
			Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
			Transport::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
			Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
			Transport::Unix(stream) => Pin::new(stream).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
			Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
			Transport::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
		}
	}
}

/// A framed, connected transport.
type Wire = Framed<Transport, LdapCodec>;

/// Access to a freshly connected, not yet announced connection, handed to
/// [`SetupHook`]s so they can run requests before regular traffic starts.
#[derive(Debug)]
pub struct SetupConn<'a> {
	/// The framed transport of the connection being set up.
	framed: &'a mut Wire,
	/// The tracker, used for message-id allocation only; setup requests
	/// are answered inline and never tracked.
	tracker: &'a mut MessageTracker,
}

impl SetupConn<'_> {
	/// Run a single request to completion and verify it succeeded.
	///
	/// Search entries streamed before the terminal result are discarded;
	/// setup steps are expected to be single-response operations.
	pub async fn request(
		&mut self,
		request: Request,
		controls: Vec<Control>,
	) -> Result<LdapResult, Error> {
		let expect = request.expected();
		let id = self.tracker.allocate();
		let result = exchange(self.framed, id, request, controls).await?;
		if expect.contains(&result.rc) {
			Ok(result)
		} else {
			Err(Error::from_result(&result))
		}
	}

	/// Perform a simple bind.
	pub async fn bind(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		self.request(
			Request::SimpleBind { dn: dn.to_owned(), password: password.to_owned() },
			Vec::new(),
		)
		.await
		.map(|_| ())
	}
}

/// A setup step run on every new connection after StartTLS and the
/// automatic bind, before the connection accepts regular traffic. A hook
/// failure discards the connection and counts as a failed attempt.
pub trait SetupHook: Send {
	/// Run the step. Returning an error aborts the connection attempt.
	fn run<'a, 'b>(
		&'a mut self,
		conn: &'a mut SetupConn<'b>,
	) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>
	where
		'b: 'a;
}

/// Why a serving connection ended.
enum CloseReason {
	/// The remote end closed the socket.
	Eof,
	/// The socket or codec failed.
	Error(Error),
	/// The caller unbound; the close is expected and reconnect is
	/// suppressed.
	Unbound,
	/// The caller destroyed the client.
	Destroyed,
	/// Every client handle was dropped.
	Shutdown,
}

/// How a serve pass ended.
enum ServeEnd {
	/// The connection is gone.
	Close(CloseReason),
	/// A StartTLS request was accepted by the server; the driver must now
	/// run the handshake and resume serving on the upgraded transport.
	StartTls {
		/// The framed transport to upgrade.
		framed: Wire,
		/// Resolved once the handshake completes or fails.
		done: oneshot::Sender<Result<(), Error>>,
	},
}

/// What to do next after handling commands while disconnected.
enum Flow {
	/// Keep waiting.
	Continue,
	/// Start a connection attempt.
	Connect,
	/// Tear down and stop.
	Destroy,
	/// Every client handle was dropped; stop.
	Shutdown,
}

/// What woke one of the driver's wait loops.
enum Wake {
	/// An inbound protocol message, or end of stream.
	Inbound(Option<Result<Message, Error>>),
	/// A command from a client handle, or channel closure.
	Command(Option<Command>),
	/// A request or idle deadline passed, or a backoff sleep elapsed.
	Tick,
	/// The queue timeout deadline passed.
	QueueTick,
}

/// The connection driver. Created by
/// [`Client::new`](crate::client::Client::new); spawn [`Connection::drive`]
/// to make the client usable.
pub struct Connection {
	/// The client configuration.
	config: Config,
	/// Commands from client handles.
	rx: mpsc::UnboundedReceiver<Command>,
	/// Lifecycle event sink.
	events: mpsc::UnboundedSender<Event>,
	/// Message-id allocation and in-flight request state.
	tracker: MessageTracker,
	/// Requests waiting for a usable connection.
	queue: RequestQueue<PendingRequest>,
	/// Setup steps run on every new connection.
	hooks: Vec<Box<dyn SetupHook>>,
	/// Cached TLS client configuration, built on first use.
	tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("url", &self.config.url)
			.field("pending", &self.tracker.pending())
			.field("hooks", &self.hooks.len())
			.finish_non_exhaustive()
	}
}

impl Connection {
	/// Build a driver around its command and event channels.
	pub(crate) fn new(
		config: Config,
		rx: mpsc::UnboundedReceiver<Command>,
		events: mpsc::UnboundedSender<Event>,
	) -> Self {
		let queue = RequestQueue::new(
			config.queue.size,
			config.queue.timeout,
			config.queue.disable,
		);
		Connection {
			config,
			rx,
			events,
			tracker: MessageTracker::default(),
			queue,
			hooks: Vec::new(),
			tls: None,
		}
	}

	/// Register a setup step to run on every new connection, after
	/// StartTLS and the automatic bind. Must be called before spawning
	/// [`Connection::drive`].
	pub fn add_setup_hook(&mut self, hook: impl SetupHook + 'static) {
		self.hooks.push(Box::new(hook));
	}

	/// Run the connection to completion. The driver connects immediately,
	/// then cycles between serving, reconnecting with backoff, and lying
	/// dormant, until the client is destroyed or every handle is dropped.
	pub async fn drive(mut self) -> Result<(), Error> {
		let mut kick = true;
		loop {
			if !kick {
				match self.dormant().await {
					Flow::Connect => {}
					Flow::Destroy | Flow::Shutdown => break,
					Flow::Continue => continue,
				}
			}
			kick = false;

			let framed = match self.establish().await {
				Ok(framed) => framed,
				Err(Flow::Destroy | Flow::Shutdown) => break,
				Err(Flow::Connect) => {
					kick = true;
					continue;
				}
				Err(Flow::Continue) => continue,
			};

			let mut framed = framed;
			let reason = loop {
				match self.serve(framed).await {
					ServeEnd::Close(reason) => break reason,
					ServeEnd::StartTls { framed: plain, done } => {
						match self.upgrade(plain).await {
							Ok(secured) => {
								debug!("starttls upgrade complete");
								let _ = done.send(Ok(()));
								framed = secured;
							}
							Err(err) => {
								let _ = done.send(Err(err.clone()));
								break CloseReason::Error(err);
							}
						}
					}
				}
			};
			self.teardown(&reason);
			match reason {
				CloseReason::Destroyed | CloseReason::Shutdown => break,
				CloseReason::Unbound => {}
				CloseReason::Eof | CloseReason::Error(_) => {
					if self.config.connection.reconnect.is_some() {
						kick = true;
					}
				}
			}
		}
		self.shutdown();
		Ok(())
	}

	/// Wait, disconnected, until a `Connect` command (or shutdown).
	/// Requests received meanwhile are queued.
	async fn dormant(&mut self) -> Flow {
		debug!("connection dormant");
		loop {
			let queue_deadline = self.queue.deadline();
			let wake = tokio::select! {
				cmd = self.rx.recv() => Wake::Command(cmd),
				() = sleep_until(queue_deadline.unwrap_or_else(Instant::now)),
					if queue_deadline.is_some() => Wake::QueueTick,
			};
			match wake {
				Wake::Command(cmd) => match self.handle_offline(cmd) {
					Flow::Continue => {}
					flow => return flow,
				},
				Wake::QueueTick => self.expire_queue(),
				Wake::Inbound(_) | Wake::Tick => {}
			}
		}
	}

	/// Attempt to connect, with exponential backoff between failures,
	/// until a connection is set up or the attempt budget is exhausted.
	async fn establish(&mut self) -> Result<Wire, Flow> {
		let reconnect = self.config.connection.reconnect.clone();
		let mut attempt: u32 = 0;
		loop {
			attempt += 1;
			match self.connect_and_setup().await {
				Ok(framed) => {
					debug!(attempt, "connected");
					self.emit(Event::Connected);
					return Ok(framed);
				}
				Err(err) => {
					warn!(attempt, %err, "connection attempt failed");
					match &err {
						Error::ConnectTimeout => self.emit(Event::ConnectTimeout),
						Error::Setup(inner) => {
							self.emit(Event::SetupError((**inner).clone()));
						}
						_ => self.emit(Event::ConnectError(err.clone())),
					}
					let Some(reconnect) = &reconnect else {
						self.emit(Event::Error(err));
						return Err(Flow::Continue);
					};
					if let Some(limit) = reconnect.fail_after {
						if attempt >= limit {
							error!(attempt, "giving up on reconnecting");
							self.emit(Event::Error(err));
							return Err(Flow::Continue);
						}
					}
					let delay = backoff_delay(reconnect, attempt);
					debug!(?delay, attempt, "backing off before retrying");
					if let Some(flow) = self.wait_backoff(Instant::now() + delay).await {
						return Err(flow);
					}
				}
			}
		}
	}

	/// Sleep until `wake`, still handling commands and queue expiry. A
	/// `Connect` command cuts the backoff short. Returns a flow only when
	/// the establish loop must stop.
	async fn wait_backoff(&mut self, wake_at: Instant) -> Option<Flow> {
		loop {
			let queue_deadline = self.queue.deadline();
			let wake = tokio::select! {
				() = sleep_until(wake_at) => Wake::Tick,
				cmd = self.rx.recv() => Wake::Command(cmd),
				() = sleep_until(queue_deadline.unwrap_or(wake_at)),
					if queue_deadline.is_some() => Wake::QueueTick,
			};
			match wake {
				Wake::Tick => return None,
				Wake::QueueTick => self.expire_queue(),
				Wake::Command(cmd) => match self.handle_offline(cmd) {
					Flow::Continue => {}
					Flow::Connect => return None,
					flow => return Some(flow),
				},
				Wake::Inbound(_) => {}
			}
		}
	}

	/// Open the transport and run connection setup: StartTLS when
	/// configured, the automatic bind, then the registered hooks.
	async fn connect_and_setup(&mut self) -> Result<Wire, Error> {
		let endpoint = self.config.endpoint()?;
		let starttls = self.config.connection.tls.starttls
			&& matches!(endpoint, Endpoint::Plain { .. });
		let tls = if starttls || matches!(endpoint, Endpoint::Tls { .. }) {
			Some(self.tls_config().await?)
		} else {
			None
		};

		debug!(url = %self.config.url, "connecting");
		let connect = open_transport(&endpoint, tls.as_ref());
		let transport = match self.config.connection.connect_timeout {
			Some(limit) => tokio::time::timeout(limit, connect)
				.await
				.map_err(|_| Error::ConnectTimeout)??,
			None => connect.await?,
		};
		let mut framed = Framed::new(transport, LdapCodec);

		if starttls {
			let Endpoint::Plain { host, .. } = &endpoint else { unreachable!() };
			framed = self
				.starttls_exchange(framed, host)
				.await
				.map_err(|err| Error::Setup(Box::new(err)))?;
		}

		if let Some(dn) = self.config.bind_dn.clone() {
			let password = self.config.bind_credentials.clone().unwrap_or_default();
			let mut setup =
				SetupConn { framed: &mut framed, tracker: &mut self.tracker };
			setup
				.bind(&dn, &password)
				.await
				.map_err(|err| Error::Setup(Box::new(err)))?;
			debug!(%dn, "automatic bind complete");
		}

		let mut hooks = std::mem::take(&mut self.hooks);
		let mut outcome = Ok(());
		for hook in &mut hooks {
			let mut setup =
				SetupConn { framed: &mut framed, tracker: &mut self.tracker };
			if let Err(err) = hook.run(&mut setup).await {
				outcome = Err(err);
				break;
			}
		}
		self.hooks = hooks;
		outcome.map_err(|err| Error::Setup(Box::new(err)))?;

		Ok(framed)
	}

	/// Send a StartTLS extended request and, on success, run the TLS
	/// handshake over the same socket.
	async fn starttls_exchange(&mut self, mut framed: Wire, host: &str) -> Result<Wire, Error> {
		let id = self.tracker.allocate();
		let request =
			Request::Extended { name: STARTTLS_OID.to_owned(), value: None };
		let result = exchange(&mut framed, id, request, Vec::new()).await?;
		if result.rc != result_codes::SUCCESS {
			return Err(Error::from_result(&result));
		}
		let tls = self.tls_config().await?;
		tls_handshake(framed, tls, host)
			.await
	}

	/// Run the TLS handshake for a caller-requested StartTLS upgrade whose
	/// extended request already succeeded.
	async fn upgrade(&mut self, framed: Wire) -> Result<Wire, Error> {
		let Endpoint::Plain { host, .. } = self.config.endpoint()? else {
			return Err(Error::Tls("only plain tcp connections can be upgraded".to_owned()));
		};
		let tls = self.tls_config().await?;
		tls_handshake(framed, tls, &host).await
	}

	/// The TLS client configuration, built from config on first use.
	async fn tls_config(&mut self) -> Result<Arc<rustls::ClientConfig>, Error> {
		if let Some(tls) = &self.tls {
			return Ok(tls.clone());
		}
		let tls = self.config.connection.tls.client_config().await?;
		self.tls = Some(tls.clone());
		Ok(tls)
	}

	/// Serve a live connection: flush the queue, then multiplex inbound
	/// messages, commands and timers until the connection ends.
	#[allow(clippy::too_many_lines)]
	async fn serve(&mut self, mut framed: Wire) -> ServeEnd {
		self.queue.thaw();
		for pending in self.queue.flush() {
			if let Err(reason) = self.transmit(&mut framed, pending).await {
				return ServeEnd::Close(reason);
			}
		}

		let mut pending_starttls: Option<(MsgId, oneshot::Sender<Result<(), Error>>)> = None;
		let mut last_activity = Instant::now();
		let mut idle_fired = false;
		loop {
			let deadline = self.serve_deadline(last_activity, idle_fired);
			let wake = tokio::select! {
				inbound = framed.next() => Wake::Inbound(inbound),
				cmd = self.rx.recv() => Wake::Command(cmd),
				() = sleep_until(deadline.unwrap_or_else(Instant::now)),
					if deadline.is_some() => Wake::Tick,
			};
			match wake {
				Wake::Inbound(None) => {
					debug!("server closed the connection");
					return ServeEnd::Close(CloseReason::Eof);
				}
				Wake::Inbound(Some(Err(err))) => {
					warn!(%err, "connection failed");
					return ServeEnd::Close(CloseReason::Error(err));
				}
				Wake::Inbound(Some(Ok(message))) => {
					last_activity = Instant::now();
					idle_fired = false;
					if let Some((id, _)) = pending_starttls {
						if message.id == id && message.is_terminal() {
							let Some((_, done)) = pending_starttls.take() else {
								unreachable!()
							};
							if let ResponseOp::Result(result) = &message.op {
								if result.rc == result_codes::SUCCESS {
									return ServeEnd::StartTls { framed, done };
								}
								let _ = done.send(Err(Error::from_result(result)));
							}
							continue;
						}
					}
					self.demux(message);
				}
				Wake::Command(None) => return ServeEnd::Close(CloseReason::Shutdown),
				Wake::Command(Some(Command::Connect)) => {
					debug!("ignoring connect command while connected");
				}
				Wake::Command(Some(Command::Destroy)) => {
					return ServeEnd::Close(CloseReason::Destroyed);
				}
				Wake::Command(Some(Command::StartTls { done })) => {
					if !matches!(framed.get_ref(), Transport::Tcp(_)) {
						let _ = done
							.send(Err(Error::Tls("connection is already secure".to_owned())));
					} else if pending_starttls.is_some() {
						let _ = done.send(Err(Error::Tls(
							"a starttls upgrade is already in progress".to_owned(),
						)));
					} else {
						let id = self.tracker.allocate();
						let request = Request::Extended {
							name: STARTTLS_OID.to_owned(),
							value: None,
						};
						let wire =
							WireRequest { id, op: request.into_tag(), controls: Vec::new() };
						if let Err(err) = framed.send(wire).await {
							let _ = done.send(Err(err.clone()));
							return ServeEnd::Close(CloseReason::Error(err));
						}
						pending_starttls = Some((id, done));
					}
				}
				Wake::Command(Some(Command::Request(new))) => {
					last_activity = Instant::now();
					idle_fired = false;
					let pending = self.admit(new);
					if let Request::Abandon { target } = pending.request {
						if let Err(reason) =
							self.send_abandon(&mut framed, pending, target).await
						{
							return ServeEnd::Close(reason);
						}
					} else if matches!(pending.request, Request::Unbind) {
						let PendingRequest { id, request, controls, done, .. } = pending;
						debug!("unbinding");
						let wire = WireRequest { id, op: request.into_tag(), controls };
						return match framed.send(wire).await {
							Ok(()) => {
								let _ = done.send(Ok(LdapResult::default()));
								ServeEnd::Close(CloseReason::Unbound)
							}
							Err(err) => {
								let _ = done.send(Err(err.clone()));
								ServeEnd::Close(CloseReason::Error(err))
							}
						};
					} else if let Err(reason) = self.transmit(&mut framed, pending).await {
						return ServeEnd::Close(reason);
					}
				}
				Wake::Tick => {
					let now = Instant::now();
					for (id, tracked) in self.tracker.take_expired(now) {
						warn!(id, kind = tracked.kind, "request timed out");
						self.emit(Event::RequestTimeout { id, kind: tracked.kind });
						let _ = tracked.done.send(Err(Error::Timeout));
					}
					if let Some(idle) = self.config.connection.idle_timeout {
						if !idle_fired
							&& self.tracker.pending() == 0
							&& now >= last_activity + idle
						{
							debug!("connection idle");
							self.emit(Event::Idle);
							idle_fired = true;
						}
					}
				}
				// The queue is empty while serving; its timer never arms.
				Wake::QueueTick => {}
			}
		}
	}

	/// The earliest timer the serve loop must wake for: the soonest
	/// request deadline, or the idle deadline while nothing is in flight.
	fn serve_deadline(&self, last_activity: Instant, idle_fired: bool) -> Option<Instant> {
		let mut deadline = self.tracker.next_deadline();
		if !idle_fired && self.tracker.pending() == 0 {
			if let Some(idle) = self.config.connection.idle_timeout {
				let candidate = last_activity + idle;
				deadline = Some(deadline.map_or(candidate, |d| d.min(candidate)));
			}
		}
		deadline
	}

	/// Track a request and write it to the socket. A write failure fails
	/// the request's handler and closes the connection.
	async fn transmit(
		&mut self,
		framed: &mut Wire,
		pending: PendingRequest,
	) -> Result<(), CloseReason> {
		let PendingRequest { id, request, controls, stream, done } = pending;
		let kind = request.kind();
		let expect = request.expected();
		let deadline =
			self.config.connection.operation_timeout.map(|t| Instant::now() + t);
		let op = request.into_tag();
		self.tracker.register(id, Tracked { kind, expect, stream, done, deadline });
		debug!(id, kind, "sending request");
		match framed.send(WireRequest { id, op, controls }).await {
			Ok(()) => Ok(()),
			Err(err) => {
				if let Some(tracked) = self.tracker.take(id) {
					let _ = tracked.done.send(Err(err.clone()));
				}
				Err(CloseReason::Error(err))
			}
		}
	}

	/// Handle an admitted abandon request: fail the target's handler
	/// locally and, if it was in flight, notify the server. Abandons get
	/// no response, so the abandon's own handler resolves once the write
	/// is done.
	async fn send_abandon(
		&mut self,
		framed: &mut Wire,
		pending: PendingRequest,
		target: MsgId,
	) -> Result<(), CloseReason> {
		let PendingRequest { id, request, controls, done, .. } = pending;
		if let Some(queued) = self.queue.remove_where(|p| p.id == target) {
			debug!(id = target, "abandoning queued request");
			let _ = queued.done.send(Err(Error::Abandoned));
		} else if self.tracker.abandon(target) {
			debug!(id = target, "abandoning in-flight request");
			let wire = WireRequest { id, op: request.into_tag(), controls };
			if let Err(err) = framed.send(wire).await {
				let _ = done.send(Err(err.clone()));
				return Err(CloseReason::Error(err));
			}
		} else {
			debug!(id = target, "abandon for an unknown message id");
		}
		let _ = done.send(Ok(LdapResult::default()));
		Ok(())
	}

	/// Route one inbound message to its tracked request.
	fn demux(&mut self, message: Message) {
		let Message { id, op, controls } = message;
		if id == 0 {
			warn!("discarding unsolicited notification");
			return;
		}
		let was_abandoned = self.tracker.is_abandoned(id);
		match op {
			ResponseOp::SearchEntry(entry) => {
				if let Some(stream) = self.tracker.stream_for(id) {
					let _ = stream.send(SearchItem::Entry(entry));
				} else {
					warn!(id, "search entry for an unknown message id");
				}
			}
			ResponseOp::SearchReference(refs) => {
				if let Some(stream) = self.tracker.stream_for(id) {
					let _ = stream.send(SearchItem::Referral(refs));
				} else {
					warn!(id, "search reference for an unknown message id");
				}
			}
			ResponseOp::Result(mut result) => {
				result.controls = controls;
				match self.tracker.take(id) {
					Some(tracked) => {
						debug!(id, kind = tracked.kind, rc = result.rc, "request complete");
						let outcome = if tracked.expect.contains(&result.rc) {
							Ok(result)
						} else {
							Err(Error::from_result(&result))
						};
						let _ = tracked.done.send(outcome);
					}
					None => warn!(id, "result for an unknown message id"),
				}
			}
		}
		if was_abandoned {
			for (purged, tracked) in self.tracker.purge_window(id) {
				debug!(id = purged, "expiring abandoned request");
				let _ = tracked.done.send(Err(Error::Abandoned));
			}
		}
	}

	/// Handle a command while no connection is being served.
	fn handle_offline(&mut self, cmd: Option<Command>) -> Flow {
		match cmd {
			None => Flow::Shutdown,
			Some(Command::Connect) => Flow::Connect,
			Some(Command::Destroy) => Flow::Destroy,
			Some(Command::StartTls { done }) => {
				let _ = done.send(Err(Error::ConnectionUnavailable));
				Flow::Continue
			}
			Some(Command::Request(new)) => {
				let pending = self.admit(new);
				if let Request::Abandon { target } = pending.request {
					if let Some(queued) = self.queue.remove_where(|p| p.id == target) {
						debug!(id = target, "abandoning queued request");
						let _ = queued.done.send(Err(Error::Abandoned));
					}
					let _ = pending.done.send(Ok(LdapResult::default()));
				} else if matches!(pending.request, Request::Unbind) {
					// Nothing is bound; resolve immediately.
					let _ = pending.done.send(Ok(LdapResult::default()));
				} else if let Err(rejected) = self.queue.enqueue(pending) {
					let err = if self.queue.is_disabled() {
						Error::ConnectionUnavailable
					} else {
						Error::QueueRejected
					};
					debug!(id = rejected.id, %err, "rejecting request");
					let _ = rejected.done.send(Err(err));
					// A send that cannot even be queued is a signal to try
					// connecting again.
					if self.config.connection.reconnect.is_some() {
						return Flow::Connect;
					}
				}
				Flow::Continue
			}
		}
	}

	/// Assign a message id to a freshly received request.
	fn admit(&mut self, new: NewRequest) -> PendingRequest {
		let NewRequest { request, controls, stream, done, id_tx } = new;
		let id = self.tracker.allocate();
		if let Some(tx) = id_tx {
			let _ = tx.send(id);
		}
		PendingRequest { id, request, controls, stream, done }
	}

	/// Fail queued requests whose queue timeout has passed.
	fn expire_queue(&mut self) {
		let expired = self.queue.take_expired(Instant::now());
		if expired.is_empty() {
			return;
		}
		warn!(count = expired.len(), "expiring queued requests");
		for pending in expired {
			let _ = pending.done.send(Err(Error::QueueTimeout));
		}
	}

	/// Fail every in-flight request and announce the close.
	fn teardown(&mut self, reason: &CloseReason) {
		let err = match reason {
			CloseReason::Error(err) => err.clone(),
			CloseReason::Destroyed => Error::Destroyed,
			_ => Error::ConnectionClosed,
		};
		let purged = self.tracker.purge_all();
		if !purged.is_empty() {
			warn!(count = purged.len(), "failing in-flight requests");
		}
		for (_, tracked) in purged {
			let _ = tracked.done.send(Err(err.clone()));
		}
		if let CloseReason::Error(err) = reason {
			self.emit(Event::Error(err.clone()));
		}
		self.emit(Event::Closed);
	}

	/// Final cleanup when the driver stops for good.
	fn shutdown(&mut self) {
		for pending in self.queue.flush() {
			let _ = pending.done.send(Err(Error::Destroyed));
		}
		for (_, tracked) in self.tracker.purge_all() {
			let _ = tracked.done.send(Err(Error::Destroyed));
		}
	}

	/// Deliver a lifecycle event, ignoring a dropped receiver.
	fn emit(&self, event: Event) {
		let _ = self.events.send(event);
	}
}

/// The backoff delay before retry number `attempt + 1`, doubling from the
/// initial delay and capped at the maximum.
fn backoff_delay(reconnect: &ReconnectConfig, attempt: u32) -> Duration {
	let exponent = attempt.saturating_sub(1).min(31);
	reconnect
		.initial_delay
		.saturating_mul(2_u32.saturating_pow(exponent))
		.min(reconnect.max_delay)
}

/// Open the raw transport for an endpoint.
async fn open_transport(
	endpoint: &Endpoint,
	tls: Option<&Arc<rustls::ClientConfig>>,
) -> Result<Transport, Error> {
	match endpoint {
		Endpoint::Plain { host, port } => {
			Ok(Transport::Tcp(TcpStream::connect((host.as_str(), *port)).await?))
		}
		Endpoint::Tls { host, port } => {
			let tls = tls
				.ok_or_else(|| Error::Tls("missing tls configuration".to_owned()))?
				.clone();
			let tcp = TcpStream::connect((host.as_str(), *port)).await?;
			let name = rustls::ServerName::try_from(host.as_str())
				.map_err(|_| Error::Tls(format!("invalid tls server name '{host}'")))?;
			let stream = tokio_rustls::TlsConnector::from(tls)
				.connect(name, tcp)
				.await
				.map_err(|err| Error::Tls(err.to_string()))?;
			Ok(Transport::Tls(Box::new(stream)))
		}
		Endpoint::Unix(path) => Ok(Transport::Unix(UnixStream::connect(path).await?)),
	}
}

/// Replace a plain TCP transport with a TLS session over the same socket,
/// preserving any buffered bytes.
async fn tls_handshake(
	framed: Wire,
	tls: Arc<rustls::ClientConfig>,
	host: &str,
) -> Result<Wire, Error> {
	let parts = framed.into_parts();
	let Transport::Tcp(stream) = parts.io else {
		return Err(Error::Tls("connection is already secure".to_owned()));
	};
	let name = rustls::ServerName::try_from(host)
		.map_err(|_| Error::Tls(format!("invalid tls server name '{host}'")))?;
	let stream = tokio_rustls::TlsConnector::from(tls)
		.connect(name, stream)
		.await
		.map_err(|err| Error::Tls(err.to_string()))?;
	let mut upgraded =
		FramedParts::new::<WireRequest>(Transport::Tls(Box::new(stream)), LdapCodec);
	upgraded.read_buf = parts.read_buf;
	upgraded.write_buf = parts.write_buf;
	Ok(Framed::from_parts(upgraded))
}

/// Send one request and read frames until its terminal result arrives.
/// Used during connection setup, before requests are tracked.
async fn exchange(
	framed: &mut Wire,
	id: MsgId,
	request: Request,
	controls: Vec<Control>,
) -> Result<LdapResult, Error> {
	let kind = request.kind();
	debug!(id, kind, "setup request");
	framed.send(WireRequest { id, op: request.into_tag(), controls }).await?;
	loop {
		let message = framed
			.next()
			.await
			.ok_or(Error::ConnectionClosed)??;
		if message.id != id {
			debug!(id = message.id, "discarding frame during setup");
			continue;
		}
		let Message { op, controls, .. } = message;
		if let ResponseOp::Result(mut result) = op {
			result.controls = controls;
			return Ok(result);
		}
	}
}

#![allow(
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::unwrap_used
)]

use std::{net::SocketAddr, time::Duration};

use ldap_client::{
	config::{Config, ConnectionConfig, QueueConfig, ReconnectConfig, TlsConfig},
	Client, Error, Event, Paged, SearchItem, SearchParams,
};
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

mod common;

use common::{Mode, COMPARE_MATCH, ROOT_DN, ROOT_PW};

const WAIT: Duration = Duration::from_secs(5);

fn config(addr: SocketAddr) -> Config {
	Config {
		url: Url::parse(&format!("ldap://{addr}")).unwrap(),
		socket_path: None,
		connection: ConnectionConfig {
			connect_timeout: Some(Duration::from_secs(5)),
			operation_timeout: None,
			idle_timeout: None,
			reconnect: Some(ReconnectConfig {
				initial_delay: Duration::from_millis(10),
				max_delay: Duration::from_millis(100),
				fail_after: None,
			}),
			tls: TlsConfig::default(),
		},
		queue: QueueConfig::default(),
		bind_dn: None,
		bind_credentials: None,
		strict_dn: false,
	}
}

/// A config whose reconnect delay is long enough that the driver is
/// effectively parked between attempts.
fn slow_retry_config(addr: SocketAddr) -> Config {
	let mut config = config(addr);
	config.connection.reconnect = Some(ReconnectConfig {
		initial_delay: Duration::from_secs(30),
		max_delay: Duration::from_secs(30),
		fail_after: None,
	});
	config
}

fn start(config: Config) -> (Client, mpsc::UnboundedReceiver<Event>) {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_filter).try_init();
	let (client, conn, events) = Client::new(config);
	tokio::spawn(conn.drive());
	(client, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
	timeout(WAIT, events.recv()).await.expect("timed out waiting for an event").unwrap()
}

#[tokio::test]
async fn bind_round_trip() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let result = timeout(WAIT, client.bind(ROOT_DN, ROOT_PW, Vec::new())).await.unwrap();
	assert_eq!(result.unwrap().rc, 0);

	let denied = timeout(WAIT, client.bind(ROOT_DN, "wrong", Vec::new())).await.unwrap();
	assert!(matches!(denied, Err(Error::Result { rc: 49, .. })));
}

#[tokio::test]
async fn search_streams_entries_then_result() {
	let addr = common::spawn(Mode::Directory { entries: 5, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let mut stream = client.search(
		SearchParams { base: "ou=people,dc=example,dc=org".to_owned(), ..Default::default() },
		Vec::new(),
	)
	.unwrap();
	let mut dns = Vec::new();
	while let Some(item) = timeout(WAIT, stream.next()).await.unwrap() {
		if let SearchItem::Entry(entry) = item {
			dns.push(entry.dn);
		}
	}
	assert_eq!(dns.len(), 5);
	assert_eq!(dns[0], "cn=user0,ou=people,dc=example,dc=org");
	assert_eq!(timeout(WAIT, stream.finish()).await.unwrap().unwrap().rc, 0);
}

#[tokio::test]
async fn paged_search_stitches_pages() {
	let addr = common::spawn(Mode::Directory { entries: 1000, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let mut stream = client
		.search_paged(
			SearchParams::default(),
			Paged { page_size: 100, pause: false },
			Vec::new(),
		)
		.unwrap();
	let mut entries = 0;
	let mut pages = 0;
	while let Some(item) = timeout(WAIT, stream.next()).await.unwrap() {
		match item {
			SearchItem::Entry(_) => entries += 1,
			SearchItem::Page(_) => pages += 1,
			SearchItem::Referral(_) => {}
		}
	}
	assert_eq!(entries, 1000);
	assert_eq!(pages, 10);
	assert_eq!(timeout(WAIT, stream.finish()).await.unwrap().unwrap().rc, 0);
}

#[tokio::test]
async fn paused_paged_search_waits_for_resume() {
	let addr = common::spawn(Mode::Directory { entries: 25, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let mut stream = client
		.search_paged(
			SearchParams::default(),
			Paged { page_size: 10, pause: true },
			Vec::new(),
		)
		.unwrap();
	let mut entries = 0;
	while let Some(item) = timeout(WAIT, stream.next()).await.unwrap() {
		match item {
			SearchItem::Entry(_) => entries += 1,
			SearchItem::Page(Some(ctl)) => ctl.resume(),
			SearchItem::Page(None) | SearchItem::Referral(_) => {}
		}
	}
	assert_eq!(entries, 25);
	assert!(timeout(WAIT, stream.finish()).await.unwrap().is_ok());
}

#[tokio::test]
async fn cancelled_paged_search_stops_after_current_page() {
	let addr = common::spawn(Mode::Directory { entries: 25, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let mut stream = client
		.search_paged(
			SearchParams::default(),
			Paged { page_size: 10, pause: true },
			Vec::new(),
		)
		.unwrap();
	let mut entries = 0;
	while let Some(item) = timeout(WAIT, stream.next()).await.unwrap() {
		match item {
			SearchItem::Entry(_) => entries += 1,
			SearchItem::Page(Some(ctl)) => ctl.cancel(),
			SearchItem::Page(None) | SearchItem::Referral(_) => {}
		}
	}
	assert_eq!(entries, 10);
	assert!(timeout(WAIT, stream.finish()).await.unwrap().is_ok());
}

#[tokio::test]
async fn disconnect_fails_every_pending_request_once() {
	let addr = common::spawn(Mode::CloseAfter { requests: 3 }).await;
	let mut config = config(addr);
	config.connection.reconnect = None;
	let (client, mut events) = start(config);

	let streams: Vec<_> = (0..3)
		.map(|_| client.search(SearchParams::default(), Vec::new()).unwrap())
		.collect();
	for stream in streams {
		let outcome = timeout(WAIT, stream.finish()).await.unwrap();
		assert!(matches!(outcome, Err(Error::ConnectionClosed)));
	}
	loop {
		if matches!(next_event(&mut events).await, Event::Closed) {
			break;
		}
	}
}

#[tokio::test]
async fn reconnect_backs_off_and_gives_up() {
	let addr = common::refused_addr().await;
	let mut config = config(addr);
	config.connection.reconnect = Some(ReconnectConfig {
		initial_delay: Duration::from_millis(10),
		max_delay: Duration::from_millis(100),
		fail_after: Some(5),
	});
	let started = std::time::Instant::now();
	let (_client, mut events) = start(config);

	let mut connect_errors = 0;
	loop {
		match next_event(&mut events).await {
			Event::ConnectError(_) => connect_errors += 1,
			Event::Error(_) => break,
			other => panic!("unexpected event {other:?}"),
		}
	}
	assert_eq!(connect_errors, 5);
	// Four backoff sleeps: 10 + 20 + 40 + 80 ms.
	assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn request_timeout_fails_the_request() {
	let addr = common::spawn(Mode::Silent).await;
	let mut config = config(addr);
	config.connection.operation_timeout = Some(Duration::from_millis(50));
	let (client, mut events) = start(config);

	let stream = client.search(SearchParams::default(), Vec::new()).unwrap();
	let outcome = timeout(WAIT, stream.finish()).await.unwrap();
	assert!(matches!(outcome, Err(Error::Timeout)));
	loop {
		if matches!(next_event(&mut events).await, Event::RequestTimeout { .. }) {
			break;
		}
	}
}

#[tokio::test]
async fn idle_connection_is_reported() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let mut config = config(addr);
	config.connection.idle_timeout = Some(Duration::from_millis(50));
	let (_client, mut events) = start(config);

	assert!(matches!(next_event(&mut events).await, Event::Connected));
	assert!(matches!(next_event(&mut events).await, Event::Idle));
}

#[tokio::test]
async fn unbind_parks_the_client_until_reconnected() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	timeout(WAIT, client.bind(ROOT_DN, ROOT_PW, Vec::new())).await.unwrap().unwrap();
	timeout(WAIT, client.unbind()).await.unwrap().unwrap();

	// The client is dormant now: new work queues instead of completing.
	let pending = tokio::spawn({
		let client = client.clone();
		async move { client.delete("cn=user0,dc=example,dc=org", Vec::new()).await }
	});
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!pending.is_finished());

	client.connect().unwrap();
	assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap().unwrap().rc, 0);
}

#[tokio::test]
async fn queued_requests_flush_in_order_after_reconnect() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	timeout(WAIT, client.unbind()).await.unwrap().unwrap();
	let first = tokio::spawn({
		let client = client.clone();
		async move { client.add("cn=a,dc=example,dc=org", Vec::new(), Vec::new()).await }
	});
	let second = tokio::spawn({
		let client = client.clone();
		async move { client.modify("cn=b,dc=example,dc=org", Vec::new(), Vec::new()).await }
	});
	tokio::time::sleep(Duration::from_millis(50)).await;
	client.connect().unwrap();

	assert_eq!(timeout(WAIT, first).await.unwrap().unwrap().unwrap().rc, 0);
	assert_eq!(timeout(WAIT, second).await.unwrap().unwrap().unwrap().rc, 0);
}

#[tokio::test]
async fn queue_timeout_fails_waiting_requests() {
	let addr = common::refused_addr().await;
	let mut config = slow_retry_config(addr);
	config.queue.timeout = Some(Duration::from_millis(50));
	let (client, _events) = start(config);

	let outcome = timeout(WAIT, client.add("cn=a,dc=example,dc=org", Vec::new(), Vec::new()))
		.await
		.unwrap();
	assert!(matches!(outcome, Err(Error::QueueTimeout)));
}

#[tokio::test]
async fn disabled_queue_rejects_offline_requests() {
	let addr = common::refused_addr().await;
	let mut config = slow_retry_config(addr);
	config.queue.disable = true;
	let (client, _events) = start(config);

	// Give the first connection attempt time to fail.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let outcome = timeout(WAIT, client.add("cn=a,dc=example,dc=org", Vec::new(), Vec::new()))
		.await
		.unwrap();
	assert!(matches!(outcome, Err(Error::ConnectionUnavailable)));
}

#[tokio::test]
async fn rejected_request_kicks_a_dormant_connection() {
	let addr = common::refused_addr().await;
	let mut config = config(addr);
	config.queue.size = Some(0);
	config.connection.reconnect = Some(ReconnectConfig {
		initial_delay: Duration::from_millis(10),
		max_delay: Duration::from_millis(10),
		fail_after: Some(1),
	});
	let (client, mut events) = start(config);

	// The single allowed attempt fails and the driver goes dormant.
	loop {
		if matches!(next_event(&mut events).await, Event::Error(_)) {
			break;
		}
	}
	let outcome = timeout(WAIT, client.add("cn=a,dc=example,dc=org", Vec::new(), Vec::new()))
		.await
		.unwrap();
	assert!(matches!(outcome, Err(Error::QueueRejected)));
	// The rejected send must wake the driver into a fresh attempt.
	loop {
		if matches!(next_event(&mut events).await, Event::ConnectError(_)) {
			break;
		}
	}
}

#[tokio::test]
async fn queued_request_can_be_abandoned() {
	let addr = common::refused_addr().await;
	let (client, _events) = start(slow_retry_config(addr));

	let mut stream = client.search(SearchParams::default(), Vec::new()).unwrap();
	let id = timeout(WAIT, stream.id()).await.unwrap().expect("search was never admitted");
	timeout(WAIT, client.abandon(id)).await.unwrap().unwrap();
	let outcome = timeout(WAIT, stream.finish()).await.unwrap();
	assert!(matches!(outcome, Err(Error::Abandoned)));
}

#[tokio::test]
async fn late_response_still_reaches_an_abandoned_search() {
	let addr = common::spawn(Mode::Directory { entries: 3, search_delay_ms: 200 }).await;
	let (client, _events) = start(config(addr));

	let mut stream = client.search(SearchParams::default(), Vec::new()).unwrap();
	let id = timeout(WAIT, stream.id()).await.unwrap().expect("search was never admitted");
	// Abandon while the server is still sitting on the response. The mock
	// ignores the abandon and answers anyway; the late response must reach
	// this stream instead of being treated as unsolicited.
	timeout(WAIT, client.abandon(id)).await.unwrap().unwrap();

	let mut entries = 0;
	while let Some(item) = timeout(WAIT, stream.next()).await.unwrap() {
		if matches!(item, SearchItem::Entry(_)) {
			entries += 1;
		}
	}
	assert_eq!(entries, 3);
	assert_eq!(timeout(WAIT, stream.finish()).await.unwrap().unwrap().rc, 0);
}

#[tokio::test]
async fn compare_maps_result_codes_to_bool() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let (client, _events) = start(config(addr));

	let matched = timeout(
		WAIT,
		client.compare("cn=user0,dc=example,dc=org", "cn", COMPARE_MATCH, Vec::new()),
	)
	.await
	.unwrap()
	.unwrap();
	assert!(matched);

	let mismatched = timeout(
		WAIT,
		client.compare("cn=user0,dc=example,dc=org", "cn", "something-else", Vec::new()),
	)
	.await
	.unwrap()
	.unwrap();
	assert!(!mismatched);
}

#[tokio::test]
async fn destroy_fails_pending_work_and_stops_the_driver() {
	let addr = common::spawn(Mode::Silent).await;
	let (client, _events) = start(config(addr));

	let stream = client.search(SearchParams::default(), Vec::new()).unwrap();
	// Let the request reach the wire before tearing down.
	tokio::time::sleep(Duration::from_millis(50)).await;
	client.destroy().unwrap();
	let outcome = timeout(WAIT, stream.finish()).await.unwrap();
	assert!(matches!(outcome, Err(Error::Destroyed)));

	tokio::time::sleep(Duration::from_millis(50)).await;
	let afterwards = timeout(WAIT, client.bind(ROOT_DN, ROOT_PW, Vec::new())).await.unwrap();
	assert!(matches!(afterwards, Err(Error::Destroyed | Error::ConnectionClosed)));
}

#[tokio::test]
async fn automatic_bind_runs_during_setup() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let mut config = config(addr);
	config.bind_dn = Some(ROOT_DN.to_owned());
	config.bind_credentials = Some(ROOT_PW.to_owned());
	let (_client, mut events) = start(config);

	assert!(matches!(next_event(&mut events).await, Event::Connected));
}

#[tokio::test]
async fn failed_automatic_bind_is_a_setup_error() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let mut config = config(addr);
	config.bind_dn = Some(ROOT_DN.to_owned());
	config.bind_credentials = Some("wrong".to_owned());
	config.connection.reconnect = Some(ReconnectConfig {
		initial_delay: Duration::from_millis(10),
		max_delay: Duration::from_millis(10),
		fail_after: Some(2),
	});
	let (_client, mut events) = start(config);

	let mut setup_errors = 0;
	loop {
		match next_event(&mut events).await {
			Event::SetupError(_) => setup_errors += 1,
			Event::Error(_) => break,
			other => panic!("unexpected event {other:?}"),
		}
	}
	assert_eq!(setup_errors, 2);
}

#[tokio::test]
async fn strict_dn_validation_rejects_bad_input_locally() {
	let addr = common::spawn(Mode::Directory { entries: 0, search_delay_ms: 0 }).await;
	let mut config = config(addr);
	config.strict_dn = true;
	let (client, _events) = start(config);

	let outcome = timeout(WAIT, client.delete("not a dn", Vec::new())).await.unwrap();
	assert!(matches!(outcome, Err(Error::InvalidDn(_))));

	let filter = client.search(
		SearchParams { filter: "(((".to_owned(), ..Default::default() },
		Vec::new(),
	);
	assert!(matches!(filter, Err(Error::InvalidFilter(_))));
}

//! An async LDAP client engine built directly on the wire protocol.
//!
//! The crate speaks LDAP over TCP, TLS or a Unix domain socket and exposes
//! one typed method per protocol operation. A single driver task owns the
//! socket and every piece of connection state; callers hold a
//! cheap-to-clone [`Client`] and talk to the driver over channels. The
//! driver tracks every outstanding request by message id, queues requests
//! issued while the connection is down, reconnects with exponential
//! backoff, and reports its lifecycle on an event stream.
//!
//! Searches stream their entries through a [`SearchStream`]; paged
//! searches (RFC 2696) are stitched into a single stream by a background
//! pager. Requests can be abandoned mid-flight, and a late response that
//! races the abandonment is handled without misdelivering it.
//!
//! # Getting started
//! A minimal example of running the client might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use url::Url;
//! use ldap_client::{
//!     config::{ConnectionConfig, QueueConfig},
//!     Client, Config, SearchItem, SearchParams,
//! };
//!
//! // Configuration can also be deserialized with serde. It's
//! // hand-constructed here for demonstration purposes.
//! let config = Config {
//!     url: Url::parse("ldap://localhost")?,
//!     socket_path: None,
//!     connection: ConnectionConfig::default(),
//!     queue: QueueConfig::default(),
//!     bind_dn: Some("cn=admin,dc=example,dc=com".to_owned()),
//!     bind_credentials: Some("verysecret".to_owned()),
//!     strict_dn: false,
//! };
//!
//! let (client, conn, mut events) = Client::new(config);
//! tokio::spawn(conn.drive());
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("connection event: {event:?}");
//!     }
//! });
//!
//! let mut search = client.search(
//!     SearchParams {
//!         base: "ou=people,dc=example,dc=com".to_owned(),
//!         filter: "(objectClass=inetOrgPerson)".to_owned(),
//!         ..SearchParams::default()
//!     },
//!     Vec::new(),
//! )?;
//! while let Some(item) = search.next().await {
//!     if let SearchItem::Entry(entry) = item {
//!         println!("found {}", entry.dn);
//!     }
//! }
//! search.finish().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
mod codec;
pub mod config;
pub mod conn;
pub mod controls;
pub mod error;
pub mod filter;
pub mod proto;
mod queue;
pub mod search;
mod tracker;

pub use client::Client;
pub use config::Config;
pub use conn::{Connection, Event, SetupConn, SetupHook};
pub use controls::Control;
pub use error::Error;
pub use filter::Filter;
pub use proto::{LdapResult, Mod, MsgId, Scope, SearchEntry, SearchParams};
pub use search::{PageCtl, Paged, SearchItem, SearchStream};

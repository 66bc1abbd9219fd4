//! Configuration for the LDAP client.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Top-level client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap, ldaps, and
	/// ldapi schemes.
	pub url: Url,
	/// Unix domain socket path; takes precedence over the URL when set.
	#[serde(default)]
	pub socket_path: Option<PathBuf>,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Settings for the queue that buffers requests while disconnected.
	#[serde(default)]
	pub queue: QueueConfig,
	/// A DN to bind as automatically on every (re)connect.
	#[serde(default)]
	pub bind_dn: Option<String>,
	/// The password for the automatic bind.
	#[serde(default)]
	pub bind_credentials: Option<String>,
	/// Reject requests whose DN fails syntactic validation instead of
	/// letting the server decide.
	#[serde(default)]
	pub strict_dn: bool,
}

/// Configuration for how to connect to the LDAP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection. `None` leaves it to the
	/// operating system.
	#[serde(default)]
	pub connect_timeout: Option<Duration>,
	/// Client-side timeout per LDAP operation, measured from the moment
	/// the request is written to the socket.
	#[serde(default)]
	pub operation_timeout: Option<Duration>,
	/// Emit an idle notification after this long without traffic.
	#[serde(default)]
	pub idle_timeout: Option<Duration>,
	/// Automatic reconnection. `None` disables it: the client stays down
	/// after a connection loss until told to connect again.
	#[serde(default = "default_reconnect")]
	pub reconnect: Option<ReconnectConfig>,
	/// TLS config.
	#[serde(default)]
	pub tls: TlsConfig,
}

/// The default reconnect configuration, used when the section is omitted
/// entirely.
fn default_reconnect() -> Option<ReconnectConfig> {
	Some(ReconnectConfig::default())
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		ConnectionConfig {
			connect_timeout: None,
			operation_timeout: None,
			idle_timeout: None,
			reconnect: default_reconnect(),
			tls: TlsConfig::default(),
		}
	}
}

/// Exponential backoff settings for automatic reconnection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectConfig {
	/// Delay before the first retry; doubles on every consecutive failure.
	pub initial_delay: Duration,
	/// Upper bound on the delay between retries.
	pub max_delay: Duration,
	/// Give up after this many consecutive failed attempts. `None` retries
	/// forever.
	#[serde(default)]
	pub fail_after: Option<u32>,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		ReconnectConfig {
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(10),
			fail_after: None,
		}
	}
}

/// Settings for the queue that holds requests while no connection is
/// usable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueConfig {
	/// Maximum number of queued requests. `None` means unbounded.
	#[serde(default)]
	pub size: Option<usize>,
	/// Fail queued requests after waiting this long for a connection.
	/// `None` lets them wait indefinitely.
	#[serde(default)]
	pub timeout: Option<Duration>,
	/// Disable queueing entirely; requests issued while disconnected fail
	/// immediately.
	#[serde(default)]
	pub disable: bool,
}

/// TLS configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
	/// Use the StartTLS extended operation for establishing a secure
	/// connection, rather than TLS on a dedicated port.
	#[serde(default)]
	pub starttls: bool,
	/// Disable verification of TLS certificates.
	#[serde(default)]
	pub danger_no_verify: bool,
	/// TLS root certificates path. When unset the platform trust store is
	/// used.
	#[serde(default)]
	pub root_certificates_path: Option<PathBuf>,
	/// Path of the TLS client key (PKCS#8) to use for the connection.
	#[serde(default)]
	pub client_key_path: Option<PathBuf>,
	/// Path of the TLS client certificate to use for the connection.
	#[serde(default)]
	pub client_certificate_path: Option<PathBuf>,
}

/// Where and how the transport connects, resolved from the URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Endpoint {
	/// Plain TCP, optionally upgraded via StartTLS later.
	Plain {
		/// Server host name or address.
		host: String,
		/// Server port.
		port: u16,
	},
	/// TLS from the first byte.
	Tls {
		/// Server host name or address.
		host: String,
		/// Server port.
		port: u16,
	},
	/// A Unix domain socket.
	Unix(PathBuf),
}

impl Config {
	/// Resolve the transport endpoint from `socket_path` and the URL.
	pub(crate) fn endpoint(&self) -> Result<Endpoint, Error> {
		if let Some(path) = &self.socket_path {
			return Ok(Endpoint::Unix(path.clone()));
		}
		match self.url.scheme() {
			"ldap" => Ok(Endpoint::Plain {
				host: self.require_host()?,
				port: self.url.port().unwrap_or(389),
			}),
			"ldaps" => Ok(Endpoint::Tls {
				host: self.require_host()?,
				port: self.url.port().unwrap_or(636),
			}),
			"ldapi" => {
				let host = self.url.host_str().unwrap_or_default();
				if host.is_empty() {
					return Err(Error::Config(
						"ldapi url carries no socket path and no socket_path is set".to_owned(),
					));
				}
				Ok(Endpoint::Unix(PathBuf::from(percent_decode(host))))
			}
			other => Err(Error::Config(format!("unsupported url scheme '{other}'"))),
		}
	}

	/// The host component of the URL, required for TCP transports.
	fn require_host(&self) -> Result<String, Error> {
		self.url
			.host_str()
			.map(ToOwned::to_owned)
			.ok_or_else(|| Error::Config("url has no host".to_owned()))
	}

	/// Returns an example config, for tests.
	#[allow(dead_code)]
	pub(crate) fn example() -> Self {
		Config {
			url: Url::parse("ldap://localhost:3389").unwrap_or_else(|_| unreachable!()),
			socket_path: None,
			connection: ConnectionConfig::default(),
			queue: QueueConfig::default(),
			bind_dn: None,
			bind_credentials: None,
			strict_dn: false,
		}
	}
}

impl TlsConfig {
	/// Build a rustls [`ClientConfig`](rustls::ClientConfig) based on this
	/// [`TlsConfig`].
	pub(crate) async fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, Error> {
		// Trust anchors are never consulted with verification disabled.
		let mut roots = rustls::RootCertStore::empty();
		if !self.danger_no_verify {
			if let Some(path) = &self.root_certificates_path {
				let pem = tokio::fs::read(path).await?;
				let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
				if certs.is_empty() {
					return Err(Error::Config(
						"root certificate file holds no certificates".to_owned(),
					));
				}
				roots.add_parsable_certificates(&certs);
			} else {
				for cert in rustls_native_certs::load_native_certs()? {
					let _ = roots.add(&rustls::Certificate(cert.0));
				}
			}
		}

		let builder = rustls::ClientConfig::builder()
			.with_safe_defaults()
			.with_root_certificates(roots);
		let mut config = match (&self.client_key_path, &self.client_certificate_path) {
			(Some(key_path), Some(cert_path)) => {
				let cert_pem = tokio::fs::read(cert_path).await?;
				let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())?
					.into_iter()
					.map(rustls::Certificate)
					.collect();
				let key_pem = tokio::fs::read(key_path).await?;
				let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())?
					.pop()
					.ok_or_else(|| {
						Error::Config(
							"client key file holds no PKCS#8 private key".to_owned(),
						)
					})?;
				builder
					.with_client_auth_cert(certs, rustls::PrivateKey(key))
					.map_err(|err| Error::Tls(err.to_string()))?
			}
			(None, None) => builder.with_no_client_auth(),
			_ => {
				return Err(Error::Config(
					"both a client certificate and key file in PKCS#8 format must be specified"
						.to_owned(),
				))
			}
		};

		if self.danger_no_verify {
			config.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
		}
		Ok(Arc::new(config))
	}
}

/// A certificate verifier that accepts any peer, for `danger_no_verify`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::Certificate,
		_intermediates: &[rustls::Certificate],
		_server_name: &rustls::ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: std::time::SystemTime,
	) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::ServerCertVerified::assertion())
	}
}

/// Decode the percent-encoded socket path of an ldapi URL.
fn percent_decode(encoded: &str) -> String {
	let bytes = encoded.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut index = 0;
	while index < bytes.len() {
		if bytes[index] == b'%' {
			if let Some(hex) = encoded.get(index + 1..index + 3) {
				if let Ok(byte) = u8::from_str_radix(hex, 16) {
					out.push(byte);
					index += 3;
					continue;
				}
			}
		}
		out.push(bytes[index]);
		index += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

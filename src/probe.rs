use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Url;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::process::Command;
use tokio_rustls::TlsConnector;

use crate::dns::{build_query, parse_probe_output, parse_response, DnsResponse};
use crate::error::BenchError;
use crate::transport::{ProbeOptions, ProbeResult, QueryType, ResolverDescriptor};

/// One resolution attempt against one resolver.
///
/// Implementations never fail: anything that goes wrong is reported as an
/// empty answer set with diagnostics.
#[async_trait]
pub trait ResolverProbe: Send + Sync {
	async fn resolve(
		&self,
		resolver: &ResolverDescriptor,
		domain: &str,
		options: &ProbeOptions,
	) -> ProbeResult;
}

/// Where and how to send a query, derived from a resolver's driver and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	Udp { host: String, port: u16 },
	Tcp { host: String, port: u16 },
	Tls { host: String, port: u16 },
	Https(Url),
}

fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> BenchError {
	BenchError::InvalidEndpoint {
		endpoint: endpoint.to_string(),
		reason: reason.into(),
	}
}

/// Parse an endpoint for the given driver.
///
/// The `dns` driver takes `udp://`, `tcp://`, `tcp-tls://` or `tls://` URLs
/// (a bare host means UDP). Ports default to 53, or 853 for TLS. The DoH
/// drivers take an `https://` URL.
pub fn parse_endpoint(driver: &str, endpoint: &str) -> Result<Endpoint, BenchError> {
	match driver {
		"dns" => {
			let with_scheme = if endpoint.contains("://") {
				endpoint.to_string()
			} else {
				format!("udp://{}", endpoint)
			};
			let url = Url::parse(&with_scheme)
				.map_err(|e| invalid_endpoint(endpoint, e.to_string()))?;
			let host = url.host_str()
				.ok_or_else(|| invalid_endpoint(endpoint, "missing host"))?
				.trim_start_matches('[')
				.trim_end_matches(']')
				.to_string();
			match url.scheme() {
				"udp" => Ok(Endpoint::Udp { host, port: url.port().unwrap_or(53) }),
				"tcp" => Ok(Endpoint::Tcp { host, port: url.port().unwrap_or(53) }),
				"tcp-tls" | "tls" => Ok(Endpoint::Tls { host, port: url.port().unwrap_or(853) }),
				other => Err(invalid_endpoint(endpoint, format!("unknown scheme '{}'", other))),
			}
		}
		"rfc8484" | "doh" | "https" => {
			let url = Url::parse(endpoint)
				.map_err(|e| invalid_endpoint(endpoint, e.to_string()))?;
			match url.scheme() {
				"https" | "http" => Ok(Endpoint::Https(url)),
				other => Err(invalid_endpoint(endpoint, format!("unknown scheme '{}'", other))),
			}
		}
		other => Err(BenchError::UnsupportedDriver(other.to_string())),
	}
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
	tokio::net::lookup_host((host, port)).await?
		.next()
		.ok_or_else(|| anyhow!("no address found for '{}'", host))
}

/// Send a single DNS query over UDP.
///
/// Binds a dedicated socket per query so concurrent probes never read each
/// other's responses.
async fn exchange_udp(addr: SocketAddr, query: &[u8], txid: u16) -> Result<DnsResponse> {
	let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
	let socket = UdpSocket::bind(bind_addr).await?;
	socket.send_to(query, addr).await?;

	// Use 4096-byte buffer to handle EDNS-extended responses
	let mut buf = vec![0u8; 4096];
	let max_retries = 3;
	let mut last_err = anyhow!("no response from {}", addr);
	for _ in 0..max_retries {
		let (len, _src) = socket.recv_from(&mut buf).await?;
		match parse_response(&buf[..len], txid) {
			Ok(response) => return Ok(response),
			// txid mismatch or parse error, retry recv
			Err(e) => last_err = e,
		}
	}
	Err(last_err)
}

/// Send a length-prefixed DNS query over a stream (TCP or TLS).
async fn exchange_stream<S>(mut stream: S, query: &[u8], txid: u16) -> Result<DnsResponse>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let len = u16::try_from(query.len())
		.map_err(|_| anyhow!("query too large: {} bytes", query.len()))?;
	let mut framed = Vec::with_capacity(query.len() + 2);
	framed.extend_from_slice(&len.to_be_bytes());
	framed.extend_from_slice(query);
	stream.write_all(&framed).await?;
	stream.flush().await?;

	let resp_len = stream.read_u16().await? as usize;
	let mut buf = vec![0u8; resp_len];
	stream.read_exact(&mut buf).await?;
	parse_response(&buf, txid)
}

/// Certificate verifier for `-insecure` probing: accepts any server
/// certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message, cert, dss, &self.0.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message, cert, dss, &self.0.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

fn tls_configs() -> Result<(Arc<ClientConfig>, Arc<ClientConfig>)> {
	let provider = Arc::new(rustls::crypto::ring::default_provider());

	let roots = RootCertStore {
		roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
	};
	let verified = ClientConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()?
		.with_root_certificates(roots)
		.with_no_client_auth();

	let insecure = ClientConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()?
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
		.with_no_client_auth();

	Ok((Arc::new(verified), Arc::new(insecure)))
}

fn http_client(timeout: Duration, insecure: bool) -> Result<reqwest::Client> {
	let client = reqwest::Client::builder()
		.use_rustls_tls()
		.timeout(timeout)
		.danger_accept_invalid_certs(insecure)
		.build()?;
	Ok(client)
}

/// In-process probe adapter speaking plain DNS (UDP, TCP, TLS) and RFC 8484 DoH.
pub struct NativeProbe {
	timeout: Duration,
	query_types: Vec<QueryType>,
	tls: Arc<ClientConfig>,
	tls_insecure: Arc<ClientConfig>,
	http: reqwest::Client,
	http_insecure: reqwest::Client,
}

impl NativeProbe {
	pub fn new(timeout: Duration, query_aaaa: bool) -> Result<Self> {
		let query_types = if query_aaaa {
			vec![QueryType::A, QueryType::AAAA]
		} else {
			vec![QueryType::A]
		};
		let (tls, tls_insecure) = tls_configs()?;
		Ok(NativeProbe {
			timeout,
			query_types,
			tls,
			tls_insecure,
			http: http_client(timeout, false)?,
			http_insecure: http_client(timeout, true)?,
		})
	}

	async fn exchange(
		&self,
		endpoint: &Endpoint,
		query: &[u8],
		txid: u16,
		insecure: bool,
	) -> Result<DnsResponse> {
		match endpoint {
			Endpoint::Udp { host, port } => {
				let addr = resolve_addr(host, *port).await?;
				exchange_udp(addr, query, txid).await
			}
			Endpoint::Tcp { host, port } => {
				let addr = resolve_addr(host, *port).await?;
				let stream = TcpStream::connect(addr).await?;
				exchange_stream(stream, query, txid).await
			}
			Endpoint::Tls { host, port } => {
				let addr = resolve_addr(host, *port).await?;
				let config = if insecure { &self.tls_insecure } else { &self.tls };
				let server_name = ServerName::try_from(host.clone())
					.map_err(|e| anyhow!("invalid TLS server name '{}': {}", host, e))?;
				let tcp = TcpStream::connect(addr).await?;
				let stream = TlsConnector::from(config.clone())
					.connect(server_name, tcp)
					.await?;
				exchange_stream(stream, query, txid).await
			}
			Endpoint::Https(url) => {
				let client = if insecure { &self.http_insecure } else { &self.http };
				let response = client.post(url.clone())
					.header("Accept", "application/dns-message")
					.header("Content-Type", "application/dns-message")
					.body(query.to_vec())
					.send()
					.await?
					.error_for_status()?;
				let body = response.bytes().await?;
				parse_response(&body, txid)
			}
		}
	}
}

#[async_trait]
impl ResolverProbe for NativeProbe {
	async fn resolve(
		&self,
		resolver: &ResolverDescriptor,
		domain: &str,
		options: &ProbeOptions,
	) -> ProbeResult {
		let endpoint = match parse_endpoint(&resolver.driver, &resolver.endpoint) {
			Ok(e) => e,
			Err(e @ BenchError::UnsupportedDriver(_)) => {
				return ProbeResult::failed(format!(
					"{}: {}, run with --doh-binary to use an external client",
					resolver, e,
				));
			}
			Err(e) => return ProbeResult::failed(format!("{}: {}", resolver, e)),
		};

		let mut answers = BTreeSet::new();
		let mut diagnostics = Vec::new();
		let mut query_duration_ms = None;

		for &query_type in &self.query_types {
			// DoH servers cache on the message bytes, RFC 8484 asks for id 0
			let txid: u16 = match endpoint {
				Endpoint::Https(_) => 0,
				_ => rand::random(),
			};
			let query = match build_query(domain, query_type, txid, options.subnet.as_ref()) {
				Ok(q) => q,
				Err(e) => {
					diagnostics.push(e.to_string());
					continue;
				}
			};

			let start = Instant::now();
			let exchange = self.exchange(&endpoint, &query, txid, options.insecure);
			match tokio::time::timeout(self.timeout, exchange).await {
				Ok(Ok(response)) => {
					if query_duration_ms.is_none() {
						query_duration_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
					}
					if response.addresses.is_empty() {
						diagnostics.push(format!(
							"{} {:?}: no address in answer ({})",
							resolver, query_type, response.rcode_str,
						));
					}
					answers.extend(response.addresses);
				}
				Ok(Err(e)) => diagnostics.push(format!("{} {:?}: {}", resolver, query_type, e)),
				Err(_) => diagnostics.push(format!(
					"{} {:?}: timed out after {} ms",
					resolver, query_type, self.timeout.as_millis(),
				)),
			}
		}

		ProbeResult {
			answers,
			diagnostics,
			query_duration_ms: if options.verbose { query_duration_ms } else { None },
		}
	}
}

/// Probe adapter that runs an external `doh`-style query binary.
///
/// Invoked as `<bin> [-short] -driver <driver> -s <endpoint> [-subnet <net>]
/// [-insecure] <domain>`; stdout is parsed line by line.
pub struct ExecProbe {
	binary: PathBuf,
	timeout: Duration,
}

impl ExecProbe {
	pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
		ExecProbe { binary: binary.into(), timeout }
	}

	fn command_args(
		resolver: &ResolverDescriptor,
		domain: &str,
		options: &ProbeOptions,
	) -> Vec<String> {
		let mut args = Vec::new();
		if options.short {
			args.push("-short".to_string());
		}
		args.push("-driver".to_string());
		args.push(resolver.driver.clone());
		args.push("-s".to_string());
		args.push(resolver.endpoint.clone());
		if let Some(subnet) = &options.subnet {
			args.push("-subnet".to_string());
			args.push(subnet.to_string());
		}
		if options.insecure {
			args.push("-insecure".to_string());
		}
		args.push(domain.to_string());
		args
	}
}

#[async_trait]
impl ResolverProbe for ExecProbe {
	async fn resolve(
		&self,
		resolver: &ResolverDescriptor,
		domain: &str,
		options: &ProbeOptions,
	) -> ProbeResult {
		let mut cmd = Command::new(&self.binary);
		cmd.args(Self::command_args(resolver, domain, options))
			.kill_on_drop(true);

		let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
			Ok(Ok(output)) => output,
			Ok(Err(e)) => {
				return ProbeResult::failed(format!(
					"failed to run {}: {}", self.binary.display(), e,
				));
			}
			Err(_) => {
				return ProbeResult::failed(format!(
					"{} {}: timed out after {} ms",
					resolver, domain, self.timeout.as_millis(),
				));
			}
		};

		let stdout = String::from_utf8_lossy(&output.stdout);
		let stderr = String::from_utf8_lossy(&output.stderr);
		let mut result = parse_probe_output(&stdout, &stderr);
		if !output.status.success() {
			result.answers.clear();
			result.query_duration_ms = None;
			result.diagnostics.push(format!("{} {}: {}", resolver, domain, output.status));
		}
		if !options.verbose {
			result.query_duration_ms = None;
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolver::parse_resolver;

	#[test]
	fn test_parse_dns_endpoints() {
		assert_eq!(
			parse_endpoint("dns", "udp://114.114.114.114").unwrap(),
			Endpoint::Udp { host: "114.114.114.114".to_string(), port: 53 },
		);
		assert_eq!(
			parse_endpoint("dns", "tcp://1.1.1.1:5353").unwrap(),
			Endpoint::Tcp { host: "1.1.1.1".to_string(), port: 5353 },
		);
		assert_eq!(
			parse_endpoint("dns", "tcp-tls://dns.google").unwrap(),
			Endpoint::Tls { host: "dns.google".to_string(), port: 853 },
		);
		assert_eq!(
			parse_endpoint("dns", "8.8.8.8").unwrap(),
			Endpoint::Udp { host: "8.8.8.8".to_string(), port: 53 },
		);
	}

	#[test]
	fn test_parse_doh_endpoint() {
		match parse_endpoint("rfc8484", "https://dns.google/dns-query").unwrap() {
			Endpoint::Https(url) => assert_eq!(url.path(), "/dns-query"),
			other => panic!("unexpected endpoint {:?}", other),
		}
	}

	#[test]
	fn test_parse_endpoint_errors() {
		assert!(matches!(
			parse_endpoint("google", "https://dns.google/resolve"),
			Err(BenchError::UnsupportedDriver(_)),
		));
		assert!(matches!(
			parse_endpoint("dns", "ftp://8.8.8.8"),
			Err(BenchError::InvalidEndpoint { .. }),
		));
		assert!(parse_endpoint("rfc8484", "udp://8.8.8.8").is_err());
	}

	#[test]
	fn test_exec_args() {
		let resolver = parse_resolver("Google,tls,tcp-tls://dns.google").unwrap();
		let options = ProbeOptions::short(true)
			.with_subnet("101.80.0.0/16".parse().unwrap());
		let args = ExecProbe::command_args(&resolver, "www.taobao.com", &options);
		assert_eq!(args, vec![
			"-short", "-driver", "dns", "-s", "tcp-tls://dns.google",
			"-subnet", "101.80.0.0/16", "-insecure", "www.taobao.com",
		]);

		let timed = ExecProbe::command_args(&resolver, "www.baidu.com", &ProbeOptions::timed(false));
		assert_eq!(timed, vec!["-driver", "dns", "-s", "tcp-tls://dns.google", "www.baidu.com"]);
	}

	#[tokio::test]
	async fn test_native_unsupported_driver_is_empty() {
		let probe = NativeProbe::new(Duration::from_millis(100), false).unwrap();
		let resolver = parse_resolver("Google,google,https://dns.google/resolve").unwrap();
		let result = probe.resolve(&resolver, "www.baidu.com", &ProbeOptions::short(false)).await;
		assert!(result.answers.is_empty());
		assert_eq!(result.diagnostics.len(), 1);
		assert!(result.diagnostics[0].contains("unsupported driver 'google'"));
		assert!(result.diagnostics[0].contains("--doh-binary"));
	}

	#[tokio::test]
	async fn test_exec_missing_binary_is_empty() {
		let probe = ExecProbe::new("/nonexistent/doh-probe", Duration::from_millis(500));
		let resolver = parse_resolver("114DNS,udp,udp://114.114.114.114").unwrap();
		let result = probe.resolve(&resolver, "www.baidu.com", &ProbeOptions::timed(false)).await;
		assert!(result.answers.is_empty());
		assert!(result.query_duration_ms.is_none());
		assert!(!result.diagnostics.is_empty());
	}
}

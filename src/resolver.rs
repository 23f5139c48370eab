use std::collections::HashSet;

use anyhow::{anyhow, Result};

use crate::error::BenchError;
use crate::transport::ResolverDescriptor;

/// Map a configured protocol to the probe adapter driver.
///
/// Plain DNS over any transport shares one driver; the transport itself is
/// carried by the endpoint scheme. Everything else names its own driver.
pub fn driver_for_protocol(protocol: &str) -> String {
	match protocol {
		"udp" | "tcp" | "tls" => "dns".to_string(),
		other => other.to_string(),
	}
}

fn descriptor(name: &str, protocol: &str, endpoint: &str) -> ResolverDescriptor {
	ResolverDescriptor {
		name: name.to_string(),
		protocol: protocol.to_string(),
		driver: driver_for_protocol(protocol),
		endpoint: endpoint.to_string(),
	}
}

/// Parse a single `name,protocol,endpoint` entry.
pub fn parse_resolver(input: &str) -> Result<ResolverDescriptor, BenchError> {
	let fields: Vec<&str> = input.split(',').map(str::trim).collect();
	match fields.as_slice() {
		[name, protocol, endpoint]
			if !name.is_empty() && !protocol.is_empty() && !endpoint.is_empty() =>
		{
			Ok(descriptor(name, protocol, endpoint))
		}
		_ => Err(BenchError::InvalidResolver(input.trim().to_string())),
	}
}

/// Reject lists where two rows share a name and protocol.
///
/// Scores are keyed by that pair, so a second endpoint would silently share
/// the first one's results.
pub fn ensure_unique(resolvers: &[ResolverDescriptor]) -> Result<(), BenchError> {
	let mut seen = HashSet::new();
	for resolver in resolvers {
		if !seen.insert(resolver) {
			return Err(BenchError::DuplicateResolver(resolver.to_string()));
		}
	}
	Ok(())
}

/// Read resolvers from CSV data with rows of `name,protocol,endpoint`.
///
/// There is no header row. Blank lines and lines starting with '#' are
/// skipped.
pub fn read_resolvers<R: std::io::Read>(input: R) -> Result<Vec<ResolverDescriptor>> {
	let mut reader = csv::ReaderBuilder::new()
		.has_headers(false)
		.comment(Some(b'#'))
		.flexible(true)
		.trim(csv::Trim::All)
		.from_reader(input);

	let mut resolvers = Vec::new();
	for (i, record) in reader.records().enumerate() {
		let record = record.map_err(|e| anyhow!("resolver list row {}: {}", i + 1, e))?;
		if record.iter().all(str::is_empty) {
			continue;
		}
		let line = record.iter().collect::<Vec<_>>().join(",");
		resolvers.push(parse_resolver(&line)?);
	}
	ensure_unique(&resolvers)?;
	Ok(resolvers)
}

/// Read resolvers from a CSV file.
pub fn read_resolver_file(path: &str) -> Result<Vec<ResolverDescriptor>> {
	let file = std::fs::File::open(path)
		.map_err(|e| anyhow!("failed to read resolver file '{}': {}", path, e))?;
	read_resolvers(file)
}

/// Return a list of well-known public resolvers over every supported transport.
pub fn default_resolvers() -> Vec<ResolverDescriptor> {
	vec![
		descriptor("114DNS", "udp", "udp://114.114.114.114"),
		descriptor("AliDNS", "udp", "udp://223.5.5.5"),
		descriptor("AliDNS", "tls", "tcp-tls://dns.alidns.com"),
		descriptor("AliDNS", "rfc8484", "https://dns.alidns.com/dns-query"),
		descriptor("Cloudflare", "udp", "udp://1.1.1.1"),
		descriptor("Cloudflare", "tcp", "tcp://1.1.1.1"),
		descriptor("Cloudflare", "tls", "tcp-tls://one.one.one.one"),
		descriptor("Cloudflare", "rfc8484", "https://cloudflare-dns.com/dns-query"),
		descriptor("Google", "udp", "udp://8.8.8.8"),
		descriptor("Google", "tls", "tcp-tls://dns.google"),
		descriptor("Google", "rfc8484", "https://dns.google/dns-query"),
		descriptor("Quad9", "udp", "udp://9.9.9.9"),
		descriptor("Quad9", "rfc8484", "https://dns.quad9.net/dns-query"),
	]
}

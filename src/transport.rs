use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ip_network::IpNetwork;

use crate::error::BenchError;

/// A resolver under test, as loaded from configuration.
///
/// Identity is `(name, protocol)`: two descriptors with the same name and
/// protocol are the same resolver even if their endpoints differ.
#[derive(Debug, Clone)]
pub struct ResolverDescriptor {
	pub name: String,
	pub protocol: String,
	/// Driver handed to the probe adapter (`udp|tcp|tls` collapse to `dns`)
	pub driver: String,
	pub endpoint: String,
}

impl PartialEq for ResolverDescriptor {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.protocol == other.protocol
	}
}

impl Eq for ResolverDescriptor {}

impl Hash for ResolverDescriptor {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.name.hash(state);
		self.protocol.hash(state);
	}
}

impl fmt::Display for ResolverDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.name, self.protocol)
	}
}

/// DNS query type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
	A,
	AAAA,
}

/// An EDNS client-subnet hint, e.g. `101.80.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
	pub addr: IpAddr,
	pub prefix: u8,
}

impl FromStr for Subnet {
	type Err = BenchError;

	/// Accepts `addr` or `addr/prefix`. A bare address gets the full
	/// address length as its prefix.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || BenchError::InvalidSubnet(s.to_string());
		let (addr_part, prefix_part) = match s.trim().split_once('/') {
			Some((a, p)) => (a, Some(p)),
			None => (s.trim(), None),
		};
		let addr: IpAddr = addr_part.parse().map_err(|_| invalid())?;
		let max = if addr.is_ipv4() { 32 } else { 128 };
		let prefix = match prefix_part {
			Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
			None => max,
		};
		if prefix > max {
			return Err(invalid());
		}
		Ok(Subnet { addr, prefix })
	}
}

impl fmt::Display for Subnet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.addr, self.prefix)
	}
}

/// Modifiers for a single probe adapter call.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
	pub subnet: Option<Subnet>,
	pub insecure: bool,
	/// Answer lines only, no telemetry
	pub short: bool,
	/// Report the query duration
	pub verbose: bool,
}

impl ProbeOptions {
	/// Short output, used by every detector that only needs answers.
	pub fn short(insecure: bool) -> Self {
		ProbeOptions { subnet: None, insecure, short: true, verbose: false }
	}

	/// Verbose output with query time telemetry.
	pub fn timed(insecure: bool) -> Self {
		ProbeOptions { subnet: None, insecure, short: false, verbose: true }
	}

	pub fn with_subnet(mut self, subnet: Subnet) -> Self {
		self.subnet = Some(subnet);
		self
	}
}

/// Result of one probe adapter call.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
	pub answers: BTreeSet<IpAddr>,
	pub diagnostics: Vec<String>,
	pub query_duration_ms: Option<f64>,
}

impl ProbeResult {
	/// An empty result carrying a single diagnostic.
	pub fn failed(message: impl Into<String>) -> Self {
		ProbeResult {
			answers: BTreeSet::new(),
			diagnostics: vec![message.into()],
			query_duration_ms: None,
		}
	}
}

/// Final per-resolver measurement
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
	NotAvailable,
	Measured {
		latency_ms: f64,
		poisoned: bool,
		ecs_supported: bool,
		/// One entry per benchmark domain; `None` when that domain failed to score
		accuracy_per_domain: Vec<Option<f64>>,
		accuracy_total: f64,
	},
}

/// One output row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverReport {
	pub name: String,
	pub protocol: String,
	pub status: ReportStatus,
}

impl ResolverReport {
	pub fn not_available(resolver: &ResolverDescriptor) -> Self {
		ResolverReport {
			name: resolver.name.clone(),
			protocol: resolver.protocol.clone(),
			status: ReportStatus::NotAvailable,
		}
	}
}

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
	/// Worker pool size for every phase
	pub max_inflight: usize,
	pub timeout: Duration,
	pub insecure: bool,
	pub query_aaaa: bool,
	pub seed: Option<u64>,
	pub filter_repeats: usize,
	pub latency_samples: usize,
	pub poison_repeats: usize,
	pub ecs_repeats: usize,
	pub accuracy_repeats: usize,
	pub reference_domain: String,
	pub canary_domain: String,
	pub canary_block: IpNetwork,
	pub subnet_domain: String,
	pub subnet_a: Subnet,
	pub subnet_b: Subnet,
	pub accuracy_domains: Vec<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn descriptor(name: &str, protocol: &str, endpoint: &str) -> ResolverDescriptor {
		ResolverDescriptor {
			name: name.to_string(),
			protocol: protocol.to_string(),
			driver: "dns".to_string(),
			endpoint: endpoint.to_string(),
		}
	}

	#[test]
	fn test_identity_ignores_endpoint() {
		let a = descriptor("114", "udp", "udp://114.114.114.114");
		let b = descriptor("114", "udp", "udp://114.114.115.115");
		let c = descriptor("114", "tcp", "tcp://114.114.114.114");
		let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
		assert_eq!(set.len(), 2);
		assert!(set.contains(&a));
	}

	#[test]
	fn test_subnet_bare_ipv4() {
		let s: Subnet = "101.80.0.0".parse().unwrap();
		assert_eq!(s.prefix, 32);
		assert_eq!(s.to_string(), "101.80.0.0/32");
	}

	#[test]
	fn test_subnet_with_prefix() {
		let s: Subnet = "52.88.0.0/13".parse().unwrap();
		assert_eq!(s.prefix, 13);
		let v6: Subnet = "2001:db8::/48".parse().unwrap();
		assert_eq!(v6.prefix, 48);
	}

	#[test]
	fn test_subnet_invalid() {
		assert!("52.88.0.0/33".parse::<Subnet>().is_err());
		assert!("not-a-net".parse::<Subnet>().is_err());
		assert!("1.2.3.4/x".parse::<Subnet>().is_err());
	}
}

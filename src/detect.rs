//! Per-resolver measurements built on top of the probe adapter.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ip_network::IpNetwork;
use tracing::warn;

use crate::probe::ResolverProbe;
use crate::stats::mean;
use crate::transport::{ProbeOptions, ResolverDescriptor, Subnet};

/// Query `domain` `repeats` times and return the union of all answers.
///
/// Failed attempts just contribute nothing; their diagnostics are logged.
pub async fn repeat_ips(
	probe: &dyn ResolverProbe,
	resolver: &ResolverDescriptor,
	domain: &str,
	options: &ProbeOptions,
	repeats: usize,
) -> BTreeSet<IpAddr> {
	let mut answers = BTreeSet::new();
	for _ in 0..repeats {
		let result = probe.resolve(resolver, domain, options).await;
		for message in &result.diagnostics {
			warn!(resolver = %resolver, domain, "{}", message);
		}
		answers.extend(result.answers);
	}
	answers
}

/// A resolver is available when it answers the reference domain at all.
pub async fn check_available(
	probe: &dyn ResolverProbe,
	resolver: &ResolverDescriptor,
	domain: &str,
	repeats: usize,
	insecure: bool,
) -> bool {
	let options = ProbeOptions::short(insecure);
	!repeat_ips(probe, resolver, domain, &options, repeats).await.is_empty()
}

/// Mean reported query time over `samples` timed queries.
///
/// Queries that report no time are skipped; `None` when none did.
pub async fn measure_latency(
	probe: &dyn ResolverProbe,
	resolver: &ResolverDescriptor,
	domain: &str,
	samples: usize,
	insecure: bool,
) -> Option<f64> {
	let options = ProbeOptions::timed(insecure);
	let mut durations = Vec::with_capacity(samples);
	for _ in 0..samples {
		let result = probe.resolve(resolver, domain, &options).await;
		for message in &result.diagnostics {
			warn!(resolver = %resolver, domain, "{}", message);
		}
		if let Some(ms) = result.query_duration_ms {
			durations.push(ms);
		}
	}
	mean(&durations)
}

/// True when some answer lies outside the known-good block.
///
/// Addresses of the other IP family cannot be judged against the block and
/// are ignored. No answers at all is not poisoning.
pub fn is_poisoned(answers: &BTreeSet<IpAddr>, block: &IpNetwork) -> bool {
	answers.iter()
		.filter(|ip| ip.is_ipv4() == matches!(block, IpNetwork::V4(_)))
		.any(|ip| !block.contains(*ip))
}

pub async fn check_poisoned(
	probe: &dyn ResolverProbe,
	resolver: &ResolverDescriptor,
	canary_domain: &str,
	canary_block: &IpNetwork,
	repeats: usize,
	insecure: bool,
) -> bool {
	let options = ProbeOptions::short(insecure);
	let answers = repeat_ips(probe, resolver, canary_domain, &options, repeats).await;
	is_poisoned(&answers, canary_block)
}

/// Both batches answered and share no address.
pub fn differs_by_subnet(a: &BTreeSet<IpAddr>, b: &BTreeSet<IpAddr>) -> bool {
	!a.is_empty() && !b.is_empty() && a.is_disjoint(b)
}

/// Whether the resolver honors EDNS client-subnet hints.
pub async fn check_subnet_hint(
	probe: &dyn ResolverProbe,
	resolver: &ResolverDescriptor,
	domain: &str,
	hints: (Subnet, Subnet),
	repeats: usize,
	insecure: bool,
) -> bool {
	let options_a = ProbeOptions::short(insecure).with_subnet(hints.0);
	let options_b = ProbeOptions::short(insecure).with_subnet(hints.1);
	let a = repeat_ips(probe, resolver, domain, &options_a, repeats).await;
	let b = repeat_ips(probe, resolver, domain, &options_b, repeats).await;
	differs_by_subnet(&a, &b)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::ProbeResult;
	use async_trait::async_trait;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// Answers per `(domain, subnet)` with optional query time.
	struct StubProbe {
		answers: HashMap<(String, Option<Subnet>), Vec<&'static str>>,
		duration_ms: Option<f64>,
		calls: AtomicUsize,
	}

	impl StubProbe {
		fn new(duration_ms: Option<f64>) -> Self {
			StubProbe { answers: HashMap::new(), duration_ms, calls: AtomicUsize::new(0) }
		}

		fn answer(mut self, domain: &str, subnet: Option<Subnet>, ips: Vec<&'static str>) -> Self {
			self.answers.insert((domain.to_string(), subnet), ips);
			self
		}
	}

	#[async_trait]
	impl ResolverProbe for StubProbe {
		async fn resolve(
			&self,
			_resolver: &ResolverDescriptor,
			domain: &str,
			options: &ProbeOptions,
		) -> ProbeResult {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let answers = self.answers.get(&(domain.to_string(), options.subnet))
				.map(|ips| ips.iter().map(|ip| ip.parse().unwrap()).collect())
				.unwrap_or_default();
			ProbeResult {
				answers,
				diagnostics: Vec::new(),
				query_duration_ms: if options.verbose { self.duration_ms } else { None },
			}
		}
	}

	fn resolver() -> ResolverDescriptor {
		crate::resolver::parse_resolver("Stub,udp,udp://127.0.0.1").unwrap()
	}

	fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
		list.iter().map(|ip| ip.parse().unwrap()).collect()
	}

	fn hints() -> (Subnet, Subnet) {
		("101.80.0.0/16".parse().unwrap(), "52.88.0.0/16".parse().unwrap())
	}

	#[test]
	fn test_poisoning_examples() {
		let block: IpNetwork = "104.244.40.0/21".parse().unwrap();
		assert!(!is_poisoned(&ips(&["104.244.41.5"]), &block));
		assert!(is_poisoned(&ips(&["8.8.8.8"]), &block));
		assert!(is_poisoned(&ips(&["104.244.41.5", "8.8.8.8"]), &block));
		assert!(!is_poisoned(&ips(&[]), &block));
		assert!(!is_poisoned(&ips(&["2606:4700::1"]), &block));
	}

	#[test]
	fn test_subnet_examples() {
		assert!(!differs_by_subnet(&ips(&["1.2.3.4"]), &ips(&["1.2.3.4"])));
		assert!(differs_by_subnet(&ips(&["1.2.3.4"]), &ips(&["5.6.7.8"])));
		assert!(!differs_by_subnet(&ips(&["1.2.3.4"]), &ips(&[])));
		assert!(!differs_by_subnet(&ips(&["1.2.3.4", "5.6.7.8"]), &ips(&["5.6.7.8"])));
	}

	#[tokio::test]
	async fn test_check_poisoned_with_stub() {
		let block: IpNetwork = "104.244.40.0/21".parse().unwrap();
		let clean = StubProbe::new(None).answer("www.twitter.com", None, vec!["104.244.41.5"]);
		let dirty = StubProbe::new(None).answer("www.twitter.com", None, vec!["8.8.8.8"]);
		assert!(!check_poisoned(&clean, &resolver(), "www.twitter.com", &block, 2, false).await);
		assert!(check_poisoned(&dirty, &resolver(), "www.twitter.com", &block, 2, false).await);
	}

	#[tokio::test]
	async fn test_check_subnet_hint_with_stub() {
		let (a, b) = hints();
		let same = StubProbe::new(None)
			.answer("www.taobao.com", Some(a), vec!["1.2.3.4"])
			.answer("www.taobao.com", Some(b), vec!["1.2.3.4"]);
		let split = StubProbe::new(None)
			.answer("www.taobao.com", Some(a), vec!["1.2.3.4"])
			.answer("www.taobao.com", Some(b), vec!["5.6.7.8"]);
		let one_sided = StubProbe::new(None)
			.answer("www.taobao.com", Some(a), vec!["1.2.3.4"]);

		let r = resolver();
		assert!(!check_subnet_hint(&same, &r, "www.taobao.com", hints(), 3, false).await);
		assert!(check_subnet_hint(&split, &r, "www.taobao.com", hints(), 3, false).await);
		assert!(!check_subnet_hint(&one_sided, &r, "www.taobao.com", hints(), 3, false).await);
		assert_eq!(split.calls.load(Ordering::SeqCst), 6);
	}

	#[tokio::test]
	async fn test_measure_latency() {
		let timed = StubProbe::new(Some(12.0));
		let silent = StubProbe::new(None);
		let r = resolver();
		assert_eq!(measure_latency(&timed, &r, "www.baidu.com", 5, false).await, Some(12.0));
		assert_eq!(timed.calls.load(Ordering::SeqCst), 5);
		assert_eq!(measure_latency(&silent, &r, "www.baidu.com", 5, false).await, None);
	}

	#[tokio::test]
	async fn test_check_available() {
		let up = StubProbe::new(None).answer("www.baidu.com", None, vec!["110.242.68.3"]);
		let down = StubProbe::new(None);
		let r = resolver();
		assert!(check_available(&up, &r, "www.baidu.com", 2, false).await);
		assert!(!check_available(&down, &r, "www.baidu.com", 2, false).await);
		assert_eq!(down.calls.load(Ordering::SeqCst), 2);
	}
}

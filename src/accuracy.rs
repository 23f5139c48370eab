//! Cross-resolver ground truth: how close each resolver's answers are to the
//! best answer any resolver gave for the same domain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::detect::repeat_ips;
use crate::error::BenchError;
use crate::probe::ResolverProbe;
use crate::rtt::{RttCache, RTT_FAILURE_MS};
use crate::stats::{mean, normalize_to_min};
use crate::transport::{ProbeOptions, ResolverDescriptor};

/// Scores of every surviving resolver for one domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainColumn {
	/// Resolver latency divided by the best latency seen for the domain
	Scored(HashMap<ResolverDescriptor, f64>),
	Failed(BenchError),
}

/// Domain → column map shared by the scoring tasks.
///
/// Columns are inserted whole and never replaced.
#[derive(Debug, Default)]
pub struct AccuracyTable {
	columns: RwLock<HashMap<String, Arc<DomainColumn>>>,
}

impl AccuracyTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a complete column. Returns false, leaving the existing column
	/// untouched, if the domain was already scored.
	pub fn insert(&self, domain: &str, column: DomainColumn) -> bool {
		let mut columns = self.columns.write().unwrap_or_else(|e| e.into_inner());
		if columns.contains_key(domain) {
			return false;
		}
		columns.insert(domain.to_string(), Arc::new(column));
		true
	}

	pub fn column(&self, domain: &str) -> Option<Arc<DomainColumn>> {
		self.columns.read().unwrap_or_else(|e| e.into_inner()).get(domain).cloned()
	}

	/// Score of one resolver for one domain, if that column was scored.
	pub fn score(&self, domain: &str, resolver: &ResolverDescriptor) -> Option<f64> {
		match self.column(domain)?.as_ref() {
			DomainColumn::Scored(scores) => scores.get(resolver).copied(),
			DomainColumn::Failed(_) => None,
		}
	}

	/// True once every domain has a column, scored or failed.
	pub fn is_complete(&self, domains: &[String]) -> bool {
		let columns = self.columns.read().unwrap_or_else(|e| e.into_inner());
		domains.iter().all(|d| columns.contains_key(d))
	}
}

/// Build a column from each resolver's representative latency.
///
/// `None` means the resolver gave no answer and is scored with the RTT
/// failure value. When no resolver answered there is nothing to compare
/// against and the column fails.
pub fn normalize_column(
	domain: &str,
	latencies: Vec<(ResolverDescriptor, Option<f64>)>,
) -> DomainColumn {
	let failed = |reason: &str| DomainColumn::Failed(BenchError::DomainScoring {
		domain: domain.to_string(),
		reason: reason.to_string(),
	});

	if latencies.iter().all(|(_, latency)| latency.is_none()) {
		return failed("no resolver returned an answer");
	}

	let values: Vec<f64> = latencies.iter()
		.map(|(_, latency)| latency.unwrap_or(RTT_FAILURE_MS))
		.collect();
	let Some(scores) = normalize_to_min(&values) else {
		return failed("no positive baseline latency");
	};

	DomainColumn::Scored(
		latencies.into_iter()
			.map(|(resolver, _)| resolver)
			.zip(scores)
			.collect(),
	)
}

/// Measure every resolver against `domain` and normalize the results.
pub async fn score_domain(
	probe: &dyn ResolverProbe,
	rtt: &RttCache,
	resolvers: &[ResolverDescriptor],
	domain: &str,
	repeats: usize,
	insecure: bool,
) -> DomainColumn {
	let options = ProbeOptions::short(insecure);
	let mut latencies = Vec::with_capacity(resolvers.len());

	for resolver in resolvers {
		let answers = repeat_ips(probe, resolver, domain, &options, repeats).await;
		let mut rtts = Vec::with_capacity(answers.len());
		for ip in answers {
			rtts.push(rtt.rtt(ip).await);
		}
		let latency = mean(&rtts);
		debug!(resolver = %resolver, domain, ?latency, "answer latency");
		latencies.push((resolver.clone(), latency));
	}

	let column = normalize_column(domain, latencies);
	if let DomainColumn::Failed(e) = &column {
		error!("{}", e);
	}
	column
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rtt::RttProber;
	use crate::transport::ProbeResult;
	use async_trait::async_trait;
	use std::net::IpAddr;
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// Resolver `fast` answers 10.0.0.10, `slow` answers 10.0.0.40 and
	/// 10.0.0.20, `dead` never answers.
	struct MapProbe;

	#[async_trait]
	impl ResolverProbe for MapProbe {
		async fn resolve(
			&self,
			resolver: &ResolverDescriptor,
			_domain: &str,
			_options: &ProbeOptions,
		) -> ProbeResult {
			let ips: &[&str] = match resolver.name.as_str() {
				"fast" => &["10.0.0.10"],
				"slow" => &["10.0.0.40", "10.0.0.20"],
				_ => &[],
			};
			ProbeResult {
				answers: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
				..ProbeResult::default()
			}
		}
	}

	/// RTT equals the last octet.
	struct OctetProber {
		calls: AtomicUsize,
	}

	#[async_trait]
	impl RttProber for OctetProber {
		async fn measure_rtt(&self, ip: IpAddr) -> f64 {
			self.calls.fetch_add(1, Ordering::SeqCst);
			match ip {
				IpAddr::V4(v4) => v4.octets()[3] as f64,
				IpAddr::V6(_) => RTT_FAILURE_MS,
			}
		}
	}

	fn resolver(name: &str) -> ResolverDescriptor {
		crate::resolver::parse_resolver(&format!("{},udp,udp://127.0.0.1", name)).unwrap()
	}

	fn scores(column: &DomainColumn) -> &HashMap<ResolverDescriptor, f64> {
		match column {
			DomainColumn::Scored(scores) => scores,
			DomainColumn::Failed(e) => panic!("column failed: {}", e),
		}
	}

	#[test]
	fn test_normalize_column_minimum_is_one() {
		let column = normalize_column("www.jd.com", vec![
			(resolver("a"), Some(30.0)),
			(resolver("b"), Some(15.0)),
			(resolver("c"), None),
		]);
		let scores = scores(&column);
		assert_eq!(scores[&resolver("b")], 1.0);
		assert_eq!(scores[&resolver("a")], 2.0);
		assert_eq!(scores[&resolver("c")], RTT_FAILURE_MS / 15.0);
		assert!(scores.values().all(|s| *s >= 1.0));
	}

	#[test]
	fn test_normalize_column_all_failed() {
		let column = normalize_column("www.jd.com", vec![
			(resolver("a"), None),
			(resolver("b"), None),
		]);
		assert!(matches!(
			column,
			DomainColumn::Failed(BenchError::DomainScoring { ref domain, .. }) if domain == "www.jd.com"
		));
	}

	#[test]
	fn test_normalize_column_zero_baseline() {
		let column = normalize_column("localhost", vec![(resolver("a"), Some(0.0))]);
		assert!(matches!(column, DomainColumn::Failed(_)));
	}

	#[test]
	fn test_table_first_writer_wins() {
		let table = AccuracyTable::new();
		let first = normalize_column("www.qq.com", vec![(resolver("a"), Some(5.0))]);
		let second = normalize_column("www.qq.com", vec![(resolver("a"), None), (resolver("b"), Some(1.0))]);
		assert!(table.insert("www.qq.com", first.clone()));
		assert!(!table.insert("www.qq.com", second));
		assert_eq!(table.column("www.qq.com").unwrap().as_ref(), &first);
		assert_eq!(table.score("www.qq.com", &resolver("a")), Some(1.0));
		assert_eq!(table.score("www.qq.com", &resolver("b")), None);
	}

	#[test]
	fn test_table_completeness() {
		let table = AccuracyTable::new();
		let domains = vec!["www.qq.com".to_string(), "www.jd.com".to_string()];
		table.insert("www.qq.com", normalize_column("www.qq.com", vec![(resolver("a"), Some(5.0))]));
		assert!(!table.is_complete(&domains));
		table.insert("www.jd.com", normalize_column("www.jd.com", vec![(resolver("a"), None)]));
		assert!(table.is_complete(&domains));
		assert_eq!(table.score("www.jd.com", &resolver("a")), None);
	}

	#[tokio::test]
	async fn test_score_domain_with_stubs() {
		let prober = Arc::new(OctetProber { calls: AtomicUsize::new(0) });
		let cache = RttCache::new(prober.clone());
		let resolvers = vec![resolver("fast"), resolver("slow"), resolver("dead")];

		let column = score_domain(&MapProbe, &cache, &resolvers, "www.jd.com", 3, false).await;
		let scores = scores(&column);
		assert_eq!(scores[&resolver("fast")], 1.0);
		assert_eq!(scores[&resolver("slow")], 3.0);
		assert_eq!(scores[&resolver("dead")], RTT_FAILURE_MS / 10.0);
		assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_score_domain_is_idempotent() {
		let prober = Arc::new(OctetProber { calls: AtomicUsize::new(0) });
		let cache = RttCache::new(prober.clone());
		let resolvers = vec![resolver("fast"), resolver("slow"), resolver("dead")];

		let first = score_domain(&MapProbe, &cache, &resolvers, "www.qq.com", 3, false).await;
		let second = score_domain(&MapProbe, &cache, &resolvers, "www.qq.com", 3, false).await;
		assert_eq!(first, second);
		// second pass is served entirely from the cache
		assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
	}
}

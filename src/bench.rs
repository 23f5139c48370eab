use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::accuracy::{score_domain, AccuracyTable, DomainColumn};
use crate::detect::{check_available, check_poisoned, check_subnet_hint, measure_latency};
use crate::error::BenchError;
use crate::output::ReportSink;
use crate::probe::ResolverProbe;
use crate::rtt::{RttCache, RttProber};
use crate::transport::{BenchmarkConfig, ReportStatus, ResolverDescriptor, ResolverReport};

/// Pipeline state. Every transition waits for the previous phase to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Loaded,
	Filtered,
	Scored,
	Reported,
	Done,
}

/// Run one task per item with at most `workers` running at once.
///
/// Returns outputs in item order once every task has finished. A task that
/// panicked yields `None` for its item.
async fn run_phase<T, O, F, Fut>(items: &[T], workers: usize, task: F) -> Vec<Option<O>>
where
	T: Clone,
	O: Send + 'static,
	F: Fn(T) -> Fut,
	Fut: Future<Output = O> + Send + 'static,
{
	let semaphore = Arc::new(Semaphore::new(workers.max(1)));
	let mut handles = Vec::with_capacity(items.len());
	for item in items {
		let sem = semaphore.clone();
		let work = task(item.clone());
		handles.push(tokio::spawn(async move {
			let _permit = sem.acquire_owned().await;
			work.await
		}));
	}

	let mut outputs = Vec::with_capacity(handles.len());
	for handle in handles {
		match handle.await {
			Ok(output) => outputs.push(Some(output)),
			Err(e) => {
				warn!("task failed: {}", e);
				outputs.push(None);
			}
		}
	}
	outputs
}

/// Measure one surviving resolver and build its report.
///
/// Reads the accuracy table, so it must only run once scoring is complete.
pub async fn aggregate_report(
	probe: &dyn ResolverProbe,
	table: &AccuracyTable,
	config: &BenchmarkConfig,
	resolver: &ResolverDescriptor,
) -> ResolverReport {
	let latency = measure_latency(
		probe, resolver, &config.reference_domain,
		config.latency_samples, config.insecure,
	).await;
	let Some(latency_ms) = latency else {
		info!(resolver = %resolver, "no query time reported, not available");
		return ResolverReport::not_available(resolver);
	};

	let poisoned = check_poisoned(
		probe, resolver, &config.canary_domain, &config.canary_block,
		config.poison_repeats, config.insecure,
	).await;
	let ecs_supported = check_subnet_hint(
		probe, resolver, &config.subnet_domain,
		(config.subnet_a, config.subnet_b),
		config.ecs_repeats, config.insecure,
	).await;

	let accuracy_per_domain: Vec<Option<f64>> = config.accuracy_domains.iter()
		.map(|domain| table.score(domain, resolver))
		.collect();
	let accuracy_total = accuracy_per_domain.iter().flatten().sum();

	ResolverReport {
		name: resolver.name.clone(),
		protocol: resolver.protocol.clone(),
		status: ReportStatus::Measured {
			latency_ms,
			poisoned,
			ecs_supported,
			accuracy_per_domain,
			accuracy_total,
		},
	}
}

/// The measurement pipeline: filter, score, report.
///
/// Owns the run-wide RTT cache and accuracy table; everything else is
/// handed between phases by value.
pub struct Bench {
	probe: Arc<dyn ResolverProbe>,
	rtt: Arc<RttCache>,
	table: Arc<AccuracyTable>,
	config: Arc<BenchmarkConfig>,
	phase: Phase,
}

impl Bench {
	pub fn new(
		probe: Arc<dyn ResolverProbe>,
		prober: Arc<dyn RttProber>,
		config: BenchmarkConfig,
	) -> Self {
		Bench {
			probe,
			rtt: Arc::new(RttCache::new(prober)),
			table: Arc::new(AccuracyTable::new()),
			config: Arc::new(config),
			phase: Phase::Loaded,
		}
	}

	fn advance(&mut self, next: Phase) {
		info!(from = ?self.phase, to = ?next, "phase complete");
		self.phase = next;
	}

	fn emit(sink: &dyn ReportSink, report: &ResolverReport) {
		if let Err(e) = sink.emit(report) {
			error!(resolver = %report.name, "failed to write report: {}", e);
		}
	}

	/// Run the whole pipeline, emitting exactly one report per resolver.
	pub async fn run(&mut self, mut resolvers: Vec<ResolverDescriptor>, sink: &dyn ReportSink) {
		let mut rng = match self.config.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		resolvers.shuffle(&mut rng);

		let survivors = self.filter(&resolvers, sink).await;
		self.score(&survivors).await;
		self.report(&survivors, sink).await;

		if let Err(e) = sink.flush() {
			error!("failed to flush reports: {}", e);
		}
		self.advance(Phase::Done);
	}

	/// Drop resolvers that do not answer the reference domain.
	///
	/// Their "not available" reports are emitted before this returns.
	pub async fn filter(
		&mut self,
		resolvers: &[ResolverDescriptor],
		sink: &dyn ReportSink,
	) -> Vec<ResolverDescriptor> {
		info!("checking availability of {} resolvers", resolvers.len());
		let outputs = run_phase(resolvers, self.config.max_inflight, |resolver| {
			let probe = self.probe.clone();
			let config = self.config.clone();
			async move {
				check_available(
					probe.as_ref(), &resolver, &config.reference_domain,
					config.filter_repeats, config.insecure,
				).await
			}
		}).await;

		let mut survivors = Vec::new();
		for (resolver, available) in resolvers.iter().zip(outputs) {
			if available == Some(true) {
				survivors.push(resolver.clone());
			} else {
				info!(resolver = %resolver, "not available");
				Self::emit(sink, &ResolverReport::not_available(resolver));
			}
		}

		info!("{}/{} resolvers available", survivors.len(), resolvers.len());
		self.advance(Phase::Filtered);
		survivors
	}

	/// Fill the accuracy table, one task per benchmark domain.
	pub async fn score(&mut self, survivors: &[ResolverDescriptor]) {
		let domains = self.config.accuracy_domains.clone();
		info!("scoring {} domains across {} resolvers", domains.len(), survivors.len());

		let shared: Arc<[ResolverDescriptor]> = survivors.into();
		let outputs = run_phase(&domains, self.config.max_inflight, |domain| {
			let probe = self.probe.clone();
			let rtt = self.rtt.clone();
			let table = self.table.clone();
			let config = self.config.clone();
			let resolvers = shared.clone();
			async move {
				let column = score_domain(
					probe.as_ref(), &rtt, &resolvers, &domain,
					config.accuracy_repeats, config.insecure,
				).await;
				table.insert(&domain, column);
			}
		}).await;

		for (domain, output) in domains.iter().zip(outputs) {
			if output.is_none() {
				let failure = BenchError::DomainScoring {
					domain: domain.clone(),
					reason: "scoring task aborted".to_string(),
				};
				error!("{}", failure);
				self.table.insert(domain, DomainColumn::Failed(failure));
			}
		}

		debug_assert!(self.table.is_complete(&domains));
		info!("measured rtt for {} addresses", self.rtt.len());
		self.advance(Phase::Scored);
	}

	/// Measure and report every survivor against the finished table.
	///
	/// Reports are emitted in completion order. Survivors whose task
	/// panicked are reported as not available once the rest have drained.
	pub async fn report(&mut self, survivors: &[ResolverDescriptor], sink: &dyn ReportSink) {
		info!("measuring {} resolvers", survivors.len());
		let semaphore = Arc::new(Semaphore::new(self.config.max_inflight.max(1)));
		let mut tasks = JoinSet::new();
		for resolver in survivors {
			let sem = semaphore.clone();
			let probe = self.probe.clone();
			let table = self.table.clone();
			let config = self.config.clone();
			let resolver = resolver.clone();
			tasks.spawn(async move {
				let _permit = sem.acquire_owned().await;
				aggregate_report(probe.as_ref(), &table, &config, &resolver).await
			});
		}

		let mut reported = HashSet::new();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(report) => {
					Self::emit(sink, &report);
					reported.insert((report.name, report.protocol));
				}
				Err(e) => warn!("task failed: {}", e),
			}
		}

		for resolver in survivors {
			if !reported.contains(&(resolver.name.clone(), resolver.protocol.clone())) {
				Self::emit(sink, &ResolverReport::not_available(resolver));
			}
		}
		self.advance(Phase::Reported);
	}
}

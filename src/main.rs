mod accuracy;
mod bench;
mod cli;
mod detect;
mod dns;
mod domains;
mod error;
mod output;
mod probe;
mod resolver;
mod rtt;
mod stats;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use ip_network::IpNetwork;
use tracing_subscriber::{fmt, EnvFilter};

use crate::bench::Bench;
use crate::cli::{Cli, OutputFormat};
use crate::output::{CollectSink, CsvSink, FanoutSink, ReportSink};
use crate::probe::{ExecProbe, NativeProbe, ResolverProbe};
use crate::rtt::PingProber;
use crate::transport::{BenchmarkConfig, Subnet};

fn setup_logging(level: &str) {
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(level))
		.unwrap_or_else(|_| EnvFilter::new("warn"));
	fmt()
		.with_env_filter(env_filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	setup_logging(&cli.log_level);

	// Collect resolvers from all sources
	let mut resolvers = Vec::new();
	for r in &cli.resolvers {
		resolvers.push(resolver::parse_resolver(r)?);
	}
	if let Some(path) = &cli.resolver_file {
		resolvers.extend(resolver::read_resolver_file(path)?);
	}
	if resolvers.is_empty() {
		resolvers = resolver::default_resolvers();
	}
	resolver::ensure_unique(&resolvers)?;

	let accuracy_domains = match &cli.domains {
		Some(path) => domains::read_domain_file(path)?,
		None => domains::default_accuracy_domains(),
	};
	if accuracy_domains.is_empty() {
		return Err(anyhow!("no accuracy domains configured"));
	}

	let canary_block: IpNetwork = cli.canary_block.parse()
		.map_err(|e| anyhow!("invalid canary block '{}': {:?}", cli.canary_block, e))?;
	let timeout = Duration::from_millis(cli.timeout);

	let config = BenchmarkConfig {
		max_inflight: cli.concurrency,
		timeout,
		insecure: cli.insecure,
		query_aaaa: cli.aaaa,
		seed: cli.seed,
		filter_repeats: cli.filter_repeats,
		latency_samples: cli.latency_samples,
		poison_repeats: cli.poison_repeats,
		ecs_repeats: cli.ecs_repeats,
		accuracy_repeats: cli.accuracy_repeats,
		reference_domain: cli.reference_domain.clone(),
		canary_domain: cli.canary_domain.clone(),
		canary_block,
		subnet_domain: cli.subnet_domain.clone(),
		subnet_a: cli.subnet_a.parse::<Subnet>()?,
		subnet_b: cli.subnet_b.parse::<Subnet>()?,
		accuracy_domains: accuracy_domains.clone(),
	};

	let probe: Arc<dyn ResolverProbe> = match &cli.doh_binary {
		Some(binary) => Arc::new(ExecProbe::new(binary.clone(), timeout)),
		None => Arc::new(NativeProbe::new(timeout, config.query_aaaa)?),
	};
	let prober = Arc::new(PingProber::new(
		cli.ping_count, Duration::from_millis(cli.ping_interval), timeout,
	));

	let collected = Arc::new(CollectSink::new());
	let mut sinks: Vec<Arc<dyn ReportSink>> = vec![collected.clone() as Arc<dyn ReportSink>];
	match cli.format {
		OutputFormat::Csv => {
			sinks.push(Arc::new(CsvSink::new(std::io::stdout(), &accuracy_domains)?));
		}
		OutputFormat::Table => output::print_config_summary(&resolvers, &config),
		OutputFormat::Markdown => {}
	}
	let sink = FanoutSink::new(sinks);

	let mut bench = Bench::new(probe, prober, config);
	bench.run(resolvers.clone(), &sink).await;

	let reports = collected.reports_in_order(&resolvers);
	match cli.format {
		OutputFormat::Table => output::print_results_table(&reports, &accuracy_domains),
		OutputFormat::Markdown => print!("{}", output::markdown_table(&reports, &accuracy_domains)),
		OutputFormat::Csv => {}
	}

	if let Some(path) = &cli.output {
		output::write_csv(path, &reports, &accuracy_domains)?;
	}

	Ok(())
}

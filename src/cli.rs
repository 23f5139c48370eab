use clap::{Parser, ValueEnum};

use crate::domains::{
	DEFAULT_CANARY_BLOCK, DEFAULT_CANARY_DOMAIN, DEFAULT_REFERENCE_DOMAIN,
	DEFAULT_SUBNET_A, DEFAULT_SUBNET_B, DEFAULT_SUBNET_DOMAIN,
};

/// How results are printed on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// Formatted table after the run
	Table,
	/// CSV rows streamed as resolvers finish
	Csv,
	/// Markdown table after the run
	Markdown,
}

/// DNS resolver benchmark tool
#[derive(Parser, Debug)]
#[command(name = "dns-resolver-bench")]
#[command(about = "Score DNS resolvers for latency, poisoning, ECS support and answer accuracy")]
pub struct Cli {
	/// Resolver as name,protocol,endpoint (repeatable, e.g. Google,udp,udp://8.8.8.8)
	#[arg(short = 'r', long = "resolver")]
	pub resolvers: Vec<String>,

	/// CSV file of resolvers, one name,protocol,endpoint per line
	#[arg(short = 'f', long = "resolver-file")]
	pub resolver_file: Option<String>,

	/// File containing the domains used for accuracy scoring
	#[arg(long = "domains")]
	pub domains: Option<String>,

	/// Domain used for availability and latency measurement
	#[arg(long = "reference-domain", default_value = DEFAULT_REFERENCE_DOMAIN)]
	pub reference_domain: String,

	/// Domain whose answers must fall inside the canary block
	#[arg(long = "canary-domain", default_value = DEFAULT_CANARY_DOMAIN)]
	pub canary_domain: String,

	/// Address block containing every legitimate canary answer
	#[arg(long = "canary-block", default_value = DEFAULT_CANARY_BLOCK)]
	pub canary_block: String,

	/// Domain queried with both client-subnet hints
	#[arg(long = "subnet-domain", default_value = DEFAULT_SUBNET_DOMAIN)]
	pub subnet_domain: String,

	/// First client-subnet hint
	#[arg(long = "subnet-a", default_value = DEFAULT_SUBNET_A)]
	pub subnet_a: String,

	/// Second client-subnet hint, topologically far from the first
	#[arg(long = "subnet-b", default_value = DEFAULT_SUBNET_B)]
	pub subnet_b: String,

	/// Worker pool size for each phase
	#[arg(short = 'c', long = "concurrency", default_value = "5")]
	pub concurrency: usize,

	/// Queries per resolver in the availability check
	#[arg(long = "filter-repeats", default_value = "2")]
	pub filter_repeats: usize,

	/// Timed queries per resolver for latency
	#[arg(long = "latency-samples", default_value = "5")]
	pub latency_samples: usize,

	/// Queries per resolver for the canary domain
	#[arg(long = "poison-repeats", default_value = "2")]
	pub poison_repeats: usize,

	/// Queries per client-subnet hint
	#[arg(long = "ecs-repeats", default_value = "3")]
	pub ecs_repeats: usize,

	/// Queries per resolver and domain for accuracy scoring
	#[arg(long = "accuracy-repeats", default_value = "3")]
	pub accuracy_repeats: usize,

	/// Query timeout in milliseconds
	#[arg(short = 't', long = "timeout", default_value = "2000")]
	pub timeout: u64,

	/// Echo probes per address when measuring RTT
	#[arg(long = "ping-count", default_value = "5")]
	pub ping_count: u32,

	/// Interval between echo probes in milliseconds
	#[arg(long = "ping-interval", default_value = "200")]
	pub ping_interval: u64,

	/// Skip TLS certificate verification
	#[arg(long = "insecure")]
	pub insecure: bool,

	/// Also query AAAA records
	#[arg(long = "aaaa")]
	pub aaaa: bool,

	/// Use an external doh query binary instead of the built-in client
	#[arg(long = "doh-binary")]
	pub doh_binary: Option<String>,

	/// Output format on stdout
	#[arg(long = "format", value_enum, default_value = "table")]
	pub format: OutputFormat,

	/// Output CSV file path
	#[arg(short = 'o', long = "output")]
	pub output: Option<String>,

	/// Random seed for the resolver dispatch order
	#[arg(short = 's', long = "seed")]
	pub seed: Option<u64>,

	/// Log filter for diagnostics on stderr (overridden by RUST_LOG)
	#[arg(long = "log-level", default_value = "warn")]
	pub log_level: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let cli = Cli::parse_from(["dns-resolver-bench"]);
		assert_eq!(cli.concurrency, 5);
		assert_eq!(cli.filter_repeats, 2);
		assert_eq!(cli.latency_samples, 5);
		assert_eq!(cli.canary_block, "104.244.40.0/21");
		assert_eq!(cli.format, OutputFormat::Table);
	}

	#[test]
	fn test_resolver_flags() {
		let cli = Cli::parse_from([
			"dns-resolver-bench",
			"-r", "Google,udp,udp://8.8.8.8",
			"-r", "Google,rfc8484,https://dns.google/dns-query",
			"--format", "csv",
		]);
		assert_eq!(cli.resolvers.len(), 2);
		assert_eq!(cli.format, OutputFormat::Csv);
	}
}

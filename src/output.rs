use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use tracing::info;

use crate::transport::{BenchmarkConfig, ReportStatus, ResolverDescriptor, ResolverReport};

const NOT_AVAILABLE: &str = "not available";

/// Destination for finished resolver reports.
pub trait ReportSink: Send + Sync {
	fn emit(&self, report: &ResolverReport) -> Result<()>;

	fn flush(&self) -> Result<()> {
		Ok(())
	}
}

fn yes_no(flag: bool) -> String {
	let text = if flag { "Yes" } else { "No" };
	text.to_string()
}

/// Column headers matching `report_row`.
pub fn header_row(domains: &[String]) -> Vec<String> {
	let mut header: Vec<String> = [
		"vendor", "protocol", "latency", "poisoned", "edns-client-subnet", "accuracy",
	].iter().map(|s| s.to_string()).collect();
	header.extend(domains.iter().cloned());
	header
}

/// Render a report as output fields.
///
/// Unavailable resolvers get the three-field short form.
pub fn report_row(report: &ResolverReport) -> Vec<String> {
	let mut row = vec![report.name.clone(), report.protocol.clone()];
	match &report.status {
		ReportStatus::NotAvailable => row.push(NOT_AVAILABLE.to_string()),
		ReportStatus::Measured {
			latency_ms, poisoned, ecs_supported, accuracy_per_domain, accuracy_total,
		} => {
			row.push(format!("{:.1}", latency_ms));
			row.push(yes_no(*poisoned));
			row.push(yes_no(*ecs_supported));
			row.push(format!("{:.2}", accuracy_total));
			row.extend(accuracy_per_domain.iter().map(|score| match score {
				Some(s) => format!("{:.2}", s),
				None => "failed".to_string(),
			}));
		}
	}
	row
}

/// Streams each report as a CSV record the moment it is emitted.
pub struct CsvSink<W: Write + Send> {
	writer: Mutex<csv::Writer<W>>,
}

impl<W: Write + Send> CsvSink<W> {
	pub fn new(inner: W, domains: &[String]) -> Result<Self> {
		let mut writer = csv::WriterBuilder::new()
			.flexible(true)
			.from_writer(inner);
		writer.write_record(header_row(domains))?;
		Ok(CsvSink { writer: Mutex::new(writer) })
	}
}

impl<W: Write + Send> ReportSink for CsvSink<W> {
	fn emit(&self, report: &ResolverReport) -> Result<()> {
		let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
		writer.write_record(report_row(report))?;
		// Keep rows visible while later resolvers are still running
		writer.flush()?;
		Ok(())
	}

	fn flush(&self) -> Result<()> {
		self.writer.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
		Ok(())
	}
}

/// Keeps every report for rendering once the run is over.
#[derive(Default)]
pub struct CollectSink {
	reports: Mutex<Vec<ResolverReport>>,
}

impl CollectSink {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reports ordered like `resolvers`; unknown reports go last.
	pub fn reports_in_order(&self, resolvers: &[ResolverDescriptor]) -> Vec<ResolverReport> {
		let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner()).clone();
		reports.sort_by_key(|r| {
			resolvers.iter()
				.position(|d| d.name == r.name && d.protocol == r.protocol)
				.unwrap_or(usize::MAX)
		});
		reports
	}
}

impl ReportSink for CollectSink {
	fn emit(&self, report: &ResolverReport) -> Result<()> {
		self.reports.lock().unwrap_or_else(|e| e.into_inner()).push(report.clone());
		Ok(())
	}
}

/// Sends every report to several sinks.
pub struct FanoutSink {
	sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
	pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
		FanoutSink { sinks }
	}
}

impl ReportSink for FanoutSink {
	fn emit(&self, report: &ResolverReport) -> Result<()> {
		for sink in &self.sinks {
			sink.emit(report)?;
		}
		Ok(())
	}

	fn flush(&self) -> Result<()> {
		for sink in &self.sinks {
			sink.flush()?;
		}
		Ok(())
	}
}

/// Print a summary of the benchmark configuration before running.
pub fn print_config_summary(resolvers: &[ResolverDescriptor], config: &BenchmarkConfig) {
	println!("DNS Resolver Benchmark Configuration");
	println!("====================================");
	println!("Resolvers:        {}", resolvers.len());
	for r in resolvers {
		println!("  - {} ({}, {})", r.name, r.protocol, r.endpoint);
	}
	println!("Reference domain: {}", config.reference_domain);
	println!("Canary:           {} in {}", config.canary_domain, config.canary_block);
	println!("ECS test:         {} via {} / {}", config.subnet_domain, config.subnet_a, config.subnet_b);
	println!("Accuracy domains: {}", config.accuracy_domains.join(", "));
	println!("Timeout:          {} ms", config.timeout.as_millis());
	println!("Concurrency:      {}", config.max_inflight);
	if let Some(seed) = config.seed {
		println!("Seed:             {}", seed);
	}
	println!();
}

/// Print the benchmark results as a formatted table.
pub fn print_results_table(reports: &[ResolverReport], domains: &[String]) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	let mut header = vec![
		"Resolver".to_string(), "Protocol".to_string(), "Latency".to_string(),
		"Poisoned".to_string(), "ECS".to_string(), "Accuracy".to_string(),
	];
	header.extend(domains.iter().cloned());
	table.set_header(header);

	for report in reports {
		table.add_row(report_row(report));
	}

	println!("\nBenchmark Results");
	println!("=================\n");
	println!("{table}");
}

/// Render the results as a markdown table.
pub fn markdown_table(reports: &[ResolverReport], domains: &[String]) -> String {
	let header = format!("| {} |", header_row(domains).join(" | "));
	let separator: String = header.chars()
		.map(|c| if c == '|' || c == ' ' { c } else { '-' })
		.collect();

	let mut out = String::new();
	out.push_str(&header);
	out.push('\n');
	out.push_str(&separator);
	out.push('\n');
	for report in reports {
		out.push_str(&format!("| {} |\n", report_row(report).join(" | ")));
	}
	out
}

/// Write benchmark results to a CSV file.
pub fn write_csv(path: &str, reports: &[ResolverReport], domains: &[String]) -> Result<()> {
	let file = std::fs::File::create(path)?;
	let sink = CsvSink::new(file, domains)?;
	for report in reports {
		sink.emit(report)?;
	}
	sink.flush()?;
	info!("results written to {}", path);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn measured() -> ResolverReport {
		ResolverReport {
			name: "Cloudflare".to_string(),
			protocol: "udp".to_string(),
			status: ReportStatus::Measured {
				latency_ms: 12.34,
				poisoned: false,
				ecs_supported: true,
				accuracy_per_domain: vec![Some(1.0), None, Some(2.5)],
				accuracy_total: 3.5,
			},
		}
	}

	fn unavailable() -> ResolverReport {
		ResolverReport {
			name: "Dead".to_string(),
			protocol: "tls".to_string(),
			status: ReportStatus::NotAvailable,
		}
	}

	fn domains() -> Vec<String> {
		vec!["www.qq.com".to_string(), "www.jd.com".to_string(), "www.baidu.com".to_string()]
	}

	#[test]
	fn test_report_row_measured() {
		assert_eq!(report_row(&measured()), vec![
			"Cloudflare", "udp", "12.3", "No", "Yes", "3.50", "1.00", "failed", "2.50",
		]);
	}

	#[test]
	fn test_report_row_short_form() {
		assert_eq!(report_row(&unavailable()), vec!["Dead", "tls", "not available"]);
	}

	#[test]
	fn test_csv_sink_streams_rows() {
		let sink = CsvSink::new(Vec::new(), &domains()).unwrap();
		sink.emit(&unavailable()).unwrap();
		sink.emit(&measured()).unwrap();
		sink.flush().unwrap();
		let writer = sink.writer.into_inner().unwrap();
		let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
		let lines: Vec<&str> = data.lines().collect();
		assert_eq!(lines.len(), 3);
		assert!(lines[0].starts_with("vendor,protocol,latency"));
		assert_eq!(lines[1], "Dead,tls,not available");
		assert!(lines[2].starts_with("Cloudflare,udp,12.3,No,Yes,3.50"));
	}

	#[test]
	fn test_collect_sink_orders_by_config() {
		let resolvers = vec![
			crate::resolver::parse_resolver("Cloudflare,udp,udp://1.1.1.1").unwrap(),
			crate::resolver::parse_resolver("Dead,tls,tls://192.0.2.1").unwrap(),
		];
		let sink = CollectSink::new();
		sink.emit(&unavailable()).unwrap();
		sink.emit(&measured()).unwrap();
		let reports = sink.reports_in_order(&resolvers);
		assert_eq!(reports[0].name, "Cloudflare");
		assert_eq!(reports[1].name, "Dead");
	}

	#[test]
	fn test_markdown_table() {
		let md = markdown_table(&[measured(), unavailable()], &domains());
		let lines: Vec<&str> = md.lines().collect();
		assert_eq!(lines.len(), 4);
		assert!(lines[0].starts_with("| vendor | protocol |"));
		assert!(lines[1].starts_with("| ------ | -------- |"));
		assert_eq!(lines[3], "| Dead | tls | not available |");
	}
}

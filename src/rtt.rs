use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::stats::mean;

/// Latency reported for an address that never answered an echo probe.
pub const RTT_FAILURE_MS: f64 = 10000.0;

/// Round-trip time measurement to a single address.
///
/// Returns `RTT_FAILURE_MS` instead of failing, so unreachable counts as slow.
#[async_trait]
pub trait RttProber: Send + Sync {
	async fn measure_rtt(&self, ip: IpAddr) -> f64;
}

/// Pull the `time=<x> ms` samples out of `ping` output.
fn parse_ping_times(output: &str) -> Vec<f64> {
	output.lines()
		.filter_map(|line| {
			let rest = line.split("time=").nth(1)?;
			rest.split_whitespace().next()?
				.trim_end_matches("ms")
				.parse::<f64>()
				.ok()
		})
		.collect()
}

/// RTT prober that runs the system `ping` and averages the replies.
pub struct PingProber {
	count: u32,
	interval: Duration,
	timeout: Duration,
}

impl PingProber {
	pub fn new(count: u32, interval: Duration, timeout: Duration) -> Self {
		PingProber { count, interval, timeout }
	}

	/// Upper bound on one measurement: every probe plus a reply timeout.
	fn deadline(&self) -> Duration {
		self.interval * self.count + self.timeout
	}
}

#[async_trait]
impl RttProber for PingProber {
	async fn measure_rtt(&self, ip: IpAddr) -> f64 {
		let wait_secs = self.timeout.as_secs().max(1);
		let mut cmd = Command::new("ping");
		cmd.arg("-n")
			.arg("-c").arg(self.count.to_string())
			.arg("-i").arg(format!("{:.1}", self.interval.as_secs_f64()))
			.arg("-W").arg(wait_secs.to_string())
			.arg(ip.to_string())
			.kill_on_drop(true);

		let output = match tokio::time::timeout(self.deadline(), cmd.output()).await {
			Ok(Ok(output)) => output,
			Ok(Err(e)) => {
				debug!(%ip, error = %e, "ping failed to run");
				return RTT_FAILURE_MS;
			}
			Err(_) => {
				debug!(%ip, "ping timed out");
				return RTT_FAILURE_MS;
			}
		};

		let times = parse_ping_times(&String::from_utf8_lossy(&output.stdout));
		let rtt = mean(&times).unwrap_or(RTT_FAILURE_MS);
		debug!(%ip, rtt, samples = times.len(), "measured rtt");
		rtt
	}
}

/// Run-wide memo of RTT measurements.
///
/// Each address is measured at most once, even when several tasks ask for
/// it at the same time: late callers wait on the first caller's result.
pub struct RttCache {
	prober: Arc<dyn RttProber>,
	entries: Mutex<HashMap<IpAddr, Arc<OnceCell<f64>>>>,
}

impl RttCache {
	pub fn new(prober: Arc<dyn RttProber>) -> Self {
		RttCache {
			prober,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub async fn rtt(&self, ip: IpAddr) -> f64 {
		let cell = {
			let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
			entries.entry(ip).or_default().clone()
		};
		*cell.get_or_init(|| self.prober.measure_rtt(ip)).await
	}

	/// Number of addresses measured (or being measured) so far.
	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
	}
}

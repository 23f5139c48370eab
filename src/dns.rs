use std::collections::BTreeSet;
use std::net::IpAddr;

use anyhow::{anyhow, Result};
use hickory_proto::op::{Edns, Message, MessageType, Query};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::transport::{ProbeResult, QueryType, Subnet};

/// Prefix of the telemetry line a verbose probe prints after the answer.
const QUERY_TIME_PREFIX: &str = ";; Query time:";

/// DNS response information extracted from a parsed message
#[derive(Debug)]
pub struct DnsResponse {
	pub rcode_str: String,
	/// A and AAAA addresses found in the answer section
	pub addresses: Vec<IpAddr>,
}

/// Build a DNS query message for the given domain and query type.
///
/// When a subnet is given, an EDNS client-subnet option carrying it is
/// attached. Returns the serialized query bytes.
pub fn build_query(
	domain: &str,
	query_type: QueryType,
	txid: u16,
	subnet: Option<&Subnet>,
) -> Result<Vec<u8>> {
	let name = Name::from_ascii(domain)
		.map_err(|e| anyhow!("invalid domain name '{}': {}", domain, e))?;

	let record_type = match query_type {
		QueryType::A => RecordType::A,
		QueryType::AAAA => RecordType::AAAA,
	};

	let mut message = Message::new();
	message.set_id(txid);
	message.set_recursion_desired(true);
	message.add_query(Query::query(name, record_type));

	if let Some(subnet) = subnet {
		let edns = message.extensions_mut().get_or_insert_with(Edns::new);
		edns.set_max_payload(1232);
		edns.options_mut().insert(EdnsOption::Subnet(
			ClientSubnet::new(subnet.addr, subnet.prefix, 0),
		));
	}

	let bytes = message.to_vec()
		.map_err(|e| anyhow!("failed to serialize DNS query: {}", e))?;
	Ok(bytes)
}

/// Parse a DNS response, validating the transaction ID and collecting addresses.
///
/// Returns an error if the response cannot be parsed or the txid does not match.
pub fn parse_response(bytes: &[u8], expected_txid: u16) -> Result<DnsResponse> {
	let message = Message::from_vec(bytes)
		.map_err(|e| anyhow!("failed to parse DNS response: {}", e))?;

	if message.id() != expected_txid {
		return Err(anyhow!(
			"txid mismatch: expected {}, got {}",
			expected_txid, message.id()
		));
	}

	if message.message_type() != MessageType::Response {
		return Err(anyhow!("received a query instead of a response"));
	}

	let addresses = message.answers().iter()
		.filter_map(|record| match record.data() {
			RData::A(a) => Some(IpAddr::V4(a.0)),
			RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
			_ => None,
		})
		.collect();

	Ok(DnsResponse {
		rcode_str: message.response_code().to_string(),
		addresses,
	})
}

/// True when a word of the line is an error or warning level marker.
fn has_diagnostic_marker(line: &str) -> bool {
	line.split(|c: char| !c.is_ascii_alphabetic())
		.any(|word| {
			["error", "warn", "warning", "fatal"].iter()
				.any(|marker| word.eq_ignore_ascii_case(marker))
		})
}

/// Parse the `;; Query time: <n> msec` telemetry line.
fn parse_query_time(line: &str) -> Option<f64> {
	let rest = line.strip_prefix(QUERY_TIME_PREFIX)?;
	rest.split_whitespace().next()?.parse().ok()
}

/// Turn the text output of an external probe into a `ProbeResult`.
///
/// Every stdout line is tried as an address literal. The query time line
/// becomes telemetry, lines with an error or warning marker become
/// diagnostics, and everything else is dropped. Non-empty stderr lines are
/// always diagnostics.
pub fn parse_probe_output(stdout: &str, stderr: &str) -> ProbeResult {
	let mut answers = BTreeSet::new();
	let mut diagnostics = Vec::new();
	let mut query_duration_ms = None;

	for line in stdout.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if let Ok(ip) = line.parse::<IpAddr>() {
			answers.insert(ip);
		} else if let Some(ms) = parse_query_time(line) {
			query_duration_ms = Some(ms);
		} else if has_diagnostic_marker(line) {
			diagnostics.push(line.to_string());
		}
	}

	diagnostics.extend(
		stderr.lines()
			.map(str::trim)
			.filter(|l| !l.is_empty())
			.map(String::from),
	);

	ProbeResult { answers, diagnostics, query_duration_ms }
}

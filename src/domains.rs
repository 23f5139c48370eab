use anyhow::{anyhow, Result};

/// Domain queried for availability and latency measurement.
pub const DEFAULT_REFERENCE_DOMAIN: &str = "www.baidu.com";

/// Domain whose every legitimate answer lies inside `DEFAULT_CANARY_BLOCK`.
pub const DEFAULT_CANARY_DOMAIN: &str = "www.twitter.com";

/// Twitter's address block.
pub const DEFAULT_CANARY_BLOCK: &str = "104.244.40.0/21";

/// CDN-hosted domain that resolves differently per client region.
pub const DEFAULT_SUBNET_DOMAIN: &str = "www.taobao.com";

/// Shanghai Telecom.
pub const DEFAULT_SUBNET_A: &str = "101.80.0.0/16";

/// AWS Canada.
pub const DEFAULT_SUBNET_B: &str = "52.88.0.0/16";

/// Return the default list of CDN-hosted domains used for accuracy scoring.
///
/// Each of these is served from many points of presence, so the answer a
/// resolver hands out says a lot about how close to the client it thinks
/// the client is.
pub fn default_accuracy_domains() -> Vec<String> {
	vec![
		"www.taobao.com",
		"www.qq.com",
		"www.baidu.com",
		"www.meituan.com",
		"www.jd.com",
	].into_iter().map(String::from).collect()
}

/// Read domains from a file, one per line.
///
/// Blank lines and lines starting with '#' are skipped.
pub fn read_domain_file(path: &str) -> Result<Vec<String>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read domain file '{}': {}", path, e))?;
	Ok(parse_domain_list(&content))
}

fn parse_domain_list(content: &str) -> Vec<String> {
	content.lines()
		.map(|line| line.trim().to_string())
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.collect()
}

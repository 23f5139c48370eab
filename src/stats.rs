/// Calculate the arithmetic mean of a slice of values.
pub fn mean(values: &[f64]) -> Option<f64> {
	if values.is_empty() {
		return None;
	}
	let sum: f64 = values.iter().sum();
	Some(sum / values.len() as f64)
}

/// Smallest value of a slice, ignoring NaN.
pub fn minimum(values: &[f64]) -> Option<f64> {
	values.iter()
		.copied()
		.filter(|v| !v.is_nan())
		.min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Divide every value by the smallest one, so the best value becomes 1.0.
///
/// Returns `None` when there is no positive finite baseline to divide by.
pub fn normalize_to_min(values: &[f64]) -> Option<Vec<f64>> {
	let baseline = minimum(values)?;
	if !baseline.is_finite() || baseline <= 0.0 {
		return None;
	}
	Some(values.iter().map(|v| v / baseline).collect())
}

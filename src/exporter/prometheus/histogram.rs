// Histogram buckets - ONTAP bucket labels to Prometheus `le` bounds
//
// Labels carry their own unit: `<20us`, `20-40ms`, `>2s`. Bounds are
// normalized to microseconds; an open upper bucket becomes `+Inf`.

use std::sync::LazyLock;

use regex::Regex;

pub const INF: &str = "+Inf";

static NUMBER_AND_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([a-z]+)$").expect("valid bucket regex"));

/// Upper bound of a bucket in microseconds, `None` if the label has no known unit
///
/// # Example
/// ```text
/// upper_bound("<20us") == Some(20.0)
/// upper_bound("20-40ms") == Some(40_000.0)
/// upper_bound(">2s") == Some(f64::INFINITY)
/// ```
pub fn upper_bound(label: &str) -> Option<f64> {
    let label = label.trim();
    if label.starts_with('>') {
        return Some(f64::INFINITY);
    }
    let upper = label.strip_prefix('<').unwrap_or(label);
    let upper = upper.rsplit_once('-').map(|(_, hi)| hi).unwrap_or(upper);

    let caps = NUMBER_AND_UNIT.captures(upper.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    let scale = match &caps[2] {
        "us" | "usec" => 1.0,
        "ms" | "msec" => 1_000.0,
        "s" | "sec" => 1_000_000.0,
        _ => return None,
    };
    Some(value * scale)
}

/// Renders a bound as the value of the `le` label
pub fn format_le(bound: f64) -> String {
    if bound.is_infinite() {
        INF.to_string()
    } else {
        format!("{bound}")
    }
}

/// `le` labels of every bucket, or `None` if any bucket cannot be normalized
pub fn normalize(buckets: &[String]) -> Option<Vec<(String, f64)>> {
    buckets
        .iter()
        .map(|b| upper_bound(b).map(|bound| (format_le(bound), bound)))
        .collect()
}

/// Cumulative bucket counts, the total count and the sum estimated from upper bounds
///
/// Counts are taken in bucket order; the open bucket adds to the count but
/// not to the sum.
pub fn accumulate(counts: &[f64], bounds: &[f64]) -> (Vec<f64>, f64, f64) {
    let mut running = 0.0;
    let mut sum = 0.0;
    let cumulative = counts
        .iter()
        .zip(bounds)
        .map(|(&count, &bound)| {
            running += count;
            if bound.is_finite() {
                sum += bound * count;
            }
            running
        })
        .collect();
    (cumulative, running, sum)
}

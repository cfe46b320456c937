// Matrix arithmetic - delta, divide and scalar operations used by cooking
//
// Every operation returns the number of cells it newly marked not-recorded.
// Cells that were already not-recorded stay that way and are not counted
// again, so one bad sample costs exactly one skip per metric.

use tracing::trace;

use super::Matrix;
use crate::error::MatrixError;

impl Matrix {
    fn position(&self, key: &str) -> Result<usize, MatrixError> {
        self.metric_index
            .get(key)
            .copied()
            .ok_or_else(|| MatrixError::NotFound(key.to_string()))
    }

    fn pair(&self, num: &str, den: &str) -> Result<(usize, usize), MatrixError> {
        let n = self.position(num)?;
        let d = self.position(den)?;
        if n == d {
            return Err(MatrixError::SameMetric(num.to_string()));
        }
        let (nl, dl) = (self.metrics[n].len(), self.metrics[d].len());
        if nl != dl {
            return Err(MatrixError::UnequalVectors {
                numerator: nl,
                denominator: dl,
            });
        }
        Ok((n, d))
    }

    /// Replaces each recorded cell of `key` with its difference to `previous`
    ///
    /// Instances are matched by key. A cell becomes not-recorded when the
    /// instance is new, the previous cell was not recorded, or the difference
    /// is negative (a counter reset or a missed sample).
    pub fn delta(&mut self, key: &str, previous: &Matrix) -> Result<usize, MatrixError> {
        let pos = self.position(key)?;
        let prev = previous
            .metric(key)
            .ok_or_else(|| MatrixError::NotFound(key.to_string()))?;

        let mut skips = 0;
        let metric = &mut self.metrics[pos];
        for (i, inst) in self.instances.iter().enumerate() {
            if !metric.is_recorded(i) {
                continue;
            }
            let current = metric.raw(i);
            let before = previous
                .instance_index(inst.key())
                .and_then(|j| prev.value(j));
            match before {
                Some(before) if current - before >= 0.0 => {
                    metric.set_value_f64(i, current - before);
                }
                _ => {
                    metric.set_recorded(i, false);
                    skips += 1;
                    trace!(
                        metric = %key,
                        instance = %inst.key(),
                        current,
                        previous = ?before,
                        "delta skipped"
                    );
                }
            }
        }
        Ok(skips)
    }

    /// Divides `num` by `den` cell by cell, in place
    ///
    /// A zero or missing denominator clears the numerator cell.
    pub fn divide(&mut self, num: &str, den: &str) -> Result<usize, MatrixError> {
        let (n, d) = self.pair(num, den)?;
        let (numerator, denominator) = self.metric_pair(n, d);

        let mut skips = 0;
        for i in 0..numerator.len() {
            if !numerator.is_recorded(i) {
                continue;
            }
            match denominator.value(i) {
                Some(dv) if dv > 0.0 && numerator.raw(i) >= 0.0 => {
                    let v = numerator.raw(i) / dv;
                    numerator.set_value_f64(i, v);
                }
                dv => {
                    numerator.set_recorded(i, false);
                    skips += 1;
                    trace!(metric = %num, numerator = numerator.raw(i), denominator = ?dv, "divide skipped");
                }
            }
        }
        Ok(skips)
    }

    /// Divides `num` by `den` only where `den` reached `min_ops`
    ///
    /// `den` must already hold its delta. Below the threshold the result is
    /// too noisy to publish and the cell is cleared. A zero delta is kept as
    /// a genuine zero only if the raw base counter was sampled in both
    /// `cached` (this poll) and `previous` (last poll) and the sample interval,
    /// read from `timestamp_key`, moved forward.
    pub fn divide_with_threshold(
        &mut self,
        num: &str,
        den: &str,
        min_ops: f64,
        cached: &Matrix,
        previous: &Matrix,
        timestamp_key: &str,
    ) -> Result<usize, MatrixError> {
        let (n, d) = self.pair(num, den)?;
        let keys: Vec<String> = self.instances.iter().map(|i| i.key().to_string()).collect();
        let (numerator, denominator) = self.metric_pair(n, d);

        let mut skips = 0;
        for (i, key) in keys.iter().enumerate() {
            if !numerator.is_recorded(i) {
                continue;
            }
            let nv = numerator.raw(i);
            let ok = match denominator.value(i) {
                Some(dv) if nv < 0.0 || dv < 0.0 => None,
                Some(dv) if dv < min_ops => None,
                Some(dv) if dv == 0.0 => {
                    sampled_twice(cached, previous, den, timestamp_key, key).then_some(0.0)
                }
                Some(dv) => Some(nv / dv),
                None => None,
            };
            match ok {
                Some(v) => numerator.set_value_f64(i, v),
                None => {
                    numerator.set_recorded(i, false);
                    skips += 1;
                    trace!(
                        metric = %num,
                        instance = %key,
                        numerator = nv,
                        denominator = ?denominator.value(i),
                        min_ops,
                        "threshold divide skipped"
                    );
                }
            }
        }
        Ok(skips)
    }

    /// Multiplies every recorded cell of `key` by `scalar`
    pub fn multiply_by_scalar(&mut self, key: &str, scalar: f64) -> Result<usize, MatrixError> {
        let pos = self.position(key)?;
        let metric = &mut self.metrics[pos];
        let mut skips = 0;
        for i in 0..metric.len() {
            if let Some(v) = metric.value(i) {
                if v < 0.0 {
                    metric.set_recorded(i, false);
                    skips += 1;
                } else {
                    metric.set_value_f64(i, v * scalar);
                }
            }
        }
        Ok(skips)
    }

    /// Marks every cell of `key` not-recorded and returns how many were recorded
    pub fn skip(&mut self, key: &str) -> Result<usize, MatrixError> {
        let pos = self.position(key)?;
        let metric = &mut self.metrics[pos];
        let skips = metric.recorded_count();
        metric.clear_recorded();
        Ok(skips)
    }
}

/// True if the raw `den` counter and a moving timestamp exist in both polls
fn sampled_twice(cached: &Matrix, previous: &Matrix, den: &str, timestamp_key: &str, instance: &str) -> bool {
    let both = |key: &str| match (cached.value(key, instance), previous.value(key, instance)) {
        (Some(now), Some(before)) => Some((now, before)),
        _ => None,
    };
    if both(den).is_none() {
        return false;
    }
    match both(timestamp_key) {
        Some((now, before)) => now > before,
        None => cached.metric(timestamp_key).is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{MetricType, With};

    fn matrix(rows: &[(&str, f64, f64, f64)]) -> Matrix {
        let mut m = Matrix::new("KeyPerf", "volume", "volume");
        for k in ["read_ops", "read_latency", "timestamp"] {
            m.new_metric(k, MetricType::Float64).unwrap();
        }
        for (key, ops, lat, ts) in rows {
            m.new_instance(key).unwrap();
            m.lazy_set_value("read_ops", key, *ops).unwrap();
            m.lazy_set_value("read_latency", key, *lat).unwrap();
            m.lazy_set_value("timestamp", key, *ts).unwrap();
        }
        m
    }

    #[test]
    fn test_delta_basic_and_negative() {
        let prev = matrix(&[("a", 1000.0, 50_000.0, 0.0), ("b", 300.0, 0.0, 0.0)]);
        let mut cur = matrix(&[("a", 2000.0, 150_000.0, 10.0), ("b", 100.0, 0.0, 10.0)]);
        let skips = cur.delta("read_ops", &prev).unwrap();
        assert_eq!(skips, 1);
        assert_eq!(cur.value("read_ops", "a"), Some(1000.0));
        assert_eq!(cur.value("read_ops", "b"), None);
    }

    #[test]
    fn test_delta_new_instance_and_unrecorded_previous() {
        let mut prev = matrix(&[("a", 10.0, 0.0, 0.0)]);
        prev.metric_mut("read_ops").unwrap().set_recorded(0, false);
        let mut cur = matrix(&[("a", 20.0, 0.0, 1.0), ("new", 5.0, 0.0, 1.0)]);
        assert_eq!(cur.delta("read_ops", &prev).unwrap(), 2);
        assert_eq!(cur.metric("read_ops").unwrap().recorded_count(), 0);
    }

    #[test]
    fn test_delta_missing_metric() {
        let prev = Matrix::new("KeyPerf", "volume", "volume");
        let mut cur = matrix(&[("a", 1.0, 1.0, 1.0)]);
        assert_eq!(
            cur.delta("read_ops", &prev),
            Err(MatrixError::NotFound("read_ops".into()))
        );
    }

    #[test]
    fn test_divide_zero_denominator() {
        let mut m = matrix(&[("a", 0.0, 10.0, 0.0), ("b", 5.0, 10.0, 0.0)]);
        let skips = m.divide("read_latency", "read_ops").unwrap();
        assert_eq!(skips, 1);
        assert_eq!(m.value("read_latency", "a"), None);
        assert_eq!(m.value("read_latency", "b"), Some(2.0));
    }

    #[test]
    fn test_divide_skips_only_fresh_cells() {
        let mut m = matrix(&[("a", 5.0, 10.0, 0.0)]);
        m.metric_mut("read_latency").unwrap().set_recorded(0, false);
        assert_eq!(m.divide("read_latency", "read_ops").unwrap(), 0);
        assert_eq!(
            m.divide("read_ops", "read_ops"),
            Err(MatrixError::SameMetric("read_ops".into()))
        );
    }

    #[test]
    fn test_divide_with_threshold() {
        let previous = matrix(&[("a", 0.0, 0.0, 0.0), ("b", 0.0, 0.0, 0.0)]);
        let cached = matrix(&[("a", 5.0, 500.0, 10.0), ("b", 1000.0, 100_000.0, 10.0)]);
        let mut cur = cached.clone_with(With::ALL).unwrap();
        for k in ["read_ops", "read_latency", "timestamp"] {
            cur.delta(k, &previous).unwrap();
        }
        let skips = cur
            .divide_with_threshold("read_latency", "read_ops", 10.0, &cached, &previous, "timestamp")
            .unwrap();
        assert_eq!(skips, 1);
        assert_eq!(cur.value("read_latency", "a"), None);
        assert_eq!(cur.value("read_latency", "b"), Some(100.0));
    }

    #[test]
    fn test_zero_delta_without_threshold() {
        let previous = matrix(&[("idle", 100.0, 900.0, 0.0), ("stale", 100.0, 900.0, 10.0)]);
        let cached = matrix(&[("idle", 100.0, 900.0, 10.0), ("stale", 100.0, 900.0, 10.0)]);
        let mut cur = cached.clone_with(With::ALL).unwrap();
        cur.delta("read_ops", &previous).unwrap();
        cur.delta("read_latency", &previous).unwrap();
        let skips = cur
            .divide_with_threshold("read_latency", "read_ops", 0.0, &cached, &previous, "timestamp")
            .unwrap();
        assert_eq!(cur.value("read_latency", "idle"), Some(0.0));
        assert_eq!(cur.value("read_latency", "stale"), None);
        assert_eq!(skips, 1);
    }

    #[test]
    fn test_multiply_and_skip() {
        let mut m = matrix(&[("a", 0.25, 1.0, 0.0), ("b", 0.5, 1.0, 0.0)]);
        m.metric_mut("read_ops").unwrap().set_recorded(1, false);
        assert_eq!(m.multiply_by_scalar("read_ops", 100.0).unwrap(), 0);
        assert_eq!(m.value("read_ops", "a"), Some(25.0));
        assert_eq!(m.value("read_ops", "b"), None);
        assert_eq!(m.skip("read_latency").unwrap(), 2);
        assert_eq!(m.metric("read_latency").unwrap().recorded_count(), 0);
    }
}

// Cook module - turns two raw samples into exportable performance metrics
//
// The cooker keeps the raw matrix of the last poll. Each call receives the
// raw matrix of the current poll, computes deltas, averages, percents and
// rates in place, applies the partial-aggregation policy and rotates the raw
// snapshot for the next call.

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::counters::TIMESTAMP;
use crate::error::MatrixError;
use crate::matrix::{Matrix, MetricType, Property, With};

/// Label added to partial instances when partial aggregation is allowed
pub const PARTIAL_LABEL: &str = "partial";

/// Default minimum ops per interval for latency counters
pub const DEFAULT_LATENCY_IO_REQD: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CookConfig {
    /// Latency counters are published only if their base delta reaches this
    pub latency_io_reqd: f64,
    /// Export partial instances with a `partial="true"` label
    pub allow_partial: bool,
    pub timestamp_key: String,
}

impl Default for CookConfig {
    fn default() -> Self {
        CookConfig {
            latency_io_reqd: DEFAULT_LATENCY_IO_REQD,
            allow_partial: false,
            timestamp_key: TIMESTAMP.to_string(),
        }
    }
}

/// Bookkeeping of one cooking pass, reported in collector metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookStats {
    pub skips: usize,
    pub instances: usize,
    pub partials: usize,
    pub calc_time: Duration,
}

#[derive(Debug)]
pub enum Cooked {
    /// No previous sample yet; nothing to export this cycle
    CacheCold,
    Ready(Matrix, CookStats),
}

#[derive(Debug)]
pub struct Cooker {
    config: CookConfig,
    previous: Matrix,
    cold: bool,
}

impl Cooker {
    pub fn new(config: CookConfig, schema: &Matrix) -> Self {
        Cooker {
            config,
            previous: schema.clone_with(With::SCHEMA).unwrap_or_else(|_| schema.clone()),
            cold: true,
        }
    }

    pub fn config(&self) -> &CookConfig {
        &self.config
    }

    /// Raw matrix of the last successful poll
    pub fn previous(&self) -> &Matrix {
        &self.previous
    }

    pub fn is_cold(&self) -> bool {
        self.cold
    }

    /// Forces the next poll to be treated as the first one
    pub fn mark_cold(&mut self) {
        self.cold = true;
    }

    /// Cooks `current` against the previous raw sample
    ///
    /// # Arguments
    /// * `current` - Raw matrix just collected; all metric properties set
    ///
    /// # Returns
    /// `Cooked::CacheCold` on the first poll, otherwise the cooked matrix
    /// and the pass statistics. The raw sample is kept for the next call in
    /// both cases.
    pub fn cook(&mut self, mut current: Matrix) -> Result<Cooked, MatrixError> {
        let start = Instant::now();
        let ts = self.config.timestamp_key.clone();

        for key in current.metric_keys() {
            if self.previous.metric(&key).is_none() {
                self.previous.new_metric(&key, MetricType::Float64)?;
            }
        }

        let cached = current.clone_with(With::ALL)?;

        if self.cold {
            debug!(object = %current.object(), "skip postprocessing until next poll (previous cache empty)");
            self.previous = cached;
            self.cold = false;
            return Ok(Cooked::CacheCold);
        }

        match current.metric_mut(&ts) {
            Some(timestamp) => timestamp.set_exportable(false),
            None => return Err(MatrixError::NotFound(ts)),
        }

        let (plain, based): (Vec<_>, Vec<_>) = current
            .metrics()
            .iter()
            .map(|m| (m.key().to_string(), m.name().to_string(), m.property(), m.comment().to_string()))
            .partition(|(_, _, property, _)| !property.needs_base());
        let ordered: Vec<_> = plain.into_iter().chain(based).collect();

        let mut skips = 0;
        for (key, name, property, base) in &ordered {
            match property {
                Property::Raw | Property::String => continue,
                Property::Unknown => {
                    error!(key = %key, "unknown property");
                    skips += current.skip(key)?;
                    continue;
                }
                _ => {}
            }

            match current.delta(key, &self.previous) {
                Ok(n) => skips += n,
                Err(err) => {
                    error!(key = %key, error = %err, "calculate delta");
                    continue;
                }
            }

            if !property.needs_base() {
                continue;
            }

            if base.is_empty() || current.metric(base).is_none() {
                warn!(key = %key, property = %property, denominator = %base, "base counter missing");
                skips += current.skip(key)?;
                continue;
            }

            let divided = if name.ends_with("latency") {
                current.divide_with_threshold(
                    key,
                    base,
                    self.config.latency_io_reqd,
                    &cached,
                    &self.previous,
                    &ts,
                )
            } else {
                current.divide(key, base)
            };
            match divided {
                Ok(n) => skips += n,
                Err(err) => {
                    error!(key = %key, error = %err, "division by base");
                    continue;
                }
            }

            if *property == Property::Percent {
                skips += current.multiply_by_scalar(key, 100.0)?;
            }
        }

        // rates last, so averages above consumed the plain deltas
        for (key, _, property, _) in &ordered {
            if *property != Property::Rate {
                continue;
            }
            match current.divide(key, &ts) {
                Ok(n) => skips += n,
                Err(err) => error!(key = %key, error = %err, "calculate rate"),
            }
        }

        let partials = self.apply_partial_policy(&mut current);

        let stats = CookStats {
            skips,
            instances: current.instances().len(),
            partials,
            calc_time: start.elapsed(),
        };
        self.previous = cached;
        Ok(Cooked::Ready(current, stats))
    }

    /// Hides metrics of partial instances and of instances that just became
    /// complete again; returns the number of partial instances
    fn apply_partial_policy(&self, current: &mut Matrix) -> usize {
        let mut partials = 0;
        let mut hidden = Vec::new();

        for inst in current.instances() {
            let was_partial = self
                .previous
                .instance(inst.key())
                .map(|p| p.is_partial())
                .unwrap_or(false);
            if inst.is_partial() {
                partials += 1;
                if !self.config.allow_partial {
                    hidden.push(inst.key().to_string());
                }
            } else if was_partial {
                debug!(instance = %inst.key(), "first complete sample after partial, suppressing");
                hidden.push(inst.key().to_string());
            }
        }

        if self.config.allow_partial {
            for inst in current.instances_mut() {
                if inst.is_partial() {
                    inst.set_label(PARTIAL_LABEL, "true");
                }
            }
        }

        for key in hidden {
            if let Err(err) = current.reset_instance(&key) {
                debug!(instance = %key, error = %err, "partial instance not reset");
            }
        }
        partials
    }
}

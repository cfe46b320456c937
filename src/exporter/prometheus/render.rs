// Exposition rendering - one matrix into Prometheus text lines
//
// Metric names are `<prefix><object>_<metric>`: the same metric name of two
// objects usually carries different label sets, which Prometheus rejects
// under one name. Every series is a gauge except flattened histograms.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace};

use super::histogram;
use crate::matrix::{Instance, Matrix};

#[derive(Debug, Clone, Default)]
pub struct Renderer {
    prefix: String,
    sort_labels: bool,
    add_meta_tags: bool,
}

/// Escapes a label value per the exposition format and renders `key="value"`
pub fn escape(key: &str, value: &str) -> String {
    let mut out = String::with_capacity(key.len() + value.len() + 3);
    out.push_str(key);
    out.push_str("=\"");
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn series_name(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}_{name}")
    }
}

fn join_labels(keys: &str, extra: &[String]) -> String {
    match (keys.is_empty(), extra.is_empty()) {
        (_, true) => keys.to_string(),
        (true, false) => extra.join(","),
        (false, false) => format!("{},{}", keys, extra.join(",")),
    }
}

impl Renderer {
    /// # Arguments
    /// * `prefix` - Global prefix; a trailing `_` is added when missing
    /// * `sort_labels` - Emit label keys in lexicographic order
    /// * `add_meta_tags` - Emit `# HELP` / `# TYPE` before the first series of a name
    pub fn new(prefix: Option<&str>, sort_labels: bool, add_meta_tags: bool) -> Self {
        let prefix = match prefix {
            Some(p) if !p.is_empty() && !p.ends_with('_') => format!("{p}_"),
            Some(p) => p.to_string(),
            None => String::new(),
        };
        Renderer {
            prefix,
            sort_labels,
            add_meta_tags,
        }
    }

    fn meta(&self, out: &mut Vec<String>, tagged: &mut HashSet<String>, name: &str, help: &str, kind: &str) {
        if self.add_meta_tags && tagged.insert(name.to_string()) {
            out.push(format!("# HELP {name} {help}"));
            out.push(format!("# TYPE {name} {kind}"));
        }
    }

    /// Labels of one instance, or `None` if the instance must be skipped
    fn instance_keys(&self, data: &Matrix, instance: &Instance, global: &[String]) -> Option<(Vec<String>, Vec<String>)> {
        let options = data.export_options();
        let mut keys = global.to_vec();
        let mut labels = Vec::new();

        if options.all_labels() {
            for (k, v) in instance.labels() {
                if !data.global_labels().contains_key(k) {
                    keys.push(escape(k, v));
                }
            }
            return Some((keys, labels));
        }

        let mut found = false;
        for k in &options.instance_keys {
            let value = instance.label(k).unwrap_or_default();
            found |= !value.is_empty();
            keys.push(escape(k, value));
        }
        if !found && options.require_instance_keys {
            trace!(instance = %instance.key(), "skip instance, no keys");
            return None;
        }
        for l in &options.instance_labels {
            let kv = escape(l, instance.label(l).unwrap_or_default());
            if !labels.contains(&kv) {
                labels.push(kv);
            }
        }
        Some((keys, labels))
    }

    /// Renders every exportable, recorded cell of `data`
    pub fn render(&self, data: &Matrix) -> Vec<String> {
        let base = if data.object().is_empty() {
            self.prefix.trim_end_matches('_').to_string()
        } else {
            format!("{}{}", self.prefix, data.object())
        };
        let global: Vec<String> = data.global_labels().iter().map(|(k, v)| escape(k, v)).collect();

        let mut out = Vec::new();
        let mut tagged = HashSet::new();
        let mut exported = 0;

        for (i, instance) in data.instances().iter().enumerate() {
            if !instance.is_exportable() {
                continue;
            }
            let Some((mut keys, labels)) = self.instance_keys(data, instance, &global) else {
                continue;
            };
            exported += 1;

            if !labels.is_empty() {
                let mut all = labels;
                for k in &keys {
                    if !all.contains(k) {
                        all.push(k.clone());
                    }
                }
                if self.sort_labels {
                    all.sort();
                }
                let name = series_name(&base, "labels");
                let help = format!("Pseudo-metric for {} labels", data.object());
                self.meta(&mut out, &mut tagged, &name, &help, "gauge");
                out.push(format!("{name}{{{}}} 1.0", all.join(",")));
            }

            if self.sort_labels {
                keys.sort();
            }
            let joined = keys.join(",");
            let help = format!("Metric for {}", data.object());
            // histogram root -> bucket values in bucket order
            let mut histograms: BTreeMap<&str, Vec<Option<f64>>> = BTreeMap::new();

            for metric in data.metrics() {
                if !metric.is_exportable() {
                    continue;
                }
                let Some(value) = metric.format_value(i) else {
                    continue;
                };

                if let Some(bucket) = metric.bucket() {
                    let Some(root) = data.metric(&bucket.root) else {
                        debug!(metric = %metric.key(), "histogram root missing, skip");
                        continue;
                    };
                    let len = root.buckets().map(|b| b.len()).unwrap_or_default();
                    let slots = histograms
                        .entry(bucket.root.as_str())
                        .or_insert_with(|| vec![None; len]);
                    if let Some(slot) = slots.get_mut(bucket.index) {
                        *slot = metric.value(i);
                    }
                    continue;
                }

                let name = series_name(&base, metric.name());
                self.meta(&mut out, &mut tagged, &name, &help, "gauge");
                let mut extra: Vec<String> = metric.labels().iter().map(|(k, v)| escape(k, v)).collect();
                if self.sort_labels {
                    extra.sort();
                }
                out.push(format!("{name}{{{}}} {value}", join_labels(&joined, &extra)));
            }

            for (root_key, values) in histograms {
                let Some(root) = data.metric(root_key) else {
                    continue;
                };
                let Some(buckets) = root.buckets() else {
                    continue;
                };
                // a histogram with a skipped bucket is left out entirely
                let Some(values) = values.into_iter().collect::<Option<Vec<f64>>>() else {
                    continue;
                };
                let name = series_name(&base, root.name());
                self.meta(&mut out, &mut tagged, &name, &help, "histogram");

                match histogram::normalize(buckets) {
                    Some(les) => {
                        let bounds: Vec<f64> = les.iter().map(|(_, b)| *b).collect();
                        let (cumulative, count, sum) = histogram::accumulate(&values, &bounds);
                        for ((le, _), value) in les.iter().zip(cumulative) {
                            let le = [format!("le=\"{le}\"")];
                            out.push(format!("{name}_bucket{{{}}} {value}", join_labels(&joined, &le)));
                        }
                        out.push(format!("{name}_count{{{joined}}} {count}"));
                        out.push(format!("{name}_sum{{{joined}}} {sum}"));
                    }
                    None => {
                        for (bucket, value) in buckets.iter().zip(values) {
                            let label = [escape("metric", bucket)];
                            out.push(format!("{name}{{{}}} {value}", join_labels(&joined, &label)));
                        }
                    }
                }
            }
        }

        debug!(
            object = %data.object(),
            "rendered {} lines from {} instances",
            out.len(),
            exported
        );
        out
    }
}

// Aggregator plugin - sums instances grouped by a label into new matrices
//
// Rule syntax, one per line:
//
//   label[<[check_label=]value|`regex`>[object]] [label1,label2|...]
//
// `node` groups volumes by their node label into `node_volume`;
// `node<>volume_node` does the same but names the object explicitly;
// `node<type=rw>` keeps only instances whose `type` is `rw`;
// a trailing `...` keys the aggregate by all labels of the source instance.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, trace, warn};

use super::{rules, Plugin, PluginOutput};
use crate::collector::{CollectorContext, DataMap};
use crate::config::PluginSpec;
use crate::error::PollError;
use crate::matrix::{ExportOptions, Instance, Matrix, Property, With};

pub const NAME: &str = "Aggregator";

#[derive(Debug)]
enum Check {
    None,
    Equals { label: String, value: String },
    Matches { label: String, regex: Regex },
}

#[derive(Debug)]
enum Grouping {
    Label,
    Include(Vec<String>),
    AllLabels,
}

#[derive(Debug)]
struct Rule {
    label: String,
    object: Option<String>,
    check: Check,
    grouping: Grouping,
}

impl Rule {
    fn parse(line: &str) -> Result<Rule, PollError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields.len() > 2 {
            return Err(PollError::InvalidParam(format!("aggregation rule: [{line}]")));
        }

        let (label, rest) = match fields[0].split_once('<') {
            Some((label, rest)) => (label.trim(), Some(rest)),
            None => (fields[0].trim(), None),
        };
        if label.is_empty() {
            return Err(PollError::InvalidParam(format!("aggregation rule without label: [{line}]")));
        }

        let mut check = Check::None;
        let mut object = None;
        if let Some(rest) = rest {
            let (inner, suffix) = rest.split_once('>').unwrap_or((rest, ""));
            let (check_label, value) = match inner.split_once('=') {
                Some((l, v)) => (l.to_string(), v),
                None => (label.to_string(), inner),
            };
            if let Some(pattern) = value.strip_prefix('`') {
                let pattern = pattern.strip_suffix('`').unwrap_or(pattern);
                let regex = Regex::new(pattern)
                    .map_err(|e| PollError::InvalidParam(format!("rule [{line}]: {e}")))?;
                check = Check::Matches {
                    label: check_label,
                    regex,
                };
            } else if !value.is_empty() {
                check = Check::Equals {
                    label: check_label,
                    value: value.to_string(),
                };
            }
            if !suffix.is_empty() {
                object = Some(suffix.to_lowercase());
            }
        }

        let grouping = match fields.get(1).map(|f| f.trim()) {
            None => Grouping::Label,
            Some("...") => Grouping::AllLabels,
            Some(list) => Grouping::Include(list.split(',').map(str::to_string).collect()),
        };

        Ok(Rule {
            label: label.to_string(),
            object,
            check,
            grouping,
        })
    }

    fn accepts(&self, instance: &Instance) -> bool {
        match &self.check {
            Check::None => true,
            Check::Equals { label, value } => instance.label(label).unwrap_or_default() == value,
            Check::Matches { label, regex } => regex.is_match(instance.label(label).unwrap_or_default()),
        }
    }

    /// Key of the aggregate row an instance contributes to
    fn group_key(&self, name: &str, instance: &Instance) -> String {
        match &self.grouping {
            Grouping::Label => name.to_string(),
            Grouping::AllLabels => instance
                .labels()
                .values()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("."),
            Grouping::Include(labels) => {
                let mut key = name.to_string();
                for l in labels {
                    key.push('.');
                    key.push_str(instance.label(l).unwrap_or_default());
                }
                key
            }
        }
    }

    fn label_group(&self, group: &mut Instance, name: &str, source: &Instance) {
        match &self.grouping {
            Grouping::AllLabels => {
                group.set_labels(source.labels().iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
            Grouping::Include(labels) => {
                for l in labels {
                    group.set_label(l, source.label(l).unwrap_or_default());
                }
                group.set_label(&self.label, name);
            }
            Grouping::Label => group.set_label(&self.label, name),
        }
    }
}

pub struct Aggregator {
    object: String,
    rules: Vec<Rule>,
}

impl Aggregator {
    pub fn new(object: &str, lines: &[String]) -> Result<Self, PollError> {
        let rules = lines
            .iter()
            .map(|line| Rule::parse(line))
            .collect::<Result<Vec<_>, _>>()?;
        if rules.is_empty() {
            return Err(PollError::MissingParam("aggregation rules".to_string()));
        }
        debug!(object, "parsed {} aggregation rules", rules.len());
        Ok(Aggregator {
            object: object.to_string(),
            rules,
        })
    }

    pub fn build(spec: &PluginSpec, ctx: &CollectorContext) -> Result<Box<dyn Plugin>, PollError> {
        Ok(Box::new(Aggregator::new(&ctx.object, rules(spec, "rules"))?))
    }

    fn aggregate(&self, rule: &Rule, data: &Matrix) -> Result<(Matrix, usize), PollError> {
        let mut out = data.clone_with(With {
            data: false,
            metrics: true,
            instances: false,
            exportable: true,
            partial: false,
        })?;
        match &rule.object {
            Some(object) => out.set_object(object),
            None => out.set_object(&format!("{}_{}", rule.label.to_lowercase(), data.object())),
        }
        out.set_uuid(&format!("{}.{}", data.uuid(), NAME));
        out.set_export_options(ExportOptions::default());
        out.set_exportable(true);

        // contributions per (row, metric) for averaging
        let mut counts: HashMap<(usize, usize), u32> = HashMap::new();
        let mut written = 0;

        for (i, instance) in data.instances().iter().enumerate() {
            if !instance.is_exportable() {
                continue;
            }
            let name = match instance.label(&rule.label) {
                Some(name) if !name.is_empty() => name,
                _ => {
                    warn!(label = %rule.label, instance = %instance.key(), "label missing, skipped");
                    continue;
                }
            };
            if !rule.accepts(instance) {
                continue;
            }

            let key = rule.group_key(name, instance);
            trace!(instance = %instance.key(), group = %key, "aggregating");
            if out.instance(&key).is_none() {
                let group = out.new_instance(&key)?;
                rule.label_group(group, name, instance);
            }
            let row = out.instance_index(&key).unwrap_or_default();

            for (m, metric) in data.metrics().iter().enumerate() {
                let Some(value) = metric.value(i) else {
                    continue;
                };
                if let Some(target) = out.metric_mut(metric.key()) {
                    target.add_value_f64(row, value);
                    *counts.entry((row, m)).or_default() += 1;
                    written += 1;
                }
            }
        }

        for (m, metric) in out.metrics_mut().enumerate() {
            if !is_average(metric.property(), metric.name()) {
                continue;
            }
            for row in 0..metric.len() {
                if let (Some(value), Some(&count)) = (metric.value(row), counts.get(&(row, m))) {
                    metric.set_value_f64(row, value / f64::from(count));
                }
            }
        }

        Ok((out, written))
    }
}

fn is_average(property: Property, name: &str) -> bool {
    matches!(property, Property::Average | Property::Percent)
        || name.contains("average_")
        || name.contains("avg_")
        || name.contains("_latency")
}

impl Plugin for Aggregator {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&mut self, data: &mut DataMap) -> Result<PluginOutput, PollError> {
        let Some(source) = data.get(&self.object) else {
            debug!(object = %self.object, "no data to aggregate");
            return Ok(PluginOutput::default());
        };

        let mut output = PluginOutput::default();
        for rule in &self.rules {
            let (matrix, written) = self.aggregate(rule, source)?;
            output.instances += matrix.instances().len();
            output.metrics += written;
            output.matrices.push(matrix);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MetricType;

    fn volumes() -> DataMap {
        let mut m = Matrix::new("ZapiPerf", "volume", "ZapiPerf:volume");
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.new_metric("read_latency", MetricType::Float64)
            .unwrap()
            .set_property(Property::Average);
        let rows = [
            ("vol1", "node1", "rw", 10.0, 100.0),
            ("vol2", "node1", "dp", 30.0, 300.0),
            ("vol3", "node2", "rw", 5.0, 50.0),
        ];
        for (key, node, kind, ops, lat) in rows {
            let inst = m.new_instance(key).unwrap();
            inst.set_labels([("node", node), ("type", kind), ("volume", key)]);
            m.lazy_set_value("read_ops", key, ops).unwrap();
            m.lazy_set_value("read_latency", key, lat).unwrap();
        }
        let mut data = DataMap::new();
        data.insert("volume".to_string(), m);
        data
    }

    fn run(lines: &[&str], data: &mut DataMap) -> PluginOutput {
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        Aggregator::new("volume", &lines).unwrap().run(data).unwrap()
    }

    #[test]
    fn test_sum_and_average_by_label() {
        let mut data = volumes();
        let out = run(&["node"], &mut data);
        assert_eq!(out.matrices.len(), 1);
        let agg = &out.matrices[0];
        assert_eq!(agg.object(), "node_volume");
        assert_eq!(agg.uuid(), "ZapiPerf.Aggregator");
        assert_eq!(agg.instance_keys(), ["node1", "node2"]);
        assert_eq!(agg.value("read_ops", "node1"), Some(40.0));
        assert_eq!(agg.value("read_latency", "node1"), Some(200.0));
        assert_eq!(agg.value("read_ops", "node2"), Some(5.0));
        assert_eq!(agg.instance("node1").unwrap().label("node"), Some("node1"));
        assert_eq!(out.instances, 2);
    }

    #[test]
    fn test_check_value_and_object() {
        let mut data = volumes();
        let out = run(&["node<type=rw>rw_node"], &mut data);
        let agg = &out.matrices[0];
        assert_eq!(agg.object(), "rw_node");
        assert_eq!(agg.value("read_ops", "node1"), Some(10.0));
        assert_eq!(agg.value("read_ops", "node2"), Some(5.0));
    }

    #[test]
    fn test_check_regex_and_include_labels() {
        let mut data = volumes();
        let out = run(&["node<type=`^d`> type"], &mut data);
        let agg = &out.matrices[0];
        assert_eq!(agg.instance_keys(), ["node1.dp"]);
        let inst = agg.instance("node1.dp").unwrap();
        assert_eq!(inst.label("type"), Some("dp"));
        assert_eq!(inst.label("node"), Some("node1"));
    }

    #[test]
    fn test_skips_hidden_and_unrecorded() {
        let mut data = volumes();
        {
            let m = data.get_mut("volume").unwrap();
            m.instance_mut("vol2").unwrap().set_exportable(false);
            let idx = m.instance_index("vol3").unwrap();
            m.metric_mut("read_latency").unwrap().set_recorded(idx, false);
        }
        let out = run(&["node"], &mut data);
        let agg = &out.matrices[0];
        assert_eq!(agg.value("read_ops", "node1"), Some(10.0));
        assert_eq!(agg.value("read_latency", "node2"), None);
    }

    #[test]
    fn test_invalid_rules() {
        assert!(Aggregator::new("volume", &[]).is_err());
        assert!(Aggregator::new("volume", &["a b c".to_string()]).is_err());
        assert!(Aggregator::new("volume", &["node<type=`(`>".to_string()]).is_err());
    }

    #[test]
    fn test_missing_object_is_noop() {
        let mut data = DataMap::new();
        let out = run(&["node"], &mut data);
        assert!(out.matrices.is_empty());
    }
}

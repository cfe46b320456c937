// LabelAgent plugin - rewrites instance labels in place
//
// Rule kinds are applied in a fixed order: split, join, replace,
// exclude_equals, exclude_contains, value_to_num. Malformed rules are
// logged and dropped; the plugin fails to build only if no rule survives.

use tracing::{debug, warn};

use super::{rules, Plugin, PluginOutput};
use crate::collector::{CollectorContext, DataMap};
use crate::config::PluginSpec;
use crate::error::PollError;
use crate::matrix::{Matrix, MetricType};

pub const NAME: &str = "LabelAgent";

/// `source `sep` target1,target2`
#[derive(Debug, Clone, PartialEq)]
struct SplitRule {
    source: String,
    sep: String,
    targets: Vec<String>,
}

/// `target `sep` source1,source2`
#[derive(Debug, Clone, PartialEq)]
struct JoinRule {
    target: String,
    sep: String,
    sources: Vec<String>,
}

/// `source target `old` `new``
#[derive(Debug, Clone, PartialEq)]
struct ReplaceRule {
    source: String,
    target: String,
    old: String,
    new: String,
}

/// `label `value``
#[derive(Debug, Clone, PartialEq)]
struct ExcludeRule {
    label: String,
    value: String,
}

/// `metric label value1 value2 [`default`]`
#[derive(Debug, Clone, PartialEq)]
struct ValueToNumRule {
    metric: String,
    label: String,
    matches: Vec<String>,
    default: Option<u8>,
}

/// Splits a rule on backticks: plain text outside, quoted text inside
fn quoted(rule: &str) -> Vec<&str> {
    rule.split('`').collect()
}

fn names(list: &str) -> Vec<String> {
    list.split(',').map(|s| s.trim().to_string()).collect()
}

fn parse_split(rule: &str) -> Option<SplitRule> {
    match quoted(rule)[..] {
        [source, sep, targets] if !source.trim().is_empty() && !sep.is_empty() => Some(SplitRule {
            source: source.trim().to_string(),
            sep: sep.to_string(),
            targets: names(targets.trim()),
        }),
        _ => None,
    }
}

fn parse_join(rule: &str) -> Option<JoinRule> {
    match quoted(rule)[..] {
        [target, sep, sources] if !target.trim().is_empty() => Some(JoinRule {
            target: target.trim().to_string(),
            sep: sep.to_string(),
            sources: names(sources.trim()),
        }),
        _ => None,
    }
}

fn parse_replace(rule: &str) -> Option<ReplaceRule> {
    match quoted(rule)[..] {
        [labels, old, between, new, tail] if between.trim().is_empty() && tail.trim().is_empty() => {
            let labels: Vec<&str> = labels.split_whitespace().collect();
            match labels[..] {
                [source, target] => Some(ReplaceRule {
                    source: source.to_string(),
                    target: target.to_string(),
                    old: old.to_string(),
                    new: new.to_string(),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_exclude(rule: &str) -> Option<ExcludeRule> {
    match quoted(rule)[..] {
        [label, value, tail] if !label.trim().is_empty() && tail.trim().is_empty() => Some(ExcludeRule {
            label: label.trim().to_string(),
            value: value.to_string(),
        }),
        _ => None,
    }
}

fn parse_value_to_num(rule: &str) -> Option<ValueToNumRule> {
    let fields: Vec<&str> = rule.split_whitespace().collect();
    if fields.len() != 4 && fields.len() != 5 {
        return None;
    }
    let default = match fields.get(4) {
        Some(raw) => Some(raw.trim_matches('`').parse::<u8>().ok()?),
        None => None,
    };
    // '-' lists several accepted values in one slot
    let matches = fields[2]
        .split('-')
        .chain(fields[3].split('-'))
        .map(str::to_string)
        .collect();
    Some(ValueToNumRule {
        metric: fields[0].to_string(),
        label: fields[1].to_string(),
        matches,
        default,
    })
}

fn parse_all<T>(spec: &PluginSpec, kind: &str, parse: fn(&str) -> Option<T>) -> Vec<T> {
    rules(spec, kind)
        .iter()
        .filter_map(|rule| {
            let parsed = parse(rule.trim());
            if parsed.is_none() {
                warn!(kind, rule = %rule, "invalid label rule, dropped");
            }
            parsed
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct LabelAgent {
    split: Vec<SplitRule>,
    join: Vec<JoinRule>,
    replace: Vec<ReplaceRule>,
    exclude_equals: Vec<ExcludeRule>,
    exclude_contains: Vec<ExcludeRule>,
    value_to_num: Vec<ValueToNumRule>,
}

impl LabelAgent {
    pub fn from_spec(spec: &PluginSpec) -> Result<Self, PollError> {
        let agent = LabelAgent {
            split: parse_all(spec, "split", parse_split),
            join: parse_all(spec, "join", parse_join),
            replace: parse_all(spec, "replace", parse_replace),
            exclude_equals: parse_all(spec, "exclude_equals", parse_exclude),
            exclude_contains: parse_all(spec, "exclude_contains", parse_exclude),
            value_to_num: parse_all(spec, "value_to_num", parse_value_to_num),
        };
        let count = agent.rule_count();
        if count == 0 {
            return Err(PollError::MissingParam("label rules".to_string()));
        }
        debug!("parsed {} label rules", count);
        Ok(agent)
    }

    pub fn build(spec: &PluginSpec, _ctx: &CollectorContext) -> Result<Box<dyn Plugin>, PollError> {
        Ok(Box::new(LabelAgent::from_spec(spec)?))
    }

    fn rule_count(&self) -> usize {
        self.split.len()
            + self.join.len()
            + self.replace.len()
            + self.exclude_equals.len()
            + self.exclude_contains.len()
            + self.value_to_num.len()
    }

    fn apply_labels(&self, matrix: &mut Matrix) {
        for instance in matrix.instances_mut() {
            for r in &self.split {
                let value = instance.label(&r.source).unwrap_or_default().to_string();
                let values: Vec<&str> = value.split(r.sep.as_str()).collect();
                if values.len() < r.targets.len() {
                    continue;
                }
                for (target, value) in r.targets.iter().zip(values) {
                    if !target.is_empty() && !value.is_empty() {
                        instance.set_label(target, value);
                    }
                }
            }

            for r in &self.join {
                let values: Vec<String> = r
                    .sources
                    .iter()
                    .filter_map(|s| instance.label(s))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                if !values.is_empty() {
                    instance.set_label(&r.target, &values.join(&r.sep));
                }
            }

            for r in &self.replace {
                let old = instance.label(&r.source).unwrap_or_default();
                if old.is_empty() {
                    continue;
                }
                let value = old.replace(&r.old, &r.new);
                if value != old {
                    instance.set_label(&r.target, &value);
                }
            }

            let label = |name: &str| instance.label(name).unwrap_or_default();
            let excluded = self.exclude_equals.iter().any(|r| label(&r.label) == r.value)
                || self.exclude_contains.iter().any(|r| label(&r.label).contains(&r.value));
            if excluded {
                instance.set_exportable(false);
            }
        }
    }

    fn map_values(&self, matrix: &mut Matrix) -> Result<usize, PollError> {
        let mut written = 0;
        for r in &self.value_to_num {
            let cells: Vec<Option<f64>> = matrix
                .instances()
                .iter()
                .map(|inst| {
                    let value = inst.label(&r.label).unwrap_or_default();
                    if r.matches.iter().any(|m| m == value) {
                        Some(1.0)
                    } else {
                        r.default.map(f64::from)
                    }
                })
                .collect();

            if matrix.metric(&r.metric).is_none() {
                matrix.new_metric(&r.metric, MetricType::Uint8)?;
            }
            if let Some(metric) = matrix.metric_mut(&r.metric) {
                for (i, cell) in cells.into_iter().enumerate() {
                    if let Some(v) = cell {
                        metric.set_value_f64(i, v);
                        written += 1;
                    }
                }
            }
        }
        Ok(written)
    }
}

impl Plugin for LabelAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&mut self, data: &mut DataMap) -> Result<PluginOutput, PollError> {
        let mut output = PluginOutput::default();
        for matrix in data.values_mut() {
            self.apply_labels(matrix);
            output.instances += matrix.instances().len();
            output.metrics += self.map_values(matrix)?;
        }
        Ok(output)
    }
}

// InfluxDB exporter - one line-protocol measurement per instance, pushed inline
//
// Writes happen on the collector's task; nothing runs in the background.
// A failed POST is reported to the caller and not retried here, the next
// data poll sends fresh values anyway.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Exporter, ExporterMetadata, ExporterStatus};
use crate::config::{ExporterKind, ExporterSpec};
use crate::error::ExportError;
use crate::matrix::{Matrix, MetricType};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Field names that clash with label names or are reserved by InfluxDB
const PROTECTED_FIELDS: [(&str, &str); 5] = [
    ("status", "status_code"),
    ("new_status", "new_status_code"),
    ("time", "harvest_time"),
    ("_measurement", "harvest_measurement"),
    ("_field", "harvest_field"),
];

fn protected(name: &str) -> &str {
    PROTECTED_FIELDS
        .iter()
        .find(|(from, _)| *from == name)
        .map(|(_, to)| *to)
        .unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}i"),
            FieldValue::UInt(v) => write!(f, "{v}u"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(v) => {
                f.write_str("\"")?;
                for c in v.chars() {
                    match c {
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

/// Escapes keys, tag values and the measurement name
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\ "),
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits on `sep` outside escapes and, when `quotes` is set, outside double quotes
fn split_unescaped(s: &str, sep: char, quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quotes => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_pair(s: &str) -> Option<(&str, &str)> {
    let mut parts = split_unescaped(s, '=', true);
    if parts.len() < 2 {
        return None;
    }
    let key = parts.remove(0);
    Some((key, &s[key.len() + 1..]))
}

/// One line of line protocol
///
/// # Example
/// ```text
/// weather,location=us\,midwest temperature=82,humidity=71i 1465839830100400200
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: Option<i64>,
}

impl Measurement {
    pub fn new(name: &str) -> Self {
        Measurement {
            name: name.to_string(),
            ..Measurement::default()
        }
    }

    pub fn add_tag(&mut self, key: &str, value: &str) {
        self.tags.push((key.to_string(), value.to_string()));
    }

    pub fn add_field(&mut self, key: &str, value: FieldValue) {
        self.fields.push((key.to_string(), value));
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn render(&self) -> String {
        let mut line = escape(&self.name);
        for (k, v) in &self.tags {
            line.push(',');
            line.push_str(&escape(k));
            line.push('=');
            line.push_str(&escape(v));
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), v))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));
        if let Some(ts) = self.timestamp {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        line
    }

    /// Parses one rendered line back into a measurement
    pub fn parse(line: &str) -> Result<Self, ExportError> {
        let malformed = |what: &str| ExportError::Malformed(format!("{what}: {line}"));
        let sections = split_unescaped(line.trim_end_matches('\n'), ' ', true);
        if !(2..=3).contains(&sections.len()) {
            return Err(malformed("expected 2 or 3 sections"));
        }

        let mut head = split_unescaped(sections[0], ',', false).into_iter();
        let name = head.next().filter(|n| !n.is_empty()).ok_or_else(|| malformed("no measurement"))?;
        let mut m = Measurement::new(&unescape(name));
        for tag in head {
            let (k, v) = split_pair(tag).ok_or_else(|| malformed("bad tag"))?;
            m.add_tag(&unescape(k), &unescape(v));
        }

        for field in split_unescaped(sections[1], ',', true) {
            let (k, v) = split_pair(field).ok_or_else(|| malformed("bad field"))?;
            m.add_field(&unescape(k), parse_field(v).ok_or_else(|| malformed("bad field value"))?);
        }

        if let Some(ts) = sections.get(2) {
            m.timestamp = Some(ts.parse().map_err(|_| malformed("bad timestamp"))?);
        }
        Ok(m)
    }
}

fn parse_field(v: &str) -> Option<FieldValue> {
    if let Some(inner) = v.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => out.push(chars.next()?),
                c => out.push(c),
            }
        }
        return Some(FieldValue::Str(out));
    }
    match v {
        "t" | "T" | "true" | "True" | "TRUE" => return Some(FieldValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Some(FieldValue::Bool(false)),
        _ => {}
    }
    if let Some(i) = v.strip_suffix('i') {
        return i.parse().ok().map(FieldValue::Int);
    }
    if let Some(u) = v.strip_suffix('u') {
        return u.parse().ok().map(FieldValue::UInt);
    }
    v.parse().ok().map(FieldValue::Float)
}

/// Timestamp precision of written points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl Precision {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "s" => Some(Precision::Seconds),
            "ms" => Some(Precision::Millis),
            "us" => Some(Precision::Micros),
            "ns" => Some(Precision::Nanos),
            _ => None,
        }
    }

    pub fn now(self) -> i64 {
        let now = Utc::now();
        match self {
            Precision::Seconds => now.timestamp(),
            Precision::Millis => now.timestamp_millis(),
            Precision::Micros => now.timestamp_micros(),
            Precision::Nanos => now.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

pub struct Influx {
    name: String,
    url: Url,
    token: Option<String>,
    content_type: String,
    precision: Option<Precision>,
    client: Client,
    metadata: Mutex<ExporterMetadata>,
    status: Mutex<(ExporterStatus, String)>,
}

impl Influx {
    /// # Returns
    /// * `Err(ExportError::MissingParam)` - No url configured
    /// * `Err(ExportError::InvalidParam)` - Unparsable url or unknown precision
    pub fn new(spec: &ExporterSpec, poller: &str) -> Result<Self, ExportError> {
        let raw = spec
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ExportError::MissingParam(format!("url of exporter {}", spec.name)))?;
        let mut url = Url::parse(raw).map_err(|e| ExportError::InvalidParam(format!("url {raw}: {e}")))?;

        let precision = match spec.precision.as_deref() {
            Some(p) => {
                let precision = Precision::parse(p)
                    .ok_or_else(|| ExportError::InvalidParam(format!("precision {p}")))?;
                url.query_pairs_mut().append_pair("precision", p);
                Some(precision)
            }
            None => None,
        };

        let client = Client::builder().timeout(spec.timeout).build()?;
        debug!(exporter = %spec.name, url = %url, timeout = ?spec.timeout, "influx exporter initialized");

        Ok(Influx {
            name: spec.name.clone(),
            url,
            token: spec.token.clone(),
            content_type: spec.content_type.clone().unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            precision,
            client,
            metadata: Mutex::new(ExporterMetadata::new(&spec.name, "InfluxDB", poller)),
            status: Mutex::new((ExporterStatus::Up, "initialized".to_string())),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Renders every exportable instance of `data`
    ///
    /// # Returns
    /// Lines and the number of data points they carry
    pub fn render(&self, data: &Matrix) -> (Vec<String>, usize) {
        let options = data.export_options();
        let timestamp = self.precision.map(Precision::now);
        let mut lines = Vec::new();
        let mut count = 0;

        for (i, instance) in data.instances().iter().enumerate() {
            if !instance.is_exportable() {
                continue;
            }
            let mut m = Measurement::new(data.object());
            m.timestamp = timestamp;
            for (k, v) in data.global_labels().iter().filter(|(_, v)| !v.is_empty()) {
                m.add_tag(k, v);
            }
            if options.all_labels() {
                for (k, v) in instance.labels() {
                    if !v.is_empty() {
                        m.add_tag(k, v);
                    }
                }
            } else {
                for k in &options.instance_keys {
                    if let Some(v) = instance.label(k).filter(|v| !v.is_empty()) {
                        m.add_tag(k, v);
                    }
                }
            }

            for label in &options.instance_labels {
                match instance.label(label) {
                    Some("true") => m.add_field(label, FieldValue::Bool(true)),
                    Some("false") => m.add_field(label, FieldValue::Bool(false)),
                    Some(v) if !v.is_empty() => m.add_field(label, FieldValue::Str(v.to_string())),
                    _ => {}
                }
            }

            for metric in data.metrics() {
                if !metric.is_exportable() {
                    continue;
                }
                let Some(value) = metric.value(i) else {
                    continue;
                };
                let mut name = metric.name().to_string();
                for v in metric.labels().values() {
                    name.push('_');
                    name.push_str(v);
                }
                let value = match metric.mtype() {
                    MetricType::Float64 => FieldValue::Float(value),
                    MetricType::Int64 => FieldValue::Int(value as i64),
                    MetricType::Uint8 | MetricType::Uint64 => FieldValue::UInt(value as u64),
                };
                m.add_field(protected(&name), value);
            }

            if !m.has_fields() {
                trace!(instance = %instance.key(), "skip instance, no fields");
                continue;
            }
            count += m.fields.len();
            lines.push(m.render());
        }
        debug!(object = %data.object(), points = count, "rendered {} measurements", lines.len());
        (lines, count)
    }

    async fn emit(&self, lines: &[String]) -> Result<(), ExportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, &self.content_type)
            .body(lines.join("\n"));
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Token {token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Exporter for Influx {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExporterKind {
        ExporterKind::InfluxDb
    }

    fn status(&self) -> (ExporterStatus, String) {
        self.status.lock().clone()
    }

    async fn export(&self, data: &Matrix) -> Result<(), ExportError> {
        let start = Instant::now();
        let (lines, count) = self.render(data);
        self.metadata.lock().set("render", start.elapsed(), count);
        if lines.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.emit(&lines).await {
            warn!(exporter = %self.name, object = %data.object(), uuid = %data.uuid(), error = %e, "failed to emit metrics");
            self.status.lock().1 = e.to_string();
            return Err(e);
        }
        debug!(exporter = %self.name, object = %data.object(), points = count, "exported");
        self.status.lock().1 = "running".to_string();

        let own = {
            let mut metadata = self.metadata.lock();
            metadata.set("export", start.elapsed(), count);
            metadata.matrix().clone()
        };
        let (own, _) = self.render(&own);
        if let Err(e) = self.emit(&own).await {
            debug!(exporter = %self.name, error = %e, "failed to emit exporter metadata");
        }
        Ok(())
    }
}

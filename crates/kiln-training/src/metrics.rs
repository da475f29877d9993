//! Structured metric samples parsed out of raw training output.
//!
//! Three line shapes are recognized: `[METRICS] key=value, ...` lines, JSON
//! object lines and free-form text such as `step: 10, loss: 0.42`. Anything
//! else is skipped. A malformed field never discards the rest of its line.

use crate::checkpoint::MetricSnapshot;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

const METRICS_TAG: &str = "[METRICS]";

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI escape regex should be valid")
});

static FREEFORM_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)step\s*[:=]\s*([^\s,;|]+)").expect("step regex should be valid"));

static FREEFORM_LOSS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)loss\s*[:=]\s*([^\s,;|]+)").expect("loss regex should be valid"));

static FREEFORM_LR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:learning.rate|\blr)\s*[:=]\s*([^\s,;|]+)").expect("learning rate regex should be valid")
});

static FREEFORM_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)progress\s*[:=]?\s*([^\s,;|]+)").expect("progress regex should be valid")
});

/// One structured progress observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default)]
    pub step: Option<u64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    #[must_use]
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            step: None,
            loss: None,
            learning_rate: None,
            progress: None,
            tokens: None,
            extra: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn has_fields(&self) -> bool {
        self.step.is_some()
            || self.loss.is_some()
            || self.learning_rate.is_some()
            || self.progress.is_some()
            || self.tokens.is_some()
            || !self.extra.is_empty()
    }

    /// Named metric values of this sample, `step` excluded.
    pub fn snapshot(&self) -> MetricSnapshot {
        let mut snapshot = self.extra.clone();
        if let Some(loss) = self.loss {
            snapshot.insert("loss".to_string(), loss);
        }
        if let Some(lr) = self.learning_rate {
            snapshot.insert("learning_rate".to_string(), lr);
        }
        if let Some(progress) = self.progress {
            snapshot.insert("progress".to_string(), progress);
        }
        if let Some(tokens) = self.tokens {
            snapshot.insert("tokens".to_string(), tokens as f64);
        }
        snapshot
    }

    fn assign(&mut self, key: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        match key {
            "step" => self.step = to_count(value),
            "tokens" => self.tokens = to_count(value),
            "loss" => self.loss = Some(value),
            "lr" | "learning_rate" => self.learning_rate = Some(value),
            "progress" => self.progress = (0.0..=1.0).contains(&value).then_some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    fn finish(mut self) -> Option<Self> {
        if self.loss.is_none() {
            self.loss = self.extra.get("train_mean_nll").copied();
        }
        self.has_fields().then_some(self)
    }
}

fn to_count(value: f64) -> Option<u64> {
    (value >= 0.0).then(|| value.trunc() as u64)
}

fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches(['.', ')', ']']);
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Removes terminal colour and cursor escape sequences.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Parses one raw output line, stamping the sample with the current time.
pub fn parse_line(line: &str) -> Option<MetricSample> {
    parse_line_at(line, Utc::now())
}

/// Parses one raw output line. Returns `None` for lines with no usable field.
pub fn parse_line_at(raw: &str, at: DateTime<Utc>) -> Option<MetricSample> {
    let cleaned = strip_ansi(raw);
    let line = cleaned.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(index) = line.find(METRICS_TAG) {
        return parse_tagged(&line[index + METRICS_TAG.len()..], at);
    }
    if line.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
            return parse_object(&map, at);
        }
    }
    parse_freeform(line, at)
}

/// Parses a structured metrics payload reported by a backend.
pub fn parse_value(value: &Value, at: DateTime<Utc>) -> Option<MetricSample> {
    match value {
        Value::Object(map) => parse_object(map, at),
        Value::String(line) => parse_line_at(line, at),
        _ => None,
    }
}

/// Lazily parses a sequence of lines, skipping those without metrics.
pub fn parse_lines<'a, I>(lines: I) -> impl Iterator<Item = MetricSample> + 'a
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: 'a,
{
    lines.into_iter().filter_map(parse_line)
}

fn parse_tagged(body: &str, at: DateTime<Utc>) -> Option<MetricSample> {
    let mut sample = MetricSample::empty(at);
    for pair in body.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if let Some(number) = parse_number(value) {
            sample.assign(key.trim(), number);
        }
    }
    sample.finish()
}

fn parse_object(map: &Map<String, Value>, at: DateTime<Utc>) -> Option<MetricSample> {
    let timestamp = map
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or(at, |parsed| parsed.with_timezone(&Utc));

    let mut sample = MetricSample::empty(timestamp);
    for (key, value) in map {
        if key == "timestamp" {
            continue;
        }
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s),
            _ => None,
        };
        if let Some(number) = number {
            sample.assign(key, number);
        }
    }
    sample.finish()
}

fn parse_freeform(line: &str, at: DateTime<Utc>) -> Option<MetricSample> {
    let mut sample = MetricSample::empty(at);
    let patterns: [(&Regex, &str); 4] = [
        (&FREEFORM_STEP, "step"),
        (&FREEFORM_LOSS, "loss"),
        (&FREEFORM_LR, "learning_rate"),
        (&FREEFORM_PROGRESS, "progress"),
    ];
    for (pattern, key) in patterns {
        let number = pattern
            .captures(line)
            .and_then(|captures| captures.get(1))
            .and_then(|value| parse_number(value.as_str()));
        if let Some(number) = number {
            sample.assign(key, number);
        }
    }
    sample.finish()
}

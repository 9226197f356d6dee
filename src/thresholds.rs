//! Threshold rules over aggregated statistics.
//!
//! Rules are parsed once at configuration-load time into a typed
//! (aggregate, comparator, limit) triple and evaluated against the final
//! metrics snapshot. A selector may carry tag filters, with `!` marking an
//! exclusion: `http_req_failed{name:!setup_create_team}` aggregates every
//! `http_req_failed` series except those tagged with that step name.

use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricKind, SeriesSnapshot, Snapshot, Tags};
use serde::Serialize;
use std::time::Duration;

/// Aggregate function referenced by a threshold rule.
///
/// `Rate` is kind-polymorphic: the failure fraction of a rate series, or
/// events per second of a counter series. Duration aggregates are in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Percentile(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    fn holds(self, observed: f64, limit: f64) -> bool {
        match self {
            Comparator::Lt => observed < limit,
            Comparator::Le => observed <= limit,
            Comparator::Gt => observed > limit,
            Comparator::Ge => observed >= limit,
            Comparator::Eq => observed == limit,
        }
    }
}

/// One tag constraint inside a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
    pub negated: bool,
}

impl TagFilter {
    fn matches(&self, tags: &Tags) -> bool {
        let actual = tags.get(&self.key).map(String::as_str);
        if self.negated {
            actual != Some(self.value.as_str())
        } else {
            actual == Some(self.value.as_str())
        }
    }
}

/// Metric name plus optional tag filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSelector {
    pub name: String,
    pub filters: Vec<TagFilter>,
}

impl MetricSelector {
    pub fn parse(input: &str) -> EngineResult<Self> {
        let input = input.trim();
        let err = |message: &str| EngineError::SelectorParse {
            selector: input.to_string(),
            message: message.to_string(),
        };

        let (name, filter_part) = match input.find('{') {
            Some(open) => {
                if !input.ends_with('}') {
                    return Err(err("missing closing '}'"));
                }
                (&input[..open], Some(&input[open + 1..input.len() - 1]))
            }
            None => (input, None),
        };
        if name.is_empty() {
            return Err(err("empty metric name"));
        }

        let mut filters = Vec::new();
        if let Some(part) = filter_part {
            for clause in part.split(',') {
                let (key, value) = clause
                    .split_once(':')
                    .ok_or_else(|| err("tag filter must be 'key:value' or 'key:!value'"))?;
                let key = key.trim();
                let value = value.trim();
                if key.is_empty() || value.is_empty() || value == "!" {
                    return Err(err("empty tag filter key or value"));
                }
                let (value, negated) = match value.strip_prefix('!') {
                    Some(rest) => (rest, true),
                    None => (value, false),
                };
                filters.push(TagFilter {
                    key: key.to_string(),
                    value: value.to_string(),
                    negated,
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            filters,
        })
    }

    /// Whether a series with the given tags contributes to this selector.
    pub fn matches(&self, tags: &Tags) -> bool {
        self.filters.iter().all(|f| f.matches(tags))
    }
}

/// A parsed pass/fail rule over one metric selector.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub aggregate: Aggregate,
    pub comparator: Comparator,
    pub limit: f64,
    selector_text: String,
    rule_text: String,
}

impl Threshold {
    /// Parse a selector string and a rule string such as `p(99)<300`.
    pub fn parse(selector: &str, rule: &str) -> EngineResult<Self> {
        let parse_err = |message: String| EngineError::ThresholdParse {
            rule: rule.to_string(),
            message,
        };

        let rule_trimmed = rule.trim();
        // Two-character comparators first so "<=" is not read as "<".
        let (op_idx, op_len, comparator) = ["<=", ">=", "==", "<", ">"]
            .iter()
            .find_map(|op| {
                rule_trimmed.find(op).map(|idx| {
                    let comparator = match *op {
                        "<=" => Comparator::Le,
                        ">=" => Comparator::Ge,
                        "==" => Comparator::Eq,
                        "<" => Comparator::Lt,
                        _ => Comparator::Gt,
                    };
                    (idx, op.len(), comparator)
                })
            })
            .ok_or_else(|| parse_err("missing comparator (<, <=, >, >=, ==)".to_string()))?;

        let aggregate = Self::parse_aggregate(rule_trimmed[..op_idx].trim())
            .map_err(|m| parse_err(m))?;
        let literal = rule_trimmed[op_idx + op_len..].trim();
        let limit: f64 = literal
            .parse()
            .map_err(|_| parse_err(format!("'{}' is not a number", literal)))?;

        Ok(Self {
            selector: MetricSelector::parse(selector)?,
            aggregate,
            comparator,
            limit,
            selector_text: selector.to_string(),
            rule_text: rule_trimmed.to_string(),
        })
    }

    fn parse_aggregate(text: &str) -> Result<Aggregate, String> {
        match text {
            "count" => Ok(Aggregate::Count),
            "rate" => Ok(Aggregate::Rate),
            "avg" => Ok(Aggregate::Avg),
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            "med" => Ok(Aggregate::Percentile(50.0)),
            _ => {
                let inner = text
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregate '{}'", text))?;
                let p: f64 = inner
                    .parse()
                    .map_err(|_| format!("'{}' is not a percentile", inner))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {} out of range [0,100]", p));
                }
                Ok(Aggregate::Percentile(p))
            }
        }
    }

    pub fn selector_text(&self) -> &str {
        &self.selector_text
    }

    pub fn rule_text(&self) -> &str {
        &self.rule_text
    }

    /// Evaluate against a snapshot.
    ///
    /// A selector that matches no samples passes; this is deliberate (an
    /// optional step may never have sampled in) and is logged as a warning so
    /// misconfigured selectors still surface.
    pub fn evaluate(&self, snapshot: &Snapshot) -> EngineResult<ThresholdOutcome> {
        let merged = snapshot
            .merge_matching(&self.selector.name, |tags| self.selector.matches(tags))
            .map_err(|message| self.eval_err(message))?;

        let Some(series) = merged else {
            tracing::warn!(
                selector = %self.selector_text,
                rule = %self.rule_text,
                "threshold matched no samples; treating as pass"
            );
            return Ok(ThresholdOutcome {
                metric: self.selector_text.clone(),
                rule: self.rule_text.clone(),
                observed: None,
                limit: self.limit,
                passed: true,
            });
        };

        let observed = self.aggregate_value(&series, snapshot.elapsed())?;
        Ok(ThresholdOutcome {
            metric: self.selector_text.clone(),
            rule: self.rule_text.clone(),
            observed: Some(observed),
            limit: self.limit,
            passed: self.comparator.holds(observed, self.limit),
        })
    }

    fn aggregate_value(&self, series: &SeriesSnapshot, elapsed: Duration) -> EngineResult<f64> {
        let kind = series.kind();
        let value = match self.aggregate {
            Aggregate::Count => Some(series.count() as f64),
            Aggregate::Rate => match kind {
                MetricKind::Rate => series.rate_fraction(),
                MetricKind::Counter => Some(series.per_second(elapsed)),
                MetricKind::Duration => None,
            },
            Aggregate::Avg => series.mean(),
            Aggregate::Min => series.min_ms(),
            Aggregate::Max => series.max_ms(),
            Aggregate::Percentile(p) => series.percentile_ms(p),
        };
        value.ok_or_else(|| {
            self.eval_err(format!(
                "aggregate is not defined for {:?} series",
                kind
            ))
        })
    }

    fn eval_err(&self, message: String) -> EngineError {
        EngineError::ThresholdEval {
            selector: self.selector_text.clone(),
            rule: self.rule_text.clone(),
            message,
        }
    }
}

/// Result of one threshold check: observed vs. required.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub rule: String,
    /// None when the selector matched no samples.
    pub observed: Option<f64>,
    pub limit: f64,
    pub passed: bool,
}

/// Final pass/fail outcome of the run.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub thresholds: Vec<ThresholdOutcome>,
    pub overall: bool,
}

impl Verdict {
    /// Evaluate all thresholds; overall is the conjunction of the outcomes.
    pub fn evaluate(thresholds: &[Threshold], snapshot: &Snapshot) -> EngineResult<Verdict> {
        let mut outcomes = Vec::with_capacity(thresholds.len());
        for threshold in thresholds {
            outcomes.push(threshold.evaluate(snapshot)?);
        }
        let overall = outcomes.iter().all(|o| o.passed);
        Ok(Verdict {
            thresholds: outcomes,
            overall,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{tag, MetricsAggregator, Observation};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_parse_percentile_rule() {
        let t = Threshold::parse("http_req_duration", "p(99)<300").unwrap();
        assert_eq!(t.aggregate, Aggregate::Percentile(99.0));
        assert_eq!(t.comparator, Comparator::Lt);
        assert_eq!(t.limit, 300.0);
        assert!(t.selector.filters.is_empty());
    }

    #[test]
    fn test_parse_rate_rules() {
        let t = Threshold::parse("errors", "rate<0.001").unwrap();
        assert_eq!(t.aggregate, Aggregate::Rate);
        assert_eq!(t.comparator, Comparator::Lt);

        let t = Threshold::parse("http_reqs", "rate>=4.8").unwrap();
        assert_eq!(t.comparator, Comparator::Ge);
        assert_eq!(t.limit, 4.8);

        let t = Threshold::parse("http_reqs", "rate<=5.2").unwrap();
        assert_eq!(t.comparator, Comparator::Le);
    }

    #[test]
    fn test_parse_selector_with_exclusion() {
        let t = Threshold::parse("http_req_failed{name:!setup_create_team}", "rate<0.001").unwrap();
        assert_eq!(t.selector.name, "http_req_failed");
        assert_eq!(t.selector.filters.len(), 1);
        assert!(t.selector.filters[0].negated);
        assert_eq!(t.selector.filters[0].value, "setup_create_team");

        assert!(t.selector.matches(&tag("name", "health")));
        assert!(t.selector.matches(&Tags::new()));
        assert!(!t.selector.matches(&tag("name", "setup_create_team")));
    }

    #[test]
    fn test_parse_positive_filter() {
        let t = Threshold::parse("http_req_duration{name:health}", "avg<100").unwrap();
        assert!(t.selector.matches(&tag("name", "health")));
        assert!(!t.selector.matches(&tag("name", "get_team")));
        assert!(!t.selector.matches(&Tags::new()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Threshold::parse("m", "p99<300"),
            Err(EngineError::ThresholdParse { .. })
        ));
        assert!(Threshold::parse("m", "rate 0.1").is_err());
        assert!(Threshold::parse("m", "rate<abc").is_err());
        assert!(Threshold::parse("m", "p(101)<1").is_err());
        assert!(matches!(
            Threshold::parse("m{name}", "rate<1"),
            Err(EngineError::SelectorParse { .. })
        ));
        assert!(Threshold::parse("m{name:health", "rate<1").is_err());
    }

    #[test]
    fn test_rate_threshold_semantics() {
        let agg = MetricsAggregator::new();
        for i in 0..500u32 {
            agg.record(Observation::rate("errors", Tags::new(), i == 0));
        }
        let snap = agg.snapshot(ms(1000));

        // 1 failure in 500 -> 0.002, which is not < 0.001.
        let t = Threshold::parse("errors", "rate<0.001").unwrap();
        let outcome = t.evaluate(&snap).unwrap();
        assert_eq!(outcome.observed, Some(0.002));
        assert!(!outcome.passed);

        // 0 failures out of N > 0 passes.
        let clean = MetricsAggregator::new();
        for _ in 0..500u32 {
            clean.record(Observation::rate("errors", Tags::new(), false));
        }
        let outcome = t.evaluate(&clean.snapshot(ms(1000))).unwrap();
        assert_eq!(outcome.observed, Some(0.0));
        assert!(outcome.passed);
    }

    #[test]
    fn test_counter_rate_is_per_second() {
        let agg = MetricsAggregator::new();
        for _ in 0..50 {
            agg.record(Observation::counter("http_reqs", Tags::new(), 1.0));
        }
        let snap = agg.snapshot(Duration::from_secs(10));

        let t = Threshold::parse("http_reqs", "rate>=4.8").unwrap();
        let outcome = t.evaluate(&snap).unwrap();
        assert_eq!(outcome.observed, Some(5.0));
        assert!(outcome.passed);

        let t = Threshold::parse("http_reqs", "rate<=5.2").unwrap();
        assert!(t.evaluate(&snap).unwrap().passed);
    }

    #[test]
    fn test_exclusion_changes_aggregate() {
        let agg = MetricsAggregator::new();
        for _ in 0..9 {
            agg.record(Observation::rate(
                "http_req_failed",
                tag("name", "health"),
                false,
            ));
        }
        agg.record(Observation::rate(
            "http_req_failed",
            tag("name", "setup_create_team"),
            true,
        ));
        let snap = agg.snapshot(ms(1000));

        let unfiltered = Threshold::parse("http_req_failed", "rate<0.001").unwrap();
        let filtered =
            Threshold::parse("http_req_failed{name:!setup_create_team}", "rate<0.001").unwrap();

        let u = unfiltered.evaluate(&snap).unwrap();
        let f = filtered.evaluate(&snap).unwrap();
        assert_eq!(u.observed, Some(0.1));
        assert!(!u.passed);
        assert_eq!(f.observed, Some(0.0));
        assert!(f.passed);
    }

    #[test]
    fn test_zero_sample_threshold_passes() {
        let snap = MetricsAggregator::new().snapshot(ms(1000));
        let t = Threshold::parse("http_req_duration{name:create_pr}", "p(99)<300").unwrap();
        let outcome = t.evaluate(&snap).unwrap();
        assert!(outcome.passed);
        assert!(outcome.observed.is_none());
    }

    #[test]
    fn test_percentile_on_rate_series_is_config_error() {
        let agg = MetricsAggregator::new();
        agg.record(Observation::rate("errors", Tags::new(), false));
        let snap = agg.snapshot(ms(1000));

        let t = Threshold::parse("errors", "p(99)<300").unwrap();
        assert!(matches!(
            t.evaluate(&snap),
            Err(EngineError::ThresholdEval { .. })
        ));
    }

    #[test]
    fn test_verdict_is_conjunction() {
        let agg = MetricsAggregator::new();
        for i in 1..=100u64 {
            agg.record(Observation::duration(
                "http_req_duration",
                tag("name", "health"),
                ms(i),
            ));
            agg.record(Observation::rate("errors", Tags::new(), false));
        }
        let snap = agg.snapshot(Duration::from_secs(10));

        let passing = vec![
            Threshold::parse("http_req_duration", "p(99)<300").unwrap(),
            Threshold::parse("errors", "rate<0.001").unwrap(),
        ];
        let verdict = Verdict::evaluate(&passing, &snap).unwrap();
        assert!(verdict.overall);

        let mixed = vec![
            Threshold::parse("http_req_duration", "p(99)<300").unwrap(),
            Threshold::parse("http_req_duration", "max<50").unwrap(),
        ];
        let verdict = Verdict::evaluate(&mixed, &snap).unwrap();
        assert!(!verdict.overall);
        assert!(verdict.thresholds[0].passed);
        assert!(!verdict.thresholds[1].passed);
    }
}

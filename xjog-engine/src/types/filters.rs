use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// One digest row as seen by filter evaluation.
#[derive(Clone, Debug)]
pub struct DigestView {
    pub value: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Composable boolean filter over the digest rows of one chart.
#[derive(Clone, Debug)]
pub enum DigestFilter {
    And(Vec<DigestFilter>),
    Or(Vec<DigestFilter>),
    Not(Box<DigestFilter>),
    Eq { key: String, value: String },
    Matches { key: String, pattern: String },
    Lt { key: String, value: String },
    Le { key: String, value: String },
    Gt { key: String, value: String },
    Ge { key: String, value: String },
    CreatedBefore { key: String, instant: DateTime<Utc> },
    CreatedAfter { key: String, instant: DateTime<Utc> },
    UpdatedBefore { key: String, instant: DateTime<Utc> },
    UpdatedAfter { key: String, instant: DateTime<Utc> },
}

/// Digest values are text; comparisons go numeric when both sides parse as
/// numbers and lexicographic otherwise.
fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.cmp(right),
    }
}

impl DigestFilter {
    pub fn matches(&self, digests: &HashMap<String, DigestView>) -> bool {
        use DigestFilter::*;
        match self {
            And(inner) => inner.iter().all(|filter| filter.matches(digests)),
            Or(inner) => inner.iter().any(|filter| filter.matches(digests)),
            Not(inner) => !inner.matches(digests),
            Eq { key, value } => digests
                .get(key)
                .map(|digest| digest.value == *value)
                .unwrap_or(false),
            Matches { key, pattern } => match (digests.get(key), regex::Regex::new(pattern)) {
                (Some(digest), Ok(re)) => re.is_match(&digest.value),
                _ => false,
            },
            Lt { key, value } => digests
                .get(key)
                .map(|digest| compare(&digest.value, value).is_lt())
                .unwrap_or(false),
            Le { key, value } => digests
                .get(key)
                .map(|digest| compare(&digest.value, value).is_le())
                .unwrap_or(false),
            Gt { key, value } => digests
                .get(key)
                .map(|digest| compare(&digest.value, value).is_gt())
                .unwrap_or(false),
            Ge { key, value } => digests
                .get(key)
                .map(|digest| compare(&digest.value, value).is_ge())
                .unwrap_or(false),
            CreatedBefore { key, instant } => digests
                .get(key)
                .map(|digest| digest.created < *instant)
                .unwrap_or(false),
            CreatedAfter { key, instant } => digests
                .get(key)
                .map(|digest| digest.created > *instant)
                .unwrap_or(false),
            UpdatedBefore { key, instant } => digests
                .get(key)
                .map(|digest| digest.updated < *instant)
                .unwrap_or(false),
            UpdatedAfter { key, instant } => digests
                .get(key)
                .map(|digest| digest.updated > *instant)
                .unwrap_or(false),
        }
    }
}

/// One chart as seen by chart-filter evaluation: identity, latest state
/// value, and registered external ids.
#[derive(Clone, Debug)]
pub struct ChartView {
    pub machine_id: String,
    pub chart_id: String,
    pub state_value: Value,
    pub external_ids: HashMap<String, String>,
}

/// Composable boolean filter over charts and their metadata.
#[derive(Clone, Debug)]
pub enum ChartFilter {
    And(Vec<ChartFilter>),
    Or(Vec<ChartFilter>),
    Not(Box<ChartFilter>),
    MachineIdMatches(String),
    ChartIdMatches(String),
    /// Dotted state-value descriptor, as in [`MachineState::matches`].
    ///
    /// [`MachineState::matches`]: crate::types::MachineState::matches
    StateMatches(String),
    ExternalIdMatches { key: String, pattern: String },
}

fn regex_match(pattern: &str, value: &str) -> bool {
    regex::Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

impl ChartFilter {
    pub fn matches(&self, chart: &ChartView) -> bool {
        use ChartFilter::*;
        match self {
            And(inner) => inner.iter().all(|filter| filter.matches(chart)),
            Or(inner) => inner.iter().any(|filter| filter.matches(chart)),
            Not(inner) => !inner.matches(chart),
            MachineIdMatches(pattern) => regex_match(pattern, &chart.machine_id),
            ChartIdMatches(pattern) => regex_match(pattern, &chart.chart_id),
            StateMatches(descriptor) => {
                let probe = crate::types::MachineState::new(chart.state_value.clone());
                probe.matches(descriptor)
            }
            ExternalIdMatches { key, pattern } => chart
                .external_ids
                .get(key)
                .map(|value| regex_match(pattern, value))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn digest(value: &str) -> DigestView {
        DigestView {
            value: value.to_string(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn digest_filter_boolean_tree() {
        let digests = HashMap::from([
            ("order_no".to_string(), digest("42")),
            ("status".to_string(), digest("shipped")),
        ]);

        let filter = DigestFilter::And(vec![
            DigestFilter::Eq {
                key: "status".to_string(),
                value: "shipped".to_string(),
            },
            DigestFilter::Not(Box::new(DigestFilter::Lt {
                key: "order_no".to_string(),
                value: "10".to_string(),
            })),
        ]);
        assert!(filter.matches(&digests));

        let miss = DigestFilter::Matches {
            key: "status".to_string(),
            pattern: "^pend".to_string(),
        };
        assert!(!miss.matches(&digests));
    }

    #[test]
    fn digest_comparison_is_numeric_when_possible() {
        let digests = HashMap::from([("order_no".to_string(), digest("9"))]);
        // "9" < "42" numerically even though "42" < "9" lexicographically
        let filter = DigestFilter::Lt {
            key: "order_no".to_string(),
            value: "42".to_string(),
        };
        assert!(filter.matches(&digests));
    }

    #[test]
    fn chart_filter_matching() {
        let chart = ChartView {
            machine_id: "order".to_string(),
            chart_id: "chart-7".to_string(),
            state_value: json!({"fulfilment": "packing"}),
            external_ids: HashMap::from([("order_no".to_string(), "42".to_string())]),
        };

        assert!(ChartFilter::MachineIdMatches("^ord".to_string()).matches(&chart));
        assert!(ChartFilter::StateMatches("fulfilment.packing".to_string()).matches(&chart));
        assert!(ChartFilter::ExternalIdMatches {
            key: "order_no".to_string(),
            pattern: "^4".to_string(),
        }
        .matches(&chart));
        assert!(!ChartFilter::And(vec![
            ChartFilter::ChartIdMatches("^chart".to_string()),
            ChartFilter::StateMatches("fulfilment.shipped".to_string()),
        ])
        .matches(&chart));
    }
}

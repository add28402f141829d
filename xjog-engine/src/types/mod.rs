pub mod event;
pub mod filters;
pub mod machine;

pub use event::{Event, EventTarget};
pub use filters::{ChartFilter, DigestFilter};
pub use machine::{
    Action, ActivityHandle, ActivitySpawn, DigestSpec, MachineDefinition, MachineOptions,
    MachineState, TransitionError,
};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const CHART_URI_SCHEME: &str = "xjog+chart";

/// Characters allowed verbatim in a chart URI path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Globally unique identity of one running chart: the machine id names the
/// definition, the chart id one running instance of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChartReference {
    pub machine_id: String,
    pub chart_id: String,
}

impl ChartReference {
    pub fn new(machine_id: impl Into<String>, chart_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            chart_id: chart_id.into(),
        }
    }

    /// Renders the `xjog+chart:/<machine>/<chart>` URI form with
    /// percent-encoded segments.
    pub fn uri(&self) -> String {
        format!(
            "{CHART_URI_SCHEME}:/{}/{}",
            utf8_percent_encode(&self.machine_id, SEGMENT),
            utf8_percent_encode(&self.chart_id, SEGMENT),
        )
    }
}

impl fmt::Display for ChartReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chart URI: {0}")]
pub struct ChartUriError(String);

impl FromStr for ChartReference {
    type Err = ChartUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s).map_err(|err| ChartUriError(format!("{s}: {err}")))?;
        if url.scheme() != CHART_URI_SCHEME {
            return Err(ChartUriError(format!("unexpected scheme in {s}")));
        }
        let segments: Vec<_> = url
            .path_segments()
            .map(|segments| segments.collect())
            .unwrap_or_default();
        let [machine_id, chart_id] = segments.as_slice() else {
            return Err(ChartUriError(format!("expected two path segments in {s}")));
        };
        let decode = |segment: &str| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|err| ChartUriError(format!("{s}: {err}")))
        };
        Ok(Self {
            machine_id: decode(machine_id)?,
            chart_id: decode(chart_id)?,
        })
    }
}

impl Serialize for ChartReference {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.uri())
    }
}

impl<'de> Deserialize<'de> for ChartReference {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uri = String::deserialize(deserializer)?;
        uri.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One transition as broadcast to in-process observers.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub kind: ChangeKind,
    pub reference: ChartReference,
    pub parent: Option<ChartReference>,
    pub event: Option<Event>,
    pub old: Option<MachineState>,
    pub new: Option<MachineState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chart_uri_round_trip() {
        let reference = ChartReference::new("door machine", "chart/42");
        let uri = reference.uri();
        assert_eq!(uri, "xjog+chart:/door%20machine/chart%2F42");
        assert_eq!(uri.parse::<ChartReference>().unwrap(), reference);
    }

    #[test]
    fn chart_uri_accepts_authority_form() {
        let parsed: ChartReference = "xjog+chart://localhost/door/main"
            .parse()
            .unwrap();
        assert_eq!(parsed, ChartReference::new("door", "main"));
    }

    #[test]
    fn chart_uri_rejects_foreign_scheme() {
        assert!("https://example.com/a/b".parse::<ChartReference>().is_err());
        assert!("xjog+chart:/only-one-segment"
            .parse::<ChartReference>()
            .is_err());
    }

    #[test]
    fn chart_reference_serde_uses_uri_form() {
        let reference = ChartReference::new("door", "main");
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"xjog+chart:/door/main\"");
        let back: ChartReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}

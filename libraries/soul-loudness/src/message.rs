use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message posted by the meter processor
///
/// Serialized as `{"type": "momentaryLoudness", "value": -14.2}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeterMessage {
    MomentaryLoudness { value: f64 },
}

impl MeterMessage {
    pub fn momentary(value: f64) -> Self {
        Self::MomentaryLoudness { value }
    }

    pub fn to_value(self) -> Value {
        match self {
            Self::MomentaryLoudness { value } => serde_json::json!({
                "type": "momentaryLoudness",
                "value": value,
            }),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Loudness carried by the message
    pub fn lufs(self) -> f64 {
        match self {
            Self::MomentaryLoudness { value } => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let value = MeterMessage::momentary(-14.5).to_value();
        assert_eq!(value, json!({ "type": "momentaryLoudness", "value": -14.5 }));
        assert_eq!(serde_json::to_value(MeterMessage::momentary(-14.5)).unwrap(), value);
    }

    #[test]
    fn parses_reports_and_rejects_others() {
        let parsed = MeterMessage::from_value(json!({ "type": "momentaryLoudness", "value": -20.0 }))
            .unwrap();
        assert_eq!(parsed.lufs(), -20.0);
        assert!(MeterMessage::from_value(json!({ "type": "peak", "value": 0.5 })).is_err());
    }
}

//! Input and output shapes of `example-task`, shared with procedures that
//! drive it.

use courier_plugin::{Payload, PluginError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub integer: Option<i64>,
    pub string: Option<String>,
    pub bool: Option<bool>,
}

impl TaskInput {
    pub fn new(integer: i64, string: Option<String>, bool: bool) -> Self {
        Self {
            integer: Some(integer),
            string,
            bool: Some(bool),
        }
    }

    pub fn from_payload(payload: &Payload) -> Result<Self, PluginError> {
        Ok(serde_json::from_value(Value::Object(payload.clone()))?)
    }

    pub fn to_payload(&self) -> Payload {
        let mut map = Payload::new();
        map.insert("integer".into(), self.integer.map_or(Value::Null, Value::from));
        map.insert("string".into(), self.string.clone().map_or(Value::Null, Value::from));
        map.insert("bool".into(), self.bool.map_or(Value::Null, Value::from));
        map
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(rename = "example-string")]
    pub example_string: String,
}

impl TaskOutput {
    pub fn to_payload(&self) -> Payload {
        let mut map = Payload::new();
        map.insert("example-string".into(), Value::from(self.example_string.clone()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_read_as_none() {
        let mut payload = Payload::new();
        payload.insert("integer".into(), json!(4));
        let input = TaskInput::from_payload(&payload).unwrap();
        assert_eq!(input, TaskInput { integer: Some(4), string: None, bool: None });
    }

    #[test]
    fn wrong_types_are_rejected() {
        let mut payload = Payload::new();
        payload.insert("integer".into(), json!("four"));
        assert!(TaskInput::from_payload(&payload).is_err());
    }

    #[test]
    fn payload_keeps_nulls() {
        let payload = TaskInput::new(2, None, false).to_payload();
        assert_eq!(Value::Object(payload), json!({"integer": 2, "string": null, "bool": false}));
    }
}

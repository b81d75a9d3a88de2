//! `example-procedure`: five steps, each handled by `example-task`. Every
//! step feeds the previous step's `example-string` back into the task.

use std::path::Path;

use courier_plugin::{
    Payload, Plugin, PluginError, PluginInfo, Procedure, SPI_VERSION, StepSequence,
};
use example_task::mapper::TaskInput;
use serde_json::Value;
use tracing::info;

pub const ID: &str = "example-procedure";
pub const STEPS: [&str; 5] = ["step-1", "step-2", "step-3", "step-4", "step-5"];

#[derive(Debug, Clone)]
pub struct ExampleProcedure {
    steps: StepSequence,
}

impl Default for ExampleProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl ExampleProcedure {
    pub fn new() -> Self {
        let task = PluginInfo::new(example_task::ID, "1.0.0", SPI_VERSION);
        let steps = STEPS
            .iter()
            .fold(StepSequence::new(), |seq, step| seq.step(*step, task.clone()));
        Self { steps }
    }
}

fn text(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

impl Plugin for ExampleProcedure {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(ID, env!("CARGO_PKG_VERSION"), SPI_VERSION)
    }

    fn init(&self, config: Option<&Path>) -> Result<(), PluginError> {
        info!(config_file = ?config, "procedure initialized");
        Ok(())
    }

    fn destroy(&self) -> Result<(), PluginError> {
        info!("procedure destroyed");
        Ok(())
    }
}

impl Procedure for ExampleProcedure {
    fn task_plugin_infos(&self) -> Vec<PluginInfo> {
        self.steps.tasks()
    }

    fn task_plugin_info(&self, step: &str) -> Result<PluginInfo, PluginError> {
        self.steps.task(step)
    }

    fn get_next_step(
        &self,
        _correlation_id: &str,
        previous_step: Option<&str>,
        next_step: Option<&str>,
        _payload: &Payload,
    ) -> Result<Option<String>, PluginError> {
        self.steps.next(previous_step, next_step)
    }

    fn map_input(
        &self,
        _correlation_id: &str,
        step: &str,
        _previous_step: Option<&str>,
        payload: &Payload,
    ) -> Result<Payload, PluginError> {
        let index = self.steps.position(step)?;
        let source = if index == 0 { "string" } else { "example-string" };
        let input = TaskInput::new(index as i64 + 1, text(payload, source), index % 2 == 0);
        Ok(input.to_payload())
    }

    fn map_output(
        &self,
        _correlation_id: &str,
        _step: &str,
        _previous_step: Option<&str>,
        output: Payload,
    ) -> Result<Payload, PluginError> {
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn requires_example_task_once() {
        let infos = ExampleProcedure::new().task_plugin_infos();
        assert_eq!(infos, vec![PluginInfo::new("example-task", "1.0.0", SPI_VERSION)]);
    }

    #[test]
    fn walks_five_steps() {
        let p = ExampleProcedure::new();
        let empty = Payload::new();
        let mut previous: Option<String> = None;
        let mut seen = Vec::new();
        while let Some(step) = p.get_next_step("c", previous.as_deref(), None, &empty).unwrap() {
            seen.push(step.clone());
            previous = Some(step);
        }
        assert_eq!(seen, STEPS);
    }

    #[test]
    fn pending_step_is_returned_unchanged() {
        let p = ExampleProcedure::new();
        let empty = Payload::new();
        for _ in 0..2 {
            let next = p.get_next_step("c", Some("step-2"), Some("step-3"), &empty).unwrap();
            assert_eq!(next.as_deref(), Some("step-3"));
        }
    }

    #[test]
    fn first_step_reads_string_later_steps_example_string() {
        let p = ExampleProcedure::new();
        let data = payload(json!({"string": "s", "example-string": "e"}));

        let first = p.map_input("c", "step-1", None, &data).unwrap();
        assert_eq!(Value::Object(first), json!({"integer": 1, "string": "s", "bool": true}));

        let second = p.map_input("c", "step-2", Some("step-1"), &data).unwrap();
        assert_eq!(Value::Object(second), json!({"integer": 2, "string": "e", "bool": false}));

        let fifth = p.map_input("c", "step-5", Some("step-4"), &data).unwrap();
        assert_eq!(Value::Object(fifth), json!({"integer": 5, "string": "e", "bool": true}));
    }

    #[test]
    fn unknown_step_fails_everywhere() {
        let p = ExampleProcedure::new();
        let empty = Payload::new();
        assert!(p.task_plugin_info("step-6").is_err());
        assert!(p.map_input("c", "step-6", None, &empty).is_err());
        assert!(p.get_next_step("c", Some("step-6"), None, &empty).is_err());
    }
}

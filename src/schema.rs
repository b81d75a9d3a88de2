use std::{fs, path::Path};

use anyhow::{Context, Error};
use schemars::schema_for;

use crate::config::BrokerConfig;
use crate::message::Message;

/// Writes the JSON schemas of the broker config and of a stored message
/// into `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<std::path::PathBuf>, Error> {
    fs::create_dir_all(out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;

    let schemas = [
        ("courier-config.schema.json", serde_json::to_string_pretty(&schema_for!(BrokerConfig))?),
        ("message.schema.json", serde_json::to_string_pretty(&schema_for!(Message))?),
    ];

    let mut written = Vec::new();
    for (name, schema) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, schema).with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn schemas_describe_config_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(&dir.path().join("schemas")).unwrap();
        assert_eq!(written.len(), 2);

        let config: Value = serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert!(config["properties"]["plugins"].is_object());

        let message: Value = serde_json::from_str(&fs::read_to_string(&written[1]).unwrap()).unwrap();
        assert!(message["properties"]["correlation_id"].is_object());
    }
}

//! Utility functions for CLI commands.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snapsort_engine::EngineConfig;

use crate::Cli;

/// Loads the engine config from `--config`, or defaults when absent.
pub fn load_engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let Some(path) = cli.config.as_deref() else {
        return Ok(EngineConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read config {path}: {e}"))?;
    Ok(EngineConfig::from_yaml(&content)?)
}

/// Loads a fixture from a YAML or JSON file.
pub fn load_request<T: DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)?;
    parse_request(&content, path)
}

/// Parses by extension; anything that is not `.json` is read as YAML.
pub fn parse_request<T: DeserializeOwned>(content: &str, path: &str) -> anyhow::Result<T> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("yaml");

    let result = match ext.to_lowercase().as_str() {
        "json" => serde_json::from_str(content)?,
        _ => serde_yaml::from_str(content)?,
    };
    Ok(result)
}

/// Requires input file to be provided.
pub fn require_input_file(cli: &Cli) -> anyhow::Result<&str> {
    cli.input
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("input file is required, use -f flag"))
}

/// Writes `value` as YAML (default) or JSON to `-o` or stdout.
pub fn output_result<T: Serialize>(value: &T, output: Option<&str>, json: bool) -> anyhow::Result<()> {
    let text = if json {
        serde_json::to_string_pretty(value)?
    } else {
        serde_yaml::to_string(value)?
    };

    match output {
        Some(path) => {
            let mut file = File::create(path)?;
            file.write_all(text.as_bytes())?;
        }
        None => println!("{}", text),
    }
    Ok(())
}

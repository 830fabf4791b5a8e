use crate::infrastructure::error::EngineError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const RECONCILE_JSON: &str = "reconcile.json";

#[derive(Debug)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub reconcile: serde_json::Value,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "HabitLoop"
            }),
        ),
        (
            RECONCILE_JSON,
            serde_json::json!({
                "schema": 1,
                "maxAttempts": 3,
                "baseDelayMs": 200,
                "writeConcurrency": 4
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), EngineError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, EngineError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| EngineError::InvalidInput(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(EngineError::InvalidInput(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, EngineError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        reconcile: read_config(&config_dir.join(RECONCILE_JSON))?,
    })
}

pub fn reconcile_config_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join(RECONCILE_JSON)
}

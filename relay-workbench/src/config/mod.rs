use crate::config::json::WorkbenchJsonConfig;
use anyhow::Context;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub mod cli;
pub mod json;

pub fn load(path: &Path) -> anyhow::Result<WorkbenchJsonConfig> {
    let file = File::open(path)
        .with_context(|| format!("failed to open config file at {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

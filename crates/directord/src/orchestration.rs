//! Orchestration expansion.
//!
//! An orchestration document is a YAML list of entries, each carrying an
//! optional target list, optional pre-formatted variables, and a list of
//! single-entry verb maps (possibly nested). Every entry expands into
//! individual job items sharing one freshly minted parent id.

use anyhow::{bail, Context, Result};
use directord_components::Registry;
use directord_protocol::get_uuid;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationEntry {
    #[serde(default)]
    pub targets: Vec<String>,

    /// Pre-formatted fields layered over every expanded job.
    #[serde(default)]
    pub vars: Option<Map<String, Value>>,

    pub jobs: Vec<Value>,
}

/// Expansion options shared by every entry of one invocation.
#[derive(Debug, Clone, Default)]
pub struct ExpandOptions {
    /// Overrides the per-entry target lists when non-empty.
    pub targets: Vec<String>,
    pub restrict: Option<Vec<String>>,
    pub skip_cache: bool,
    pub return_raw: bool,
}

/// Expand entries into submittable job documents.
pub fn expand_orchestrations(
    registry: &Registry,
    entries: &[OrchestrationEntry],
    options: &ExpandOptions,
) -> Result<Vec<Value>> {
    let mut jobs = Vec::new();

    for entry in entries {
        let parent_id = get_uuid();
        let targets = if options.targets.is_empty() {
            entry.targets.clone()
        } else {
            options.targets.clone()
        };

        let mut verb_items = Vec::new();
        flatten_jobs(&entry.jobs, &mut verb_items)?;

        for (verb, exec) in verb_items {
            let component = registry
                .get(&verb)
                .with_context(|| format!("Unknown verb: '{verb}'"))?;
            let parsed = component
                .server(&exec)
                .with_context(|| format!("Failed to parse {verb} execution arguments"))?;

            let mut job = parsed.into_job();
            job.targets = targets.clone();
            job.parent_id = parent_id.clone();
            job.restrict = options.restrict.clone();
            if options.skip_cache {
                job.skip_cache = true;
            }
            job.return_raw = options.return_raw;

            let mut value = serde_json::to_value(&job)?;
            if let (Value::Object(map), Some(vars)) = (&mut value, &entry.vars) {
                for (key, var) in vars {
                    map.insert(key.clone(), var.clone());
                }
            }
            jobs.push(value);
        }
    }

    Ok(jobs)
}

/// Nested job lists flatten recursively; each leaf is a single-entry map
/// from verb to execution string.
fn flatten_jobs(items: &[Value], out: &mut Vec<(String, Vec<String>)>) -> Result<()> {
    for item in items {
        match item {
            Value::Array(nested) => flatten_jobs(nested, out)?,
            Value::Object(map) => {
                let Some((verb, exec)) = map.iter().next() else {
                    bail!("Orchestration job entries cannot be empty");
                };
                if map.len() != 1 {
                    bail!("Orchestration job entries must hold exactly one verb");
                }
                out.push((verb.to_uppercase(), exec_array(exec)?));
            }
            other => bail!("Orchestration job entries must be mappings, got: {other}"),
        }
    }
    Ok(())
}

fn exec_array(exec: &Value) -> Result<Vec<String>> {
    match exec {
        Value::String(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part {
                    Value::String(s) => {
                        out.extend(s.split_whitespace().map(str::to_string));
                    }
                    other => bail!("Execution arrays must hold strings, got: {other}"),
                }
            }
            Ok(out)
        }
        other => bail!("Execution must be a string or string array, got: {other}"),
    }
}

/// Load orchestration entries from a YAML document.
pub fn load_orchestrations(content: &str) -> Result<Vec<OrchestrationEntry>> {
    serde_yaml::from_str(content).context("Orchestration file is not a list of entries")
}

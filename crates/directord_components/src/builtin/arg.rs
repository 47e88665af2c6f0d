//! ARG / ENV: cached argument and environment updates.
//!
//! One implementation serves both verbs; the two share a lock so their
//! cache namespaces never interleave mid-merge. Values are rendered
//! through the template engine before storing, which lets arguments
//! reference one another.

use crate::{blueprint, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_cache::SetOptions;
use directord_protocol::{JobItem, VerbPayload};
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(about = "Process cache commands", disable_help_flag = true)]
struct ArgExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Allow complex args to extend existing ones.
    #[arg(long)]
    extend_args: bool,

    /// KEY VALUE...
    #[arg(required = true, num_args = 2..)]
    key_value: Vec<String>,
}

pub struct CacheArg {
    verb: &'static str,
    cache_key: &'static str,
}

impl CacheArg {
    pub fn arg() -> Self {
        CacheArg {
            verb: "ARG",
            cache_key: "args",
        }
    }

    pub fn env() -> Self {
        CacheArg {
            verb: "ENV",
            cache_key: "envs",
        }
    }

    fn mapping<'j>(&self, job: &'j JobItem) -> Option<&'j Map<String, Value>> {
        match &job.payload {
            VerbPayload::Arg { args } if self.verb == "ARG" => Some(args),
            VerbPayload::Env { envs } if self.verb == "ENV" => Some(envs),
            _ => None,
        }
    }
}

impl Component for CacheArg {
    fn verb(&self) -> &'static str {
        self.verb
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("arg")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = ArgExec::try_parse_from(exec_argv(self.verb, exec))?;
        let key = parsed.key_value[0].clone();
        let raw = parsed.key_value[1..].join(" ");
        // Structured values pass through as JSON; everything else is a
        // string.
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));

        let mut mapping = Map::new();
        mapping.insert(key, value);
        let payload = if self.verb == "ENV" {
            VerbPayload::Env { envs: mapping }
        } else {
            VerbPayload::Arg { args: mapping }
        };

        let mut parsed_exec = ParsedExec::new(payload, parsed.common);
        parsed_exec.extend_args = parsed.extend_args;
        Ok(parsed_exec)
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let Some(mapping) = self.mapping(job) else {
            return TaskOutcome::failure(format!("{} received a mismatched payload", self.verb));
        };

        // Render values against the current args so interdependent
        // arguments resolve.
        let serialized = Value::Object(mapping.clone()).to_string();
        let rendered = match blueprint::render(&serialized, &ctx.args(), true) {
            Ok(rendered) => serde_json::from_str::<Value>(&rendered)
                .unwrap_or(Value::Object(mapping.clone())),
            Err(_) => Value::Object(mapping.clone()),
        };

        let value = if self.verb == "ENV" {
            // Environment values are always strings.
            let mut envs = Map::new();
            if let Value::Object(map) = &rendered {
                for (key, value) in map {
                    let string = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    envs.insert(key.clone(), Value::String(string));
                }
            }
            Value::Object(envs)
        } else {
            rendered
        };

        let options = SetOptions::tagged(self.cache_key).updating(job.extend_args);
        if let Err(e) = ctx.cache.set(self.cache_key, value.clone(), options) {
            return TaskOutcome::failure_with_info(
                format!("Failed to add {} to cache", self.cache_key),
                e.to_string(),
            );
        }

        TaskOutcome::success(
            Some(format!("{} added to cache", self.cache_key)),
            Some(format!("type:{}, value:{}", self.cache_key, value)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_cache::Cache;
    use directord_transport::{Driver, DriverConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(DriverConfig::new("inproc://arg-test", "w1")));
        (dir, TaskContext::new(cache, driver))
    }

    #[test]
    fn test_server_builds_mapping() {
        let exec: Vec<String> = ["foo", "bar"].iter().map(|s| s.to_string()).collect();
        let parsed = CacheArg::arg().server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::Arg { args } => {
                assert_eq!(args.get("foo"), Some(&json!("bar")));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_server_parses_structured_values() {
        let exec: Vec<String> = ["ports", "[80, 443]"].iter().map(|s| s.to_string()).collect();
        let parsed = CacheArg::arg().server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::Arg { args } => {
                assert_eq!(args.get("ports"), Some(&json!([80, 443])));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_client_merges_into_args() {
        let (_dir, mut ctx) = context();
        ctx.cache
            .set("args", json!({"keep": 1}), SetOptions::tagged("args"))
            .unwrap();

        let mut mapping = Map::new();
        mapping.insert("foo".to_string(), json!("bar"));
        let job = JobItem::new(VerbPayload::Arg { args: mapping });

        let outcome = CacheArg::arg().client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(
            ctx.cache.get("args"),
            Some(json!({"keep": 1, "foo": "bar"}))
        );
    }

    #[test]
    fn test_env_values_are_stringified() {
        let (_dir, mut ctx) = context();
        let mut mapping = Map::new();
        mapping.insert("PORT".to_string(), json!(8080));
        let job = JobItem::new(VerbPayload::Env { envs: mapping });

        let outcome = CacheArg::env().client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(ctx.cache.get("envs"), Some(json!({"PORT": "8080"})));
    }

    #[test]
    fn test_interdependent_args_render() {
        let (_dir, mut ctx) = context();
        ctx.cache
            .set("args", json!({"base": "/srv"}), SetOptions::tagged("args"))
            .unwrap();

        let mut mapping = Map::new();
        mapping.insert("path".to_string(), json!("{{ base }}/app"));
        let job = JobItem::new(VerbPayload::Arg { args: mapping });

        let outcome = CacheArg::arg().client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(
            ctx.cache.get("args"),
            Some(json!({"base": "/srv", "path": "/srv/app"}))
        );
    }
}

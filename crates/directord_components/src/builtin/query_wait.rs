//! QUERY_WAIT: block until a query answer is present in the local cache.

use crate::{exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{current_time, JobItem, VerbPayload, DEFAULT_JOB_TIMEOUT_SECS};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

const POLL_SLEEP_MS: u64 = 250;
const WARN_EVERY_SECS: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(name = "QUERY_WAIT", about = "Process query_wait commands", disable_help_flag = true)]
struct QueryWaitExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Seconds to wait for the item to be present in cache.
    #[arg(long, default_value_t = DEFAULT_JOB_TIMEOUT_SECS)]
    query_timeout: u64,

    /// Worker identities that must hold the item; repeatable.
    #[arg(long = "identity")]
    identity: Vec<String>,

    /// Key within the host-specific query cache to wait for.
    item: String,
}

pub struct QueryWait;

impl Component for QueryWait {
    fn verb(&self) -> &'static str {
        "QUERY_WAIT"
    }

    fn cacheable(&self) -> bool {
        false
    }

    // The payload carries its own deadline.
    fn timeout_enforced(&self) -> bool {
        false
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = QueryWaitExec::try_parse_from(exec_argv("QUERY_WAIT", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::QueryWait {
                item: parsed.item,
                query_timeout: parsed.query_timeout,
                identity: parsed.identity,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::QueryWait {
            item,
            query_timeout,
            identity,
        } = &job.payload
        else {
            return TaskOutcome::failure("QUERY_WAIT received a mismatched payload");
        };

        let start = current_time();
        let mut last_warn = start;
        let mut missing: BTreeSet<String> = BTreeSet::new();

        while current_time() - start < *query_timeout as f64 {
            let args = ctx.args();
            let query_args = match args.get("query") {
                Some(Value::Object(map)) => map.clone(),
                _ => {
                    std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
                    continue;
                }
            };

            if identity.is_empty() {
                let found = query_args
                    .values()
                    .any(|items| matches!(items, Value::Object(map) if map.contains_key(item)));
                if found {
                    return TaskOutcome::success(
                        Some("Item found".to_string()),
                        Some(format!("Item {item} found in the query cache")),
                    );
                }
            } else {
                missing.clear();
                for node in identity {
                    match query_args.get(node) {
                        Some(Value::Object(items)) if items.contains_key(item) => {}
                        _ => {
                            missing.insert(node.clone());
                        }
                    }
                }
                if missing.is_empty() {
                    return TaskOutcome::success(
                        Some("Item found in all identities".to_string()),
                        Some(format!(
                            "Item {item} found in the query cache for identities {identity:?}"
                        )),
                    );
                }
            }

            if current_time() - last_warn >= WARN_EVERY_SECS {
                warn!(
                    "QUERY argument [ {} ] not found in cache for {:?}",
                    item, missing
                );
                last_warn = current_time();
            }
            std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
        }

        let info = if missing.is_empty() {
            format!("Item {item} was not found in the query cache within {query_timeout} seconds")
        } else {
            format!(
                "Item {item} was not found in the query cache for the identities {:?} within {query_timeout} seconds",
                missing.iter().collect::<Vec<_>>()
            )
        };
        TaskOutcome::failure_with_info(format!("Timeout after {query_timeout} seconds"), info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_cache::{Cache, SetOptions};
    use directord_transport::{Driver, DriverConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(DriverConfig::new(
            "inproc://query-wait-test",
            "w1",
        )));
        (dir, TaskContext::new(cache, driver))
    }

    fn wait_job(item: &str, timeout: u64, identity: Vec<String>) -> JobItem {
        JobItem::new(VerbPayload::QueryWait {
            item: item.to_string(),
            query_timeout: timeout,
            identity,
        })
    }

    #[test]
    fn test_present_item_returns_immediately() {
        let (_dir, mut ctx) = context();
        ctx.cache
            .set(
                "args",
                json!({"query": {"w2": {"origin": "east"}}}),
                SetOptions::tagged("args"),
            )
            .unwrap();

        let outcome = QueryWait.client(&mut ctx, &wait_job("origin", 5, vec![]));
        assert!(outcome.outcome);
    }

    #[test]
    fn test_identity_scoped_wait() {
        let (_dir, mut ctx) = context();
        ctx.cache
            .set(
                "args",
                json!({"query": {"w1": {"origin": "east"}, "w2": {"origin": "west"}}}),
                SetOptions::tagged("args"),
            )
            .unwrap();

        let outcome = QueryWait.client(
            &mut ctx,
            &wait_job("origin", 5, vec!["w1".to_string(), "w2".to_string()]),
        );
        assert!(outcome.outcome);
        assert!(outcome.info.unwrap().contains("found in the query cache"));
    }

    #[test]
    fn test_timeout_names_missing_identities() {
        let (_dir, mut ctx) = context();
        ctx.cache
            .set(
                "args",
                json!({"query": {"w1": {"origin": "east"}}}),
                SetOptions::tagged("args"),
            )
            .unwrap();

        let outcome = QueryWait.client(
            &mut ctx,
            &wait_job("origin", 1, vec!["w1".to_string(), "w9".to_string()]),
        );
        assert!(!outcome.outcome);
        let info = outcome.info.unwrap();
        assert!(info.contains("w9"));
        assert!(!info.contains("\"w1\""));
    }
}

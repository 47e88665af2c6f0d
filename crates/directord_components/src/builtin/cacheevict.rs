//! CACHEEVICT: drop tagged cache entries.

use crate::{exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};

#[derive(Parser, Debug)]
#[command(name = "CACHEEVICT", about = "Process cacheevict commands", disable_help_flag = true)]
struct CacheevictExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Tag to evict: args, envs, jobs, parents, query... or 'all'.
    cacheevict: String,
}

pub struct Cacheevict;

impl Component for Cacheevict {
    fn verb(&self) -> &'static str {
        "CACHEEVICT"
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = CacheevictExec::try_parse_from(exec_argv("CACHEEVICT", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::Cacheevict {
                cacheevict: parsed.cacheevict,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Cacheevict { cacheevict: tag } = &job.payload else {
            return TaskOutcome::failure("CACHEEVICT received a mismatched payload");
        };

        if tag.eq_ignore_ascii_case("all") {
            return match ctx.cache.clear() {
                Ok(_) => TaskOutcome::success(Some("All cache has been cleared".to_string()), None),
                Err(e) => TaskOutcome::failure(e.to_string()),
            };
        }

        match ctx.cache.evict(tag) {
            Ok(evicted) => TaskOutcome::success(
                Some(format!("Evicted {evicted} items, tagged {tag}")),
                None,
            ),
            Err(e) => TaskOutcome::failure(e.to_string()),
        }
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
            "inproc://cacheevict-test",
            "w1",
        )));
        (dir, TaskContext::new(cache, driver))
    }

    #[test]
    fn test_evict_tag_reports_count() {
        let (_dir, mut ctx) = context();
        ctx.cache.set("a", json!(1), SetOptions::tagged("jobs")).unwrap();
        ctx.cache.set("b", json!(2), SetOptions::tagged("jobs")).unwrap();
        ctx.cache.set("c", json!(3), SetOptions::tagged("args")).unwrap();

        let job = JobItem::new(VerbPayload::Cacheevict {
            cacheevict: "jobs".to_string(),
        });
        let outcome = Cacheevict.client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(
            outcome.stdout.as_deref(),
            Some("Evicted 2 items, tagged jobs")
        );
        assert_eq!(ctx.cache.len(), 1);
    }

    #[test]
    fn test_all_clears_everything() {
        let (_dir, mut ctx) = context();
        ctx.cache.set("a", json!(1), SetOptions::tagged("jobs")).unwrap();
        ctx.cache.set("b", json!(2), SetOptions::tagged("args")).unwrap();

        let job = JobItem::new(VerbPayload::Cacheevict {
            cacheevict: "all".to_string(),
        });
        let outcome = Cacheevict.client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert!(ctx.cache.is_empty());
    }
}

//! Entry point for running one job description to completion. Grounded
//! on the teacher's own binary crates (`processor`), which are a thin
//! `EngineArgs::run::<Config>` call plus a `RunnableConfig` impl; the job
//! orchestration itself lives entirely in the `engine` library crate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::config::JobConfig;
use engine::job::{Job, JobOutcome};
use engine::plugin::PluginRegistry;
use engine::plugins::register_builtins;
use engine::retry::TracingSink;
use serde::{Deserialize, Serialize};
use server_framework::{EngineArgs, RunnableConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EtlJobConfig {
    name: String,
    #[serde(flatten)]
    job: JobConfig,
}

#[async_trait]
impl RunnableConfig for EtlJobConfig {
    async fn run(&self, _verbose: Option<bool>) -> Result<()> {
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry);

        let sink = TracingSink;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });

        for index in 0..self.job.content.len() {
            let mut job = Job::from_config(&self.job, index, &registry)
                .with_context(|| format!("building job content entry {index}"))?;
            match job.run(&sink, cancel.clone()).await {
                JobOutcome::Success(summary) => {
                    tracing::info!(
                        job = %self.name,
                        tasks_total = summary.tasks_total,
                        tasks_failed = summary.tasks_failed,
                        records_read = summary.records_read,
                        records_written = summary.records_written,
                        records_dirty = summary.records_dirty,
                        "job succeeded"
                    );
                },
                JobOutcome::Failure { summary, cause } => {
                    tracing::error!(job = %self.name, %cause, ?summary, "job failed");
                    anyhow::bail!("job {} failed: {}", self.name, cause);
                },
            }
        }
        Ok(())
    }

    fn get_job_name(&self) -> String {
        self.name.clone()
    }
}

fn main() -> Result<()> {
    let args = <EngineArgs as clap::Parser>::parse();
    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build the tokio runtime")?,
    );
    let handle = runtime.handle().clone();
    runtime.block_on(args.run::<EtlJobConfig>(handle))
}

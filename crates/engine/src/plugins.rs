//! Built-in reference plugins. Real deployments register their own
//! readers/writers against [`PluginRegistry`]; these two exist so the
//! engine binary has something runnable out of the box and so the end-to-
//! end tests don't need a real database. Grounded on the teacher's own
//! convention of shipping a couple of demo processors alongside the
//! framework crate.

use crate::channel::{ChannelReceiver, ChannelSender, ReceiveBatch, SendResult};
use crate::config::{PluginConf, PluginJobConf};
use crate::error::EngineError;
use crate::plugin::{BaseJobScope, PluginRegistry, ReaderJob, ReaderTask, TaskConfig, WriterJob, WriterTask};
use crate::record::{Column, Record};
use async_trait::async_trait;
use serde::Deserialize;

/// `{"name": "sequence", "parameter": {"count": N}}` emits the integers
/// `0..count` on a single column named `n`.
#[derive(Debug, Default)]
pub struct SequenceReaderJob {
    count: u64,
    scope: BaseJobScope,
}

#[derive(Deserialize)]
struct SequenceParam {
    count: u64,
}

#[async_trait]
impl ReaderJob for SequenceReaderJob {
    fn set_plugin_conf(&mut self, conf: PluginConf) {
        self.scope.set_plugin_conf(conf);
    }
    fn set_plugin_job_conf(&mut self, conf: PluginJobConf) {
        self.scope.set_plugin_job_conf(conf);
    }

    async fn init(&mut self) -> Result<(), EngineError> {
        let param: SequenceParam = serde_json::from_value(self.scope.plugin_job_conf.parameter.clone())
            .map_err(|err| EngineError::config("sequence_reader", err.to_string()))?;
        self.count = param.count;
        Ok(())
    }

    async fn split(&mut self, n: usize) -> Result<Vec<TaskConfig>, EngineError> {
        let n = n.max(1) as u64;
        let base = self.count / n;
        let extra = self.count % n;
        let mut configs = Vec::new();
        let mut start = 0u64;
        for i in 0..n {
            let len = base + if (i as u64) < extra { 1 } else { 0 };
            if len == 0 {
                continue;
            }
            let end = start + len;
            configs.push(TaskConfig {
                ordinal: i as usize,
                plugin_job_conf: PluginJobConf {
                    parameter: serde_json::json!({"start": start, "end": end}),
                    split_key: None,
                },
            });
            start = end;
        }
        if configs.is_empty() {
            configs.push(TaskConfig {
                ordinal: 0,
                plugin_job_conf: PluginJobConf {
                    parameter: serde_json::json!({"start": 0, "end": 0}),
                    split_key: None,
                },
            });
        }
        Ok(configs)
    }

    fn build_task(&self, config: TaskConfig) -> Box<dyn ReaderTask> {
        Box::new(SequenceReaderTask { config })
    }
}

struct SequenceReaderTask {
    config: TaskConfig,
}

#[async_trait]
impl ReaderTask for SequenceReaderTask {
    async fn init(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_read(&mut self, sender: ChannelSender) -> Result<(), EngineError> {
        let start = self.config.plugin_job_conf.parameter["start"].as_u64().unwrap_or(0);
        let end = self.config.plugin_job_conf.parameter["end"].as_u64().unwrap_or(0);
        for n in start..end {
            let record = Record::new().with_column("n", Column::BigInt(n as i64));
            if sender.send_writer(record).await == SendResult::Terminated {
                break;
            }
        }
        sender.terminate();
        Ok(())
    }
}

/// `{"name": "log", "parameter": {}}` logs each record through `tracing`
/// and counts them; useful for smoke-testing a pipeline without a sink.
#[derive(Debug, Default)]
pub struct LogWriterJob;

#[async_trait]
impl WriterJob for LogWriterJob {
    fn set_plugin_conf(&mut self, _conf: PluginConf) {}
    fn set_plugin_job_conf(&mut self, _conf: PluginJobConf) {}

    async fn init(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn split(&mut self, n: usize) -> Result<Vec<TaskConfig>, EngineError> {
        Ok((0..n.max(1))
            .map(|i| TaskConfig {
                ordinal: i,
                plugin_job_conf: PluginJobConf::default(),
            })
            .collect())
    }

    fn build_task(&self, config: TaskConfig) -> Box<dyn WriterTask> {
        Box::new(LogWriterTask { ordinal: config.ordinal })
    }
}

struct LogWriterTask {
    ordinal: usize,
}

#[async_trait]
impl WriterTask for LogWriterTask {
    async fn init(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_write(&mut self, receiver: ChannelReceiver) -> Result<(), EngineError> {
        let mut total = 0u64;
        loop {
            match receiver.pull_batch().await {
                ReceiveBatch::Records(batch) => {
                    total += batch.len() as u64;
                    tracing::debug!(ordinal = self.ordinal, batch_len = batch.len(), total, "wrote batch");
                },
                ReceiveBatch::Terminated => return Ok(()),
            }
        }
    }
}

/// Registers the built-in `sequence` reader and `log` writer.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register_reader("sequence", |_param| Box::new(SequenceReaderJob::default()));
    registry.register_writer("log", |_param| Box::new(LogWriterJob));
}

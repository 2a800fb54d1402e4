//! The plugin contract (spec §4.1): two narrow capability sets, Job-scope
//! and Task-scope, implemented by every reader/writer. Grounded on the
//! teacher's `ProcessorStorageTrait` pattern of a required surface plus
//! default-provided helper methods (`processors/mod.rs`), and on
//! `build_processor`/`ProcessorConfig`'s name-keyed factory lookup for the
//! registry.

use crate::channel::{ChannelReceiver, ChannelSender};
use crate::config::{PluginConf, PluginJobConf};
use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for one Task, produced by `Split` and consumed when a
/// TaskGroup instantiates a Task-scope plugin object.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub ordinal: usize,
    pub plugin_job_conf: PluginJobConf,
}

/// Base struct every Job-scope plugin embeds to get the two config setters
/// for free, mirroring the teacher's base-struct-plus-trait composition.
#[derive(Debug, Clone, Default)]
pub struct BaseJobScope {
    pub plugin_conf: PluginConf,
    pub plugin_job_conf: PluginJobConf,
}

impl BaseJobScope {
    pub fn set_plugin_conf(&mut self, conf: PluginConf) {
        self.plugin_conf = conf;
    }

    pub fn set_plugin_job_conf(&mut self, conf: PluginJobConf) {
        self.plugin_job_conf = conf;
    }
}

/// Job-scope capability set (spec §4.1). One instance per logical
/// endpoint; configures and splits.
#[async_trait]
pub trait ReaderJob: Send + Sync {
    fn set_plugin_conf(&mut self, conf: PluginConf);
    fn set_plugin_job_conf(&mut self, conf: PluginJobConf);

    async fn init(&mut self) -> Result<(), EngineError>;
    async fn destroy(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    /// Optional pre-hook (DDL, compaction). No-op by default.
    async fn prepare(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    /// Optional post-hook. No-op by default.
    async fn post(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Partition the source into at least 1 and at most `n` Task configs.
    async fn split(&mut self, n: usize) -> Result<Vec<TaskConfig>, EngineError>;

    /// Build the Task-scope object for one of the configs `split` produced.
    fn build_task(&self, config: TaskConfig) -> Box<dyn ReaderTask>;
}

#[async_trait]
pub trait WriterJob: Send + Sync {
    fn set_plugin_conf(&mut self, conf: PluginConf);
    fn set_plugin_job_conf(&mut self, conf: PluginJobConf);

    async fn init(&mut self) -> Result<(), EngineError>;
    async fn destroy(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn prepare(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn post(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn split(&mut self, n: usize) -> Result<Vec<TaskConfig>, EngineError>;

    fn build_task(&self, config: TaskConfig) -> Box<dyn WriterTask>;
}

/// Task-scope capability set for readers: produce records into `sender`
/// until the source is exhausted, then terminate it.
#[async_trait]
pub trait ReaderTask: Send + Sync {
    async fn init(&mut self) -> Result<(), EngineError>;
    async fn destroy(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn start_read(&mut self, sender: ChannelSender) -> Result<(), EngineError>;
}

/// Task-scope capability set for writers: pull from `receiver` until it
/// signals terminate, applying each batch to the sink.
#[async_trait]
pub trait WriterTask: Send + Sync {
    async fn init(&mut self) -> Result<(), EngineError>;
    async fn destroy(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn start_write(&mut self, receiver: ChannelReceiver) -> Result<(), EngineError>;
}

type ReaderJobFactory = Arc<dyn Fn(&serde_json::Value) -> Box<dyn ReaderJob> + Send + Sync>;
type WriterJobFactory = Arc<dyn Fn(&serde_json::Value) -> Box<dyn WriterJob> + Send + Sync>;

/// Process-wide, write-once-then-read-only map from plugin name to
/// factory, as spec §6/§9 require ("plugins MUST be declaratively
/// registered at process start"; "the plugin registry... initialise once
/// at startup; never mutate after").
#[derive(Default)]
pub struct PluginRegistry {
    readers: HashMap<String, ReaderJobFactory>,
    writers: HashMap<String, WriterJobFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_reader<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Box<dyn ReaderJob> + Send + Sync + 'static,
    {
        self.readers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_writer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Box<dyn WriterJob> + Send + Sync + 'static,
    {
        self.writers.insert(name.into(), Arc::new(factory));
    }

    pub fn build_reader(
        &self,
        name: &str,
        parameter: &serde_json::Value,
    ) -> Result<Box<dyn ReaderJob>, EngineError> {
        let factory = self.readers.get(name).ok_or_else(|| {
            EngineError::config("plugin_registry", format!("unknown reader plugin: {name}"))
        })?;
        Ok(factory(parameter))
    }

    pub fn build_writer(
        &self,
        name: &str,
        parameter: &serde_json::Value,
    ) -> Result<Box<dyn WriterJob>, EngineError> {
        let factory = self.writers.get(name).ok_or_else(|| {
            EngineError::config("plugin_registry", format!("unknown writer plugin: {name}"))
        })?;
        Ok(factory(parameter))
    }
}

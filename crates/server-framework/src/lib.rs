use anyhow::{bail, Context, Ok, Result};
use backtrace::Backtrace;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs::File, io::Read, panic::PanicInfo, path::PathBuf, process};
use tokio::runtime::Handle;
use tracing::error;
use tracing_subscriber::EnvFilter;
use warp::{http::Response, Filter};

/// `EngineArgs` bootstraps a binary with the pieces every entry point needs,
/// then hands off to the `run` method of the specific job config.
#[derive(Parser)]
pub struct EngineArgs {
    #[clap(short, long, value_parser)]
    pub job_path: PathBuf,
    #[clap(short, long)]
    pub verbose: Option<bool>,
}

impl EngineArgs {
    pub async fn run<C>(&self, handle: Handle) -> Result<()>
    where
        C: RunnableConfig,
    {
        let config = load::<GenericConfig<C>>(&self.job_path)?;
        let job_name = config.get_job_name();
        // Set up the process. The panic handler is attached with the job's
        // own name so a crash in one binary's logs is never mistaken for
        // another job running on the same host.
        setup_logging();
        setup_panic_handler(job_name.clone());
        run_with_config(config, job_name, handle, self.verbose).await
    }
}

/// Runs a job plus the health/metrics probes. The caller provides a handle
/// to a runtime they already own so both can be spawned on it.
pub async fn run_with_config<C>(
    config: GenericConfig<C>,
    job_name: String,
    handle: Handle,
    verbose: Option<bool>,
) -> Result<()>
where
    C: RunnableConfig,
{
    let health_port = config.health_check_port;
    tracing::info!(job = %job_name, health_port, "starting job");
    let probe_handler = handle.spawn(async move {
        register_probes_and_metrics_handler(health_port, job_name).await;
        Ok(())
    });
    let job_handler = handle.spawn(async move { config.run(verbose).await });
    tokio::select! {
        _ = probe_handler => {
            error!("Probes and metrics handler unexpectedly exited");
            bail!("Probes and metrics handler unexpectedly exited");
        },
        res = job_handler => {
            res.context("job task panicked")??;
        },
    }
    Ok(())
}

#[derive(Deserialize, Debug, Serialize)]
pub struct GenericConfig<T> {
    // Shared configuration among all jobs.
    pub health_check_port: u16,

    // Specific configuration for this job.
    pub job_config: T,
}

#[async_trait::async_trait]
impl<T> RunnableConfig for GenericConfig<T>
where
    T: RunnableConfig,
{
    async fn run(&self, verbose: Option<bool>) -> Result<()> {
        self.job_config.run(verbose).await
    }

    fn get_job_name(&self) -> String {
        self.job_config.get_job_name()
    }
}

/// `RunnableConfig` is implemented once per job binary; the engine bootstrap
/// handles everything else (logging, panics, probes).
#[async_trait::async_trait]
pub trait RunnableConfig: DeserializeOwned + Send + Sync + 'static {
    async fn run(&self, verbose: Option<bool>) -> Result<()>;
    fn get_job_name(&self) -> String;
}

/// Parse a JSON file into a struct. Job descriptions are JSON (see the
/// engine's job config contract), not YAML.
pub fn load<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<T> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open the file at path: {:?}", path))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("failed to read the file at path: {:?}", path))?;
    serde_json::from_str::<T>(&contents).context("unable to parse job JSON")
}

#[derive(Debug, Serialize)]
pub struct CrashInfo {
    job: String,
    details: String,
    backtrace: String,
}

/// Invoke to ensure the process exits on a thread panic.
///
/// Tokio's default behavior is to catch panics and ignore them. Invoking
/// this ensures all subsequent thread panics (even Tokio threads) report
/// details/backtrace and then exit, rather than silently wedging a Task
/// with half its reader/writer pairs gone.
pub fn setup_panic_handler(job_name: String) {
    std::panic::set_hook(Box::new(move |pi: &PanicInfo<'_>| {
        handle_panic(&job_name, pi);
    }));
}

fn handle_panic(job_name: &str, panic_info: &PanicInfo<'_>) {
    let details = format!("{}", panic_info);
    let backtrace = format!("{:#?}", Backtrace::new());
    let info = CrashInfo { job: job_name.to_string(), details, backtrace };
    let crash_info = toml::to_string_pretty(&info).unwrap();
    error!("{}", crash_info);
    // Write synchronously too, since error! doesn't guarantee a flush before exit.
    eprintln!("{}", crash_info);
    process::exit(12);
}

/// Set up structured logging for the process.
pub fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::fmt()
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .init();
}

/// Register readiness/liveness probes and the Prometheus metrics endpoint.
/// The readiness body echoes `job_name` so a host running several job
/// binaries on adjacent ports can tell which probe answered.
async fn register_probes_and_metrics_handler(port: u16, job_name: String) {
    let readiness = warp::path("readiness").map(move || {
        warp::reply::with_status(format!("ready: {job_name}"), warp::http::StatusCode::OK)
    });
    let metrics_endpoint = warp::path("metrics").map(|| {
        let metrics = prometheus::gather();
        let mut encode_buffer = vec![];
        let encoder = TextEncoder::new();
        // If metrics encoding fails, we want to panic and crash the process.
        encoder
            .encode(&metrics, &mut encode_buffer)
            .context("Failed to encode metrics")
            .unwrap();

        Response::builder()
            .header("Content-Type", "text/plain")
            .body(encode_buffer)
    });
    warp::serve(readiness.or(metrics_endpoint))
        .run(([0, 0, 0, 0], port))
        .await;
}

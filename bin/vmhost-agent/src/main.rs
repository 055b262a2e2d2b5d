// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use slog::info;
use vmhost_agent::agent::Agent;
use vmhost_agent::engine::SimulatedEngine;
use vmhost_agent::server;
use vmhost_agent::storage::DirectoryStore;

/// Threads to spawn for tokio runtime handling the API (dropshot, etc)
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server managing the VMs on one hypervisor host
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the agent.
    Run {
        /// Path to the agent's TOML configuration.
        #[clap(action)]
        config: PathBuf,

        #[clap(name = "AGENT_IP:PORT", action)]
        agent_addr: SocketAddr,

        /// Logging level for the server
        #[clap(
            long,
            default_value_t = slog::Level::Info,
            value_parser = parse_log_level
        )]
        log_level: slog::Level,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("VM Host Agent API", semver::Version::new(0, 0, 1))
        .description("API for managing the VMs on one hypervisor host.")
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn run_server(
    config_path: PathBuf,
    agent_addr: SocketAddr,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let config = vmhost_config_toml::parse(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    std::fs::create_dir_all(&config.agent.state_dir).with_context(|| {
        format!("creating state directory {}", config.agent.state_dir.display())
    })?;

    let api_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(API_RT_THREADS)
        .thread_name("tokio-rt-api")
        .enable_all()
        .build()?;

    api_runtime.block_on(async move {
        let storage = Arc::new(DirectoryStore::new(
            config.agent.state_dir.clone(),
            config.capacity.volume_bytes,
        ));
        let (engine, events) = SimulatedEngine::new(
            log.new(slog::o!("component" => "engine")),
        );
        let agent = Arc::new(Agent::new(
            config,
            storage,
            Arc::new(engine),
            log.clone(),
        ));
        let _events = agent.spawn_event_handler(events);

        info!(log, "Starting server...");
        let server = server::start(agent, agent_addr, &log)?;
        server.await.map_err(|e| anyhow!("Server exited with an error: {}", e))
    })
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("vmhost-agent", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), slog::o!())
}

fn main() -> anyhow::Result<()> {
    // Command line arguments.
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { config, agent_addr, log_level } => {
            let log = build_logger(log_level);
            run_server(config, agent_addr, log)
        }
    }
}

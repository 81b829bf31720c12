//! MCP Auth Proxy - authorizing reverse proxy for MCP servers

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_auth_proxy::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    policy::ScopePolicy,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_config(cli: &Cli) -> mcp_auth_proxy::Result<Config> {
    Config::load_with(cli.config.as_deref(), |config| {
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(host) = &cli.host {
            config.server.host.clone_from(host);
        }
    })
}

/// Print the effective configuration
fn check_config(config: &Config) -> ExitCode {
    let paths = &config.backend.paths;
    println!("Configuration OK");
    println!("  Listen:        {}:{}", config.server.host, config.server.port);
    println!("  Backend:       {}", config.backend.base_url);
    println!(
        "  Auth server:   {} ({:?} mode)",
        if config.auth_server.base_url.is_empty() {
            "<none>"
        } else {
            config.auth_server.base_url.as_str()
        },
        config.auth_server.mode
    );
    println!("  JWKS:          {}", config.auth_server.jwks_url);
    println!("  Resource:      {}", config.resource.identifier);
    println!("  Audience:      {}", config.resource.audience);
    println!("  Cutover:       {}", config.resource.protocol_cutover);
    println!("  SSE path:      {}", paths.sse);
    println!("  Messages path: {}", paths.messages);
    if let Some(path) = &paths.streamable_http {
        println!("  Streamable:    {path}");
    }
    for (from, to) in &config.backend.path_mapping {
        println!("  Mapped:        {from} -> {to}");
    }

    let policy = ScopePolicy::from_config(&config.required_scopes);
    if policy.is_empty() {
        println!("  Scope policy:  <none>");
    } else {
        println!("  Scope policy:");
        for (method, target, scopes) in policy.table() {
            let key = match target {
                Some(target) => format!("{method} [{target}]"),
                None => method,
            };
            println!("    {key:<32} any of {}", scopes.join(", "));
        }
    }

    if config.command.enabled {
        match config
            .command
            .shell_command(&config.backend.base_url, &config.backend.paths)
        {
            Ok(line) => println!("  Command:       {line}"),
            Err(e) => {
                eprintln!("Invalid command: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backend = %config.backend.base_url,
        "Starting MCP auth proxy"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            if e.is_fatal_at_startup() {
                error!("Startup aborted: {e}");
            } else {
                error!("Failed to create gateway: {e}");
            }
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

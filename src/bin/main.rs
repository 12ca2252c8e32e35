use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use mcp_atlassian_gateway::auth::{DEFAULT_REFRESH_MARGIN_SECONDS, IdentityResolver};
use mcp_atlassian_gateway::client::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECONDS};
use mcp_atlassian_gateway::{McpServer, ResolverOptions, Settings, create_server};

// rmcp imports for MCP stdio server mode
use rmcp::service::ServiceExt;
use rmcp::transport::stdio;

#[derive(Parser)]
#[command(name = "mcp-atlassian-gateway")]
#[command(about = "Multi-user MCP gateway for Jira and Confluence")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as an MCP Streamable HTTP server with per-request credentials
    Http {
        /// Bind address, e.g. 0.0.0.0:8000
        #[arg(long, env = "MCP_ATLASSIAN_BIND", default_value = "127.0.0.1:8000")]
        bind: String,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Run as an MCP stdio server (for use in mcp.json) with the configured identity
    Stdio {
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Report which backends are configured and whether their fallback identity is usable
    CheckConfig {
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args)]
struct Tuning {
    /// Maximum number of cached backend clients
    #[arg(long, env = "MCP_ATLASSIAN_CACHE_MAX_ENTRIES", default_value_t = DEFAULT_MAX_ENTRIES)]
    cache_max_entries: usize,
    /// Seconds a cached backend client stays usable
    #[arg(long, env = "MCP_ATLASSIAN_CACHE_TTL_SECS", default_value_t = DEFAULT_TTL_SECONDS)]
    cache_ttl_secs: u64,
    /// Refresh OAuth access tokens this many seconds before they expire
    #[arg(long, env = "MCP_ATLASSIAN_REFRESH_MARGIN_SECS", default_value_t = DEFAULT_REFRESH_MARGIN_SECONDS)]
    refresh_margin_secs: u64,
    /// Check per-request credentials against the current-user endpoint before caching a client
    #[arg(
        long,
        env = "MCP_ATLASSIAN_VALIDATE_ON_CONNECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    validate_on_connect: bool,
}

impl Tuning {
    fn options(&self) -> ResolverOptions {
        ResolverOptions {
            cache_max_entries: self.cache_max_entries.max(1),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            refresh_margin: Duration::from_secs(self.refresh_margin_secs),
            validate_on_connect: self.validate_on_connect,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mcp_atlassian_gateway=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Http { bind, tuning } => {
            info!("Starting MCP HTTP server (rmcp) on {}", bind);

            let server = create_server(settings, &tuning.options())?;
            log_configuration(server.resolver()).await;

            mcp_atlassian_gateway::start_mcp_http(server.as_ref().clone(), &bind).await?;
        }
        Commands::Stdio { tuning } => {
            info!("Starting MCP stdio server (rmcp)");

            let server = create_server(settings, &tuning.options())?;
            log_configuration(server.resolver()).await;

            // Run as an MCP stdio server. McpServer implements ServerHandler.
            let service = McpServer::clone(&server)
                .serve(stdio())
                .await
                .inspect_err(|e| tracing::error!("serving error: {:?}", e))?;

            // Block until the MCP session ends.
            service.waiting().await?;
            info!("MCP stdio server session ended");
        }
        Commands::CheckConfig { tuning } => {
            let read_only = settings.read_only;
            let server = create_server(settings, &tuning.options())?;
            let statuses = server.resolver().check_configuration().await;

            if statuses.is_empty() {
                println!("No backends configured. Set JIRA_URL and/or CONFLUENCE_URL.");
                return Ok(());
            }

            println!("{:<12} {:<14} {:<10} {}", "BACKEND", "DEPLOYMENT", "FALLBACK", "STATUS");
            println!("{}", "-".repeat(60));
            for status in statuses {
                let (fallback, detail) = match &status.fallback {
                    Ok(label) => (*label, "ok".to_string()),
                    Err(e) => ("-", e.to_string()),
                };
                println!(
                    "{:<12} {:<14} {:<10} {}",
                    status.backend.product(),
                    status.deployment.as_str(),
                    fallback,
                    detail
                );
            }
            if read_only {
                println!();
                println!("Read-only mode: write tools are hidden and refused.");
            }
        }
    }

    Ok(())
}

async fn log_configuration(resolver: &IdentityResolver) {
    let statuses = resolver.check_configuration().await;
    if statuses.is_empty() {
        warn!("No Atlassian backends configured; no tools will be listed");
    }
}

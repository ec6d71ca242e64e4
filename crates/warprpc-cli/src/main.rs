//! # warprpc CLI Entry Point
//!
//! Runs the coordination service, hosts the built-in `Echo` service, or
//! makes a single call.
//!
//! ## Usage
//!
//! ```bash
//! # Start the coordination service
//! warprpc coordinator -b 127.0.0.1:2181
//!
//! # Host Echo on port 9000, registering through the coordinator
//! warprpc serve -p 9000 -r 127.0.0.1:2181
//!
//! # Call it (prints the raw JSON result)
//! warprpc call Echo echo -a '["hello"]' -r 127.0.0.1:2181
//! ```
//!
//! `WARPRPC_REGISTRY_ADDR` supplies the registry address when `-r` is not
//! given.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use warprpc_client::RpcClient;
use warprpc_common::config::{ClientConfig, CommonConfig, SerializeKind, ServerConfig};
use warprpc_common::RpcValue;
use warprpc_registry::{CoordinatorConfig, CoordinatorServer};
use warprpc_server::{echo_service, RpcServer};

#[derive(FromArgs)]
/// warprpc - registry-backed RPC framework
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Coordinator(CoordinatorArgs),
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for running the coordination service.
///
/// Servers and clients keep a session here; entries of a session that
/// stops heartbeating are removed after the session timeout.
#[derive(FromArgs)]
#[argh(subcommand, name = "coordinator")]
/// run the coordination service
struct CoordinatorArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "\"127.0.0.1:2181\".into()")]
    bind: String,

    /// session timeout in milliseconds
    #[argh(option, long = "session-timeout-ms", default = "10000")]
    session_timeout_ms: u64,
}

/// Arguments for hosting `Echo`.
///
/// The server registers itself through the registry and keeps serving
/// until ctrl-c, then unregisters.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// host the built-in Echo service
struct ServeArgs {
    /// port to listen on
    #[argh(option, short = 'p', default = "9000")]
    port: u16,

    /// interface to bind
    #[argh(option, long = "bind-host", default = "\"0.0.0.0\".into()")]
    bind_host: String,

    /// host published in the registry
    #[argh(option, long = "advertise-host", default = "\"127.0.0.1\".into()")]
    advertise_host: String,

    /// registry address (defaults to $WARPRPC_REGISTRY_ADDR, then 127.0.0.1:2181)
    #[argh(option, short = 'r', long = "registry")]
    registry: Option<String>,

    /// body encoding: binary or json
    #[argh(option, long = "serialize", default = "SerializeKind::Binary")]
    serialize: SerializeKind,

    /// application name recorded in registry entries
    #[argh(option, long = "application")]
    application: Option<String>,
}

/// Arguments for a single call.
///
/// Arguments are given as a JSON array, one element per argument. The
/// result is printed as compact JSON on stdout so it can be piped to `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method and print the JSON result
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// arguments as a JSON array
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// registry address (defaults to $WARPRPC_REGISTRY_ADDR, then 127.0.0.1:2181)
    #[argh(option, short = 'r', long = "registry")]
    registry: Option<String>,

    /// body encoding: binary or json
    #[argh(option, long = "serialize", default = "SerializeKind::Binary")]
    serialize: SerializeKind,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "3000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Coordinator(args) => run_coordinator(args).await,
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

/// Flag beats environment, environment beats the default.
fn common_config(registry: Option<String>, serialize: SerializeKind) -> CommonConfig {
    let common = CommonConfig::default()
        .with_env_overrides()
        .with_serialize_kind(serialize);
    match registry {
        Some(addr) => common.with_registry_addr(addr),
        None => common,
    }
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let config = CoordinatorConfig::default()
        .with_bind_addr(args.bind.clone())
        .with_session_timeout(Duration::from_millis(args.session_timeout_ms));
    let server = CoordinatorServer::bind(config)
        .await
        .with_context(|| format!("failed to start coordinator on {}", args.bind))?;
    let shutdown = server.shutdown_token();
    let handle = server.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down coordinator");
    shutdown.cancel();
    handle.await.context("coordinator task failed")??;
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut common = common_config(args.registry, args.serialize);
    if let Some(application) = args.application {
        common = common.with_application_name(application);
    }
    let config = ServerConfig::default()
        .with_common(common)
        .with_port(args.port)
        .with_bind_host(args.bind_host)
        .with_advertise_host(args.advertise_host);

    let server = RpcServer::start(config).await.context("failed to start server")?;
    let entry = server
        .register_service(echo_service())
        .await?
        .await
        .context("failed to publish Echo")?;
    tracing::info!(
        addr = %server.local_addr(),
        node = ?entry.node_id,
        "serving Echo"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    server.stop().await;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let call_args = parse_call_args(&args.args)?;
    let config = ClientConfig::default()
        .with_common(common_config(args.registry, args.serialize))
        .with_call_timeout(Duration::from_millis(args.timeout_ms));

    let client = RpcClient::new(config).await.context("failed to start client")?;
    let result = client.call(&args.service, &args.method, call_args).await;
    client.close().await;

    let value = serde_json::Value::from(result?);
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

fn parse_call_args(raw: &str) -> Result<Vec<RpcValue>> {
    let parsed: serde_json::Value =
        serde_json::from_str(raw).context("args must be valid JSON")?;
    match parsed {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(RpcValue::from).collect()),
        other => bail!("args must be a JSON array, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_coordinator_defaults() {
        let args: Cli = Cli::from_args(&["warprpc"], &["coordinator"]).unwrap();
        match args.command {
            Commands::Coordinator(CoordinatorArgs {
                bind,
                session_timeout_ms,
            }) => {
                assert_eq!(bind, "127.0.0.1:2181");
                assert_eq!(session_timeout_ms, 10000);
            }
            _ => panic!("Expected Coordinator command"),
        }
    }

    #[test]
    fn test_cli_parse_serve() {
        let args: Cli = Cli::from_args(
            &["warprpc"],
            &[
                "serve",
                "-p", "9100",
                "-r", "10.0.0.5:2181",
                "--serialize", "json",
                "--application", "demo",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                port,
                bind_host,
                advertise_host,
                registry,
                serialize,
                application,
            }) => {
                assert_eq!(port, 9100);
                assert_eq!(bind_host, "0.0.0.0");
                assert_eq!(advertise_host, "127.0.0.1");
                assert_eq!(registry.as_deref(), Some("10.0.0.5:2181"));
                assert_eq!(serialize, SerializeKind::Json);
                assert_eq!(application.as_deref(), Some("demo"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_serializer() {
        let result = Cli::from_args(&["warprpc"], &["serve", "--serialize", "hessian"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["warprpc"],
            &["call", "Echo", "echo", "-a", "[\"hello\"]", "--timeout-ms", "500"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                service,
                method,
                args,
                registry,
                serialize,
                timeout_ms,
            }) => {
                assert_eq!(service, "Echo");
                assert_eq!(method, "echo");
                assert_eq!(args, "[\"hello\"]");
                assert!(registry.is_none());
                assert_eq!(serialize, SerializeKind::Binary);
                assert_eq!(timeout_ms, 500);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_parse_call_args() {
        let parsed = parse_call_args("[\"hello\", 3, true]").unwrap();
        assert_eq!(
            parsed,
            vec![RpcValue::from("hello"), RpcValue::Int(3), RpcValue::Bool(true)]
        );
        assert!(parse_call_args("[]").unwrap().is_empty());
        assert!(parse_call_args("{\"a\": 1}").is_err());
        assert!(parse_call_args("not json").is_err());
    }

    #[test]
    fn test_registry_flag_wins() {
        let config = common_config(Some("10.1.1.1:2181".to_string()), SerializeKind::Json);
        assert_eq!(config.registry_addr, "10.1.1.1:2181");
        assert_eq!(config.serialize_kind, SerializeKind::Json);
    }
}

//! `caprpc` entry point.
//!
//! ## Commands
//!
//! - `caprpc serve [--listen ADDR]`: serve the `Echo` demo service over TCP
//!   until Ctrl+C, then wait for connected peers to leave.
//! - `caprpc call [--connect ADDR] --text T [--reverse]`: bootstrap the
//!   server's `Echo` capability and print its reply.
//!
//! Settings come from `caprpc.toml` (or `CAPRPC_CONFIG`); flags override them.

mod echo;

use std::path::PathBuf;

use caprpc::Client;
use caprpc::RpcConfig;
use caprpc::Value;
use caprpc::two_party::TwoPartyClient;
use caprpc::two_party::TwoPartyServer;
use clap::Parser;
use clap::Subcommand;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use crate::echo::Echo;
use crate::echo::echo_request;

#[derive(Debug, Parser)]
#[command(name = "caprpc", version, about = "Capability RPC demo server and client")]
struct Cli {
    /// Config file to load instead of the default lookup.
    #[arg(long = "config", short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log every RPC message at debug level.
    #[arg(long = "trace-messages", global = true)]
    trace_messages: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the Echo service.
    Serve(ServeArgs),
    /// Call a running Echo service once.
    Call(CallArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Address to listen on (overrides `[server] listen`).
    #[arg(long = "listen", short = 'l')]
    listen: Option<String>,
}

#[derive(Debug, Parser)]
struct CallArgs {
    /// Server address (overrides `[client] connect`).
    #[arg(long = "connect")]
    connect: Option<String>,

    /// Text to send.
    #[arg(long = "text", short = 't')]
    text: String,

    /// Ask the server to reverse the text instead of echoing it.
    #[arg(long = "reverse")]
    reverse: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => RpcConfig::load_from_path(path)?,
        None => RpcConfig::load()?,
    };
    if cli.trace_messages {
        config.rpc.trace_messages = true;
    }

    // The engine is single-threaded: everything runs on one LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        match cli.command {
            Command::Serve(args) => {
                if let Some(listen) = args.listen {
                    config.server.listen = listen;
                }
                serve(config).await
            }
            Command::Call(args) => {
                if let Some(connect) = args.connect.clone() {
                    config.client.connect = connect;
                }
                call(config, args).await
            }
        }
    })
}

async fn serve(config: RpcConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server.listen).await?;
    tracing::info!(
        "caprpc v{} serving Echo on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    let server = TwoPartyServer::with_config(Client::new(Echo::default()), config);
    tokio::select! {
        result = server.listen(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(
                "Signal received, shutting down (connections: {})",
                server.connection_count()
            );
        }
    }

    server.drain().await;
    tracing::info!("caprpc exiting cleanly");
    Ok(())
}

async fn call(config: RpcConfig, args: CallArgs) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&config.client.connect).await?;
    stream.set_nodelay(true)?;
    tracing::debug!("connected to {}", config.client.connect);

    let (reader, writer) = stream.into_split();
    let client = TwoPartyClient::new(reader, writer, &config);
    let echo = client.bootstrap();

    let method_id = if args.reverse {
        echo::method::REVERSE
    } else {
        echo::method::ECHO
    };
    let response = echo_request(&echo, method_id, &args.text)
        .send()
        .promise
        .await?;
    let content = response.content();
    let text = content.get("text").and_then(Value::as_text).unwrap_or_default();
    let count = content.get("count").and_then(Value::as_uint).unwrap_or_default();
    println!("{text}");
    tracing::info!("server has answered {count} call(s)");
    Ok(())
}

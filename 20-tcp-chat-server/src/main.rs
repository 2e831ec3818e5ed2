use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use tcp_chat_server::{
    cli::{Cli, Command},
    client,
    server::ChatServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let listener = match TcpListener::bind(args.listen).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(listen = %args.listen, error = ?err, "failed to bind listener");
                    return Err(err).with_context(|| format!("failed to bind {}", args.listen));
                }
            };
            let server = ChatServer::new(listener, args.config());
            let addr = server.local_addr()?;
            info!("chat server listening on {}", addr);
            server.run_until_ctrl_c().await?;
            info!("chat server stopped");
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

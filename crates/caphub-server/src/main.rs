use std::sync::Arc;

use caphub::{Hub, HubConfig};
use caphub_server::handlers::EchoHandler;
use caphub_server::http::{router, AppState};
use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "caphub-server")]
struct Args {
    #[arg(long, env = "CAPHUB_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = HubConfig::from_env();

    let hub = match Hub::builder()
        .with_config(config)
        .with_handler(Arc::new(EchoHandler))
        .build()
        .await
    {
        Ok(hub) => Arc::new(hub),
        Err(err) => {
            eprintln!("failed to build hub: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = hub.start().await {
        eprintln!("failed to start hub: {err}");
        std::process::exit(2);
    }

    let app = router(AppState { hub: hub.clone() });
    let listener = match tokio::net::TcpListener::bind(&args.http_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {}: {err}", args.http_addr);
            std::process::exit(2);
        }
    };
    info!(addr = %args.http_addr, "caphub server listening");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                eprintln!("server error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }
    hub.shutdown().await;
}

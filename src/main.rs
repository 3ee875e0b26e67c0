use anyhow::Result;
use clap::Parser;
use pisa::app::{App, Options};
use pisa::shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = Options::parse();
    let host_name = options.server.host_name.clone();
    let host_port = options.server.host_port;

    let app = Arc::new(App::new(options).await?);
    app.start().await;

    let addr: SocketAddr = format!("{host_name}:{host_port}").parse()?;
    info!(%addr, "listening");

    shutdown::watch_shutdown_signals();
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown::await_shutdown().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        }
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.router().into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    app.shutdown().await;
    Ok(())
}

use anyhow::Context;
use axum::serve;
use deskchat_node::storage::SledStore;
use deskchat_node::{init_tracing, router, AppConfig, AppState};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let store = SledStore::open(&config.storage_path).with_context(|| {
        format!(
            "failed to open local storage at {}",
            config.storage_path.display()
        )
    })?;
    let state = AppState::new(config.clone(), Arc::new(store));

    let app = router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        build_id = %config.build_id,
        workspace_id = %config.workspace_id,
        "starting DeskChat node service"
    );

    serve(listener, app).await?;
    Ok(())
}

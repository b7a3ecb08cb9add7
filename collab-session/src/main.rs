use collab_session::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("collab_session=info"))
        .init();

    let config = ServerConfig::from_env()?;
    let server = SyncServer::open(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
        }
    }

    server.shutdown().await;
    Ok(())
}

use clap::Parser;
use env_logger::Env;
use log::{error, info, LevelFilter};
use lpr_push::server::detect_local_ip;
use lpr_push::{Config, ImageStore, LogSubscriber, NotificationHandler, Server};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()))
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("warp", LevelFilter::Warn)
        .init();
    info!("Starting lpr-push");

    let image_dir = config.image_dir();
    let store = match ImageStore::open(&image_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("Cannot use image directory {}: {}", image_dir.display(), e);
            process::exit(1);
        }
    };

    let dispatcher = config.dispatcher();
    dispatcher.subscribe(Arc::new(LogSubscriber));
    let handler = NotificationHandler::new(store, dispatcher);
    let mut server = Server::new(handler)
        .with_shutdown_grace(config.shutdown_grace())
        .with_max_body_bytes(config.max_body_bytes);

    let addr = match server.start(config.host, config.port).await {
        Ok(addr) => addr,
        Err(e) => {
            error!("Server failed to start: {}", e);
            process::exit(1);
        }
    };
    info!("Server starting at http://{}", addr);
    info!("Detected local IP: {}", detect_local_ip());
    info!("Image directory: {}", image_dir.display());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    if let Err(e) = server.stop().await {
        error!("Error stopping server: {}", e);
    }
    info!("Exiting main");
}

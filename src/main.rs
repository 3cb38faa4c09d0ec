use actix_web::web;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use evald::config::{CliArgs, Config};
use evald::evaluator::Evaluator;
use evald::sandbox::flush_scratch_dir;
use evald::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();

    let Config {
        server: server_config,
        evaluation: evaluation_config,
    } = cli.to_config().expect("Failed to load configuration");

    let evaluator_config = evaluation_config
        .resolve()
        .expect("Invalid evaluation configuration");

    let shutdown_token = CancellationToken::new();
    let evaluator = Evaluator::build(evaluator_config, shutdown_token.clone())
        .expect("Failed to initialize evaluator");

    if cli.flush_scratch {
        if let Err(e) = flush_scratch_dir(&evaluator.config().scratch_dir) {
            log::warn!("Unable to flush scratch dir: {e:#}");
        }
    }

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(server_config, web::Data::new(evaluator))?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Kill every evaluation program still running
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to running evaluations");

    // 2. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}

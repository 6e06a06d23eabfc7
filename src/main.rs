// AfriFutures Settlement Engine - Main Entry Point
// Wires both chains, the bridge and the background jobs, then serves the read API

use std::process::ExitCode;
use tracing::{error, info, warn};

use afrifutures_settlement::app_state::AppState;
use afrifutures_settlement::config::EngineConfig;
use afrifutures_settlement::handlers;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("❌ Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt().with_max_level(config.log_level).init();

    println!("\n═══════════════════════════════════════════════");
    println!("     🌍 AfriFutures Settlement Engine");
    println!("═══════════════════════════════════════════════\n");

    let engine = match AppState::build(&config) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "failed to build engine");
            return ExitCode::FAILURE;
        }
    };
    let state = engine.state;
    let mut scheduler = engine.scheduler;

    // Pick up transfers a previous run left mid-flight
    if let Some(bridge) = &state.bridge {
        match bridge.resume_pending() {
            Ok(resumed) if !resumed.is_empty() => info!(count = resumed.len(), "resumed unfinished transfers"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "could not scan transfer journal"),
        }
    }
    scheduler.start();

    let app = handlers::router(state.clone());

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %config.listen_addr, error = %err, "cannot bind");
            scheduler.stop().await;
            return ExitCode::FAILURE;
        }
    };

    info!(
        addr = %config.listen_addr,
        mock_mode = state.mock_mode,
        bridge = state.bridge.is_some(),
        "server running"
    );
    println!("📋 Available Endpoints:");
    println!("   GET  /health                                  - Engine status");
    println!("   GET  /markets/:chain                          - List markets with odds");
    println!("   GET  /markets/:chain/:id                      - Market details");
    println!("   GET  /markets/:chain/:id/quote?side=&amount=  - Payout quote");
    println!("   GET  /markets/:chain/:id/positions/:account   - User position");
    println!("   GET  /balance/:chain/:account                 - USDC balance");
    println!("   GET  /portfolio?polygon=&solana=              - Portfolio report");
    println!("   GET  /bridge/transfers[/:id]                  - Bridge transfers");
    println!("   GET  /jobs                                    - Background jobs\n");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "cannot listen for shutdown signal");
            }
            println!("\n\n🛑 Shutdown signal received...");
        })
        .await;

    scheduler.stop().await;

    match served {
        Ok(()) => {
            println!("👋 Goodbye!\n");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "server error");
            ExitCode::FAILURE
        }
    }
}

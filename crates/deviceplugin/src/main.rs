use std::process::ExitCode;

use clap::Parser;
use deviceplugin::config::Cli;
use deviceplugin::logging;
use deviceplugin::orchestrator::Handlers;
use deviceplugin::orchestrator::Orchestrator;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Resolves on the first SIGHUP, SIGINT, SIGTERM or SIGQUIT.
async fn termination_signal() {
    let kinds = [
        SignalKind::hangup(),
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ];

    let mut streams = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(e) => tracing::error!("failed to install handler for {kind:?}: {e}"),
        }
    }

    if streams.is_empty() {
        std::future::pending::<()>().await;
    }

    let received = streams.iter_mut().map(|stream| Box::pin(stream.recv()));
    futures::future::select_all(received).await;
    tracing::info!("Received termination signal");
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_global_hooks();

    let cli = Cli::parse();
    let logging = logging::init();

    Orchestrator::from_cli(&cli, Handlers::linux())
        .with_logging(logging)
        .run(termination_signal())
        .await
        .into()
}

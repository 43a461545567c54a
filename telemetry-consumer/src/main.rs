use std::{env, process::ExitCode};

use getopts::Options;
use telemetry_consumer::{config::ConsumerConfig, install_exporter, run};
use tokio::{runtime, signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("telemetry-consumer");
    let opts = ConsumerConfig::options();

    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            print_usage(program, &opts);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return ExitCode::SUCCESS;
    }

    let config = match ConsumerConfig::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration.");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime.");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        if let Some(address) = config.prometheus_listen {
            install_exporter(address)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal.");
            }
            info!("Shutting down.");
            let _ = shutdown_tx.send(true);
        });

        info!(
            nsqd = %config.nsqd_address,
            metrics_topic = %config.metrics_topic,
            logs_topic = %config.logs_topic,
            "Starting telemetry consumer."
        );
        run(config, shutdown_rx).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Telemetry consumer failed.");
            ExitCode::FAILURE
        }
    }
}

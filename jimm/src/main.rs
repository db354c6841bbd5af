#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use jimm::config::ConfHandle;

use crate::service::JimmService;

struct Cli {
    config_path: Option<Utf8PathBuf>,
    action: Action,
}

enum Action {
    Run,
    ConfigDump,
    Help,
}

fn main() -> anyhow::Result<()> {
    let cli = parse_cli()?;

    match cli.action {
        Action::Help => print_usage(),
        Action::ConfigDump => {
            let conf = ConfHandle::init(cli.config_path)
                .context("unable to initialize configuration")?
                .get_conf();
            println!("{conf:#?}");
        }
        Action::Run => run_service(cli.config_path)?,
    }

    Ok(())
}

fn parse_cli() -> anyhow::Result<Cli> {
    let mut cli = Cli {
        config_path: None,
        action: Action::Run,
    };

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                let value = args.next().context("--config-path requires a value")?;
                cli.config_path = Some(Utf8PathBuf::from(value));
            }
            "--config-dump" => cli.action = Action::ConfigDump,
            "--help" | "-h" => cli.action = Action::Help,
            unknown => {
                eprintln!("unrecognized argument: {unknown}");
                cli.action = Action::Help;
            }
        }
    }

    Ok(cli)
}

fn print_usage() {
    println!(
        "USAGE:
    jimm [OPTIONS]

OPTIONS:
    --config-path <PATH>    Read the configuration from PATH
    --config-dump           Print the resolved configuration and exit
    --help                  Show this help"
    );
}

fn run_service(config_path: Option<Utf8PathBuf>) -> anyhow::Result<()> {
    jimm::tls::install_default_crypto_provider();

    let conf_handle = ConfHandle::init(config_path).context("unable to initialize configuration")?;

    let mut service = JimmService::load(conf_handle).context("service loading failed")?;
    service.start().context("service failed to start")?;

    // The worker runtime belongs to the service; signal handling gets its own
    // small one.
    let signals_rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the signal runtime")?;
    signals_rt.block_on(wait_for_stop_signal())?;

    service.stop();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM stream")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT stream")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL-C handler")?;
    info!("Received interrupt");
    Ok(())
}

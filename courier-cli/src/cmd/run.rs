use clap::Args;
use courier::config::{BrokerKind, Config, RunConfig};
use courier::{BrokerClient, Emulator, NatsBroker, Scenario};
use log::{debug, error, info};
use std::io::{Error, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub(crate) struct Opts {
    /// Sets a custom config file
    #[clap(
        short,
        long,
        parse(from_os_str),
        value_name = "FILE",
        default_value = "courier.toml"
    )]
    config: PathBuf,

    /// Talk to this nats server instead of the configured broker
    #[clap(long, value_name = "URI", conflicts_with = "emulator")]
    nats_uri: Option<String>,

    /// Use the in-process emulator regardless of the config file
    #[clap(long)]
    emulator: bool,
}

pub(crate) async fn handle(opts: Opts) -> Result<(), Error> {
    // Load the courier config...
    // build the config path from current dir...
    let dir = std::env::current_dir()?;
    let mut config_path = dir.clone();
    config_path.push(&opts.config);
    let cfg = if config_path.exists() {
        info!("load courier config from path {:?}", &config_path);
        Config::load(&config_path)?
    } else if opts.config == PathBuf::from("courier.toml") {
        info!("no courier.toml found, running the reference scenario");
        Config::parse("")?
    } else {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("config file {:?} does not exist", &config_path),
        ));
    };
    debug!("loaded courier config: {:#?}", &cfg);

    let kind = match (&opts.nats_uri, opts.emulator) {
        (Some(_), _) => BrokerKind::Nats,
        (None, true) => BrokerKind::Emulator,
        (None, false) => cfg.broker.kind,
    };

    match kind {
        BrokerKind::Emulator => {
            info!("running against the in-process emulator");
            execute(Arc::new(Emulator::new()), cfg.run).await
        }
        BrokerKind::Nats => {
            let nats_uri = opts
                .nats_uri
                .or(cfg.broker.nats_uri.clone())
                .or_else(|| courier::env::emulator_host().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidInput,
                        format!(
                            "missing nats uri, pass --nats-uri or set {}",
                            courier::env::format_emulator_host()
                        ),
                    )
                })?;
            info!("running against nats at {}", &nats_uri);
            let attempts = cfg.broker.connect_attempts.unwrap_or(5);
            let client = NatsBroker::connect_with_retry(
                cfg.run.project.clone(),
                nats_uri,
                attempts,
                Duration::from_millis(1000),
            )
            .await
            .map_err(|err| Error::new(ErrorKind::ConnectionRefused, err))?;
            execute(Arc::new(client), cfg.run).await
        }
    }
}

async fn execute<C: BrokerClient>(client: Arc<C>, run: RunConfig) -> Result<(), Error> {
    let scenario = Scenario::new(client, run);
    match scenario.execute().await {
        Ok(report) => {
            info!(
                "received {} of {} message(s), {} publish receipt(s), {:?}",
                report.received.count,
                scenario.config().message_count,
                report.publish.receipts.len(),
                &report.service
            );
            Ok(())
        }
        Err(err) => {
            error!("scenario failed: {}", &err);
            Err(Error::new(ErrorKind::Other, err))
        }
    }
}

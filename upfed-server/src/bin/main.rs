use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::FmtSubscriber;

use upfed_server::{
    rest,
    sessions::{self, SessionRegistry},
    settings::Settings,
    state_machine::StateMachineInitializer,
    storage::MemoryStorage,
    workers,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "upfed-server", about = "Federated high-utility itemset mining")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        log: log_settings,
        federation: federation_settings,
        privacy: privacy_settings,
        session: session_settings,
        mining: mining_settings,
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let storage = MemoryStorage::new();
    let registry = SessionRegistry::new(storage.clone(), &session_settings);

    let (state_machine, round_requests, _events) = StateMachineInitializer::new(
        federation_settings,
        privacy_settings,
        storage.clone(),
        registry.clone(),
    )
    .init()
    .await
    .unwrap_or_else(|err| {
        error!("failed to initialize the round coordinator: {}", err);
        process::exit(1);
    });

    let jobs = workers::spawn_pool(storage.clone(), &mining_settings);
    workers::spawn_reaper(storage.clone(), &mining_settings);
    sessions::spawn_sweeper(registry.clone(), &session_settings);

    let api = rest::serve(api_settings, storage, registry, jobs, round_requests);

    tokio::select! {
        _ = state_machine.run() => {
            // The coordinator only stops when its request channel dies
            // while the server is still up: unrecoverable internal state.
            error!("shutting down: the round coordinator terminated");
            process::exit(2);
        }
        result = api => {
            match result {
                Ok(()) => warn!("shutting down: REST server terminated"),
                Err(err) => {
                    error!("{}", err);
                    process::exit(1);
                }
            }
        }
        _ = signal::ctrl_c() => {}
    }
}

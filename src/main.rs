use clap::Parser as _;
use swegon_modbus_tools::commands;
use tracing_subscriber::filter::{LevelFilter, targets::Targets};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "SWEGON_MODBUS_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Publish(commands::publish::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let default = Targets::new().with_default(LevelFilter::WARN);
    let (filter, filter_error) = match std::env::var(LOG_ENV) {
        Err(_) => (default, None),
        Ok(description) => match description.parse::<Targets>() {
            Ok(filter) => (filter, None),
            Err(e) => (default, Some((description, e))),
        },
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    if let Some((description, error)) = filter_error {
        tracing::warn!(message = "ignoring invalid log filter", env = LOG_ENV, %description, %error);
    }
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Publish(args) => end(commands::publish::run(args)),
    }
}

use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use server::ServerError;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Handle;

/// Command line arguments. Flags override values from the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a TOML config file
    #[clap(short, long)]
    conf: Option<PathBuf>,
    /// Log filter, e.g. "info" or "server=debug". Overrides RUST_LOG
    #[clap(short, long)]
    log_level: Option<String>,
    /// Game port
    #[clap(short, long)]
    port: Option<u16>,
    /// Address every service binds to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Server name reported to status queries
    #[clap(short, long)]
    name: Option<String>,
    /// Server location reported to status queries
    #[clap(long)]
    loc: Option<String>,
    /// Instance id shown in the logs
    #[clap(long)]
    id: Option<String>,
    /// Do not print the startup banner
    #[clap(long)]
    no_logo: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig, ServerError> {
    let mut config = match &args.conf {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.game_port = port;
    }
    if let Some(host) = &args.host {
        config.server.ip = host.clone();
    }
    if let Some(name) = &args.name {
        config.server.name = name.clone();
    }
    if let Some(loc) = &args.loc {
        config.server.location = loc.clone();
    }
    if let Some(id) = &args.id {
        config.server.id = Some(id.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_logo(config: &ServerConfig) {
    println!("  ____       _       _                          ");
    println!(" / ___| __ _| |_ ___| |__   ___  _   _ ___  ___ ");
    println!("| |  _ / _` | __/ _ \\ '_ \\ / _ \\| | | / __|/ _ \\");
    println!("| |_| | (_| | ||  __/ | | | (_) | |_| \\__ \\  __/");
    println!(" \\____|\\__,_|\\__\\___|_| |_|\\___/ \\__,_|___/\\___|");
    println!();
    println!(
        "{} v{} | {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.server.name,
        config.server.location
    );
    println!();
}

/// Main-method of the application.
/// Runs every socket on one I/O thread next to the dispatcher and scheduler threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &args.log_level {
        logger.parse_filters(filter);
    }
    logger.init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if !args.no_logo {
        print_logo(&config);
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialise server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.start(&Handle::current()) {
        error!("Failed to start server: {}", e);
        server.shutdown();
        return ExitCode::FAILURE;
    }

    tokio::select! {
        _ = server.run_until_shutdown() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    }

    server.shutdown();
    ExitCode::SUCCESS
}

use clap::{Parser, Subcommand};
use client::admin::AdminClient;
use client::game::{GameClient, GameEvent};
use client::{login, status, ClientError};
use log::{error, info};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Login/status server address
    #[arg(short = 's', long, default_value = "127.0.0.1:7171")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show server name, location and population
    Status,
    /// List players online
    Players,
    /// Log in and list characters
    Login { account: String, password: String },
    /// Create an account
    CreateAccount {
        account: String,
        password: String,
        #[arg(default_value = "")]
        email: String,
    },
    /// Log in, enter the world, say something and print events
    Play {
        account: String,
        password: String,
        /// Character to play, defaults to the first one
        #[arg(short, long)]
        character: Option<String>,
        /// Chat message to send after entering
        #[arg(short, long)]
        message: Option<String>,
        /// Seconds to stay online
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Run an administration command
    Admin {
        password: String,
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
enum AdminAction {
    Info,
    Broadcast { text: String },
    Kick { character: String },
    Ban {
        ip: IpAddr,
        /// Zero bans permanently
        #[arg(default_value = "0")]
        minutes: u32,
    },
    Unban { ip: IpAddr },
    Shutdown,
}

fn resolve<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<SocketAddr, ClientError> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{:?}", addr)).into()
    })
}

async fn play(
    server: SocketAddr,
    account: &str,
    password: &str,
    character: Option<String>,
    message: Option<String>,
    duration: Duration,
) -> Result<(), ClientError> {
    let list = login::login(server, account, password).await?;
    let character = match character.or_else(|| list.characters.first().cloned()) {
        Some(character) => character,
        None => {
            info!("Account has no characters");
            return Ok(());
        }
    };

    let game_addr = resolve((list.game_host.as_str(), list.game_port))?;
    let mut game = GameClient::enter(game_addr, account, list.token, &character).await?;
    if let Some(message) = message {
        game.say(&message).await?;
    }

    let deadline = tokio::time::Instant::now() + duration;
    loop {
        match tokio::time::timeout_at(deadline, game.next_event()).await {
            Ok(Ok(GameEvent::Chat { sender, text })) => println!("{}: {}", sender, text),
            Ok(Ok(GameEvent::ServerMessage(text))) => println!("[server] {}", text),
            Ok(Ok(event)) => info!("{:?}", event),
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }
    game.logout().await
}

async fn admin(server: SocketAddr, password: &str, action: AdminAction) -> Result<(), ClientError> {
    let mut admin = AdminClient::connect(server, password).await?;
    match action {
        AdminAction::Info => {
            let info = admin.server_info().await?;
            println!(
                "{}/{} players, {} connections, up {}s",
                info.online,
                info.max_players,
                info.connections,
                info.uptime.as_secs()
            );
        }
        AdminAction::Broadcast { text } => admin.broadcast(&text).await?,
        AdminAction::Kick { character } => admin.kick(&character).await?,
        AdminAction::Ban { ip, minutes } => admin.ban_ip(ip, minutes).await?,
        AdminAction::Unban { ip } => admin.unban_ip(ip).await?,
        AdminAction::Shutdown => admin.shutdown().await?,
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), ClientError> {
    let server = resolve(args.server.as_str())?;

    match args.command {
        Command::Status => {
            let info = status::query_status(server).await?;
            println!("{} ({})", info.name, info.location);
            println!("{}/{} players online", info.online, info.max_players);
            println!("up {}s, protocol {}", info.uptime.as_secs(), info.protocol_version);
        }
        Command::Players => {
            for name in status::query_players(server).await? {
                println!("{}", name);
            }
        }
        Command::Login { account, password } => {
            let list = login::login(server, &account, &password).await?;
            println!("game server {}:{}", list.game_host, list.game_port);
            for character in list.characters {
                println!("  {}", character);
            }
        }
        Command::CreateAccount {
            account,
            password,
            email,
        } => {
            login::create_account(server, &account, &password, &email).await?;
            println!("account {} created", account);
        }
        Command::Play {
            account,
            password,
            character,
            message,
            duration,
        } => {
            play(
                server,
                &account,
                &password,
                character,
                message,
                Duration::from_secs(duration),
            )
            .await?
        }
        Command::Admin { password, action } => admin(server, &password, action).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

//! Tic-tac-toe matchmaking server.
//!
//! Pairs connections in arrival order, runs one [`Lobby`] per pair and
//! closes lobbies once their game is over.

mod lobby;

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tictoc_net::config::NetworkConfig;
use tictoc_net::error::{Result, TransportError};
use tictoc_net::utils::logging::init_logging;
use tictoc_net::{Connection, OwnedMessage, Server, ServerHandler};
use tracing::{info, warn};

use crate::lobby::{packet_type, Lobby};

#[derive(Parser, Debug)]
#[command(name = "tictoc_server", about = "Tic-tac-toe matchmaking server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port, overriding the configured address's port
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Default)]
struct TicTocGame {
    room: VecDeque<Arc<Connection>>,
    lobbies: BTreeMap<u32, Lobby>,
    next_lobby_id: u32,
}

impl TicTocGame {
    fn lobby_of(&mut self, connection_id: u32) -> Option<&mut Lobby> {
        self.lobbies
            .values_mut()
            .find(|lobby| lobby.has_player(connection_id))
    }

    fn try_match(&mut self) {
        self.room.retain(|c| c.is_connected());
        while self.room.len() >= 2 {
            let (Some(p1), Some(p2)) = (self.room.pop_front(), self.room.pop_front()) else {
                break;
            };
            let lobby_id = self.next_lobby_id;
            self.next_lobby_id += 1;
            self.lobbies.insert(lobby_id, Lobby::start(p1, p2));
        }
    }

    /// Drop lobbies whose game has ended; returns how many were closed
    fn close_finished_lobbies(&mut self) -> usize {
        let before = self.lobbies.len();
        self.lobbies.retain(|id, lobby| {
            let alive = lobby.is_game_alive();
            if !alive {
                info!(lobby_id = id, "Closing lobby");
            }
            alive
        });
        before - self.lobbies.len()
    }
}

impl ServerHandler for TicTocGame {
    fn on_message(&mut self, mut message: OwnedMessage) {
        if message.type_id() != packet_type::PLAYER_MOVE {
            return;
        }

        let player_id = message.origin_id();
        match message.pop_int() {
            Ok(index) => {
                if let Some(lobby) = self.lobby_of(player_id) {
                    lobby.play(player_id, index);
                }
            }
            Err(e) => warn!(conn_id = player_id, error = %e, "Malformed move"),
        }
    }

    fn on_connected(&mut self, connection: Arc<Connection>) {
        self.room.push_back(connection);
        self.try_match();
    }

    fn on_disconnected(&mut self, connection: Arc<Connection>) {
        let id = connection.id();
        self.room.retain(|c| c.id() != id);
        if let Some(lobby) = self.lobby_of(id) {
            lobby.on_player_disconnected(id);
        }
    }
}

fn load_config(args: &Args) -> Result<NetworkConfig> {
    let mut config = match &args.config {
        Some(path) => NetworkConfig::from_file(path)?,
        None => NetworkConfig::default(),
    };
    config.apply_env()?;

    if let Some(port) = args.port {
        let mut address: SocketAddr = config.server.address.parse().map_err(|_| {
            TransportError::ConfigError(format!(
                "Invalid server address: '{}'",
                config.server.address
            ))
        })?;
        address.set_port(port);
        config.server.address = address.to_string();
    }

    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    init_logging(&config.logging)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)).map_err(|e| {
            TransportError::ConfigError(format!("Unable to install Ctrl-C handler: {e}"))
        })?;
    }

    let server = Server::bind(&config, TicTocGame::default())?;
    info!(
        app = %config.logging.app_name,
        address = %server.local_addr(),
        "Tic-tac-toe server running"
    );

    while running.load(Ordering::SeqCst) {
        server.update_blocking(config.server.poll_interval);
        server.with_handler(TicTocGame::close_finished_lobbies);
    }

    info!("Received shutdown signal");
    server.log_metrics();
    server.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_config {
        println!("{}", NetworkConfig::example_config());
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tictoc_server: {e}");
            ExitCode::FAILURE
        }
    }
}

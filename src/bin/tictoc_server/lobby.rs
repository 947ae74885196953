//! One tic-tac-toe match between two connections.

use std::sync::Arc;

use tictoc_net::{Connection, ConnectionId, Message};
use tracing::{debug, info};

/// Message type identifiers shared with the game client
pub mod packet_type {
    /// Body: the receiving player's number (1 or 2)
    pub const START_GAME: u32 = 0;
    /// Body: the nine cells in board order, then the player to move
    pub const GAME_STATE: u32 = 1;
    /// Body: the winning player, or 0 for a draw
    pub const END_GAME: u32 = 2;
    /// Body: the cell index the sender wants to claim
    pub const PLAYER_MOVE: u32 = 3;
}

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// 3x3 board; cells hold 0 (empty) or the owning player's number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    cells: [i32; 9],
    turn: i32,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            cells: [0; 9],
            turn: 1,
        }
    }
}

impl Board {
    pub fn cells(&self) -> &[i32; 9] {
        &self.cells
    }

    pub fn turn(&self) -> i32 {
        self.turn
    }

    /// Claim `index` for `player` if it is their turn and the cell is free.
    /// Returns whether the move was applied.
    pub fn play(&mut self, player: i32, index: i32) -> bool {
        if player != self.turn {
            return false;
        }
        let Some(cell) = usize::try_from(index).ok().and_then(|i| self.cells.get_mut(i)) else {
            return false;
        };
        if *cell != 0 {
            return false;
        }

        *cell = player;
        self.turn = if player == 1 { 2 } else { 1 };
        true
    }

    /// `Some(player)` for a win, `Some(0)` for a full board, `None` while
    /// the game is still open
    pub fn outcome(&self) -> Option<i32> {
        for player in [1, 2] {
            if LINES
                .iter()
                .any(|line| line.iter().all(|&i| self.cells[i] == player))
            {
                return Some(player);
            }
        }

        if self.cells.iter().all(|&cell| cell != 0) {
            Some(0)
        } else {
            None
        }
    }
}

pub struct Lobby {
    board: Board,
    players: [Arc<Connection>; 2],
    game_over: bool,
}

impl Lobby {
    /// Seat both players and tell each which number they play
    pub fn start(player1: Arc<Connection>, player2: Arc<Connection>) -> Self {
        let lobby = Self {
            board: Board::default(),
            players: [player1, player2],
            game_over: false,
        };

        info!(
            player1 = lobby.players[0].id(),
            player2 = lobby.players[1].id(),
            "Game started"
        );
        for (number, player) in (1..).zip(lobby.players.iter()) {
            let mut msg = Message::new(packet_type::START_GAME);
            msg.push_int(number);
            send_or_log(player, msg);
        }
        lobby
    }

    /// Player number (1 or 2) of a connection, 0 if it is not seated here
    pub fn player_number(&self, connection_id: ConnectionId) -> i32 {
        self.players
            .iter()
            .position(|p| p.id() == connection_id)
            .map_or(0, |i| i as i32 + 1)
    }

    pub fn has_player(&self, connection_id: ConnectionId) -> bool {
        self.player_number(connection_id) != 0
    }

    pub fn is_game_alive(&self) -> bool {
        !self.game_over
    }

    pub fn play(&mut self, connection_id: ConnectionId, index: i32) {
        if self.game_over {
            return;
        }

        let player = self.player_number(connection_id);
        if !self.board.play(player, index) {
            debug!(conn_id = connection_id, index, "Ignoring illegal move");
            return;
        }

        self.send_game_state();
        if let Some(winner) = self.board.outcome() {
            self.end_game(winner);
        }
    }

    /// The remaining player wins by forfeit
    pub fn on_player_disconnected(&mut self, connection_id: ConnectionId) {
        if self.game_over {
            return;
        }
        let winner = if self.player_number(connection_id) == 1 { 2 } else { 1 };
        self.end_game(winner);
    }

    fn send_game_state(&self) {
        let mut msg = Message::new(packet_type::GAME_STATE);
        for &cell in self.board.cells() {
            msg.push_int(cell);
        }
        msg.push_int(self.board.turn());
        self.send_to_both(&msg);
    }

    fn end_game(&mut self, winner: i32) {
        let mut msg = Message::new(packet_type::END_GAME);
        msg.push_int(winner);
        info!(winner, "Game ended");
        self.send_to_both(&msg);
        self.game_over = true;
    }

    fn send_to_both(&self, msg: &Message) {
        for player in &self.players {
            send_or_log(player, msg.clone());
        }
    }
}

fn send_or_log(player: &Connection, msg: Message) {
    if let Err(e) = player.send(msg) {
        debug!(conn_id = player.id(), error = %e, "Player unreachable");
    }
}

use std::time::Duration;

use clap::Parser;

/// Runtime configuration for the match server.
///
/// Defaults reproduce the rapid time control the service was designed
/// around: 19x19 boards, fifteen minutes per player, a fifteen second
/// reconnection grace and a one second watchdog tick.
#[derive(Parser, Debug, Clone)]
#[command(name = "goban", about = "Live Go match server")]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener on
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,

    /// Board size for new matches
    #[arg(long, default_value_t = 19)]
    pub board_size: u8,

    /// Per-player time budget in milliseconds
    #[arg(long, default_value_t = 900_000)]
    pub turn_budget_ms: u64,

    /// How long a disconnected player may reconnect before forfeiting
    #[arg(long, default_value_t = 15_000)]
    pub grace_ms: u64,

    /// Watchdog polling interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub tick_ms: u64,

    /// Compensation points awarded to the second-moving color
    #[arg(long, default_value_t = 7.5)]
    pub komi: f32,

    /// Time-to-live for presence records in seconds
    #[arg(long, default_value_t = 35 * 60)]
    pub presence_ttl_secs: u64,
}

impl ServerConfig {
    pub fn turn_budget(&self) -> Duration {
        Duration::from_millis(self.turn_budget_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}

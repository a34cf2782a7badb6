use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "janus-videoroom")]
#[command(version)]
#[command(about = "Janus VideoRoom publisher/subscriber client", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/janus-videoroom.toml")]
    pub config: PathBuf,

    /// Gateway URL (overrides server.url)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Room number (overrides room.room_id)
    #[arg(short, long)]
    pub room: Option<u64>,

    /// Display name (overrides room.display)
    #[arg(short, long)]
    pub display: Option<String>,

    /// Echo local media back instead of publishing
    #[arg(long, action)]
    pub loopback: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply(&self, config: &mut config::Config) {
        if let Some(ref url) = self.server {
            config.server.url = url.clone();
        }
        if let Some(room) = self.room {
            config.room.room_id = room;
        }
        if let Some(ref display) = self.display {
            config.room.display = display.clone();
        }
        if self.loopback {
            config.media.loopback = true;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

//! Command line configuration of the profile server

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shared::SchemaMode;

use crate::modules::{AuthConfig, ProfilesConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// UDP port to listen on
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Maximum number of concurrent clients
    #[arg(short, long, default_value = "64")]
    pub max_clients: usize,

    /// Delay before pending profile changes are pushed to the client
    #[arg(long, default_value = "100")]
    pub push_delay_ms: u64,

    /// Delay before pending profile changes are saved
    #[arg(long, default_value = "5000")]
    pub save_delay_ms: u64,

    /// How long a profile stays loaded after its owner logs out
    #[arg(long, default_value = "10000")]
    pub unload_delay_ms: u64,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "5")]
    pub client_timeout_secs: u64,

    /// Directory for saved profiles; profiles are kept in memory if unset
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// User granted admin access (repeatable)
    #[arg(long = "admin", value_name = "USER")]
    pub admins: Vec<String>,

    /// Accept stored profiles whose property count differs, with a warning
    #[arg(long)]
    pub tolerant_schema: bool,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn profiles(&self) -> ProfilesConfig {
        ProfilesConfig {
            push_delay: Duration::from_millis(self.push_delay_ms),
            save_delay: Duration::from_millis(self.save_delay_ms),
            unload_delay: Duration::from_millis(self.unload_delay_ms),
            schema_mode: if self.tolerant_schema {
                SchemaMode::Tolerant
            } else {
                SchemaMode::Strict
            },
        }
    }

    pub fn auth(&self) -> AuthConfig {
        AuthConfig {
            admins: self.admins.iter().cloned().collect(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["server"])
    }
}

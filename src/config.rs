use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::notify::{Delivery, Overflow};

const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Parser)]
#[command(version, about = "In-memory key-value store with expiring entries")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve a store over RESP
    Serve(ServeArgs),
    /// Interactive client for a running server
    Repl(ReplArgs),
}

/// Which store a server fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// Entries expire after their TTL
    Ttl,
    /// Entries never expire; every write is reported to a subscriber
    Notify,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value_t = DEFAULT_HOST)]
    pub host: IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, value_enum, default_value_t = StoreMode::Ttl)]
    pub mode: StoreMode,
    /// What a write does when the subscriber falls behind (notify mode)
    #[arg(long, value_enum, default_value_t = Overflow::Blocking)]
    pub delivery: Overflow,
    /// Notifications queued before `--delivery` kicks in (notify mode)
    #[arg(long, default_value_t = 10)]
    pub buffer: usize,
}

impl ServeArgs {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn delivery(&self) -> Delivery {
        match self.delivery {
            Overflow::Blocking => Delivery::blocking(self.buffer),
            Overflow::DropOldest => Delivery::drop_oldest(self.buffer),
            Overflow::Reject => Delivery::reject(self.buffer),
        }
    }
}

#[derive(Debug, Args)]
pub struct ReplArgs {
    #[arg(long, default_value_t = DEFAULT_HOST)]
    pub host: IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ReplArgs {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

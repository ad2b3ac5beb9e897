//! Daemon command line.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// mvirt L4 load balancer - keeps the kernel IPVS table in sync
#[derive(Parser, Debug, Clone)]
#[command(name = "mvirt-lb", version, about)]
pub struct Args {
    /// Desired state file (JSON)
    #[arg(long, default_value = "/etc/mvirt/lb/services.json")]
    pub state_file: PathBuf,

    /// Seconds between sync passes
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// ipvsadm binary
    #[arg(long, default_value = "ipvsadm")]
    pub ipvsadm: String,

    /// Run a single sync pass and exit
    #[arg(long)]
    pub once: bool,

    /// Flush the IPVS table on shutdown
    #[arg(long)]
    pub flush_on_exit: bool,
}

impl Args {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

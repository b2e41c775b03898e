//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vpn_toggle::VpnKind;

/// vpn-toggle - store VPN profiles and switch them on and off
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Settings file (default: <config dir>/vpn-toggle/config.toml)
    #[arg(long, env = "VPN_TOGGLE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Connection record, overriding the settings file
    #[arg(long, env = "VPN_TOGGLE_STORE", global = true)]
    pub store: Option<PathBuf>,

    /// Debug logging, including every line of client output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    Openvpn,
    Ipsec,
}

impl From<KindArg> for VpnKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Openvpn => VpnKind::OpenVpn,
            KindArg::Ipsec => VpnKind::Ipsec,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List stored profiles
    List,
    /// Add a profile; passwords are prompted for
    Add {
        /// Unique profile name
        name: String,
        #[arg(long, value_enum, default_value_t = KindArg::Openvpn)]
        kind: KindArg,
        /// OpenVPN client configuration file
        #[arg(long)]
        config_path: Option<PathBuf>,
        /// IPsec gateway address
        #[arg(long)]
        server: Option<String>,
        /// VPN account name
        #[arg(long)]
        username: String,
    },
    /// Change fields of an existing profile
    Edit {
        /// Current profile name
        name: String,
        /// New profile name
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        config_path: Option<PathBuf>,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        username: Option<String>,
        /// Prompt for a new VPN password
        #[arg(long)]
        password: bool,
        /// Prompt for a new IPsec shared secret
        #[arg(long)]
        shared_secret: bool,
    },
    /// Delete a profile
    Remove {
        name: String,
    },
    /// Connect a profile and stay in the foreground until Enter is pressed
    Connect {
        name: String,
    },
    /// Stop every running VPN client process, including ones started elsewhere
    KillStray,
    /// Check that the VPN client binaries are installed
    Check,
}

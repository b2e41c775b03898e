//! vpn-toggle - store VPN profiles and switch them on and off from the
//! terminal.

mod cli;

use clap::Parser;
use color_eyre::Result;

use crate::cli::args::Args;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    vpn_toggle::logger::init(args.verbose);
    log::debug!("{} {}", vpn_toggle::constants::APP_NAME, vpn_toggle::constants::APP_VERSION);
    cli::commands::run(&args)
}

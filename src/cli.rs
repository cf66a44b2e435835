use std::path::PathBuf;

use clap::Parser;

use crate::transport::udscs::DEFAULT_SOCKET;

#[derive(Parser)]
#[command(
    name = "clipbridge",
    about = "Clipboard bridge between the desktop session and spice-vdagentd"
)]
pub struct Cli {
    /// Log debug messages
    #[arg(short, long)]
    pub debug: bool,

    /// spice-vdagentd socket path
    #[arg(short = 'S', long = "vdagentd-socket", default_value = DEFAULT_SOCKET)]
    pub vdagentd_socket: PathBuf,

    /// Run in the foreground instead of daemonizing
    #[arg(short = 'x', long)]
    pub foreground: bool,
}

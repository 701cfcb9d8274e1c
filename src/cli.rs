use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mirrorbox")]
#[command(about = "Mirror downloads into cloud storage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP command server
    Server(ServerArgs),
    /// Mirror the given URIs or torrent file, then exit
    Mirror(MirrorArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP server to (defaults to server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct MirrorArgs {
    /// URIs handed to the download daemon together as one job
    pub uris: Vec<String>,

    /// Torrent metainfo file submitted as a separate job
    #[arg(long)]
    pub torrent: Option<PathBuf>,
}

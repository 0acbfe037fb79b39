use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tradebars", version, about = "Trade aggregation and bar persistence server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node (standalone, collector or coordinator per configuration)
    Serve {
        /// Override the query API port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print store status and exit
    Status,
}

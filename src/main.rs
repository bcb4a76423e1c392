use clap::{Parser, Subcommand};

use volprep::worker;

#[derive(Parser)]
#[command(name = "volprep")]
#[command(about = "Pre-populates network volumes with model artifacts for GPU workers")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the download worker and serve its status endpoint
    Worker {
        #[arg(long, default_value = "0.0.0.0", help = "Address to bind to")]
        address: String,
        #[arg(short, long, default_value_t = 8188)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Worker { address, port }) => {
            worker::run(address, port).await?;
        }
        None => {
            println!("Use --help for available commands");
        }
    }

    Ok(())
}

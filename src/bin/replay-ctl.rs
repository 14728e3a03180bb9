use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "replay-ctl")]
#[command(about = "Query a running traffic-replay diagnostics endpoint", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9187")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pipeline state and per-Input / per-Output counters
    Status,
    /// Registered Outputs and their queues
    Outputs,
    /// Raw Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{base}/status")).send().await?;
            print_json(res).await?;
        }
        Commands::Outputs => {
            let res = client.get(format!("{base}/outputs")).send().await?;
            print_json(res).await?;
        }
        Commands::Metrics => {
            let res = client.get(format!("{base}/metrics")).send().await?;
            let status = res.status();
            let text = res.text().await?;
            if !status.is_success() {
                eprintln!("Error: diagnostics endpoint returned status {status}");
                eprintln!("Response: {text}");
                std::process::exit(1);
            }
            print!("{text}");
        }
    }

    Ok(())
}

async fn print_json(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: diagnostics endpoint returned status {status}");
        if let Ok(text) = res.text().await {
            eprintln!("Response: {text}");
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

use clap::{Parser, Subcommand};
use serde_json::Value;

use gem::http::status::STATUS_PATH;
use gem::Signal;

#[derive(Parser)]
#[command(name = "gemctl")]
#[command(about = "Control a running gem server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hand the listeners to a fresh process, then drain this one
    Restart {
        #[arg(short, long)]
        pid: i32,

        /// Signal bound to the restart action on the server
        #[arg(short, long, default_value = "SIGHUP")]
        signal: String,
    },
    /// Drain and exit without handing over
    Stop {
        #[arg(short, long)]
        pid: i32,
    },
    /// Show the status of the generation serving at URL
    Status {
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Restart { pid, signal } => {
            let signal: Signal = signal.parse()?;
            send_signal(pid, signal)?;
        }
        Commands::Stop { pid } => {
            send_signal(pid, Signal::TERM)?;
        }
        Commands::Status { url } => {
            let res = reqwest::get(format!("{}{}", url.trim_end_matches('/'), STATUS_PATH)).await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

fn send_signal(pid: i32, signal: Signal) -> std::io::Result<()> {
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(pid, signal.as_raw()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    println!("Sent {} to {}", signal, pid);
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: status endpoint returned {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

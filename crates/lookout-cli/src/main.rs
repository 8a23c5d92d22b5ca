use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.lookout.Matcher1",
    default_service = "org.lookout.Matcher1",
    default_path = "/org/lookout/Matcher1"
)]
trait Matcher {
    async fn register_image(&self, case_id: &str, blob_path: &str) -> zbus::Result<String>;
    async fn submit_frame(&self, bytes: Vec<u8>) -> zbus::Result<String>;
    async fn open_case(&self, case_id: &str, reporter: &str) -> zbus::Result<()>;
    async fn case_closed(&self, case_id: &str) -> zbus::Result<()>;
    async fn frame_status(&self, frame_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "lookout", about = "Lookout missing-person face matching CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a reference photo already in the daemon's blob store
    Register {
        case_id: String,
        /// Blob path relative to the daemon's blob root (e.g. "uploads/ref.jpg")
        blob_path: String,
    },
    /// Submit a camera frame from a local image file
    Submit {
        file: PathBuf,
    },
    /// Open (or reopen) a case
    Open {
        case_id: String,
        /// User who reported the case and receives its notifications
        #[arg(short, long)]
        reporter: String,
    },
    /// Close a case and purge its reference faces
    Close {
        case_id: String,
    },
    /// Show the processing state of a submitted frame
    Frame {
        frame_id: String,
    },
    /// Show daemon status
    Status,
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = MatcherProxy::new(&conn)
        .await
        .context("lookoutd is not reachable")?;

    match cli.command {
        Commands::Register { case_id, blob_path } => {
            let reference = proxy.register_image(&case_id, &blob_path).await?;
            println!("Registered {reference} for case {case_id}");
        }
        Commands::Submit { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            tracing::debug!(bytes = bytes.len(), "submitting frame");
            let frame_id = proxy.submit_frame(bytes).await?;
            println!("{frame_id}");
        }
        Commands::Open { case_id, reporter } => {
            proxy.open_case(&case_id, &reporter).await?;
            println!("Case {case_id} is active");
        }
        Commands::Close { case_id } => {
            proxy.case_closed(&case_id).await?;
            println!("Case {case_id} closed");
        }
        Commands::Frame { frame_id } => {
            print_json(&proxy.frame_status(&frame_id).await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

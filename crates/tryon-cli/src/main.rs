use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use tryon_hw::V4lCameraSource;

#[derive(Parser)]
#[command(name = "tryon", about = "Virtual try-on CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the try-on with an overlay image
    #[command(group(ArgGroup::new("overlay").required(true).args(["url", "image_path"])))]
    Activate {
        /// Overlay image URL or local path
        #[arg(long)]
        url: Option<String>,
        /// Product image path on the storefront backend (resolved by the daemon)
        #[arg(long)]
        image_path: Option<String>,
    },
    /// Stop the try-on and release the camera
    Deactivate,
    /// Show session state and render statistics
    Status,
    /// Save the latest composited frame as PNG
    Snapshot {
        /// Output file
        path: PathBuf,
    },
    /// List V4L2 capture devices (bypasses the daemon)
    Devices,
}

#[zbus::proxy(
    interface = "org.tryon.TryOn1",
    default_service = "org.tryon.TryOn1",
    default_path = "/org/tryon/TryOn1"
)]
trait TryOn {
    async fn activate(&self, url: &str) -> zbus::Result<()>;
    async fn activate_product(&self, image_path: &str) -> zbus::Result<()>;
    async fn deactivate(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn snapshot(&self, path: &str) -> zbus::Result<bool>;
}

async fn connect() -> Result<TryOnProxy<'static>> {
    tracing::debug!("connecting to tryond on the session bus");
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    TryOnProxy::new(&conn)
        .await
        .context("failed to reach tryond (is it running?)")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Activate { url, image_path } => {
            let proxy = connect().await?;
            match (url, image_path) {
                (Some(url), _) => {
                    proxy.activate(&url).await?;
                    println!("Try-on active: {url}");
                }
                (None, Some(image_path)) => {
                    proxy.activate_product(&image_path).await?;
                    println!("Try-on active: {image_path}");
                }
                (None, None) => anyhow::bail!("one of --url or --image-path is required"),
            }
        }
        Commands::Deactivate => {
            connect().await?.deactivate().await?;
            println!("Try-on stopped");
        }
        Commands::Status => {
            let status = connect().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Snapshot { path } => {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            let path_str = path.to_str().context("snapshot path is not valid UTF-8")?;
            tracing::debug!(path = path_str, "requesting snapshot");
            if connect().await?.snapshot(path_str).await? {
                println!("Saved {}", path.display());
            } else {
                println!("No frame painted yet; is the try-on active?");
            }
        }
        Commands::Devices => {
            let devices = V4lCameraSource::list_devices();
            tracing::debug!(count = devices.len(), "enumerated capture devices");
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} [{}] {}", device.path, device.name, device.driver, device.bus);
            }
        }
    }

    Ok(())
}

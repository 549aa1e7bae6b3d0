use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_hw::{ImageDirSource, VideoSource};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceid", about = "faceid enrollment and verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in view under a name
    Enroll {
        /// Identity name
        name: String,
    },
    /// Verify the face in view against an enrolled identity
    Verify {
        /// Identity name
        name: String,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity name
        name: String,
    },
    /// Show daemon status
    Status,
    /// Read frames straight from a video source (bypasses the daemon)
    Frames {
        /// Directory of still images to replay
        #[arg(long, conflicts_with = "device")]
        dir: Option<PathBuf>,
        /// V4L2 device path (requires the v4l2 feature)
        #[arg(long)]
        device: Option<String>,
        /// Number of frames to read
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
        /// Write each frame as PNG into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.faceid.FaceId1",
    default_service = "org.faceid.FaceId1",
    default_path = "/org/faceid/FaceId1"
)]
trait FaceId {
    fn enroll(&self, name: &str) -> zbus::Result<String>;
    fn verify(&self, name: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, name: &str) -> zbus::Result<bool>;
}

async fn proxy() -> Result<FaceIdProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    FaceIdProxy::new(&conn)
        .await
        .context("faceidd is not reachable on org.faceid.FaceId1")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { name } => {
            println!("Enrolling {name}; look at the camera...");
            let registered = proxy().await?.enroll(&name).await?;
            print_json(&registered)?;
        }
        Commands::Verify { name } => {
            println!("Verifying {name}...");
            if proxy().await?.verify(&name).await? {
                println!("Verified: {name}");
            } else {
                println!("Not verified");
                std::process::exit(1);
            }
        }
        Commands::List => {
            let identities = proxy().await?.list_identities().await?;
            print_json(&identities)?;
        }
        Commands::Remove { name } => {
            if proxy().await?.remove_identity(&name).await? {
                println!("Removed {name}");
            } else {
                println!("No identity named {name}");
            }
        }
        Commands::Status => {
            let status = proxy().await?.status().await?;
            print_json(&status)?;
        }
        Commands::Frames {
            dir,
            device,
            count,
            output,
        } => {
            let mut source = open_source(dir, device)?;
            tracing::debug!(source = %source.describe(), "frame source opened");
            let result = read_frames(source.as_mut(), count, output.as_deref());
            source.release();
            result?;
        }
    }

    Ok(())
}

fn open_source(dir: Option<PathBuf>, device: Option<String>) -> Result<Box<dyn VideoSource>> {
    if let Some(device) = device {
        return open_camera(&device);
    }
    match dir {
        Some(dir) => Ok(Box::new(ImageDirSource::open(&dir)?)),
        None => bail!("pass --dir or --device"),
    }
}

#[cfg(feature = "v4l2")]
fn open_camera(device: &str) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(faceid_hw::Camera::open(device)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_camera(device: &str) -> Result<Box<dyn VideoSource>> {
    bail!("{device}: built without the v4l2 feature")
}

fn read_frames(source: &mut dyn VideoSource, count: usize, output: Option<&Path>) -> Result<()> {
    if let Some(dir) = output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    println!("Reading {count} frames from {}", source.describe());
    for i in 0..count {
        let frame = source.current_frame()?;
        println!(
            "  frame {i}: {}x{} seq={} brightness={:.1}{}",
            frame.width,
            frame.height,
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { " (dark)" } else { "" }
        );

        if let Some(dir) = output {
            let path = dir.join(format!("frame-{i:03}.png"));
            let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
                .context("frame buffer does not match its dimensions")?;
            image
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recon_core::Profile;
use recon_hw::{Camera, CaptureConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Enrollment needs several views of the face.
const MIN_ENROLL_IMAGES: usize = 3;

#[zbus::proxy(
    interface = "io.lightrecon.Recon1",
    default_service = "io.lightrecon.Recon1",
    default_path = "/io/lightrecon/Recon1"
)]
trait Recon {
    async fn add_reference(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn save_profile(&self, profile_json: &str) -> zbus::Result<String>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn visible(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "recon", about = "Recon face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from face images
    Enroll {
        /// Display name (unique; used as the record directory name)
        name: String,
        /// Face images; the most confident face in each is used
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        gender: Option<String>,
        #[arg(long)]
        occupation: Option<String>,
        #[arg(long)]
        nationality: Option<String>,
        /// Status tag (e.g. CIVILIAN, VIP); defaults from settings
        #[arg(long)]
        status: Option<String>,
        /// Threat-level tag (e.g. LOW, HIGH); defaults from settings
        #[arg(long)]
        threat_level: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Import a legacy dataset directory (<dir>/<name>/profile.json + images)
    Import {
        dataset: PathBuf,
    },
    /// List registered identities
    List,
    /// Re-read settings and the gallery from disk
    Reload,
    /// Show daemon status
    Status,
    /// Show identities seen in the last few seconds
    Visible,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 30)]
        frames: usize,
    },
}

async fn connect() -> Result<ReconProxy<'static>> {
    let conn = if std::env::var("RECON_SYSTEM_BUS").is_ok_and(|v| v != "0") {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    ReconProxy::new(&conn)
        .await
        .context("recond is not reachable on D-Bus")
}

fn absolute(path: &Path) -> Result<String> {
    let path = path
        .canonicalize()
        .with_context(|| format!("{}: not found", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("jpg" | "jpeg" | "png" | "bmp")
    )
}

/// Add every image as a reference; failures are reported and skipped.
async fn add_images(proxy: &ReconProxy<'_>, name: &str, images: &[PathBuf]) -> Result<usize> {
    let mut added = 0;
    for image in images {
        let path = absolute(image)?;
        match proxy.add_reference(name, &path).await {
            Ok(_) => {
                added += 1;
                println!("  + {}", image.display());
            }
            Err(e) => eprintln!("  ! {}: {e}", image.display()),
        }
    }
    Ok(added)
}

async fn import_dataset(proxy: &ReconProxy<'_>, dataset: &Path) -> Result<()> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dataset)
        .with_context(|| format!("cannot read {}", dataset.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut imported = 0;
    for dir in dirs {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };

        let profile_path = dir.join("profile.json");
        // Forwarded as raw JSON so absent fields pick up the daemon's defaults.
        let mut profile: serde_json::Value = match std::fs::read_to_string(&profile_path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
        {
            Ok(serde_json::Value::Object(fields)) => serde_json::Value::Object(fields),
            Ok(_) => {
                eprintln!("skipping {name}: {}: not a JSON object", profile_path.display());
                continue;
            }
            Err(e) => {
                eprintln!("skipping {name}: {}: {e}", profile_path.display());
                continue;
            }
        };
        profile["name"] = serde_json::Value::String(name.clone());

        let mut images: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_image(p))
            .collect();
        images.sort();
        if images.is_empty() {
            eprintln!("skipping {name}: no images");
            continue;
        }

        println!("{name}:");
        proxy.save_profile(&serde_json::to_string(&profile)?).await?;
        if add_images(proxy, &name, &images).await? > 0 {
            imported += 1;
        }
    }

    println!("imported {imported} identities");
    Ok(())
}

fn camera_test(device: String, frames: usize) -> Result<()> {
    let config = CaptureConfig {
        device,
        ..CaptureConfig::default()
    };
    let mut camera = Camera::open(&config)?;
    println!(
        "{}: {}x{} {:?}",
        camera.device_path(),
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let start = Instant::now();
    let mut captured = 0usize;
    for _ in 0..frames {
        match camera.capture_frame() {
            Ok(frame) => {
                captured += 1;
                tracing::debug!(seq = frame.sequence, bytes = frame.data.len(), "frame");
            }
            Err(e) => eprintln!("capture error: {e}"),
        }
    }
    let elapsed = start.elapsed().max(Duration::from_millis(1));
    println!(
        "captured {captured}/{frames} frames in {:.2}s ({:.1} fps)",
        elapsed.as_secs_f64(),
        captured as f64 / elapsed.as_secs_f64()
    );
    Ok(())
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
        Commands::Enroll {
            name,
            images,
            age,
            gender,
            occupation,
            nationality,
            status,
            threat_level,
            notes,
        } => {
            if images.len() < MIN_ENROLL_IMAGES {
                bail!("enrollment needs at least {MIN_ENROLL_IMAGES} images, got {}", images.len());
            }
            let mut profile = Profile::new(name.clone());
            profile.age = age;
            // Blank tags are filled from the daemon's configured defaults.
            profile.gender = gender.unwrap_or_default();
            profile.status = status.unwrap_or_default();
            profile.threat_level = threat_level.unwrap_or_default();
            if let Some(occupation) = occupation {
                profile.occupation = occupation;
            }
            if let Some(nationality) = nationality {
                profile.nationality = nationality;
            }
            profile.notes = notes.unwrap_or_else(|| "No additional information.".into());

            let proxy = connect().await?;
            let id = proxy.save_profile(&serde_json::to_string(&profile)?).await?;
            println!("Enrolling {name} ({id})");
            let added = add_images(&proxy, &name, &images).await?;
            if added == 0 {
                bail!("no face found in any image");
            }
            println!("{added}/{} images registered", images.len());
        }
        Commands::Import { dataset } => {
            let proxy = connect().await?;
            import_dataset(&proxy, &dataset).await?;
        }
        Commands::List => {
            let proxy = connect().await?;
            let raw = proxy.list_identities().await?;
            let list: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            if list.is_empty() {
                println!("No identities registered");
            }
            for identity in list {
                println!(
                    "{:<20} {:<10} {:<9} sightings={:<5} last_seen={}",
                    identity["name"].as_str().unwrap_or("?"),
                    identity["status"].as_str().unwrap_or(""),
                    identity["threat_level"].as_str().unwrap_or(""),
                    identity["sightings"],
                    identity["last_seen"].as_str().unwrap_or("never"),
                );
            }
        }
        Commands::Reload => {
            let proxy = connect().await?;
            let count = proxy.reload_gallery().await?;
            println!("gallery reloaded: {count} identities");
        }
        Commands::Status => match connect().await {
            Ok(proxy) => print_json(&proxy.status().await?)?,
            Err(e) => println!("recond: not connected ({e:#})"),
        },
        Commands::Visible => {
            let proxy = connect().await?;
            print_json(&proxy.visible().await?)?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, frames } => {
            tokio::task::spawn_blocking(move || camera_test(device, frames)).await??;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_matches_extensions_case_insensitively() {
        assert!(is_image(Path::new("ana/ana_1.jpg")));
        assert!(is_image(Path::new("ana/ana_2.PNG")));
        assert!(!is_image(Path::new("ana/profile.json")));
        assert!(!is_image(Path::new("ana/README")));
    }

    #[test]
    fn test_enroll_parses_profile_flags() {
        let cli = Cli::try_parse_from([
            "recon", "enroll", "Ana", "a.jpg", "b.jpg", "c.jpg", "--age", "31", "--status", "VIP",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll {
                name,
                images,
                age,
                status,
                threat_level,
                ..
            } => {
                assert_eq!(name, "Ana");
                assert_eq!(images.len(), 3);
                assert_eq!(age, Some(31));
                assert_eq!(status.as_deref(), Some("VIP"));
                assert!(threat_level.is_none());
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["recon", "enroll", "Ana"]).is_err());
    }
}

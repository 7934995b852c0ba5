use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use otaflash::config::OtaConfig;
use otaflash::flash::{RamFlash, SharedFlash};
use otaflash::ota::{receive_with_yield, verify_image, ImageBuilder, ImageFormat, OtaManager, ReceiveOptions};
use otaflash::partition::RamBootConfig;
use otaflash::logging;
use otaflash::targets::{self, TargetProfile};

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "Build, check and upload otaflash firmware images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine log level for dry runs (error, warn, info, debug)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Checksummed,
    SignedContainer,
    EspApp,
}

impl From<FormatArg> for ImageFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Checksummed => ImageFormat::Checksummed,
            FormatArg::SignedContainer => ImageFormat::SignedContainer,
            FormatArg::EspApp => ImageFormat::EspApp,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Wrap a raw payload into an OTA image
    Pack {
        /// Raw firmware payload
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value = "esp-app")]
        format: FormatArg,
        /// Hardware tag, e.g. chip-9 or bl602
        #[arg(long)]
        hardware: Option<String>,
        /// Firmware version stored in the header
        #[arg(long)]
        version: Option<String>,
        /// Run the packed image through the engine against a board profile
        #[arg(long, value_name = "TARGET")]
        verify: Option<String>,
    },
    /// Check an image offline and print its header
    Inspect {
        image: PathBuf,
    },
    /// Upload an image to a device
    Upload {
        /// Device IP address
        #[arg(value_name = "IP")]
        ip: String,
        image: PathBuf,
        /// Bank to write; the device refuses its active bank
        #[arg(long)]
        bank: Option<String>,
        /// Skip the offline check
        #[arg(long)]
        force: bool,
    },
    /// Show the device's OTA status
    Status {
        #[arg(value_name = "IP")]
        ip: String,
    },
    /// Cancel a running upload
    Abort {
        #[arg(value_name = "IP")]
        ip: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if logging::init_logger().is_ok() && !logging::set_max_level_from_str(&cli.log_level) {
        println!("{} unknown log level '{}'", "⚠️".yellow(), cli.log_level);
    }

    let result = match cli.command {
        Commands::Pack { input, output, format, hardware, version, verify } => pack(
            &input,
            &output,
            format.into(),
            hardware.as_deref(),
            version.as_deref(),
            verify.as_deref(),
        ),
        Commands::Inspect { image } => inspect(&image),
        Commands::Upload { ip, image, bank, force } => upload(&ip, &image, bank.as_deref(), force),
        Commands::Status { ip } => status(&ip),
        Commands::Abort { ip } => abort(&ip),
    };

    if let Err(e) = result {
        println!("\n{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn pack(
    input: &Path,
    output: &Path,
    format: ImageFormat,
    hardware: Option<&str>,
    version: Option<&str>,
    verify: Option<&str>,
) -> Result<()> {
    let payload = fs::read(input).with_context(|| format!("reading {}", input.display()))?;

    let mut builder = ImageBuilder::new(format);
    if let Some(tag) = hardware {
        builder = builder.hardware(tag);
    }
    if let Some(tag) = version {
        builder = builder.version(tag);
    }
    let image = builder.build(&payload);
    if image.len() < format.min_len() {
        bail!("payload too small for a {} image ({} bytes)", format.name(), image.len());
    }

    fs::write(output, &image).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "📦 {} {} ({} bytes, {} format)",
        "Packed".green(),
        output.display(),
        image.len(),
        format.name()
    );

    if let Some(name) = verify {
        let profile = targets::find(name).with_context(|| {
            format!("unknown target '{}', known: {}", name, TargetProfile::names().collect::<Vec<_>>().join(", "))
        })?;
        dry_run(profile, &image)?;
    }
    Ok(())
}

/// Stream the image into RAM flash laid out like the target board
fn dry_run(profile: &TargetProfile, image: &[u8]) -> Result<()> {
    println!("🧪 {} {}", "Dry run on".cyan(), profile.name);
    let geometry = profile.geometry;
    let flash = SharedFlash::new(RamFlash::new(geometry.size, geometry.erase_block, geometry.max_write));
    let config = OtaConfig { formats: profile.formats.to_vec(), ..OtaConfig::default() };
    let options = ReceiveOptions::from_config(&config);
    let mut manager = OtaManager::new(flash, RamBootConfig::new(profile.layout.clone()), config)?;

    let declared = u32::try_from(image.len()).context("image larger than 4 GiB")?;
    let id = manager.begin_update(declared, None)?;
    let mut source = image;
    let report = receive_with_yield(&mut manager, id, &mut source, &options, |_| {})?;

    let stats = manager.flash().with(|f| Ok(f.stats()))?;
    println!(
        "   {} {} bytes committed to bank {:?}, {} erases, {} writes",
        "✅".green(),
        report.bytes_written,
        manager.status().target_bank,
        stats.erases,
        stats.writes
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let image = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    println!("🔍 {} {} ({} bytes)", "Inspecting".cyan(), path.display(), image.len());

    let header = verify_image(&image)?;
    println!("   Format:   {}", header.format.name());
    println!("   Body:     {} bytes", header.body_len);
    println!("   Hardware: {}", header.hw_version.as_deref().unwrap_or("-"));
    println!("   Version:  {}", header.sw_version.as_deref().unwrap_or("-"));
    println!("   {} Digest verified", "✅".green());
    Ok(())
}

fn client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn upload(ip: &str, path: &Path, bank: Option<&str>, force: bool) -> Result<()> {
    let image = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if !force {
        let header = verify_image(&image).context("offline check failed (use --force to upload anyway)")?;
        println!(
            "   {} image, version {}",
            header.format.name(),
            header.sw_version.as_deref().unwrap_or("unknown")
        );
    }

    let size = image.len() as u64;
    println!("\n📤 {} {}", "Updating".cyan(), ip);
    println!("   Firmware: {} bytes ({:.2} MB)", size, size as f64 / 1024.0 / 1024.0);

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );

    let mut url = format!("http://{}/api/ota", ip);
    if let Some(bank) = bank {
        url.push_str("?bank=");
        url.push_str(bank);
    }
    let body = Body::sized(pb.wrap_read(std::io::Cursor::new(image)), size);
    let response = client(Duration::from_secs(300))?
        .post(&url)
        .header("Content-Length", size.to_string())
        .body(body)
        .send();
    pb.finish_and_clear();

    let response = response?;
    let status = response.status();
    let json: serde_json::Value = response.json().unwrap_or_default();
    if status.is_success() {
        println!("   {} Upload successful! Device will restart.", "✅".green());
        println!("\n✨ {}", "OTA update completed successfully!".green());
        Ok(())
    } else {
        bail!(
            "upload failed: HTTP {} {} ({})",
            status,
            json["error"].as_str().unwrap_or("UNKNOWN"),
            json["message"].as_str().unwrap_or("no details")
        )
    }
}

fn status(ip: &str) -> Result<()> {
    let json: serde_json::Value = client(Duration::from_secs(5))?
        .get(format!("http://{}/api/ota/status", ip))
        .send()?
        .json()?;
    let status = &json["status"];
    println!("📱 {} {}", "Device".cyan(), ip);
    println!("   State:    {}", status["state"].as_str().unwrap_or("unknown"));
    if let Some(progress) = status["progress"].as_u64() {
        println!(
            "   Progress: {}% ({}/{} bytes)",
            progress,
            status["bytes_written"].as_u64().unwrap_or(0),
            status["declared_length"].as_u64().unwrap_or(0)
        );
    }
    if let Some(err) = status["last_error"].as_str() {
        println!("   Error:    {}", err.red());
    }
    if let Some(version) = json["version"].as_str() {
        println!("   Firmware: {}", version);
    }
    Ok(())
}

fn abort(ip: &str) -> Result<()> {
    let response = client(Duration::from_secs(5))?
        .post(format!("http://{}/api/ota/abort", ip))
        .send()?;
    if !response.status().is_success() {
        bail!("abort failed: HTTP {}", response.status());
    }
    println!("🛑 {}", "Abort requested".yellow());
    Ok(())
}

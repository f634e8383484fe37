use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tus_depot::client::partition::{DEFAULT_MAX_PARTS, DEFAULT_PART_SIZE, PartitionPolicy};
use tus_depot::config::DEFAULT_MAX_FILE_SIZE;
use tus_depot::{ClientConfig, Scheduler, ServerConfig, UploadStatus};

#[derive(Parser)]
#[command(name = "tus-depot")]
#[command(about = "Resumable TUS uploads with parallel multipart assembly", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the upload server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080", env = "LISTEN_ADDR")]
        listen: SocketAddr,

        /// Directory holding in-flight uploads and their sidecars
        #[arg(long, default_value = "./staging", env = "STAGING_DIR")]
        staging_dir: PathBuf,

        /// Root under which finished uploads are placed
        #[arg(long, default_value = "./uploads", env = "MOUNT_PATH")]
        mount_path: PathBuf,

        /// Largest accepted Upload-Length, in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE, env = "MAX_FILE_SIZE")]
        max_file_size: u64,
    },

    /// Upload one or more files
    Upload {
        /// Files to upload
        files: Vec<PathBuf>,

        /// Upload endpoint URL
        #[arg(
            long,
            default_value = "http://127.0.0.1:8080/api/upload/",
            env = "TUS_ENDPOINT"
        )]
        endpoint: String,

        /// Concurrent stream budget shared by a batch (1-64)
        #[arg(long, default_value = "8", value_parser = clap::value_parser!(u64).range(1..=64))]
        max_streams: u64,

        /// Slice size multi-part files are split at, in bytes
        #[arg(long, default_value_t = DEFAULT_PART_SIZE)]
        part_size: u64,

        /// Final-name strategy (`default`, `original`, or a registered name)
        #[arg(long, default_value = "original")]
        with_filename: String,

        /// Collision strategy (`prevent`, `number`, or a registered name)
        #[arg(long, default_value = "prevent")]
        on_duplicate: String,

        /// Destination subdirectory beneath the server's mount root
        #[arg(long, default_value = "")]
        destination: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            debug!("Error loading .env file: {e}");
        }
    } else {
        debug!("Loaded environment from .env file");
    }

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            staging_dir,
            mount_path,
            max_file_size,
        } => {
            let mut config = ServerConfig::new(staging_dir, mount_path)?;
            config.max_file_size = max_file_size;
            tus_depot::serve(config, listen).await?;
            Ok(())
        }

        Commands::Upload {
            files,
            endpoint,
            max_streams,
            part_size,
            with_filename,
            on_duplicate,
            destination,
        } => {
            if files.is_empty() {
                return Err(anyhow::anyhow!("No files specified for upload"));
            }

            let mut config = ClientConfig::new(endpoint)?;
            #[allow(clippy::cast_possible_truncation)]
            {
                config.max_stream_count = max_streams as usize;
            }
            config.with_filename = with_filename;
            config.on_duplicate = on_duplicate;
            config.destination_path = destination;

            let scheduler = Scheduler::new(config).with_policy(PartitionPolicy {
                part_size,
                max_parts: DEFAULT_MAX_PARTS,
            });
            for file in &files {
                scheduler.enqueue(file).await?;
            }

            run_with_progress(&scheduler).await;

            let queue = scheduler.snapshot();
            let completed: Vec<_> = queue
                .iter()
                .filter(|f| f.status == UploadStatus::Completed)
                .collect();
            let failed: Vec<_> = queue
                .iter()
                .filter(|f| f.status == UploadStatus::Error)
                .collect();

            if !completed.is_empty() {
                println!("\n✅ Successfully uploaded {} file(s):", completed.len());
                for file in &completed {
                    println!("  {}", file.path.display());
                }
            }

            if !failed.is_empty() {
                eprintln!("\n❌ Failed to upload {} file(s):", failed.len());
                for file in &failed {
                    eprintln!("  {}", file.path.display());
                }
                return Err(anyhow::anyhow!(
                    "{} file(s) failed to upload",
                    failed.len()
                ));
            }

            Ok(())
        }
    }
}

/// Drives the scheduler while mirroring queue progress into one bar per
/// file.
async fn run_with_progress(scheduler: &Scheduler) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    let driver = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    loop {
        for file in scheduler.snapshot() {
            let bar = bars.entry(file.id.clone()).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(file.size.max(1)));
                #[allow(clippy::expect_used)]
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                        )
                        .expect("Failed to set progress bar template")
                        .progress_chars("#>-"),
                );
                bar.set_message(file.path.display().to_string());
                bar
            });

            match file.status {
                UploadStatus::Completed => bar.finish_with_message(format!(
                    "{} done",
                    file.path.display()
                )),
                UploadStatus::Error => bar.abandon_with_message(format!(
                    "{} failed",
                    file.path.display()
                )),
                _ => bar.set_position(file.uploaded_bytes),
            }
        }

        if driver.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = driver.await;
}

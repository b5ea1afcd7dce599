use clap::{Parser, Subcommand};
use eyre::{ensure, Context, Result};
use flatfat::{FileDisk, FileSystem};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the volume geometry and free space
    Info {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// List the files on the volume
    Ls {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Print the size of a file
    Stat {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
    /// Write a file's contents to stdout
    Cat {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
    /// Copy a host file onto the volume
    Add {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        file: PathBuf,
        /// Name on the volume, defaults to the host file name
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Delete a file from the volume
    Rm {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
}

fn mount(image: &Path) -> Result<FileSystem<FileDisk>> {
    let mut fs = FileSystem::new();
    fs.mount_volume(image)
        .wrap_err_with(|| format!("Failed to mount {image:?}"))?;
    Ok(fs)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up flatfat cli");
    match cli.command {
        Command::Info { image } => {
            let mut fs = mount(&image)?;
            println!("{}", fs.info()?);
            fs.unmount()?;
        }
        Command::Ls { image } => {
            let mut fs = mount(&image)?;
            println!("FS Ls:");
            for entry in fs.list()? {
                println!("{entry}");
            }
            fs.unmount()?;
        }
        Command::Stat { image, name } => {
            let mut fs = mount(&image)?;
            let fd = fs.open(&name)?;
            println!("Size of file '{name}' is {} bytes", fs.stat(fd)?);
            fs.close(fd)?;
            fs.unmount()?;
        }
        Command::Cat { image, name } => {
            let mut fs = mount(&image)?;
            let fd = fs.open(&name)?;
            let data = fs.read_vec(fd, fs.stat(fd)?)?;
            std::io::stdout().write_all(&data)?;
            fs.close(fd)?;
            fs.unmount()?;
        }
        Command::Add { image, file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_owned)
                    .ok_or_else(|| eyre::eyre!("{file:?} has no usable file name"))?,
            };
            let data = std::fs::read(&file).wrap_err("Couldn't read the host file")?;
            let mut fs = mount(&image)?;
            fs.create(&name)?;
            let fd = fs.open(&name)?;
            let written = fs.write(fd, &data)?;
            fs.close(fd)?;
            fs.unmount()?;
            ensure!(
                written == data.len(),
                "Volume full: only {written} of {} bytes were written",
                data.len()
            );
            println!("Wrote file '{name}' ({written}/{} bytes)", data.len());
        }
        Command::Rm { image, name } => {
            let mut fs = mount(&image)?;
            fs.delete(&name)?;
            fs.unmount()?;
            println!("Removed file '{name}'");
        }
    }
    Ok(())
}

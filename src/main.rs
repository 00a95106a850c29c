use clap::Parser;
use cursor_chat_export::archive::{self, ExportConfig};
use eyre::{eyre, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Export Cursor editor AI chat history to Markdown files in a zip archive.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write the archive into.
    /// Defaults to the current directory if not set in config.
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Path to the Cursor user data directory (the one containing
    /// workspaceStorage). Auto-detected if omitted.
    #[arg(long, value_name = "PATH")]
    cursor_dir: Option<PathBuf>,

    /// Workspace id to export; repeat for several. Omit to export everything.
    #[arg(long = "workspace", value_name = "ID")]
    workspaces: Vec<String>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/cursor-chat-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the reconciled conversations as JSON to stdout instead of
    /// writing an archive.
    #[arg(long)]
    json: bool,

    /// Print each workspace's conversation count.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress standard output (progress bars).
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    output_dir: Option<PathBuf>,
    cursor_dir: Option<PathBuf>,
}

fn default_cursor_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Cursor/User"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        // Search: XDG/OS config dir, then nothing
        dirs::config_dir()
            .map(|d| d.join("cursor-chat-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve output_dir (CLI > Config > Default)
    let output_dir = cli
        .output_dir
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    // 3. Resolve cursor_dir (CLI > Config > Auto-detect)
    let cursor_dir = cli
        .cursor_dir
        .or(file_cfg.cursor_dir)
        .or_else(default_cursor_dir)
        .ok_or_else(|| {
            eyre!("Could not determine the Cursor user data directory.\nUse --cursor-dir to specify manually, or set cursor_dir in config.toml.")
        })?;

    if !cursor_dir.exists() {
        return Err(eyre!(
            "Cursor user data directory not found at: {}\nUse --cursor-dir to specify the path manually.",
            cursor_dir.display()
        ));
    }

    // 4. Build the Export Config
    let config = ExportConfig {
        output_dir,
        cursor_dir,
        workspaces: cli.workspaces,
        verbose: cli.verbose,
        quiet: cli.quiet || cli.json,
    };

    // 5. Run the Business Logic
    if cli.json {
        let response = archive::query(&config)?;
        let payload = serde_json::to_string_pretty(&response)
            .wrap_err("Failed to serialize conversations")?;
        println!("{payload}");
        Ok(())
    } else {
        archive::execute(&config).map(|_| ())
    }
}

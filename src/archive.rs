//! Zip packaging and the sequential multi-workspace export loop.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use eyre::{eyre, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::exporter;
use crate::importer::{self, WorkspaceRef};
use crate::reconcile::{Conversation, ConversationsResponse};

/// Configuration required to run an export.
/// Decouples the logic from how the arguments were parsed (CLI/config file).
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Cursor user data directory (the one holding `workspaceStorage/`).
    pub cursor_dir: PathBuf,
    /// Workspace ids to export; empty means every discovered workspace.
    pub workspaces: Vec<String>,
    pub verbose: bool,
    pub quiet: bool,
}

impl ExportConfig {
    fn storage_dir(&self) -> PathBuf {
        self.cursor_dir.join("workspaceStorage")
    }

    fn global_db(&self) -> PathBuf {
        self.cursor_dir.join("globalStorage").join("state.vscdb")
    }

    /// Requested workspaces, or everything under `workspaceStorage`.
    /// An explicitly requested id is kept even if its database is missing;
    /// that workspace just exports empty.
    fn selected_workspaces(&self) -> Vec<WorkspaceRef> {
        if self.workspaces.is_empty() {
            importer::discover_workspaces(&self.storage_dir())
        } else {
            self.workspaces
                .iter()
                .map(|id| WorkspaceRef {
                    id: id.clone(),
                    db_path: self.storage_dir().join(id).join("state.vscdb"),
                })
                .collect()
        }
    }
}

pub struct ExportSummary {
    pub archive_path: PathBuf,
    pub workspaces: usize,
    pub conversations: usize,
}

/// Run the export: reconcile every selected workspace sequentially, then
/// package the result as one zip archive.
///
/// Zero conversations across all workspaces is a distinct error; a single
/// empty workspace is not.
pub fn execute(config: &ExportConfig) -> Result<ExportSummary> {
    let workspaces = config.selected_workspaces();

    let pb = if config.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(workspaces.len() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} workspaces",
            )
            .unwrap()
            .progress_chars("=>-"),
        );
        bar.println(format!("Found {} workspace(s).", workspaces.len()));
        bar
    };

    let gathered = gather(config, &workspaces, &pb);
    pb.finish_and_clear();

    let total: usize = gathered.iter().map(|(_, convs)| convs.len()).sum();
    if total == 0 {
        return Err(eyre!(
            "No conversations found in {} workspace(s)",
            gathered.len()
        ));
    }

    fs::create_dir_all(&config.output_dir).wrap_err_with(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;

    let single = match &config.workspaces[..] {
        [only] => Some(only.as_str()),
        _ => None,
    };
    let archive_path = config
        .output_dir
        .join(archive_file_name(Local::now(), single));
    write_archive(&archive_path, &gathered)?;

    if !config.quiet {
        eprintln!(
            "Done. Exported {} conversation(s) from {} workspace(s) to {}.",
            total,
            gathered.len(),
            archive_path.display()
        );
    }

    Ok(ExportSummary {
        archive_path,
        workspaces: gathered.len(),
        conversations: total,
    })
}

/// Reconcile every selected workspace and return the flat, newest-first
/// conversation list consumed by UI/API layers.
pub fn query(config: &ExportConfig) -> Result<ConversationsResponse> {
    let workspaces = config.selected_workspaces();
    let pb = ProgressBar::hidden();
    let gathered = gather(config, &workspaces, &pb);

    let mut conversations: Vec<Conversation> = gathered
        .into_iter()
        .flat_map(|(_, convs)| convs)
        .collect();
    if conversations.is_empty() {
        return Err(eyre!("No conversations found"));
    }
    conversations.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
    Ok(ConversationsResponse { conversations })
}

/// One workspace fully completes before the next begins; there is no shared
/// state between runs, so a failing workspace only empties itself.
fn gather(
    config: &ExportConfig,
    workspaces: &[WorkspaceRef],
    pb: &ProgressBar,
) -> Vec<(String, Vec<Conversation>)> {
    let global_db = config.global_db();
    let mut gathered = Vec::with_capacity(workspaces.len());
    for ws in workspaces {
        let conversations = importer::load_workspace(&ws.db_path, &global_db);
        if config.verbose {
            pb.println(format!("{}: {} conversation(s)", ws.id, conversations.len()));
        }
        gathered.push((ws.id.clone(), conversations));
        pb.inc(1);
    }
    gathered
}

fn write_archive(path: &Path, gathered: &[(String, Vec<Conversation>)]) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("Failed to create archive: {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (workspace_id, conversations) in gathered {
        let folder = sanitize_filename(workspace_id);
        zip.add_directory(format!("{folder}/"), options)
            .wrap_err("Failed to add archive directory")?;

        let mut taken: HashMap<String, String> = HashMap::new();
        for conversation in conversations {
            let stem = allocate_entry_stem(&conversation.id, &conversation.title, &mut taken);
            zip.start_file(format!("{folder}/{stem}.md"), options)
                .wrap_err("Failed to start archive entry")?;
            let mut buf = Vec::new();
            exporter::write_conversation_markdown(&mut buf, conversation)
                .wrap_err("Failed to render conversation markdown")?;
            zip.write_all(&buf).wrap_err("Failed to write archive entry")?;
        }
    }

    zip.finish().wrap_err("Failed to finalize archive")?;
    Ok(())
}

/// `cursor_chats_<YYYYMMDDHHMMSS>[_<workspace-id>].zip`
pub fn archive_file_name(now: DateTime<Local>, workspace: Option<&str>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S");
    match workspace {
        Some(ws) => format!("cursor_chats_{stamp}_{}.zip", sanitize_filename(ws)),
        None => format!("cursor_chats_{stamp}.zip"),
    }
}

/// Replace filesystem-unsafe characters and control characters with
/// underscores; a trailing literal dot becomes an underscore too.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    if out.ends_with('.') {
        out.pop();
        out.push('_');
    }
    out
}

/// Pick a unique file stem within one archive folder: the sanitized title,
/// falling back to the conversation id, suffixed with an id prefix on
/// collision.
fn allocate_entry_stem(id: &str, title: &str, taken: &mut HashMap<String, String>) -> String {
    let base = {
        let s = sanitize_filename(title);
        if s.trim().is_empty() {
            sanitize_filename(id)
        } else {
            s
        }
    };
    let short: String = id.chars().take(8).collect();
    for candidate in [base.clone(), format!("{base}_{short}"), format!("{base}_{id}")] {
        match taken.get(&candidate) {
            None => {
                taken.insert(candidate.clone(), id.to_string());
                return candidate;
            }
            Some(owner) if owner == id => return candidate,
            Some(_) => continue,
        }
    }
    // Unreachable: the full id is unique per conversation
    base
}

//! Cursor storage schema and access.
//!
//! Cursor keeps editor state in SQLite key-value stores:
//!
//! - per workspace: `<user-dir>/workspaceStorage/<workspace-id>/state.vscdb`,
//!   table `ItemTable (key TEXT PRIMARY KEY, value BLOB)`;
//! - shared: `<user-dir>/globalStorage/state.vscdb`,
//!   table `cursorDiskKV (key TEXT PRIMARY KEY, value BLOB)`.
//!
//! Values are JSON blobs. The keys this tool reads:
//!
//! - `workbench.panel.aichat.view.aichat.chatdata` (workspace) - legacy chat
//!   tabs, complete with their bubbles;
//! - `composer.composerData` (workspace) - the index of composer instances
//!   belonging to this workspace;
//! - `composerData:<composerId>` (global) - one composer body: metadata,
//!   inline message list, optional explicit header order;
//! - `bubbleId:<composerId>:<bubbleId>` (global) - one composer message.
//!
//! The schema is undocumented and has shifted between Cursor releases, so
//! every field here is optional and decoded leniently; raw shapes never
//! escape past the normalizer in [`crate::reconcile`].
//!
//! Databases are opened **read-only** - user data is never modified.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::reconcile::{Conversation, Reconciler};

/// Workspace-store key holding the legacy chat tabs.
pub const WORKSPACE_CHAT_KEY: &str = "workbench.panel.aichat.view.aichat.chatdata";
/// Workspace-store key holding the composer index.
pub const WORKSPACE_COMPOSER_KEY: &str = "composer.composerData";
/// Global-store key prefix for composer bodies.
pub const GLOBAL_COMPOSER_PREFIX: &str = "composerData:";
/// Global-store key prefix for composer message bubbles.
pub const GLOBAL_BUBBLE_PREFIX: &str = "bubbleId:";

// ---------------------------------------------------------------------------
// Raw record shapes
// ---------------------------------------------------------------------------

/// The legacy chat blob: every chat tab of one workspace.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatData {
    pub tabs: Vec<ChatTab>,
}

/// One legacy chat tab. `lastSendTime` is the only timestamp this generation
/// recorded.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatTab {
    pub tab_id: String,
    pub chat_title: Option<String>,
    pub last_send_time: Option<Value>,
    pub bubbles: Vec<RawBubble>,
}

/// The workspace composer index: which composer instances belong here.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposerIndex {
    pub all_composers: Vec<ComposerEntry>,
}

/// One entry of the composer index. Timestamps are kept raw; their shape
/// varies across Cursor versions.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposerEntry {
    pub composer_id: String,
    pub name: Option<String>,
    pub created_at: Option<Value>,
    pub last_updated_at: Option<Value>,
}

/// A composer body from the global store.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposerBody {
    pub composer_id: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub created_at: Option<Value>,
    pub last_updated_at: Option<Value>,
    /// Inline message list, newer layout.
    pub messages: Vec<RawBubble>,
    /// Inline message list, older layout.
    pub conversation: Vec<RawBubble>,
    /// Explicit message ordering when the composer recorded one.
    pub full_conversation_headers_only: Vec<BubbleHeader>,
}

impl ComposerBody {
    /// `messages` or, when that is empty, `conversation` - first non-empty
    /// wins.
    pub fn message_list(&self) -> &[RawBubble] {
        if !self.messages.is_empty() {
            &self.messages
        } else {
            &self.conversation
        }
    }
}

/// One entry of a composer's explicit header-order list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BubbleHeader {
    pub bubble_id: Option<String>,
}

/// One raw message record, from any of the three sources. `type` is a string
/// in legacy tabs ("user"/"ai") and a number everywhere else.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawBubble {
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub role: Option<String>,
    pub text: Option<String>,
    pub raw_text: Option<String>,
    pub bubble_id: Option<String>,
    pub id: Option<String>,
}

// ---------------------------------------------------------------------------
// Store access
// ---------------------------------------------------------------------------

fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open database: {}", path.display()))
}

/// Cursor stores JSON values as TEXT or BLOB depending on the writer version.
fn column_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    }
}

/// A workspace-local `state.vscdb`, read via its `ItemTable`.
pub struct WorkspaceStore {
    conn: Connection,
}

impl WorkspaceStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_read_only(path)?,
        })
    }

    /// Fetch a single value by key. Missing keys are not an error.
    pub fn read_item(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM ItemTable WHERE key = ?1")
            .wrap_err("Failed to prepare ItemTable query")?;
        let mut rows = stmt.query([key]).wrap_err("Failed to query ItemTable")?;
        match rows.next().wrap_err("Failed to read ItemTable row")? {
            Some(row) => Ok(column_text(row.get_ref(0)?)),
            None => Ok(None),
        }
    }
}

/// The shared global `state.vscdb`, read via its `cursorDiskKV` table.
pub struct GlobalStore {
    conn: Connection,
}

impl GlobalStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_read_only(path)?,
        })
    }

    /// One batched lookup for a list of keys.
    pub fn read_many(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("SELECT key, value FROM cursorDiskKV WHERE key IN ({placeholders})");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .wrap_err("Failed to prepare batched cursorDiskKV query")?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(keys.iter()))
            .wrap_err("Failed to query cursorDiskKV")?;
        while let Some(row) = rows.next().wrap_err("Failed to read cursorDiskKV row")? {
            let key: String = row.get(0)?;
            if let Some(value) = column_text(row.get_ref(1)?) {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Scan every key under a prefix, e.g. all `bubbleId:` records.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM cursorDiskKV WHERE key LIKE ?1")
            .wrap_err("Failed to prepare cursorDiskKV scan")?;
        let pattern = format!("{prefix}%");
        let mut rows = stmt.query([pattern]).wrap_err("Failed to scan cursorDiskKV")?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().wrap_err("Failed to read scan row")? {
            let key: String = row.get(0)?;
            match column_text(row.get_ref(1)?) {
                Some(value) => records.push((key, value)),
                None => debug!(key = %key, "skipping non-text global record"),
            }
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Workspace discovery and the per-workspace fetch driver
// ---------------------------------------------------------------------------

/// One discovered workspace: its storage-directory name and database path.
#[derive(Debug, Clone)]
pub struct WorkspaceRef {
    pub id: String,
    pub db_path: PathBuf,
}

/// Enumerate workspace directories under `workspaceStorage`, sorted by id.
/// A missing or unreadable storage directory yields an empty set.
pub fn discover_workspaces(storage_dir: &Path) -> Vec<WorkspaceRef> {
    let Ok(entries) = fs::read_dir(storage_dir) else {
        debug!(dir = %storage_dir.display(), "workspace storage directory not readable");
        return Vec::new();
    };
    let mut workspaces: Vec<WorkspaceRef> = entries
        .flatten()
        .filter_map(|entry| {
            let db_path = entry.path().join("state.vscdb");
            if !db_path.is_file() {
                return None;
            }
            Some(WorkspaceRef {
                id: entry.file_name().to_string_lossy().into_owned(),
                db_path,
            })
        })
        .collect();
    workspaces.sort_by(|a, b| a.id.cmp(&b.id));
    workspaces
}

/// Reconcile one workspace's conversations.
///
/// Never fails past this boundary: a missing workspace database is a valid
/// empty state, and any storage or top-level parse failure is logged and
/// collapses to an empty list, leaving other workspaces unaffected.
pub fn load_workspace(workspace_db: &Path, global_db: &Path) -> Vec<Conversation> {
    match load_workspace_inner(workspace_db, global_db) {
        Ok(conversations) => conversations,
        Err(err) => {
            warn!(
                workspace = %workspace_db.display(),
                err = %format!("{err:#}"),
                "workspace fetch failed, returning no conversations"
            );
            Vec::new()
        }
    }
}

fn load_workspace_inner(workspace_db: &Path, global_db: &Path) -> Result<Vec<Conversation>> {
    if !workspace_db.is_file() {
        debug!(workspace = %workspace_db.display(), "workspace database absent");
        return Ok(Vec::new());
    }

    let store = WorkspaceStore::open(workspace_db)?;
    let mut reconciler = Reconciler::new();

    if let Some(blob) = store.read_item(WORKSPACE_CHAT_KEY)? {
        let chat: ChatData =
            serde_json::from_str(&blob).wrap_err("Malformed legacy chat data blob")?;
        reconciler.ingest_chat_tabs(&chat);
    }

    let index: Option<ComposerIndex> = match store.read_item(WORKSPACE_COMPOSER_KEY)? {
        Some(blob) => {
            Some(serde_json::from_str(&blob).wrap_err("Malformed composer metadata blob")?)
        }
        None => None,
    };

    if let Some(index) = index.filter(|ix| !ix.all_composers.is_empty()) {
        let global = GlobalStore::open(global_db)?;

        let keys: Vec<String> = index
            .all_composers
            .iter()
            .filter(|entry| !entry.composer_id.is_empty())
            .map(|entry| format!("{GLOBAL_COMPOSER_PREFIX}{}", entry.composer_id))
            .collect();
        let raw_bodies = global.read_many(&keys)?;

        // Composer bodies are individual global-store records: a malformed
        // one degrades that composer to its index metadata, nothing more.
        let mut bodies: HashMap<String, ComposerBody> = HashMap::with_capacity(raw_bodies.len());
        for (key, value) in &raw_bodies {
            let composer_id = key
                .strip_prefix(GLOBAL_COMPOSER_PREFIX)
                .unwrap_or(key)
                .to_string();
            match serde_json::from_str::<ComposerBody>(value) {
                Ok(body) => {
                    bodies.insert(composer_id, body);
                }
                Err(err) => warn!(key = %key, %err, "malformed composer body record, skipped"),
            }
        }
        reconciler.ingest_composers(&index, &bodies);

        let records = global.scan_prefix(GLOBAL_BUBBLE_PREFIX)?;
        let total = records.len();
        let mut admitted = 0usize;
        for (key, value) in &records {
            if reconciler.ingest_global_bubble(key, value) {
                admitted += 1;
            }
        }
        debug!(
            total,
            admitted,
            skipped = total - admitted,
            "global bubble scan complete"
        );
    }

    Ok(reconciler.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_workspace_db(dir: &Path, items: &[(&str, String)]) -> PathBuf {
        let path = dir.join("state.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value BLOB)",
            [],
        )
        .unwrap();
        for (key, value) in items {
            conn.execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .unwrap();
        }
        path
    }

    fn create_global_db(dir: &Path, items: &[(String, String)]) -> PathBuf {
        let path = dir.join("global.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE cursorDiskKV (key TEXT PRIMARY KEY, value BLOB)",
            [],
        )
        .unwrap();
        for (key, value) in items {
            conn.execute(
                "INSERT INTO cursorDiskKV (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn test_missing_workspace_db_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let global = create_global_db(dir.path(), &[]);
        let convs = load_workspace(&dir.path().join("absent.vscdb"), &global);
        assert!(convs.is_empty());
    }

    #[test]
    fn test_malformed_top_level_blob_aborts_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = create_workspace_db(
            dir.path(),
            &[(WORKSPACE_CHAT_KEY, "{definitely not json".to_string())],
        );
        let global = create_global_db(dir.path(), &[]);
        assert!(load_workspace(&ws, &global).is_empty());
    }

    #[test]
    fn test_chat_tab_only_workspace() {
        // One chat tab, no composer metadata: one conversation named after
        // the first title line.
        let dir = tempfile::tempdir().unwrap();
        let chat = json!({
            "tabs": [{
                "tabId": "t1",
                "chatTitle": "Hello\nworld",
                "lastSendTime": 1_700_000_000_000i64,
                "bubbles": [{"type": "user", "text": "Hi"}]
            }]
        });
        let ws = create_workspace_db(dir.path(), &[(WORKSPACE_CHAT_KEY, chat.to_string())]);
        let global = create_global_db(dir.path(), &[]);
        let convs = load_workspace(&ws, &global);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "t1");
        assert_eq!(convs[0].title, "Hello");
        assert_eq!(convs[0].messages.len(), 1);
        assert_eq!(convs[0].messages[0].content, "Hi");
    }

    #[test]
    fn test_composer_workspace_with_foreign_bubbles() {
        // Composer c1 belongs to the workspace; c2's bubbles sit in the same
        // global store and must never leak in.
        let dir = tempfile::tempdir().unwrap();
        let composer_index = json!({
            "allComposers": [{
                "composerId": "c1",
                "name": "My composer",
                "createdAt": 1_700_000_000_000i64,
                "lastUpdatedAt": 1_700_000_100_000i64
            }]
        });
        let ws = create_workspace_db(
            dir.path(),
            &[(WORKSPACE_COMPOSER_KEY, composer_index.to_string())],
        );
        let global = create_global_db(
            dir.path(),
            &[
                (
                    "composerData:c1".to_string(),
                    json!({"composerId": "c1"}).to_string(),
                ),
                (
                    "bubbleId:c1:b1".to_string(),
                    json!({"type": 1, "text": "question"}).to_string(),
                ),
                (
                    "bubbleId:c1:b2".to_string(),
                    json!({"type": 0, "text": "answer"}).to_string(),
                ),
                (
                    "bubbleId:c2:b9".to_string(),
                    json!({"type": 1, "text": "someone else"}).to_string(),
                ),
            ],
        );
        let convs = load_workspace(&ws, &global);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "c1");
        assert_eq!(convs[0].messages.len(), 2);
        assert!(convs[0].messages.iter().all(|m| m.content != "someone else"));
    }

    #[test]
    fn test_malformed_bubble_does_not_abort_scan() {
        let dir = tempfile::tempdir().unwrap();
        let composer_index = json!({
            "allComposers": [{"composerId": "c1", "name": "n",
                              "createdAt": 1_700_000_000_000i64}]
        });
        let ws = create_workspace_db(
            dir.path(),
            &[(WORKSPACE_COMPOSER_KEY, composer_index.to_string())],
        );
        let global = create_global_db(
            dir.path(),
            &[
                ("bubbleId:c1:bad".to_string(), "{broken".to_string()),
                (
                    "bubbleId:c1:ok".to_string(),
                    json!({"type": 1, "text": "survives"}).to_string(),
                ),
            ],
        );
        let convs = load_workspace(&ws, &global);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].messages.len(), 1);
        assert_eq!(convs[0].messages[0].content, "survives");
    }

    #[test]
    fn test_same_id_in_both_sources_prefers_composer_title() {
        let dir = tempfile::tempdir().unwrap();
        let chat = json!({
            "tabs": [{
                "tabId": "t1",
                "chatTitle": "Tab title",
                "lastSendTime": 1_700_000_000_000i64,
                "bubbles": [{"type": "user", "text": "Hi"}]
            }]
        });
        let composer_index = json!({
            "allComposers": [{"composerId": "t1", "name": "Composer title"}]
        });
        let ws = create_workspace_db(
            dir.path(),
            &[
                (WORKSPACE_CHAT_KEY, chat.to_string()),
                (WORKSPACE_COMPOSER_KEY, composer_index.to_string()),
            ],
        );
        let global = create_global_db(dir.path(), &[]);
        let convs = load_workspace(&ws, &global);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].title, "Composer title");
    }

    #[test]
    fn test_discover_workspaces_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["bbb", "aaa"] {
            let ws_dir = dir.path().join(id);
            fs::create_dir(&ws_dir).unwrap();
            create_workspace_db(&ws_dir, &[]);
        }
        fs::create_dir(dir.path().join("no-db-here")).unwrap();
        let found = discover_workspaces(dir.path());
        let ids: Vec<&str> = found.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_read_many_batched_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let global_path = create_global_db(
            dir.path(),
            &[
                ("composerData:a".to_string(), "1".to_string()),
                ("composerData:b".to_string(), "2".to_string()),
            ],
        );
        let global = GlobalStore::open(&global_path).unwrap();
        let found = global
            .read_many(&[
                "composerData:a".to_string(),
                "composerData:missing".to_string(),
            ])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["composerData:a"], "1");
    }
}

//! Reconciles Cursor's three conversation sources into one canonical model.
//!
//! Cursor has grown two generations of chat storage: the legacy "chat tab"
//! records kept whole in the workspace store, and the newer "composer"
//! records whose index lives in the workspace store while the message bodies
//! ("bubbles") live in the shared global store. The same logical conversation
//! can show up in neither, one, or both places, keyed by a tab id or a
//! composer id (the two namespaces are disjoint).
//!
//! The [`Reconciler`] ingests the sources in a fixed order - legacy chat
//! tabs, then the composer index cross-referenced with composer bodies, then
//! the global bubble scan - merging records by id, staging normalized
//! messages, and resolving ordering at the end. All state is owned by one
//! reconciliation run; nothing survives a call to [`Reconciler::finish`].

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::importer::{ChatData, ComposerBody, ComposerIndex, RawBubble};

/// Numeric timestamps below this magnitude are seconds since epoch,
/// everything at or above it is milliseconds.
const SECONDS_MAGNITUDE_CUTOFF: i64 = 100_000_000_000;

// ---------------------------------------------------------------------------
// Canonical model
// ---------------------------------------------------------------------------

/// Conversation turn role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn display_name(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// Which raw source a message was normalized from. Kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageSource {
    #[serde(rename = "legacy-chat")]
    LegacyChat,
    #[serde(rename = "composer-message")]
    ComposerMessage,
    #[serde(rename = "global-bubble")]
    GlobalBubble,
}

/// A single normalized message. Immutable once built.
///
/// Identity for deduplication is the (role, content) pair, not `id`: the same
/// logical message can appear under different identifiers across sources.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Raw type discriminator (numeric or string), preserved as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_type: Option<Value>,
    pub original_source: MessageSource,
}

/// One reconciled conversation, keyed by a tab id or a composer id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// The payload consumed by UI/API layers: all conversations, newest first.
#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<Conversation>,
}

// ---------------------------------------------------------------------------
// Timestamp normalization
// ---------------------------------------------------------------------------

/// Coerce whatever the store recorded as a timestamp into a UTC instant.
///
/// Accepts missing values, RFC 3339 / `YYYY-MM-DD HH:MM:SS` strings, and
/// numbers (seconds or milliseconds since epoch, disambiguated by magnitude).
/// Never fails: anything unparseable falls back to the current time.
pub fn normalize_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        None | Some(Value::Null) => Utc::now(),
        Some(Value::String(s)) => parse_instant_str(s).unwrap_or_else(|| {
            warn!(raw = %s, "unparseable timestamp string, using current time");
            Utc::now()
        }),
        Some(Value::Number(n)) => parse_instant_number(n).unwrap_or_else(|| {
            warn!(raw = %n, "out-of-range numeric timestamp, using current time");
            Utc::now()
        }),
        Some(other) => {
            warn!(raw = %other, "unrecognized timestamp shape, using current time");
            Utc::now()
        }
    }
}

fn parse_instant_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_instant_number(n: &serde_json::Number) -> Option<DateTime<Utc>> {
    let raw = n.as_f64()?;
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() < SECONDS_MAGNITUDE_CUTOFF as f64 {
        (raw * 1000.0) as i64
    } else {
        raw as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}

// ---------------------------------------------------------------------------
// Bubble normalization
// ---------------------------------------------------------------------------

/// Normalize one raw bubble into a canonical message.
///
/// Role inference differs per source generation:
/// - legacy chat tabs mark the user turn with a literal `"user"` in either
///   the role or the type field;
/// - composer messages use `role == "user"` or numeric type `1`;
/// - global-store bubbles only carry the numeric type (`1` user, `0`/`2`
///   assistant, anything else treated as assistant).
///
/// Records whose resolved content is empty or whitespace-only yield `None`.
pub fn normalize_bubble(raw: &RawBubble, source: MessageSource) -> Option<Message> {
    let content = raw
        .text
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| raw.raw_text.clone().filter(|t| !t.is_empty()))
        .unwrap_or_default();
    if content.trim().is_empty() {
        return None;
    }

    let role_is_user = |r: Option<&str>| r == Some("user");
    let type_num = raw.kind.as_ref().and_then(Value::as_i64);
    let role = match source {
        MessageSource::LegacyChat => {
            let type_str = raw.kind.as_ref().and_then(Value::as_str);
            if role_is_user(raw.role.as_deref()) || type_str == Some("user") {
                Role::User
            } else {
                Role::Assistant
            }
        }
        MessageSource::ComposerMessage => {
            if role_is_user(raw.role.as_deref()) || type_num == Some(1) {
                Role::User
            } else {
                Role::Assistant
            }
        }
        MessageSource::GlobalBubble => {
            if type_num == Some(1) {
                Role::User
            } else {
                Role::Assistant
            }
        }
    };

    let id = raw
        .bubble_id
        .clone()
        .or_else(|| raw.id.clone())
        .filter(|i| !i.is_empty());

    Some(Message {
        role,
        content,
        id,
        original_type: raw.kind.clone(),
        original_source: source,
    })
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Composer metadata as seen in step 2, the global-store body merged over the
/// workspace index entry. Step 3 reuses this view for conversations it has to
/// create or refresh.
#[derive(Debug, Default, Clone)]
struct ComposerMeta {
    name: Option<String>,
    summary: Option<String>,
    created_at: Option<Value>,
    last_updated_at: Option<Value>,
}

impl ComposerMeta {
    /// The composer's best "last updated" evidence: explicit field first,
    /// creation time as the fallback.
    fn last_updated_evidence(&self) -> Option<&Value> {
        self.last_updated_at.as_ref().or(self.created_at.as_ref())
    }
}

/// A conversation being assembled; messages stay staged until `finish`.
#[derive(Debug)]
struct Draft {
    id: String,
    title: String,
    summary: Option<String>,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    staged: Vec<Message>,
}

/// Merges the three raw sources into canonical conversations.
///
/// All maps are local to one run and dropped by [`Reconciler::finish`].
#[derive(Default)]
pub struct Reconciler {
    drafts: HashMap<String, Draft>,
    /// Creation order of drafts, for deterministic output on timestamp ties.
    order: Vec<String>,
    /// Composer ids named by this workspace's own index. Gates the global
    /// bubble scan: the global store holds bubbles from every workspace.
    membership: HashSet<String>,
    composer_meta: HashMap<String, ComposerMeta>,
    /// Per-conversation explicit ordering: bubble id -> intended position.
    order_hints: HashMap<String, HashMap<String, usize>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step 1: legacy chat tabs from the workspace store.
    ///
    /// Each tab becomes a provisional conversation. The tab's single
    /// `lastSendTime` seeds both timestamps; no separate creation time exists
    /// at this layer.
    pub fn ingest_chat_tabs(&mut self, data: &ChatData) {
        for tab in &data.tabs {
            if tab.tab_id.is_empty() {
                debug!("skipping chat tab without an id");
                continue;
            }
            let ts = normalize_timestamp(tab.last_send_time.as_ref());
            let title = tab
                .chat_title
                .as_deref()
                .and_then(|t| t.lines().next())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .unwrap_or_else(|| fallback_title(&tab.tab_id));

            let draft = self.draft_entry(&tab.tab_id, || Draft {
                id: tab.tab_id.clone(),
                title,
                summary: None,
                created_at: ts,
                last_updated_at: ts,
                staged: Vec::new(),
            });
            draft.staged.extend(
                tab.bubbles
                    .iter()
                    .filter_map(|b| normalize_bubble(b, MessageSource::LegacyChat)),
            );
        }
    }

    /// Step 2: the workspace composer index cross-referenced with composer
    /// bodies fetched from the global store.
    ///
    /// Every indexed composer id joins the membership set regardless of
    /// whether its body was found; that set is what admits global bubbles in
    /// step 3. Composer fields overwrite chat-tab fields when present and
    /// leave them untouched when absent.
    pub fn ingest_composers(
        &mut self,
        index: &ComposerIndex,
        bodies: &HashMap<String, ComposerBody>,
    ) {
        for entry in &index.all_composers {
            let id = entry.composer_id.clone();
            if id.is_empty() {
                debug!("skipping composer entry without an id");
                continue;
            }
            self.membership.insert(id.clone());

            let body = bodies.get(&id);
            let meta = ComposerMeta {
                name: body
                    .and_then(|b| b.name.clone())
                    .or_else(|| entry.name.clone())
                    .filter(|n| !n.is_empty()),
                summary: body
                    .and_then(|b| b.summary.clone())
                    .filter(|s| !s.is_empty()),
                created_at: body
                    .and_then(|b| b.created_at.clone())
                    .or_else(|| entry.created_at.clone()),
                last_updated_at: body
                    .and_then(|b| b.last_updated_at.clone())
                    .or_else(|| entry.last_updated_at.clone()),
            };

            if let Some(body) = body {
                let hints: HashMap<String, usize> = body
                    .full_conversation_headers_only
                    .iter()
                    .enumerate()
                    .filter_map(|(pos, h)| h.bubble_id.clone().map(|b| (b, pos)))
                    .collect();
                if !hints.is_empty() {
                    self.order_hints.insert(id.clone(), hints);
                }
            }

            let staged: Vec<Message> = body
                .map(|b| {
                    b.message_list()
                        .iter()
                        .filter_map(|m| normalize_bubble(m, MessageSource::ComposerMessage))
                        .collect()
                })
                .unwrap_or_default();

            // A freshly created draft starts from synthetic defaults (summary
            // falling back to the composer's name); the per-field overwrites
            // below then apply uniformly. Composer data wins over legacy
            // chat-tab data per field, but only when it is actually present.
            let draft = self.draft_entry(&id, || Draft {
                id: id.clone(),
                title: fallback_title(&id),
                summary: meta.summary.clone().or_else(|| meta.name.clone()),
                created_at: normalize_timestamp(meta.created_at.as_ref()),
                last_updated_at: normalize_timestamp(meta.last_updated_evidence()),
                staged: Vec::new(),
            });
            if let Some(name) = &meta.name {
                draft.title = name.clone();
            }
            if let Some(summary) = &meta.summary {
                draft.summary = Some(summary.clone());
            }
            if let Some(updated) = meta.last_updated_evidence() {
                draft.last_updated_at = normalize_timestamp(Some(updated));
            }
            if let Some(created) = &meta.created_at {
                draft.created_at = normalize_timestamp(Some(created));
            }
            draft.staged.extend(staged);

            self.composer_meta.insert(id, meta);
        }
    }

    /// Step 3: one record from the global bubble scan.
    ///
    /// `key` is the raw store key, `bubbleId:<composerId>:<bubbleId>`. Records
    /// whose composer id is not in the membership set are discarded - the
    /// global store is shared across all workspaces. Bubble-level timestamps
    /// never touch conversation timestamps; only composer metadata does.
    ///
    /// Returns false when the record was filtered or malformed, so callers
    /// can keep skip counts without aborting the scan.
    pub fn ingest_global_bubble(&mut self, key: &str, raw_json: &str) -> bool {
        let Some((composer_id, bubble_id)) = parse_bubble_key(key) else {
            debug!(key, "global record key is not a bubble key");
            return false;
        };
        if !self.membership.contains(composer_id) {
            debug!(key, "bubble belongs to another workspace, discarded");
            return false;
        }
        let raw: RawBubble = match serde_json::from_str(raw_json) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, %err, "malformed global bubble record, skipped");
                return false;
            }
        };
        let Some(mut msg) = normalize_bubble(&raw, MessageSource::GlobalBubble) else {
            return false;
        };
        if msg.id.is_none() {
            // The key always carries the bubble id even when the body drops it.
            msg.id = Some(bubble_id.to_string());
        }

        let meta = self
            .composer_meta
            .get(composer_id)
            .cloned()
            .unwrap_or_default();
        let draft = self.draft_entry(composer_id, || Draft {
            id: composer_id.to_string(),
            title: meta
                .name
                .clone()
                .unwrap_or_else(|| fallback_title(composer_id)),
            summary: meta.summary.clone().or_else(|| meta.name.clone()),
            created_at: normalize_timestamp(meta.created_at.as_ref()),
            last_updated_at: normalize_timestamp(meta.last_updated_evidence()),
            staged: Vec::new(),
        });
        if let Some(updated) = meta.last_updated_evidence() {
            draft.last_updated_at = normalize_timestamp(Some(updated));
        }
        draft.staged.push(msg);
        true
    }

    /// Deduplicate, order, and emit the final conversation list.
    ///
    /// Messages deduplicate on first occurrence of (role, content). When an
    /// order-hint map exists, hinted messages sort before unhinted ones and
    /// by hint position among themselves; the stable sort keeps staging order
    /// for everything else. Conversations left without messages are dropped.
    /// The list comes back newest first by `lastUpdatedAt`.
    pub fn finish(mut self) -> Vec<Conversation> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let Some(draft) = self.drafts.remove(id) else {
                continue;
            };

            let mut seen: HashSet<(Role, String)> = HashSet::new();
            let mut messages: Vec<Message> = Vec::with_capacity(draft.staged.len());
            for msg in draft.staged {
                if seen.insert((msg.role, msg.content.clone())) {
                    messages.push(msg);
                }
            }

            if let Some(hints) = self.order_hints.get(id).filter(|h| !h.is_empty()) {
                messages.sort_by_key(|m| {
                    match m.id.as_deref().and_then(|mid| hints.get(mid)) {
                        Some(&pos) => (0usize, pos),
                        None => (1, 0),
                    }
                });
            }

            if messages.is_empty() {
                debug!(id = %id, "conversation empty after deduplication, dropped");
                continue;
            }

            out.push(Conversation {
                id: draft.id,
                title: draft.title,
                summary: draft.summary,
                messages,
                created_at: draft.created_at,
                last_updated_at: draft.last_updated_at,
            });
        }

        out.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        out
    }

    fn draft_entry(&mut self, id: &str, make: impl FnOnce() -> Draft) -> &mut Draft {
        match self.drafts.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.order.push(id.to_string());
                entry.insert(make())
            }
        }
    }
}

/// `bubbleId:<composerId>:<bubbleId>` -> (composer id, bubble id).
fn parse_bubble_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(crate::importer::GLOBAL_BUBBLE_PREFIX)?;
    let (composer_id, bubble_id) = rest.split_once(':')?;
    if composer_id.is_empty() || bubble_id.is_empty() {
        return None;
    }
    Some((composer_id, bubble_id))
}

fn fallback_title(id: &str) -> String {
    let short: String = id.chars().take(8).collect();
    format!("Chat {short}")
}

pub mod content;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

pub use content::{
    apply_highlights, apply_mark, deserialize_range, remove_mark, serialize_range, ContentNode,
    ContentTree, ElementNode, Locator, NodeAddress, TreeRange,
};

pub type BookId = u64;

const HIGHLIGHT_TEXT_LIMIT: usize = 500;
const TOP_GENRES: usize = 3;
const TOP_CONCEPTS: usize = 8;
const RECENT_SESSIONS: usize = 3;
const RECENT_IDEAS: usize = 6;

/// Rendering family a book's content belongs to, selecting which position
/// tracker the reader view instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookLayout {
    Reflowable,
    FixedPage,
}

/// Catalog entry for a marketplace book. Genre and concept tags are static
/// per-book metadata; the core never derives concepts itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub genre: String,
    pub concepts: Vec<String>,
    pub content_uri: String,
    pub layout: BookLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightColor {
    Amber,
    Mint,
    Rose,
    Sky,
}

impl Default for HighlightColor {
    fn default() -> Self {
        HighlightColor::Amber
    }
}

/// A persisted text highlight. The locator fields are structural paths valid
/// only against a content tree with the same rendered shape; when the shape
/// diverges, resolution fails silently and the highlight is simply not shown
/// for that render. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    pub id: Uuid,
    pub book_id: BookId,
    pub owner_address: String,
    pub text: String,
    pub color: HighlightColor,
    pub created_at: DateTime<Utc>,
    pub chapter_index: usize,
    pub page_in_chapter: usize,
    pub start_path: String,
    pub end_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Highlight {
    pub fn new(
        book_id: BookId,
        owner_address: impl Into<String>,
        text: impl Into<String>,
        color: HighlightColor,
        chapter_index: usize,
        page_in_chapter: usize,
        locator: Locator,
    ) -> Self {
        let mut text: String = text.into();
        if text.chars().count() > HIGHLIGHT_TEXT_LIMIT {
            text = text.chars().take(HIGHLIGHT_TEXT_LIMIT).collect();
        }
        Self {
            id: Uuid::new_v4(),
            book_id,
            owner_address: owner_address.into(),
            text,
            color,
            created_at: Utc::now(),
            chapter_index,
            page_in_chapter,
            start_path: locator.start_path,
            end_path: locator.end_path,
            start_offset: locator.start_offset,
            end_offset: locator.end_offset,
        }
    }

    pub fn locator(&self) -> Locator {
        Locator {
            start_path: self.start_path.clone(),
            start_offset: self.start_offset,
            end_path: self.end_path.clone(),
            end_offset: self.end_offset,
        }
    }
}

/// A timed interval of reading activity against one book. Open while
/// `ended_at` is `None`; closed exactly once. One open session per book is
/// caller discipline, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingSession {
    pub id: Uuid,
    pub book_id: BookId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pages_read: u32,
    pub duration_minutes: i64,
    pub ideas_extracted: Vec<String>,
}

impl ReadingSession {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Derived personalization signals, recomputed fully on every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingProfile {
    pub total_reading_time_minutes: i64,
    pub weekly_reading_time_minutes: i64,
    pub top_genres: Vec<String>,
    pub top_concepts: Vec<String>,
    pub recent_ideas: Vec<String>,
}

/// Normalized "where am I" pair shared by both position trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPosition {
    pub current_location: usize,
    pub total_locations: usize,
    pub at_start: bool,
    pub at_end: bool,
}

impl DocumentPosition {
    pub fn new(current_location: usize, total_locations: usize) -> Self {
        let total = total_locations.max(1);
        let current = current_location.clamp(1, total);
        Self {
            current_location: current,
            total_locations: total,
            at_start: current == 1,
            at_end: current == total || total <= 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub book_id: BookId,
    pub location: usize,
    pub total_locations: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShelfView {
    Grid,
    List,
}

impl Default for ShelfView {
    fn default() -> Self {
        ShelfView::Grid
    }
}

/// The snapshot that crosses the persistence boundary. Wallet identity and
/// transient reader state are deliberately absent; they reset per process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedLibrary {
    pub catalog: Vec<BookRecord>,
    pub owned: BTreeSet<BookId>,
    pub progress: HashMap<BookId, ReadingProgress>,
    pub sessions: Vec<ReadingSession>,
    pub highlights: Vec<Highlight>,
    pub shelf_view: ShelfView,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedLibrary>>;
    fn save(&self, state: &PersistedLibrary) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("library.json")
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedLibrary>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedLibrary) -> Result<()> {
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

pub struct MemoryStateStore {
    inner: Mutex<Option<PersistedLibrary>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedLibrary>> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, state: &PersistedLibrary) -> Result<()> {
        *self.inner.lock() = Some(state.clone());
        Ok(())
    }
}

/// The application-state object. All mutations go through its methods; the
/// persistence boundary is the injected [`StateStore`].
pub struct Library {
    state: PersistedLibrary,
    owner_address: Option<String>,
    store: Arc<dyn StateStore>,
}

impl Library {
    #[instrument(skip(store))]
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        let state = store.load()?.unwrap_or_default();
        Ok(Self {
            state,
            owner_address: None,
            store,
        })
    }

    pub fn persist(&self) -> Result<()> {
        self.store.save(&self.state)
    }

    pub fn set_owner(&mut self, address: impl Into<String>) {
        self.owner_address = Some(address.into());
    }

    pub fn clear_owner(&mut self) {
        self.owner_address = None;
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner_address.as_deref()
    }

    pub fn upsert_book(&mut self, record: BookRecord) {
        match self.state.catalog.iter_mut().find(|b| b.id == record.id) {
            Some(existing) => *existing = record,
            None => self.state.catalog.push(record),
        }
    }

    pub fn book(&self, id: BookId) -> Option<&BookRecord> {
        self.state.catalog.iter().find(|b| b.id == id)
    }

    pub fn mark_owned(&mut self, id: BookId) {
        self.state.owned.insert(id);
    }

    pub fn is_owned(&self, id: BookId) -> bool {
        self.state.owned.contains(&id)
    }

    pub fn shelf_view(&self) -> ShelfView {
        self.state.shelf_view
    }

    pub fn set_shelf_view(&mut self, view: ShelfView) {
        self.state.shelf_view = view;
    }

    pub fn set_progress(&mut self, book_id: BookId, location: usize, total_locations: usize) {
        self.state.progress.insert(
            book_id,
            ReadingProgress {
                book_id,
                location,
                total_locations,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn progress(&self, book_id: BookId) -> Option<&ReadingProgress> {
        self.state.progress.get(&book_id)
    }

    // ---- session lifecycle ----

    pub fn start_session(&mut self, book_id: BookId) -> Uuid {
        self.start_session_at(book_id, Utc::now())
    }

    pub fn start_session_at(&mut self, book_id: BookId, now: DateTime<Utc>) -> Uuid {
        let session = ReadingSession {
            id: Uuid::new_v4(),
            book_id,
            started_at: now,
            ended_at: None,
            pages_read: 0,
            duration_minutes: 0,
            ideas_extracted: Vec::new(),
        };
        let id = session.id;
        debug!(session = %id, book = book_id, "session started");
        self.state.sessions.push(session);
        id
    }

    pub fn record_page_read(&mut self, session_id: Uuid) {
        if let Some(session) = self
            .state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_open())
        {
            session.pages_read = session.pages_read.saturating_add(1);
        }
    }

    pub fn end_session(&mut self, session_id: Uuid, ideas: Vec<String>) -> Result<()> {
        self.end_session_at(session_id, ideas, Utc::now())
    }

    pub fn end_session_at(
        &mut self,
        session_id: Uuid,
        ideas: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(session) = self.state.sessions.iter_mut().find(|s| s.id == session_id) else {
            bail!("unknown reading session {session_id}");
        };
        if !session.is_open() {
            bail!("reading session {session_id} is already closed");
        }
        session.ended_at = Some(now);
        let seconds = (now - session.started_at).num_seconds().max(0);
        session.duration_minutes = ((seconds as f64) / 60.0).round() as i64;
        session.ideas_extracted = ideas;
        debug!(
            session = %session_id,
            minutes = session.duration_minutes,
            "session closed"
        );
        Ok(())
    }

    pub fn session(&self, session_id: Uuid) -> Option<&ReadingSession> {
        self.state.sessions.iter().find(|s| s.id == session_id)
    }

    // ---- profile aggregation ----

    /// Single pass over closed sessions. Deterministic for an unchanged
    /// history: frequency tables tie-break by insertion order under a stable
    /// sort.
    pub fn reading_profile(&self, now: DateTime<Utc>) -> ReadingProfile {
        let week_ago = now - ChronoDuration::days(7);

        let mut total = 0i64;
        let mut weekly = 0i64;
        let mut concept_counts: Vec<(String, u32)> = Vec::new();
        let mut genre_counts: Vec<(String, u32)> = Vec::new();
        let mut genre_seen: BTreeSet<BookId> = BTreeSet::new();

        for session in self.state.sessions.iter().filter(|s| !s.is_open()) {
            total += session.duration_minutes;
            if session.started_at >= week_ago {
                weekly += session.duration_minutes;
            }

            for idea in &session.ideas_extracted {
                bump_count(&mut concept_counts, idea);
            }

            // Genre is counted once per distinct book, at its first-seen
            // session, so books read in many short sessions do not dominate.
            if genre_seen.insert(session.book_id) {
                if let Some(record) = self.book(session.book_id) {
                    bump_count(&mut genre_counts, &record.genre);
                }
            }
        }

        concept_counts.sort_by(|a, b| b.1.cmp(&a.1));
        genre_counts.sort_by(|a, b| b.1.cmp(&a.1));

        let mut recent: Vec<&ReadingSession> =
            self.state.sessions.iter().filter(|s| !s.is_open()).collect();
        recent.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let recent_ideas: Vec<String> = recent
            .iter()
            .take(RECENT_SESSIONS)
            .flat_map(|s| s.ideas_extracted.iter().cloned())
            .take(RECENT_IDEAS)
            .collect();

        ReadingProfile {
            total_reading_time_minutes: total,
            weekly_reading_time_minutes: weekly,
            top_genres: genre_counts
                .into_iter()
                .take(TOP_GENRES)
                .map(|(genre, _)| genre)
                .collect(),
            top_concepts: concept_counts
                .into_iter()
                .take(TOP_CONCEPTS)
                .map(|(concept, _)| concept)
                .collect(),
            recent_ideas,
        }
    }

    // ---- highlights ----

    pub fn add_highlight(&mut self, highlight: Highlight) -> Uuid {
        let id = highlight.id;
        self.state.highlights.push(highlight);
        id
    }

    pub fn remove_highlight(&mut self, id: Uuid) -> bool {
        let before = self.state.highlights.len();
        self.state.highlights.retain(|h| h.id != id);
        self.state.highlights.len() != before
    }

    pub fn highlights_for(
        &self,
        owner: &str,
        book_id: BookId,
        chapter_index: usize,
        page_in_chapter: usize,
    ) -> Vec<&Highlight> {
        self.state
            .highlights
            .iter()
            .filter(|h| {
                h.owner_address == owner
                    && h.book_id == book_id
                    && h.chapter_index == chapter_index
                    && h.page_in_chapter == page_in_chapter
            })
            .collect()
    }
}

fn bump_count(counts: &mut Vec<(String, u32)>, key: &str) {
    match counts.iter_mut().find(|(k, _)| k == key) {
        Some((_, count)) => *count += 1,
        None => counts.push((key.to_string(), 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn library() -> Library {
        Library::open(Arc::new(MemoryStateStore::new())).unwrap()
    }

    fn book(id: BookId, genre: &str, concepts: &[&str]) -> BookRecord {
        BookRecord {
            id,
            title: format!("Book {id}"),
            author: "Test Author".into(),
            genre: genre.into(),
            concepts: concepts.iter().map(|c| c.to_string()).collect(),
            content_uri: format!("mem://{id}"),
            layout: BookLayout::Reflowable,
        }
    }

    #[test]
    fn session_close_computes_duration_and_snapshot() {
        let mut lib = library();
        let start = Utc::now();
        let id = lib.start_session_at(42, start);

        let ideas = vec!["stoicism".to_string(), "virtue".to_string()];
        lib.end_session_at(id, ideas.clone(), start + ChronoDuration::minutes(42))
            .unwrap();

        let session = lib.session(id).unwrap();
        assert!(session.ended_at.is_some());
        assert_eq!(session.duration_minutes, 42);
        assert_eq!(session.ideas_extracted, ideas);
    }

    #[test]
    fn session_cannot_be_closed_twice() {
        let mut lib = library();
        let id = lib.start_session(7);
        lib.end_session(id, vec![]).unwrap();
        assert!(lib.end_session(id, vec![]).is_err());
        assert!(lib.end_session(Uuid::new_v4(), vec![]).is_err());
    }

    #[test]
    fn duration_is_never_negative() {
        let mut lib = library();
        let start = Utc::now();
        let id = lib.start_session_at(1, start);
        lib.end_session_at(id, vec![], start - ChronoDuration::minutes(5))
            .unwrap();
        assert_eq!(lib.session(id).unwrap().duration_minutes, 0);
    }

    #[test]
    fn profile_on_empty_history_is_zeroed() {
        let lib = library();
        let profile = lib.reading_profile(Utc::now());
        assert_eq!(profile, ReadingProfile::default());
    }

    #[test]
    fn profile_is_deterministic() {
        let mut lib = library();
        lib.upsert_book(book(1, "philosophy", &[]));
        let now = Utc::now();
        let id = lib.start_session_at(1, now - ChronoDuration::minutes(30));
        lib.end_session_at(id, vec!["memento mori".into()], now)
            .unwrap();

        let first = lib.reading_profile(now);
        let second = lib.reading_profile(now);
        assert_eq!(first, second);
    }

    #[test]
    fn profile_counts_genre_once_per_book() {
        let mut lib = library();
        lib.upsert_book(book(1, "philosophy", &[]));
        lib.upsert_book(book(2, "economics", &[]));
        let now = Utc::now();

        // Book 1 read in two sessions, book 2 in one; each genre counts once
        // per book so insertion order breaks the tie.
        for offset in [300, 200] {
            let id = lib.start_session_at(1, now - ChronoDuration::minutes(offset));
            lib.end_session_at(id, vec![], now - ChronoDuration::minutes(offset - 10))
                .unwrap();
        }
        let id = lib.start_session_at(2, now - ChronoDuration::minutes(100));
        lib.end_session_at(id, vec![], now - ChronoDuration::minutes(90))
            .unwrap();

        let profile = lib.reading_profile(now);
        assert_eq!(profile.top_genres, vec!["philosophy", "economics"]);
    }

    #[test]
    fn profile_splits_weekly_from_total() {
        let mut lib = library();
        let now = Utc::now();

        let old = lib.start_session_at(1, now - ChronoDuration::days(30));
        lib.end_session_at(
            old,
            vec![],
            now - ChronoDuration::days(30) + ChronoDuration::minutes(50),
        )
        .unwrap();

        let fresh = lib.start_session_at(1, now - ChronoDuration::days(2));
        lib.end_session_at(
            fresh,
            vec![],
            now - ChronoDuration::days(2) + ChronoDuration::minutes(20),
        )
        .unwrap();

        let profile = lib.reading_profile(now);
        assert_eq!(profile.total_reading_time_minutes, 70);
        assert_eq!(profile.weekly_reading_time_minutes, 20);
    }

    #[test]
    fn profile_recent_ideas_come_from_latest_sessions() {
        let mut lib = library();
        let now = Utc::now();

        let ideas_by_age: [(i64, &[&str]); 4] = [
            (40, &["a", "b"]),
            (30, &["c", "d"]),
            (20, &["e", "f"]),
            (10, &["g", "h"]),
        ];
        for (days, ideas) in ideas_by_age {
            let started = now - ChronoDuration::days(days);
            let id = lib.start_session_at(1, started);
            lib.end_session_at(
                id,
                ideas.iter().map(|s| s.to_string()).collect(),
                started + ChronoDuration::minutes(15),
            )
            .unwrap();
        }

        let profile = lib.reading_profile(now);
        assert_eq!(profile.recent_ideas, vec!["g", "h", "e", "f", "c", "d"]);
    }

    #[test]
    fn profile_truncates_concepts_to_top_eight() {
        let mut lib = library();
        let now = Utc::now();
        let id = lib.start_session_at(1, now - ChronoDuration::minutes(20));
        let ideas: Vec<String> = (0..12).map(|i| format!("concept-{i}")).collect();
        lib.end_session_at(id, ideas, now).unwrap();

        let profile = lib.reading_profile(now);
        assert_eq!(profile.top_concepts.len(), 8);
        assert_eq!(profile.top_concepts[0], "concept-0");
    }

    #[test]
    fn open_sessions_do_not_contribute_to_profile() {
        let mut lib = library();
        let now = Utc::now();
        lib.start_session_at(1, now - ChronoDuration::minutes(30));
        let profile = lib.reading_profile(now);
        assert_eq!(profile.total_reading_time_minutes, 0);
        assert!(profile.recent_ideas.is_empty());
    }

    #[test]
    fn highlight_text_is_truncated_at_limit() {
        let locator = Locator {
            start_path: "p:nth-of-type(1)/text()[0]".into(),
            start_offset: 0,
            end_path: "p:nth-of-type(1)/text()[0]".into(),
            end_offset: 600,
        };
        let highlight = Highlight::new(1, "GABC", "x".repeat(600), HighlightColor::Mint, 0, 0, locator);
        assert_eq!(highlight.text.chars().count(), 500);
    }

    #[test]
    fn highlights_filter_by_owner_and_position() {
        let mut lib = library();
        let locator = Locator {
            start_path: "p:nth-of-type(1)/text()[0]".into(),
            start_offset: 0,
            end_path: "p:nth-of-type(1)/text()[0]".into(),
            end_offset: 4,
        };
        let mine = Highlight::new(1, "GME", "text", HighlightColor::default(), 0, 2, locator.clone());
        let theirs = Highlight::new(1, "GYOU", "text", HighlightColor::default(), 0, 2, locator.clone());
        let elsewhere = Highlight::new(1, "GME", "text", HighlightColor::default(), 1, 0, locator);
        let mine_id = lib.add_highlight(mine);
        lib.add_highlight(theirs);
        lib.add_highlight(elsewhere);

        let found = lib.highlights_for("GME", 1, 0, 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, mine_id);

        assert!(lib.remove_highlight(mine_id));
        assert!(!lib.remove_highlight(mine_id));
        assert!(lib.highlights_for("GME", 1, 0, 2).is_empty());
    }

    #[test]
    fn overlapping_highlights_are_stored_not_rejected() {
        let mut lib = library();
        let first = Locator {
            start_path: "p:nth-of-type(1)/text()[0]".into(),
            start_offset: 0,
            end_path: "p:nth-of-type(1)/text()[0]".into(),
            end_offset: 8,
        };
        let second = Locator {
            start_path: "p:nth-of-type(1)/text()[0]".into(),
            start_offset: 4,
            end_path: "p:nth-of-type(1)/text()[0]".into(),
            end_offset: 12,
        };
        lib.add_highlight(Highlight::new(
            1, "GME", "The obst", HighlightColor::default(), 0, 0, first,
        ));
        lib.add_highlight(Highlight::new(
            1, "GME", "obstacle", HighlightColor::default(), 0, 0, second,
        ));
        // Overlap handling is deferred to re-application, which clips or
        // skips; storage accepts both records.
        assert_eq!(lib.highlights_for("GME", 1, 0, 0).len(), 2);
    }

    #[test]
    fn wallet_identity_is_not_persisted() {
        let store = Arc::new(MemoryStateStore::new());
        let mut lib = Library::open(store.clone() as Arc<dyn StateStore>).unwrap();
        lib.set_owner("GWALLET");
        lib.mark_owned(9);
        lib.persist().unwrap();

        let reopened = Library::open(store).unwrap();
        assert!(reopened.owner().is_none());
        assert!(reopened.is_owned(9));
    }

    #[test]
    fn file_state_store_round_trips_atomically() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path().join("state")).unwrap());

        let mut lib = Library::open(store.clone() as Arc<dyn StateStore>).unwrap();
        lib.upsert_book(book(3, "history", &["empire"]));
        lib.mark_owned(3);
        lib.set_progress(3, 12, 40);
        lib.set_shelf_view(ShelfView::List);
        lib.persist().unwrap();

        let reopened = Library::open(store).unwrap();
        assert!(reopened.is_owned(3));
        assert_eq!(reopened.progress(3).unwrap().location, 12);
        assert_eq!(reopened.shelf_view(), ShelfView::List);
        assert_eq!(reopened.book(3).unwrap().genre, "history");
    }
}

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use inkshelf_core::{apply_highlights, ContentNode, ContentTree, DocumentPosition, Locator};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Fetch and structure failures surfaced through [`ReaderEvent::Failed`].
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Ready { total_locations: usize },
    PageChanged { current: usize, total: usize },
    Failed(String),
}

pub type ReaderEvents = Arc<Mutex<Vec<ReaderEvent>>>;

/// Opaque byte source for document content.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, ReaderError>;
}

/// Fetches document bytes over HTTP. Non-2xx responses are transport errors,
/// never panics; the blocking client runs on the runtime's blocking pool.
pub struct HttpSource;

#[async_trait]
impl DocumentSource for HttpSource {
    #[instrument(skip(self))]
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, ReaderError> {
        let uri = uri.to_string();
        let handle = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ReaderError> {
            let response = ureq::get(&uri).call().map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    ReaderError::Transport(format!("{uri} returned HTTP {code}"))
                }
                other => ReaderError::Transport(other.to_string()),
            })?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut bytes)
                .map_err(|err| ReaderError::Transport(err.to_string()))?;
            Ok(bytes)
        });
        handle
            .await
            .map_err(|err| ReaderError::Transport(err.to_string()))?
    }
}

pub struct FileSource;

#[async_trait]
impl DocumentSource for FileSource {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, ReaderError> {
        let path = uri.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            std::fs::read(&path)
                .map_err(|err| ReaderError::Transport(format!("failed to read {path}: {err}")))
        });
        handle
            .await
            .map_err(|err| ReaderError::Transport(err.to_string()))?
    }
}

/// Ties a completed fetch back to the load that requested it. A token from a
/// superseded load no longer matches the tracker's generation and its result
/// is discarded, which is how in-flight work for a replaced document is
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken {
    generation: u64,
}

/// One discrete navigation unit within a reflowable document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationSpan {
    pub chapter_index: usize,
    pub start_char: usize,
    pub len: usize,
}

/// Position tracker for reflowable documents: chapters of markup are
/// virtually paginated into fixed-size character chunks. Smaller chunks give
/// more accurate location counts at higher generation cost.
pub struct ReflowableTracker {
    chars_per_location: usize,
    chapters: Vec<ContentTree>,
    locations: Vec<LocationSpan>,
    current: usize,
    loading: bool,
    generation: u64,
    events: ReaderEvents,
}

impl ReflowableTracker {
    pub fn new(chars_per_location: usize) -> Self {
        Self {
            chars_per_location: chars_per_location.max(1),
            chapters: Vec::new(),
            locations: Vec::new(),
            current: 1,
            loading: false,
            generation: 0,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> ReaderEvents {
        Arc::clone(&self.events)
    }

    pub fn is_ready(&self) -> bool {
        !self.loading && !self.locations.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Starts a fresh load, superseding any load still in flight.
    pub fn begin_load(&mut self, uri: &str) -> LoadToken {
        debug!(uri, "reflowable load started");
        self.generation += 1;
        self.loading = true;
        self.chapters.clear();
        self.locations.clear();
        self.current = 1;
        LoadToken {
            generation: self.generation,
        }
    }

    /// Applies the outcome of a fetch. Results carrying a stale token belong
    /// to a superseded document and are ignored.
    pub fn finish_load(&mut self, token: LoadToken, result: Result<Vec<u8>, ReaderError>) {
        if token.generation != self.generation {
            debug!("discarding load result for superseded document");
            return;
        }
        self.loading = false;

        let outcome = result.and_then(|bytes| self.build(&bytes));
        match outcome {
            Ok(()) => {
                let total = self.locations.len();
                let mut events = self.events.lock();
                events.push(ReaderEvent::Ready {
                    total_locations: total,
                });
                events.push(ReaderEvent::PageChanged { current: 1, total });
            }
            Err(err) => {
                warn!(%err, "reflowable document failed to load");
                self.chapters.clear();
                self.locations.clear();
                self.events.lock().push(ReaderEvent::Failed(err.to_string()));
            }
        }
    }

    pub async fn open(&mut self, source: &dyn DocumentSource, uri: &str) {
        let token = self.begin_load(uri);
        let result = source.fetch(uri).await;
        self.finish_load(token, result);
    }

    /// Tears down the current document and invalidates in-flight loads.
    pub fn close(&mut self) {
        self.generation += 1;
        self.loading = false;
        self.chapters.clear();
        self.locations.clear();
        self.current = 1;
    }

    fn build(&mut self, bytes: &[u8]) -> Result<(), ReaderError> {
        let markup = std::str::from_utf8(bytes)
            .map_err(|_| ReaderError::Malformed("document is not valid UTF-8".into()))?;
        let tree = ContentTree::parse(markup)
            .map_err(|err| ReaderError::Malformed(err.to_string()))?;

        let book = tree
            .root()
            .children
            .iter()
            .find_map(|node| match node {
                ContentNode::Element(el) if el.tag == "book" => Some(el),
                _ => None,
            })
            .ok_or_else(|| ReaderError::Malformed("document has no book element".into()))?;

        let mut chapters = Vec::new();
        for child in &book.children {
            if let ContentNode::Element(el) = child {
                chapters.push(ContentTree::from_element(el.clone()));
            }
        }
        if chapters.is_empty() {
            return Err(ReaderError::Malformed("book has no chapters".into()));
        }

        let mut locations = Vec::new();
        for (chapter_index, chapter) in chapters.iter().enumerate() {
            let total_chars = chapter.text().chars().count();
            let mut start = 0usize;
            loop {
                let len = self.chars_per_location.min(total_chars - start);
                locations.push(LocationSpan {
                    chapter_index,
                    start_char: start,
                    len,
                });
                start += self.chars_per_location;
                if start >= total_chars {
                    break;
                }
            }
        }

        self.chapters = chapters;
        self.locations = locations;
        self.current = 1;
        Ok(())
    }

    pub fn position(&self) -> DocumentPosition {
        DocumentPosition::new(self.current, self.locations.len())
    }

    pub fn next(&mut self) -> bool {
        if !self.is_ready() || self.current >= self.locations.len() {
            return false;
        }
        self.current += 1;
        self.emit_page_changed();
        true
    }

    pub fn prev(&mut self) -> bool {
        if !self.is_ready() || self.current <= 1 {
            return false;
        }
        self.current -= 1;
        self.emit_page_changed();
        true
    }

    /// Jumps to a location, clamped into `[1, total]`.
    pub fn goto_location(&mut self, location: usize) -> bool {
        if !self.is_ready() {
            return false;
        }
        let clamped = location.clamp(1, self.locations.len());
        if clamped == self.current {
            return false;
        }
        self.current = clamped;
        self.emit_page_changed();
        true
    }

    fn emit_page_changed(&self) {
        self.events.lock().push(ReaderEvent::PageChanged {
            current: self.current,
            total: self.locations.len(),
        });
    }

    pub fn current_span(&self) -> Option<LocationSpan> {
        self.locations.get(self.current.checked_sub(1)?).copied()
    }

    pub fn current_chapter_index(&self) -> Option<usize> {
        self.current_span().map(|span| span.chapter_index)
    }

    /// Text of the current location chunk.
    pub fn current_text(&self) -> Option<String> {
        let span = self.current_span()?;
        let chapter = self.chapters.get(span.chapter_index)?;
        let text: String = chapter
            .text()
            .chars()
            .skip(span.start_char)
            .take(span.len)
            .collect();
        Some(text)
    }

    pub fn chapter(&self, chapter_index: usize) -> Option<&ContentTree> {
        self.chapters.get(chapter_index)
    }

    /// A clean copy of the chapter with the given highlights re-applied.
    /// Call after every content commit; stale locators are skipped silently.
    pub fn decorated_chapter(
        &self,
        chapter_index: usize,
        highlights: &[(Uuid, Locator)],
    ) -> Option<(ContentTree, usize)> {
        let mut tree = self.chapters.get(chapter_index)?.clone();
        let applied = apply_highlights(&mut tree, highlights);
        Some((tree, applied))
    }
}

/// Position tracker for fixed-page documents: the page count comes straight
/// from the document's own structure, no derived chunking.
pub struct FixedPageTracker {
    pages: Vec<String>,
    current: usize,
    loading: bool,
    generation: u64,
    events: ReaderEvents,
}

impl FixedPageTracker {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: 1,
            loading: false,
            generation: 0,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> ReaderEvents {
        Arc::clone(&self.events)
    }

    pub fn is_ready(&self) -> bool {
        !self.loading && !self.pages.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn begin_load(&mut self, uri: &str) -> LoadToken {
        debug!(uri, "fixed-page load started");
        self.generation += 1;
        self.loading = true;
        self.pages.clear();
        self.current = 1;
        LoadToken {
            generation: self.generation,
        }
    }

    pub fn finish_load(&mut self, token: LoadToken, result: Result<Vec<u8>, ReaderError>) {
        if token.generation != self.generation {
            debug!("discarding load result for superseded document");
            return;
        }
        self.loading = false;

        let outcome = result.and_then(|bytes| parse_pages(&bytes));
        match outcome {
            Ok(pages) => {
                let total = pages.len();
                self.pages = pages;
                self.current = 1;
                let mut events = self.events.lock();
                events.push(ReaderEvent::Ready {
                    total_locations: total,
                });
                events.push(ReaderEvent::PageChanged { current: 1, total });
            }
            Err(err) => {
                warn!(%err, "fixed-page document failed to load");
                self.events.lock().push(ReaderEvent::Failed(err.to_string()));
            }
        }
    }

    pub async fn open(&mut self, source: &dyn DocumentSource, uri: &str) {
        let token = self.begin_load(uri);
        let result = source.fetch(uri).await;
        self.finish_load(token, result);
    }

    /// Drops the fetched page buffers and invalidates in-flight loads.
    /// Resources tied to a superseded document must not outlive it.
    pub fn close(&mut self) {
        self.generation += 1;
        self.loading = false;
        self.pages = Vec::new();
        self.current = 1;
    }

    pub fn position(&self) -> DocumentPosition {
        DocumentPosition::new(self.current, self.pages.len())
    }

    pub fn next(&mut self) -> bool {
        if !self.is_ready() || self.current >= self.pages.len() {
            return false;
        }
        self.current += 1;
        self.emit_page_changed();
        true
    }

    pub fn prev(&mut self) -> bool {
        if !self.is_ready() || self.current <= 1 {
            return false;
        }
        self.current -= 1;
        self.emit_page_changed();
        true
    }

    pub fn goto_page(&mut self, page: usize) -> bool {
        if !self.is_ready() {
            return false;
        }
        let clamped = page.clamp(1, self.pages.len());
        if clamped == self.current {
            return false;
        }
        self.current = clamped;
        self.emit_page_changed();
        true
    }

    fn emit_page_changed(&self) {
        self.events.lock().push(ReaderEvent::PageChanged {
            current: self.current,
            total: self.pages.len(),
        });
    }

    pub fn page_text(&self) -> Option<&str> {
        self.pages
            .get(self.current.checked_sub(1)?)
            .map(String::as_str)
    }
}

impl Default for FixedPageTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_pages(bytes: &[u8]) -> Result<Vec<String>, ReaderError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ReaderError::Malformed("document is not valid UTF-8".into()))?;
    if text.trim().is_empty() {
        return Err(ReaderError::Malformed("document contains no pages".into()));
    }
    Ok(text.split('\u{0c}').map(|page| page.to_string()).collect())
}

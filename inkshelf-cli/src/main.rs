use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use inkshelf_core::{
    BookLayout, BookRecord, ContentNode, DocumentPosition, ElementNode, FileStateStore, Highlight,
    HighlightColor, Library, StateStore,
};
use inkshelf_reader::{
    DocumentSource, FileSource, FixedPageTracker, HttpSource, ReaderEvent, ReflowableTracker,
};
use inkshelf_shield::{
    watermark_band, InputSignal, ShieldEngine, ShieldStatus, ViewportSample, PRINT_NOTICE,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "inkshelf",
    version,
    about = "terminal reader for inkshelf marketplace books"
)]
struct Args {
    /// Book content URI (http(s) URL or local path)
    uri: String,

    /// Layout family of the document
    #[arg(long, value_enum, default_value_t = LayoutArg::Reflowable)]
    layout: LayoutArg,

    /// Verified owner wallet address, used for watermarking and highlights
    #[arg(long)]
    owner: Option<String>,

    /// Marketplace book id the session and progress are recorded against
    #[arg(long, default_value_t = 1)]
    book: u64,

    /// Characters per generated location for reflowable documents
    #[arg(long, default_value_t = 600)]
    chars_per_location: usize,

    /// Override the platform state directory
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LayoutArg {
    Reflowable,
    Fixed,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

enum Tracker {
    Reflowable(ReflowableTracker),
    Fixed(FixedPageTracker),
}

impl Tracker {
    async fn open(&mut self, source: &dyn DocumentSource, uri: &str) {
        match self {
            Tracker::Reflowable(t) => t.open(source, uri).await,
            Tracker::Fixed(t) => t.open(source, uri).await,
        }
    }

    fn drain_events(&self) -> Vec<ReaderEvent> {
        let events = match self {
            Tracker::Reflowable(t) => t.events(),
            Tracker::Fixed(t) => t.events(),
        };
        let drained = std::mem::take(&mut *events.lock());
        drained
    }

    fn position(&self) -> DocumentPosition {
        match self {
            Tracker::Reflowable(t) => t.position(),
            Tracker::Fixed(t) => t.position(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Tracker::Reflowable(t) => t.is_ready(),
            Tracker::Fixed(t) => t.is_ready(),
        }
    }

    fn next(&mut self) -> bool {
        match self {
            Tracker::Reflowable(t) => t.next(),
            Tracker::Fixed(t) => t.next(),
        }
    }

    fn prev(&mut self) -> bool {
        match self {
            Tracker::Reflowable(t) => t.prev(),
            Tracker::Fixed(t) => t.prev(),
        }
    }

    fn goto(&mut self, location: usize) {
        match self {
            Tracker::Reflowable(t) => {
                t.goto_location(location);
            }
            Tracker::Fixed(t) => {
                t.goto_page(location);
            }
        }
    }

    fn close(&mut self) {
        match self {
            Tracker::Reflowable(t) => t.close(),
            Tracker::Fixed(t) => t.close(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "inkshelf", "inkshelf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("state"));
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let mut library = Library::open(store)?;

    if let Some(owner) = &args.owner {
        library.set_owner(owner.clone());
    }
    ensure_catalog_entry(&mut library, &args);

    let source: Box<dyn DocumentSource> = if args.uri.starts_with("http://")
        || args.uri.starts_with("https://")
    {
        Box::new(HttpSource)
    } else {
        Box::new(FileSource)
    };

    let mut tracker = match args.layout {
        LayoutArg::Reflowable => {
            Tracker::Reflowable(ReflowableTracker::new(args.chars_per_location))
        }
        LayoutArg::Fixed => Tracker::Fixed(FixedPageTracker::new()),
    };
    tracker.open(source.as_ref(), &args.uri).await;

    let mut failure: Option<String> = None;
    for event in tracker.drain_events() {
        if let ReaderEvent::Failed(message) = event {
            failure = Some(message);
        }
    }
    if let Some(message) = failure {
        library.persist()?;
        return Err(anyhow!("could not open {}: {message}", args.uri));
    }
    if let Some(progress) = library.progress(args.book) {
        tracker.goto(progress.location);
        tracker.drain_events();
    }

    let session_id = library.start_session(args.book);
    let mut shield = ShieldEngine::default();
    let baseline = terminal::size().unwrap_or((80, 24));

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;

    let mut dirty = true;
    let mut last_status = ShieldStatus::default();

    loop {
        for event in tracker.drain_events() {
            match event {
                ReaderEvent::PageChanged { .. } => {
                    library.record_page_read(session_id);
                    dirty = true;
                }
                ReaderEvent::Ready { .. } => dirty = true,
                ReaderEvent::Failed(message) => {
                    failure = Some(message);
                    dirty = true;
                }
            }
        }

        let status = shield.status(Instant::now());
        if status != last_status {
            last_status = status;
            dirty = true;
        }

        if dirty {
            redraw(&mut stdout, &tracker, &library, &args, status, failure.as_deref())?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }

        match event::read()? {
            Event::Key(key) => {
                let signal = match key.kind {
                    KeyEventKind::Release => InputSignal::KeyRelease {
                        code: key.code,
                        modifiers: key.modifiers,
                    },
                    _ => InputSignal::KeyPress {
                        code: key.code,
                        modifiers: key.modifiers,
                    },
                };
                let verdict = shield.evaluate(signal, Instant::now());
                if verdict.block_default {
                    dirty = true;
                    continue;
                }
                if key.kind == KeyEventKind::Release {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Right | KeyCode::Char(' ') => {
                        tracker.next();
                    }
                    KeyCode::Left => {
                        tracker.prev();
                    }
                    KeyCode::Char('m') => {
                        if highlight_current_location(&mut library, &tracker, &args) {
                            dirty = true;
                        }
                    }
                    _ => {}
                }
            }
            Event::FocusGained => {
                shield.evaluate(InputSignal::FocusGained, Instant::now());
                dirty = true;
            }
            Event::FocusLost => {
                shield.evaluate(InputSignal::FocusLost, Instant::now());
                dirty = true;
            }
            Event::Resize(cols, rows) => {
                shield.evaluate(
                    InputSignal::Viewport(ViewportSample {
                        inner_width: u32::from(cols),
                        inner_height: u32::from(rows),
                        outer_width: u32::from(baseline.0),
                        outer_height: u32::from(baseline.1),
                    }),
                    Instant::now(),
                );
                dirty = true;
            }
            _ => {}
        }
    }

    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;

    let position = tracker.position();
    if tracker.is_ready() {
        library.set_progress(args.book, position.current_location, position.total_locations);
    }
    let ideas = library
        .book(args.book)
        .map(|record| record.concepts.clone())
        .unwrap_or_default();
    library.end_session(session_id, ideas)?;
    tracker.close();
    library.persist()?;

    drop(_raw);
    print_profile_summary(&library);
    Ok(())
}

fn ensure_catalog_entry(library: &mut Library, args: &Args) {
    if library.book(args.book).is_some() {
        return;
    }
    let title = args
        .uri
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("untitled")
        .to_string();
    library.upsert_book(BookRecord {
        id: args.book,
        title,
        author: String::new(),
        genre: "uncategorized".into(),
        concepts: Vec::new(),
        content_uri: args.uri.clone(),
        layout: match args.layout {
            LayoutArg::Reflowable => BookLayout::Reflowable,
            LayoutArg::Fixed => BookLayout::FixedPage,
        },
    });
}

fn highlight_current_location(library: &mut Library, tracker: &Tracker, args: &Args) -> bool {
    let Tracker::Reflowable(reflowable) = tracker else {
        return false;
    };
    let Some(span) = reflowable.current_span() else {
        return false;
    };
    let Some(chapter) = reflowable.chapter(span.chapter_index) else {
        return false;
    };

    let len = span.len.min(80);
    let Some(range) = chapter.capture_selection(span.start_char, len) else {
        return false;
    };
    let Some(locator) = inkshelf_core::serialize_range(chapter, &range) else {
        return false;
    };

    let text: String = chapter
        .text()
        .chars()
        .skip(span.start_char)
        .take(len)
        .collect();
    let owner = library.owner().unwrap_or("anonymous").to_string();
    let page_in_chapter = span.start_char / args.chars_per_location.max(1);
    library.add_highlight(Highlight::new(
        args.book,
        owner,
        text,
        HighlightColor::default(),
        span.chapter_index,
        page_in_chapter,
        locator,
    ));
    true
}

fn redraw(
    stdout: &mut io::Stdout,
    tracker: &Tracker,
    library: &Library,
    args: &Args,
    status: ShieldStatus,
    failure: Option<&str>,
) -> Result<()> {
    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    let (cols, rows) = terminal::size().unwrap_or((80, 24));

    if let Some(message) = failure {
        crossterm::execute!(stdout, Print(format!("Failed to load document: {message}\r\n")))?;
        crossterm::execute!(stdout, Print("Press q to exit.\r\n"))?;
        return Ok(());
    }

    if !tracker.is_ready() {
        crossterm::execute!(stdout, Print("Loading document...\r\n"))?;
        return Ok(());
    }

    let owner = library.owner().unwrap_or("unverified");
    if status.content_blurred {
        let band = watermark_band(owner, cols as usize);
        for row in 0..rows.saturating_sub(2) {
            crossterm::execute!(
                stdout,
                cursor::MoveTo(0, row),
                SetAttribute(Attribute::Dim),
                Print(&band),
                SetAttribute(Attribute::Reset)
            )?;
        }
        crossterm::execute!(
            stdout,
            cursor::MoveTo(0, rows.saturating_sub(2)),
            Print(PRINT_NOTICE)
        )?;
    } else {
        render_content(stdout, tracker, library, args)?;
    }

    let position = tracker.position();
    let mut line = format!(
        "{} | location {}/{} | {}",
        args.uri, position.current_location, position.total_locations, owner
    );
    if status.message_visible {
        line.push_str(" | protected content — action blocked");
    }
    crossterm::execute!(
        stdout,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        Clear(ClearType::CurrentLine),
        SetAttribute(Attribute::Reverse),
        Print(line),
        SetAttribute(Attribute::Reset)
    )?;
    stdout.flush()?;
    Ok(())
}

fn render_content(
    stdout: &mut io::Stdout,
    tracker: &Tracker,
    library: &Library,
    args: &Args,
) -> Result<()> {
    match tracker {
        Tracker::Fixed(fixed) => {
            let text = fixed.page_text().unwrap_or_default().to_string();
            crossterm::execute!(stdout, Print(text.replace('\n', "\r\n")))?;
        }
        Tracker::Reflowable(reflowable) => {
            let Some(span) = reflowable.current_span() else {
                return Ok(());
            };
            let owner = library.owner().unwrap_or("anonymous");
            let page_in_chapter = span.start_char / args.chars_per_location.max(1);
            let stored: Vec<_> = library
                .highlights_for(owner, args.book, span.chapter_index, page_in_chapter)
                .iter()
                .map(|h| (h.id, h.locator()))
                .collect();

            // Highlights are re-applied against a clean copy of the chapter
            // on every render; stale locators drop out silently.
            let Some((decorated, _)) = reflowable.decorated_chapter(span.chapter_index, &stored)
            else {
                return Ok(());
            };
            let window = span.start_char..span.start_char + span.len;
            let styled = windowed_chars(decorated.root(), &window);
            write_styled(stdout, &styled)?;
        }
    }
    Ok(())
}

/// Characters of the chapter that fall inside the location window, each
/// tagged with whether a highlight wrapper covers it.
fn windowed_chars(root: &ElementNode, window: &Range<usize>) -> Vec<(char, bool)> {
    let mut out = Vec::with_capacity(window.len());
    let mut cursor = 0usize;
    collect_window(root, false, window, &mut cursor, &mut out);
    out
}

fn collect_window(
    element: &ElementNode,
    marked: bool,
    window: &Range<usize>,
    cursor: &mut usize,
    out: &mut Vec<(char, bool)>,
) {
    for child in &element.children {
        match child {
            ContentNode::Text(text) => {
                for ch in text.chars() {
                    if window.contains(&*cursor) {
                        out.push((ch, marked));
                    }
                    *cursor += 1;
                }
            }
            ContentNode::Element(el) => {
                collect_window(el, marked || el.mark.is_some(), window, cursor, out);
            }
        }
    }
}

fn write_styled(stdout: &mut io::Stdout, chars: &[(char, bool)]) -> Result<()> {
    let mut highlighted = false;
    let mut buffer = String::new();
    for &(ch, marked) in chars {
        if marked != highlighted {
            flush_run(stdout, &mut buffer, highlighted)?;
            highlighted = marked;
        }
        if ch == '\n' {
            buffer.push_str("\r\n");
        } else {
            buffer.push(ch);
        }
    }
    flush_run(stdout, &mut buffer, highlighted)?;
    Ok(())
}

fn flush_run(stdout: &mut io::Stdout, buffer: &mut String, highlighted: bool) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    if highlighted {
        crossterm::execute!(
            stdout,
            SetAttribute(Attribute::Reverse),
            Print(&buffer),
            SetAttribute(Attribute::Reset)
        )?;
    } else {
        crossterm::execute!(stdout, Print(&buffer))?;
    }
    buffer.clear();
    Ok(())
}

fn print_profile_summary(library: &Library) {
    let profile = library.reading_profile(chrono::Utc::now());
    println!("reading profile");
    println!("  total minutes:  {}", profile.total_reading_time_minutes);
    println!("  weekly minutes: {}", profile.weekly_reading_time_minutes);
    if !profile.top_genres.is_empty() {
        println!("  top genres:     {}", profile.top_genres.join(", "));
    }
    if !profile.top_concepts.is_empty() {
        println!("  top concepts:   {}", profile.top_concepts.join(", "));
    }
    if !profile.recent_ideas.is_empty() {
        println!("  recent ideas:   {}", profile.recent_ideas.join(", "));
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "inkshelf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

use crate::cache::{CacheLayer, Cacheable};
use crate::config::Config;
use crate::manga::cached_client::{open_store, CachedMangaClient};
use crate::manga::types::{format_date, Chapter, ListOptions, Manga, PageImage};
use crate::query::{Query, QueryView};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::io::{self, Write};
use tracing::{debug, info, warn};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Trending titles
  Trending(ListArgs),
  /// Latest releases
  Latest(ListArgs),
  /// Search titles by name
  Search { term: String },
  /// Show details of a title
  Manga { id: String },
  /// List the chapters of a title
  Chapters { manga_id: String },
  /// Print the page images of a chapter and mark it as read
  Read { chapter_id: String },
  /// Manage the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
  /// Delete every cached response and read marker
  Clear,
}

/// Filters for the trending and latest listings
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct ListArgs {
  #[arg(long, default_value_t = 1)]
  pub page: u32,

  /// Only titles with this genre (repeatable)
  #[arg(long = "genre")]
  pub genres: Vec<String>,

  #[arg(long = "type", default_value = "all")]
  pub manga_type: String,

  /// Include NSFW titles
  #[arg(long)]
  pub nsfw: bool,
}

impl ListArgs {
  pub fn options(&self) -> ListOptions {
    ListOptions {
      page: self.page,
      genres: self.genres.clone(),
      manga_type: self.manga_type.clone(),
      nsfw: self.nsfw.then_some(true),
    }
  }
}

/// Run a `cache` subcommand. Needs no API key.
pub fn run_cache_action(config: &Config, action: &CacheAction) -> Result<()> {
  match action {
    CacheAction::Clear => {
      CacheLayer::new_shared(open_store(config)?).invalidate_all()?;
      info!("cache cleared");
      println!("Cache cleared.");
    }
  }
  Ok(())
}

/// Main application state
pub struct App {
  client: CachedMangaClient,
  /// Bypass fresh entries
  refresh: bool,
}

impl App {
  pub fn new(config: &Config, refresh: bool) -> Result<Self> {
    let client = CachedMangaClient::new(config)?;

    if config.cache.clear_on_start {
      client.invalidate_all()?;
      info!("cache cleared on start");
    }

    Ok(Self { client, refresh })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    let mut out = io::stdout();

    match command {
      Command::Trending(args) => {
        let query = self.client.trending(&args.options());
        present(query, self.refresh, &mut out, |m, out| render_mangas(m, out)).await?;
      }
      Command::Latest(args) => {
        let query = self.client.latest(&args.options());
        present(query, self.refresh, &mut out, |m, out| render_mangas(m, out)).await?;
      }
      Command::Search { term } => {
        if term.trim().is_empty() {
          return Err(eyre!("Search term must not be empty"));
        }
        let query = self.client.search(&term);
        present(query, self.refresh, &mut out, |m, out| render_mangas(m, out)).await?;
      }
      Command::Manga { id } => {
        let query = self.client.manga(&id);
        present(query, self.refresh, &mut out, |m, out| render_manga(m, out)).await?;
      }
      Command::Chapters { manga_id } => {
        let query = self.client.chapters(&manga_id);
        present(query, self.refresh, &mut out, |chapters, out| {
          render_chapters(chapters, |c| self.client.is_chapter_read(&manga_id, &c.id), out)
        })
        .await?;
      }
      Command::Read { chapter_id } => {
        let query = self.client.images(&chapter_id);
        let pages = present(query, self.refresh, &mut out, |p, out| render_pages(p, out)).await?;
        if let Some(pages) = pages {
          self.client.mark_chapter_read(&chapter_id, &pages);
        }
      }
      Command::Cache { .. } => return Err(eyre!("cache commands do not need an API client")),
    }

    out.flush()?;
    Ok(())
  }
}

/// Drive a query to completion and print what it produced.
///
/// A stale value is printed right away while the refresh runs; the refreshed
/// value is printed only if it differs. A failed network refresh keeps the
/// stale value.
/// Returns the data that was shown, if any.
async fn present<T, W, R>(mut query: Query<T>, refresh: bool, out: &mut W, render: R) -> Result<Option<T>>
where
  T: Cacheable + PartialEq,
  W: Write,
  R: Fn(&T, &mut W) -> io::Result<()>,
{
  if refresh {
    query.refetch();
  } else {
    query.fetch();
  }

  let mut shown: Option<T> = None;
  if query.is_loading() {
    if let Some(stale) = query.data() {
      writeln!(out, "(cached copy, refreshing...)")?;
      render(stale, out)?;
      shown = Some(stale.clone());
    }
  }

  if !query.poll() {
    query.settle().await;
  }

  match query.view() {
    QueryView::Ready(resolved) => {
      debug!(key = query.key(), from_cache = resolved.is_from_cache(), stored_at = %resolved.stored_at, "resolved");
      if shown.as_ref() != Some(&resolved.data) {
        if shown.is_some() {
          writeln!(out, "\nUpdated:")?;
        }
        render(&resolved.data, out)?;
      }
      Ok(Some(resolved.data.clone()))
    }
    QueryView::Failed { error, .. } => match shown {
      Some(stale) if error.is_remote() => {
        warn!(key = query.key(), %error, "refresh failed, keeping cached copy");
        writeln!(out, "(refresh failed: {}; showing cached copy)", error)?;
        Ok(Some(stale))
      }
      _ => Err(eyre!("Failed to load {}: {}", query.key(), error)),
    },
    QueryView::Loading { .. } | QueryView::NoData => {
      writeln!(out, "No data.")?;
      Ok(None)
    }
  }
}

fn render_mangas<W: Write>(mangas: &[Manga], out: &mut W) -> io::Result<()> {
  if mangas.is_empty() {
    return writeln!(out, "No results.");
  }

  for manga in mangas {
    if manga.sub_title.is_empty() {
      writeln!(out, "{}  {}", manga.id, manga.title)?;
    } else {
      writeln!(out, "{}  {} ({})", manga.id, manga.title, manga.sub_title)?;
    }

    let mut details = Vec::new();
    if !manga.status.is_empty() {
      details.push(manga.status.clone());
    }
    if !manga.genres.is_empty() {
      details.push(manga.genres.join(", "));
    }
    details.push(format!("updated {}", format_date(manga.update_at)));
    writeln!(out, "    {}", details.join(" | "))?;
  }
  Ok(())
}

fn render_manga<W: Write>(manga: &Manga, out: &mut W) -> io::Result<()> {
  writeln!(out, "{}", manga.title)?;
  if !manga.sub_title.is_empty() {
    writeln!(out, "{}", manga.sub_title)?;
  }
  writeln!(out)?;
  writeln!(out, "Id:       {}", manga.id)?;
  writeln!(out, "Status:   {}", or_dash(&manga.status))?;
  writeln!(out, "Type:     {}", or_dash(&manga.manga_type))?;
  writeln!(out, "Authors:  {}", or_dash(&manga.authors.join(", ")))?;
  writeln!(out, "Genres:   {}", or_dash(&manga.genres.join(", ")))?;
  writeln!(out, "Updated:  {}", format_date(manga.update_at))?;
  if !manga.summary.is_empty() {
    writeln!(out)?;
    writeln!(out, "{}", manga.summary.trim())?;
  }
  Ok(())
}

fn render_chapters<W, F>(chapters: &[Chapter], is_read: F, out: &mut W) -> io::Result<()>
where
  W: Write,
  F: Fn(&Chapter) -> bool,
{
  if chapters.is_empty() {
    return writeln!(out, "No chapters.");
  }

  for chapter in chapters {
    let mark = if is_read(chapter) { '*' } else { ' ' };
    writeln!(
      out,
      "{} {}  {}  {}",
      mark,
      chapter.id,
      chapter.title,
      format_date(chapter.create_at)
    )?;
  }
  writeln!(out, "(* = read)")
}

fn render_pages<W: Write>(pages: &[PageImage], out: &mut W) -> io::Result<()> {
  if pages.is_empty() {
    return writeln!(out, "No pages.");
  }

  let mut sorted: Vec<&PageImage> = pages.iter().collect();
  sorted.sort_by_key(|page| page.index);
  for page in sorted {
    writeln!(out, "{:>3}  {}", page.index, page.link)?;
  }
  Ok(())
}

fn or_dash(value: &str) -> &str {
  if value.is_empty() {
    "-"
  } else {
    value
  }
}

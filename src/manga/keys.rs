//! Cache keys for MangaVerse resources.

use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::cache::CacheKey;

use super::types::ListOptions;

/// Cache key types for MangaVerse API calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MangaKey {
  /// Trending listing
  Trending(ListOptions),
  /// Latest releases listing
  Latest(ListOptions),
  /// Free text search
  Search { term: String },
  /// Details of one title
  Manga { id: String },
  /// Chapter list of one title
  Chapters { manga_id: String },
  /// Page images of one chapter
  Images { chapter_id: String },
  /// Marker set once a chapter has been opened
  ChapterRead { manga_id: String, chapter_id: String },
}

impl CacheKey for MangaKey {
  fn storage_key(&self) -> String {
    match self {
      Self::Trending(options) => format!("@Mangas/{}", canonical_list(options)),
      Self::Latest(options) => format!("@Latest/{}", canonical_list(options)),
      Self::Search { term } => format!("@Search/{}", hash_term(term)),
      Self::Manga { id } => format!("@Manga/{}", encode(id)),
      Self::Chapters { manga_id } => format!("@MangaChapters/{}", encode(manga_id)),
      Self::Images { chapter_id } => format!("@MangaImages/{}", encode(chapter_id)),
      Self::ChapterRead {
        manga_id,
        chapter_id,
      } => format!("@ChapterRead/{}/{}", encode(manga_id), encode(chapter_id)),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Trending(options) => format!("trending titles, page {}", options.page),
      Self::Latest(options) => format!("latest titles, page {}", options.page),
      Self::Search { term } => format!("search: {}", term),
      Self::Manga { id } => format!("title {}", id),
      Self::Chapters { manga_id } => format!("chapters of {}", manga_id),
      Self::Images { chapter_id } => format!("pages of chapter {}", chapter_id),
      Self::ChapterRead {
        manga_id,
        chapter_id,
      } => format!("read marker {}/{}", manga_id, chapter_id),
    }
  }
}

/// Percent-encode an identifier so it cannot introduce a `/` separator.
fn encode(id: &str) -> String {
  form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

/// Listing filters as a stable query string.
fn canonical_list(options: &ListOptions) -> String {
  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for (name, value) in options.params() {
    if let Some(value) = value {
      serializer.append_pair(name, &value);
    }
  }
  serializer.finish()
}

/// Normalize the search term so trivially different queries share an entry.
fn normalize_term(term: &str) -> String {
  term.trim().to_lowercase()
}

fn hash_term(term: &str) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(normalize_term(term).as_bytes());
  hex::encode(hasher.finalize())
}

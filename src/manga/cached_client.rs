//! Cached MangaVerse client that wraps MangaClient with transparent caching.

use color_eyre::Result;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheLayer, KeyValueStore, NoopStore, SqliteStore};
use crate::config::Config;
use crate::query::Query;

use super::client::MangaClient;
use super::keys::MangaKey;
use super::types::{Chapter, ListOptions, Manga, PageImage};

/// MangaVerse client with transparent caching support.
///
/// Every read goes through the cache layer, so repeated requests inside the
/// freshness window cost no API quota.
#[derive(Clone)]
pub struct CachedMangaClient {
  inner: MangaClient,
  cache: CacheLayer,
}

impl CachedMangaClient {
  /// Create a new cached client with the store described by `config`.
  pub fn new(config: &Config) -> Result<Self> {
    let inner = MangaClient::new(config)?;
    let cache = CacheLayer::new_shared(open_store(config)?).with_freshness(config.cache.freshness()?);

    Ok(Self::from_parts(inner, cache))
  }

  pub fn from_parts(inner: MangaClient, cache: CacheLayer) -> Self {
    Self { inner, cache }
  }

  /// Trending titles.
  pub fn trending(&self, options: &ListOptions) -> Query<Vec<Manga>> {
    let inner = self.inner.clone();
    let key = MangaKey::Trending(options.clone());
    let options = options.clone();
    self.query(&key, move || {
      let inner = inner.clone();
      let options = options.clone();
      async move { inner.get_mangas(&options).await }
    })
  }

  /// Latest releases.
  pub fn latest(&self, options: &ListOptions) -> Query<Vec<Manga>> {
    let inner = self.inner.clone();
    let key = MangaKey::Latest(options.clone());
    let options = options.clone();
    self.query(&key, move || {
      let inner = inner.clone();
      let options = options.clone();
      async move { inner.get_latest_mangas(&options).await }
    })
  }

  /// Search titles.
  pub fn search(&self, term: &str) -> Query<Vec<Manga>> {
    let inner = self.inner.clone();
    let key = MangaKey::Search {
      term: term.to_string(),
    };
    let term = term.to_string();
    self.query(&key, move || {
      let inner = inner.clone();
      let term = term.clone();
      async move { inner.search_mangas(&term).await }
    })
  }

  /// Details of one title.
  pub fn manga(&self, id: &str) -> Query<Manga> {
    let inner = self.inner.clone();
    let key = MangaKey::Manga { id: id.to_string() };
    let id = id.to_string();
    self.query(&key, move || {
      let inner = inner.clone();
      let id = id.clone();
      async move { inner.get_manga(&id).await }
    })
  }

  /// Chapter list of one title.
  pub fn chapters(&self, manga_id: &str) -> Query<Vec<Chapter>> {
    let inner = self.inner.clone();
    let key = MangaKey::Chapters {
      manga_id: manga_id.to_string(),
    };
    let manga_id = manga_id.to_string();
    self.query(&key, move || {
      let inner = inner.clone();
      let manga_id = manga_id.clone();
      async move { inner.get_manga_chapters(&manga_id).await }
    })
  }

  /// Page images of one chapter.
  pub fn images(&self, chapter_id: &str) -> Query<Vec<PageImage>> {
    let inner = self.inner.clone();
    let key = MangaKey::Images {
      chapter_id: chapter_id.to_string(),
    };
    let chapter_id = chapter_id.to_string();
    self.query(&key, move || {
      let inner = inner.clone();
      let chapter_id = chapter_id.clone();
      async move { inner.get_manga_images(&chapter_id).await }
    })
  }

  /// Remember that the chapter these pages belong to has been opened.
  ///
  /// Nothing is recorded for an empty page list.
  pub fn mark_chapter_read(&self, chapter_id: &str, pages: &[PageImage]) {
    if let Some(first) = pages.first() {
      self.cache.put_marker(&MangaKey::ChapterRead {
        manga_id: first.manga.clone(),
        chapter_id: chapter_id.to_string(),
      });
    }
  }

  pub fn is_chapter_read(&self, manga_id: &str, chapter_id: &str) -> bool {
    self.cache.has_marker(&MangaKey::ChapterRead {
      manga_id: manga_id.to_string(),
      chapter_id: chapter_id.to_string(),
    })
  }

  /// Drop every cached response and read marker.
  pub fn invalidate_all(&self) -> Result<()> {
    self.cache.invalidate_all()
  }

  fn query<T, F, Fut>(&self, key: &MangaKey, fetcher: F) -> Query<T>
  where
    T: crate::cache::Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
  {
    debug!(key = %key.storage_key(), "{}", key.description());
    Query::new(self.cache.clone(), key.storage_key(), fetcher)
  }
}

/// Pick the store backing the cache from configuration.
pub(crate) fn open_store(config: &Config) -> Result<std::sync::Arc<dyn KeyValueStore>> {
  if !config.cache.enabled {
    info!("caching disabled");
    return Ok(std::sync::Arc::new(NoopStore));
  }

  let store = match &config.cache.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  Ok(std::sync::Arc::new(store))
}

use crate::config::Config;
use crate::manga::api_types::ApiResponse;
use crate::manga::types::{Chapter, ListOptions, Manga, PageImage};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// MangaVerse API client wrapper
#[derive(Clone)]
pub struct MangaClient {
  http: reqwest::Client,
  base_url: String,
  host: String,
  api_key: String,
}

impl MangaClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_key(config, api_key)
  }

  pub fn with_key(config: &Config, api_key: String) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: config.api.base_url.trim_end_matches('/').to_string(),
      host: config.api.host.clone(),
      api_key,
    })
  }

  /// Trending titles
  pub async fn get_mangas(&self, options: &ListOptions) -> Result<Vec<Manga>> {
    self.get("/fetch", &options.params()).await
  }

  /// Latest releases
  pub async fn get_latest_mangas(&self, options: &ListOptions) -> Result<Vec<Manga>> {
    self.get("/latest", &options.latest_params()).await
  }

  /// Search titles by free text
  pub async fn search_mangas(&self, term: &str) -> Result<Vec<Manga>> {
    self
      .get(
        "/search",
        &[
          ("text", Some(term.to_string())),
          ("nsfw", Some("false".to_string())),
          ("type", Some("all".to_string())),
        ],
      )
      .await
  }

  /// Get a single title by id
  pub async fn get_manga(&self, id: &str) -> Result<Manga> {
    self.get("", &[("id", Some(id.to_string()))]).await
  }

  /// Get the chapter list of a title
  pub async fn get_manga_chapters(&self, manga_id: &str) -> Result<Vec<Chapter>> {
    self.get("/chapter", &[("id", Some(manga_id.to_string()))]).await
  }

  /// Get the page images of a chapter
  pub async fn get_manga_images(&self, chapter_id: &str) -> Result<Vec<PageImage>> {
    self.get("/image", &[("id", Some(chapter_id.to_string()))]).await
  }

  /// Build the URL for `path`, skipping parameters without a value.
  pub fn endpoint(&self, path: &str, params: &[(&str, Option<String>)]) -> Result<Url> {
    let raw = format!("{}{}", self.base_url, path);
    let mut url = Url::parse(&raw).map_err(|e| eyre!("Invalid API URL {}: {}", raw, e))?;

    {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in params {
        if let Some(value) = value {
          pairs.append_pair(name, value);
        }
      }
    }
    if url.query() == Some("") {
      url.set_query(None);
    }

    Ok(url)
  }

  async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &[(&str, Option<String>)],
  ) -> Result<T> {
    let url = self.endpoint(path, params)?;
    let endpoint = if path.is_empty() { "/" } else { path };
    debug!(%url, "GET");

    let response = self
      .http
      .get(url)
      .header("X-RapidAPI-Key", &self.api_key)
      .header("X-RapidAPI-Host", &self.host)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", endpoint, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} returned HTTP {}", endpoint, status));
    }

    let envelope: ApiResponse<T> = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", endpoint, e))?;

    envelope.into_data(endpoint)
  }
}

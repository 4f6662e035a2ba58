use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A title as listed by the trending, latest and search endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manga {
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub sub_title: String,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub thumb: String,
  #[serde(default)]
  pub summary: String,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub authors: Vec<String>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub genres: Vec<String>,
  #[serde(default)]
  pub nsfw: bool,
  #[serde(rename = "type", default)]
  pub manga_type: String,
  /// Unix millis
  #[serde(default)]
  pub create_at: i64,
  /// Unix millis
  #[serde(default)]
  pub update_at: i64,
}

/// A chapter of a title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
  pub id: String,
  #[serde(default)]
  pub manga: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub create_at: i64,
  #[serde(default)]
  pub update_at: i64,
}

/// One page image of a chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
  pub id: String,
  #[serde(default)]
  pub chapter: String,
  #[serde(default)]
  pub manga: String,
  #[serde(default)]
  pub index: u32,
  pub link: String,
}

/// Filters shared by the trending and latest listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
  pub page: u32,
  pub genres: Vec<String>,
  pub manga_type: String,
  pub nsfw: Option<bool>,
}

impl Default for ListOptions {
  fn default() -> Self {
    Self {
      page: 1,
      genres: Vec::new(),
      manga_type: "all".to_string(),
      nsfw: None,
    }
  }
}

impl ListOptions {
  /// Query parameters in request order; `None` values are left out.
  pub fn params(&self) -> Vec<(&'static str, Option<String>)> {
    vec![
      ("page", Some(self.page.to_string())),
      ("genres", Some(self.genres.join(","))),
      ("type", Some(self.manga_type.clone())),
      ("nsfw", self.nsfw.map(|n| n.to_string())),
    ]
  }

  /// Parameters for the latest listing, which always sends `nsfw` (off unless set).
  pub fn latest_params(&self) -> Vec<(&'static str, Option<String>)> {
    let mut params = self.params();
    for (name, value) in params.iter_mut() {
      if *name == "nsfw" && value.is_none() {
        *value = Some("false".to_string());
      }
    }
    params
  }
}

/// Render a unix-millis timestamp as a date.
pub fn format_date(millis: i64) -> String {
  DateTime::<Utc>::from_timestamp_millis(millis)
    .map(|dt| dt.format("%Y-%m-%d").to_string())
    .unwrap_or_else(|| "-".to_string())
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Option<Vec<String>> = Option::deserialize(deserializer)?;
  Ok(v.unwrap_or_default())
}

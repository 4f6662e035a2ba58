//! Serde-deserializable envelope matching MangaVerse API responses.
//!
//! Every endpoint wraps its payload as `{"code": 200, "data": ...}`. The
//! payload types themselves live in `types` since they are also what the
//! cache persists.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
  #[serde(default)]
  pub code: Option<u16>,
  pub data: Option<T>,
}

impl<T> ApiResponse<T> {
  /// Unwrap the payload; an envelope without data or with an error code is a failure.
  pub fn into_data(self, endpoint: &str) -> Result<T> {
    if let Some(code) = self.code {
      if !(200..300).contains(&code) {
        return Err(eyre!("{} responded with code {}", endpoint, code));
      }
    }
    self
      .data
      .ok_or_else(|| eyre!("{} responded without data", endpoint))
  }
}

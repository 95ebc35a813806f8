use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing summary as returned by the listings endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
  pub id: String,
  pub title: String,
  /// Price in minor currency units
  pub price: u64,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub category_id: Option<String>,
  #[serde(default)]
  pub image_urls: Vec<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub display_name: String,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(default)]
  pub rating: Option<f32>,
}

/// A listing the user created locally, queued for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
  pub title: String,
  pub price: u64,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub category_id: Option<String>,
  #[serde(default)]
  pub images: Vec<ListingImage>,
}

/// Image bytes carried inside the queued payload so a retry needs nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingImage {
  pub file_name: String,
  pub content_type: String,
  /// Sent as standard base64
  #[serde(with = "base64_bytes")]
  pub data: Vec<u8>,
}

mod base64_bytes {
  use base64::{engine::general_purpose::STANDARD, Engine as _};
  use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(|e| D::Error::custom(format!("invalid base64 image data: {}", e)))
  }
}

impl ListingImage {
  /// Build an image, guessing the content type from the file extension.
  pub fn from_bytes(file_name: impl Into<String>, data: Vec<u8>) -> Self {
    let file_name = file_name.into();
    let extension = file_name
      .rsplit_once('.')
      .map(|(_, ext)| ext.to_lowercase())
      .unwrap_or_default();
    let content_type = match extension.as_str() {
      "jpg" | "jpeg" => "image/jpeg",
      "png" => "image/png",
      "webp" => "image/webp",
      "gif" => "image/gif",
      _ => "application/octet-stream",
    };

    Self {
      file_name,
      content_type: content_type.to_string(),
      data,
    }
  }
}

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Plate number reported when the camera did not recognize one.
pub const UNKNOWN_PLATE: &str = "Unknown";

/// A notification that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEnvelope {
    pub action: String,
    pub remote_address: String,
    pub picture: Picture,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    // base64
    pub content: String,
    pub file_name_hint: Option<String>,
    pub plate: Option<Plate>,
}

impl Picture {
    pub fn plate_number(&self) -> &str {
        self.plate
            .as_ref()
            .map(|p| p.plate_number.as_str())
            .unwrap_or(UNKNOWN_PLATE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    pub plate_number: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// What subscribers receive for every notification whose image was saved.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub stored_image: Option<StoredImage>,
    pub plate_number: String,
    pub remote_address: String,
    pub action: String,
    pub received_at: DateTime<Utc>,
}

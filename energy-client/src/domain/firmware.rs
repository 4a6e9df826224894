use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A firmware binary stored for one device.
///
/// File names carry their version token as a prefix: `{token}_{name}.bin`,
/// where the token is the upload time in unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareObject {
    pub device_id: String,
    pub filename: String,
    pub file_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

impl FirmwareObject {
    pub fn version_token(&self) -> Option<&str> {
        version_token(&self.filename)
    }
}

pub fn version_token(filename: &str) -> Option<&str> {
    let (token, rest) = filename.split_once('_')?;
    if token.is_empty() || rest.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(token)
}

/// Name under which an upload is stored; `None` when the original name is unusable.
pub fn versioned_filename(uploaded_at: OffsetDateTime, original_name: &str) -> Option<String> {
    let name = original_name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let stem_ok = name.len() > ".bin".len()
        && name.ends_with(".bin")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !stem_ok || name.contains("..") {
        return None;
    }

    let millis = uploaded_at.unix_timestamp_nanos() / 1_000_000;
    Some(format!("{millis}_{name}"))
}

/// Whether the stored token is newer than what the device runs.
///
/// Numeric tokens compare numerically; anything else (including a device
/// that reports no version) is treated as outdated unless identical.
pub fn is_newer(latest_token: &str, current_version: Option<&str>) -> bool {
    let current = match current_version.map(str::trim) {
        Some(c) if !c.is_empty() => c,
        _ => return true,
    };

    match (latest_token.parse::<u128>(), current.parse::<u128>()) {
        (Ok(latest), Ok(current)) => latest > current,
        _ => latest_token != current,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaStage {
    Checking,
    Downloading,
    Installing,
    Success,
    Failed,
}

impl OtaStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Progress report sent by a device while it applies an update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaStatusUpdate {
    pub device_id: String,
    pub status: OtaStage,
    pub progress: i16,
    pub message: Option<String>,
    pub device_timestamp: Option<String>,
    pub firmware_version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use energy_client::domain::{
    device::validate_device_id,
    firmware::{is_newer, version_token, versioned_filename},
    FirmwareObject, OtaStage, OtaStatusUpdate,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::ServiceError, store::Store};

/// Firmware binaries on disk, laid out as `{root}/firmware/{device_id}/{token}_{name}.bin`.
pub struct FirmwareRepository {
    root: PathBuf,
    public_base_url: String,
}

impl FirmwareRepository {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn device_dir(&self, device_id: &str) -> Result<PathBuf, ServiceError> {
        validate_device_id(device_id)?;
        Ok(self.root.join("firmware").join(device_id))
    }

    pub fn public_url(&self, device_id: &str, filename: &str) -> String {
        format!("{}/firmware/{device_id}/{filename}", self.public_base_url)
    }

    /// Newest stored binary by version token.
    pub async fn latest(&self, device_id: &str) -> Result<Option<FirmwareObject>, ServiceError> {
        let dir = self.device_dir(device_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<(u128, FirmwareObject)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if !filename.ends_with(".bin") {
                continue;
            }
            let Some(token) = version_token(&filename).and_then(|t| t.parse::<u128>().ok()) else {
                continue;
            };
            if latest.as_ref().is_some_and(|(best, _)| *best >= token) {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let object = FirmwareObject {
                device_id: device_id.to_string(),
                uploaded_at: token_time(token),
                file_size: metadata.len(),
                filename,
            };
            latest = Some((token, object));
        }

        Ok(latest.map(|(_, object)| object))
    }

    pub async fn store(
        &self,
        device_id: &str,
        original_name: &str,
        bytes: &[u8],
        now: OffsetDateTime,
    ) -> Result<FirmwareObject, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("firmware file is empty".to_string()));
        }
        let filename = versioned_filename(now, original_name).ok_or_else(|| {
            ServiceError::Validation("filename must be a plain name ending in .bin".to_string())
        })?;

        let dir = self.device_dir(device_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&filename), bytes).await?;

        tracing::info!(device_id = %device_id, filename = %filename, size = bytes.len(), "firmware stored");
        Ok(FirmwareObject {
            device_id: device_id.to_string(),
            filename,
            file_size: bytes.len() as u64,
            uploaded_at: now,
        })
    }

    pub async fn read(&self, device_id: &str, filename: &str) -> Result<Vec<u8>, ServiceError> {
        let plain = !filename.is_empty()
            && !filename.contains("..")
            && !filename.contains(['/', '\\'])
            && filename.ends_with(".bin");
        if !plain {
            return Err(ServiceError::NotFound(format!("firmware {filename}")));
        }

        let path = self.device_dir(device_id)?.join(filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::NotFound(format!("firmware {filename}"))),
            Err(e) => Err(e.into()),
        }
    }
}

fn token_time(token_millis: u128) -> OffsetDateTime {
    i128::try_from(token_millis)
        .ok()
        .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(ms.saturating_mul(1_000_000)).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaCheck {
    pub has_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub uploaded_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OtaCheck {
    fn up_to_date(message: &str) -> Self {
        Self {
            has_update: false,
            firmware_url: None,
            filename: None,
            firmware_version: None,
            file_size: None,
            checksum: None,
            uploaded_at: None,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaStatusReport {
    pub device_id: String,
    pub status: OtaStage,
    #[serde(default)]
    pub progress: Option<i16>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// Device-facing update checks and progress reports, plus owner uploads.
pub struct OtaService {
    store: Arc<dyn Store>,
    firmware: FirmwareRepository,
}

impl OtaService {
    pub fn new(store: Arc<dyn Store>, firmware: FirmwareRepository) -> Self {
        Self { store, firmware }
    }

    pub fn firmware(&self) -> &FirmwareRepository {
        &self.firmware
    }

    async fn require_device(&self, device_id: &str) -> Result<(), ServiceError> {
        if device_id.trim().is_empty() {
            return Err(ServiceError::Validation("device_id is required".to_string()));
        }
        if self.store.device(device_id).await?.is_none() {
            return Err(ServiceError::DeviceNotRegistered(device_id.to_string()));
        }
        Ok(())
    }

    /// Unregistered devices are simply told there is nothing to install.
    pub async fn check(&self, device_id: &str, current_version: Option<&str>) -> Result<OtaCheck, ServiceError> {
        match self.require_device(device_id).await {
            Ok(()) => {}
            Err(ServiceError::DeviceNotRegistered(_)) => {
                tracing::debug!(device_id = %device_id, "update check from unregistered device");
                return Ok(OtaCheck::up_to_date("No firmware available"));
            }
            Err(e) => return Err(e),
        }

        let Some(latest) = self.firmware.latest(device_id).await? else {
            return Ok(OtaCheck::up_to_date("No firmware available"));
        };
        let Some(token) = latest.version_token() else {
            return Ok(OtaCheck::up_to_date("No firmware available"));
        };
        if !is_newer(token, current_version) {
            return Ok(OtaCheck::up_to_date("Firmware is up to date"));
        }

        let bytes = self.firmware.read(device_id, &latest.filename).await?;
        tracing::info!(
            device_id = %device_id,
            current = current_version.unwrap_or("unknown"),
            latest = token,
            "firmware update offered"
        );

        Ok(OtaCheck {
            has_update: true,
            firmware_url: Some(self.firmware.public_url(device_id, &latest.filename)),
            firmware_version: Some(token.to_string()),
            file_size: Some(latest.file_size),
            checksum: Some(checksum(&bytes)),
            uploaded_at: Some(latest.uploaded_at),
            filename: Some(latest.filename),
            message: None,
        })
    }

    pub async fn report_status(&self, report: OtaStatusReport, now: OffsetDateTime) -> Result<OtaStatusUpdate, ServiceError> {
        self.require_device(&report.device_id).await?;

        let progress = report.progress.unwrap_or(0);
        if !(0..=100).contains(&progress) {
            return Err(ServiceError::Validation(format!("progress must be between 0 and 100, got {progress}")));
        }

        let update = OtaStatusUpdate {
            device_id: report.device_id,
            status: report.status,
            progress,
            message: report.message,
            device_timestamp: report.timestamp,
            firmware_version: report.firmware_version,
            received_at: now,
        };
        self.store.record_ota_status(&update).await?;

        match update.status {
            OtaStage::Failed => tracing::warn!(
                device_id = %update.device_id,
                detail = update.message.as_deref().unwrap_or(""),
                "ota update failed on device"
            ),
            stage => tracing::info!(
                device_id = %update.device_id,
                stage = stage.as_str(),
                progress = update.progress,
                "ota status"
            ),
        }
        Ok(update)
    }

    pub async fn upload(
        &self,
        device_id: &str,
        original_name: &str,
        bytes: &[u8],
        now: OffsetDateTime,
    ) -> Result<FirmwareObject, ServiceError> {
        self.firmware.store(device_id, original_name, bytes, now).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use energy_client::domain::NewDevice;
    use time::{macros::datetime, Duration};

    use super::*;
    use crate::store::MemoryStore;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "relay-ota-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ))
    }

    async fn service() -> (OtaService, Arc<MemoryStore>, PathBuf) {
        let store = Arc::new(MemoryStore::new());
        store
            .register_device(
                &NewDevice {
                    device_id: "D1".to_string(),
                    device_name: "Meter".to_string(),
                    channel_count: 4,
                    owner_id: "owner".to_string(),
                },
                NOW,
            )
            .await
            .unwrap();

        let dir = scratch_dir();
        let repo = FirmwareRepository::new(&dir, "http://relay.local/");
        (OtaService::new(store.clone(), repo), store, dir)
    }

    #[tokio::test]
    async fn newest_upload_is_offered() {
        let (ota, _, dir) = service().await;
        ota.upload("D1", "app.bin", b"v1", NOW).await.unwrap();
        let second = ota
            .upload("D1", "app.bin", b"v2-longer", NOW + Duration::hours(1))
            .await
            .unwrap();

        let check = ota.check("D1", None).await.unwrap();
        assert!(check.has_update);
        assert_eq!(check.filename.as_deref(), Some(second.filename.as_str()));
        assert_eq!(check.file_size, Some(9));
        assert_eq!(check.checksum, Some(checksum(b"v2-longer")));
        assert_eq!(
            check.firmware_url,
            Some(format!("http://relay.local/firmware/D1/{}", second.filename))
        );
        assert_eq!(check.uploaded_at, Some(NOW + Duration::hours(1)));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn current_version_is_not_offered_again() {
        let (ota, _, dir) = service().await;
        let stored = ota.upload("D1", "app.bin", b"v1", NOW).await.unwrap();
        let token = stored.version_token().unwrap().to_string();

        let check = ota.check("D1", Some(&token)).await.unwrap();
        assert!(!check.has_update);
        assert!(check.message.is_some());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn no_firmware_means_no_update() {
        let (ota, _, dir) = service().await;
        let check = ota.check("D1", Some("1")).await.unwrap();
        assert!(!check.has_update);
        assert_eq!(check.message.as_deref(), Some("No firmware available"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unregistered_devices_get_no_update() {
        let (ota, _, dir) = service().await;
        let check = ota.check("ghost", None).await.unwrap();
        assert!(!check.has_update);
        assert_eq!(check.message.as_deref(), Some("No firmware available"));
        assert!(matches!(ota.check("  ", None).await, Err(ServiceError::Validation(_))));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn uploads_need_a_plain_bin_name() {
        let (ota, _, dir) = service().await;
        for name in ["app.hex", "../../etc/app.bin", ".bin"] {
            let res = ota.upload("D1", name, b"x", NOW).await;
            if name == "../../etc/app.bin" {
                // Directory components are stripped, leaving a usable name.
                assert!(res.is_ok());
            } else {
                assert!(matches!(res, Err(ServiceError::Validation(_))), "{name}");
            }
        }
        assert!(matches!(
            ota.upload("D1", "app.bin", b"", NOW).await,
            Err(ServiceError::Validation(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn downloads_reject_traversal() {
        let (ota, _, dir) = service().await;
        let stored = ota.upload("D1", "app.bin", b"payload", NOW).await.unwrap();

        let bytes = ota.firmware().read("D1", &stored.filename).await.unwrap();
        assert_eq!(bytes, b"payload");
        assert!(matches!(
            ota.firmware().read("D1", "../D2/x.bin").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            ota.firmware().read("D1", "missing.bin").await,
            Err(ServiceError::NotFound(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn status_reports_are_recorded() {
        let (ota, store, dir) = service().await;
        let report = OtaStatusReport {
            device_id: "D1".to_string(),
            status: OtaStage::Downloading,
            progress: Some(40),
            message: None,
            timestamp: Some("12345".to_string()),
            firmware_version: None,
        };
        ota.report_status(report.clone(), NOW).await.unwrap();
        assert_eq!(store.ota_updates("D1").await.len(), 1);

        let bad = OtaStatusReport {
            progress: Some(101),
            ..report
        };
        assert!(matches!(ota.report_status(bad, NOW).await, Err(ServiceError::Validation(_))));
        let _ = std::fs::remove_dir_all(dir);
    }
}

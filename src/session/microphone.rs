use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PermissionDenied;
use crate::transport::LocalAudioTrack;

/// Access to the local microphone. Asked before any network call.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn request_access(&self) -> Result<LocalAudioTrack, PermissionDenied>;
}

/// Microphone whose availability comes from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredMicrophone {
    enabled: bool,
    label: String,
}

impl ConfiguredMicrophone {
    pub fn new(enabled: bool, label: impl Into<String>) -> Self {
        Self {
            enabled,
            label: label.into(),
        }
    }
}

#[async_trait]
impl Microphone for ConfiguredMicrophone {
    async fn request_access(&self) -> Result<LocalAudioTrack, PermissionDenied> {
        if !self.enabled {
            return Err(PermissionDenied("microphone disabled in configuration".to_string()));
        }
        let track = LocalAudioTrack::new(Uuid::new_v4().to_string(), self.label.clone());
        log::debug!("Microphone track {} ({}) granted", track.id, track.label);
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_microphone_is_denied() {
        let err = ConfiguredMicrophone::new(false, "Default").request_access().await.unwrap_err();
        assert!(err.0.contains("disabled"));
    }

    #[tokio::test]
    async fn enabled_microphone_yields_a_fresh_track() {
        let mic = ConfiguredMicrophone::new(true, "Default");
        let a = mic.request_access().await.unwrap();
        let b = mic.request_access().await.unwrap();
        assert_eq!(a.label, "Default");
        assert_ne!(a.id, b.id);
    }
}

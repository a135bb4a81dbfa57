//! Text-to-speech fetch for buffered playback.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde_json::json;

use crate::audio::EncodedClip;

pub struct TtsClient {
    http: Client,
    endpoint: String,
    voice: String,
}

impl TtsClient {
    pub fn new(endpoint: impl Into<String>, voice: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            voice: voice.into(),
        })
    }

    /// `POST {"voice", "text"}`; the response body is a WAV file.
    pub async fn synthesize(&self, text: &str) -> Result<EncodedClip> {
        log::info!("Synthesizing {} chars with voice {}", text.chars().count(), self.voice);
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({"voice": self.voice, "text": text}))
            .send()
            .await
            .context("TTS request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "HTTP error! status: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
        }

        let bytes = response.bytes().await?;
        log::debug!("Received {} bytes of speech", bytes.len());
        Ok(EncodedClip::wav(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::serve_once;

    #[tokio::test]
    async fn posts_voice_and_text() {
        let (base, request) = serve_once("200 OK", "RIFF").await;
        let client = TtsClient::new(format!("{}/tts", base), "alto", Duration::from_secs(5)).unwrap();

        let clip = client.synthesize("hello").await.unwrap();
        assert_eq!(&clip.bytes[..], b"RIFF");

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /tts"));
        assert!(request.contains(r#""voice":"alto""#));
        assert!(request.contains(r#""text":"hello""#));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (base, _request) = serve_once("503 Service Unavailable", "").await;
        let client = TtsClient::new(base, "alto", Duration::from_secs(5)).unwrap();
        let err = client.synthesize("hello").await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP error! status: 503 Service Unavailable");
    }
}

//! Text-to-speech narration of recorded turns.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::audio::{self, SAMPLE_RATE};
use crate::config::{Config, Credentials, NarrationBackend, NarrationConfig};
use crate::error::ColloquyError;
use crate::persona::{Persona, VoiceSettings};
use crate::retry::{RetryPolicy, with_retry};

/// A narrated reply written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub path: PathBuf,
    pub duration_secs: f32,
}

/// Speech backend selected by `[narration] backend`.
pub enum Narrator {
    Azure(AzureSpeech),
    #[cfg(feature = "kokoro")]
    Kokoro(KokoroNarrator),
}

impl Narrator {
    /// Synthesize `text` with `voice` into a WAV file at `path`.
    pub async fn narrate(
        &mut self,
        text: &str,
        voice: &VoiceSettings,
        path: &Path,
    ) -> Result<AudioClip, ColloquyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match self {
            Narrator::Azure(azure) => azure.narrate(text, voice, path).await,
            #[cfg(feature = "kokoro")]
            Narrator::Kokoro(kokoro) => kokoro.narrate(text, voice, path),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Narrator::Azure(_) => "azure",
            #[cfg(feature = "kokoro")]
            Narrator::Kokoro(_) => "kokoro",
        }
    }
}

/// Build the configured narrator, or `None` when narration is disabled.
pub async fn build_narrator(
    config: &Config,
    credentials: &Credentials,
) -> Result<Option<Narrator>, ColloquyError> {
    match config.narration.backend {
        NarrationBackend::None => Ok(None),
        NarrationBackend::Azure => {
            let reqwest_client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()?;
            let azure = AzureSpeech::from_credentials(reqwest_client, credentials)?
                .with_retry(config.retry.policy());
            Ok(Some(Narrator::Azure(azure)))
        }
        #[cfg(feature = "kokoro")]
        NarrationBackend::Kokoro => Ok(Some(Narrator::Kokoro(KokoroNarrator::new().await?))),
        #[cfg(not(feature = "kokoro"))]
        NarrationBackend::Kokoro => Err(ColloquyError::ConfigError(
            "narration backend 'kokoro' requires building with the `kokoro` feature".to_string(),
        )),
    }
}

/// Voice for a persona, falling back to the configured default.
pub fn voice_for(persona: &Persona, narration: &NarrationConfig) -> VoiceSettings {
    persona.voice.clone().unwrap_or_else(|| {
        VoiceSettings::new(narration.default_voice.clone(), narration.default_rate)
    })
}

const OUTPUT_FORMAT: &str = "raw-24khz-16bit-mono-pcm";

/// Longest text sent in one Azure request; longer replies are split.
const AZURE_MAX_CHARS: usize = 3_000;

/// Longest text handed to kokoro in one synthesis call.
#[cfg(feature = "kokoro")]
const KOKORO_MAX_CHARS: usize = 200;

/// Azure Cognitive Services speech synthesis over REST.
pub struct AzureSpeech {
    client: reqwest::Client,
    key: String,
    endpoint: String,
    retry: RetryPolicy,
}

impl AzureSpeech {
    pub fn new(
        client: reqwest::Client,
        key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            key: key.into(),
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Requires `SPEECH_KEY` plus either `SPEECH_ENDPOINT` or `SPEECH_REGION`.
    pub fn from_credentials(
        client: reqwest::Client,
        credentials: &Credentials,
    ) -> Result<Self, ColloquyError> {
        let key = credentials.speech_key.as_deref().ok_or_else(|| {
            ColloquyError::ConfigError("SPEECH_KEY is not set".to_string())
        })?;
        let endpoint = resolve_endpoint(
            credentials.speech_endpoint.as_deref(),
            credentials.speech_region.as_deref(),
        )?;
        Ok(Self::new(client, key, endpoint))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn narrate(
        &self,
        text: &str,
        voice: &VoiceSettings,
        path: &Path,
    ) -> Result<AudioClip, ColloquyError> {
        let requests = ssml_requests(text, voice);
        debug!(
            voice = %voice.name,
            rate = voice.rate,
            requests = requests.len(),
            "requesting speech synthesis"
        );

        let mut pcm = Vec::new();
        for body in requests {
            let part = with_retry(&self.retry, "azure speech", || self.synthesize(body.clone()))
                .await?;
            pcm.extend_from_slice(&part);
        }
        let duration_secs = audio::write_wav_pcm16(path, &pcm, SAMPLE_RATE)?;

        Ok(AudioClip {
            path: path.to_path_buf(),
            duration_secs,
        })
    }

    async fn synthesize(&self, ssml: String) -> Result<Vec<u8>, ColloquyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .header("User-Agent", "colloquy")
            .body(ssml)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(speech_status_error(status.as_u16(), message));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ColloquyError::TtsError("speech service returned no audio".to_string()));
        }
        Ok(bytes.to_vec())
    }
}

fn speech_status_error(status: u16, message: String) -> ColloquyError {
    ColloquyError::SpeechApi { status, message }
}

fn resolve_endpoint(endpoint: Option<&str>, region: Option<&str>) -> Result<String, ColloquyError> {
    if let Some(endpoint) = endpoint {
        let base = endpoint.trim_end_matches('/');
        if base.ends_with("/cognitiveservices/v1") {
            return Ok(base.to_string());
        }
        return Ok(format!("{}/cognitiveservices/v1", base));
    }
    if let Some(region) = region {
        return Ok(format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            region.trim()
        ));
    }
    Err(ColloquyError::ConfigError(
        "set SPEECH_ENDPOINT or SPEECH_REGION for Azure narration".to_string(),
    ))
}

/// Prosody rate as a signed percentage, 1.0 -> "+0%", 0.75 -> "-25%".
fn rate_percent(rate: f32) -> String {
    let percent = ((rate - 1.0) * 100.0).round() as i32;
    format!("{:+}%", percent)
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// One SSML document per chunk of `text`.
fn ssml_requests(text: &str, voice: &VoiceSettings) -> Vec<String> {
    audio::split_into_chunks(text, AZURE_MAX_CHARS)
        .iter()
        .map(|chunk| build_ssml(chunk, voice))
        .collect()
}

fn build_ssml(text: &str, voice: &VoiceSettings) -> String {
    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"en-US\">\
         <voice name=\"{}\"><prosody rate=\"{}\">{}</prosody></voice></speak>",
        xml_escape(&voice.name),
        rate_percent(voice.rate),
        xml_escape(text)
    )
}

/// Local synthesis through kokoro-tiny.
#[cfg(feature = "kokoro")]
pub struct KokoroNarrator {
    engine: kokoro_tiny::TtsEngine,
    available_voices: Vec<String>,
}

#[cfg(feature = "kokoro")]
impl KokoroNarrator {
    pub async fn new() -> Result<Self, ColloquyError> {
        let engine = kokoro_tiny::TtsEngine::new()
            .await
            .map_err(|e| ColloquyError::TtsError(format!("Failed to initialize TTS: {}", e)))?;
        let available_voices = engine.voices();
        Ok(Self {
            engine,
            available_voices,
        })
    }

    pub fn available_voices(&self) -> &[String] {
        &self.available_voices
    }

    fn narrate(
        &mut self,
        text: &str,
        voice: &VoiceSettings,
        path: &Path,
    ) -> Result<AudioClip, ColloquyError> {
        if !self.available_voices.iter().any(|v| v == &voice.name) {
            return Err(ColloquyError::TtsError(format!(
                "Unknown voice '{}'",
                voice.name
            )));
        }

        let mut samples = Vec::new();
        for chunk in audio::split_into_chunks(text, KOKORO_MAX_CHARS) {
            let chunk_samples = self
                .engine
                .synthesize(&chunk, Some(voice.name.as_str()))
                .map_err(|e| ColloquyError::TtsError(format!("Synthesis failed: {}", e)))?;
            samples.extend(chunk_samples);
            // 0.3s pause between chunks
            samples.extend(std::iter::repeat_n(0.0, 7_200));
        }
        samples.extend(std::iter::repeat_n(0.0, 12_000));

        let samples = audio::adjust_audio_speed(samples, voice.rate);
        let duration_secs = audio::write_wav_f32(path, &samples, SAMPLE_RATE)?;
        Ok(AudioClip {
            path: path.to_path_buf(),
            duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{PersonaId, ProviderKind};

    #[test]
    fn test_rate_percent() {
        assert_eq!(rate_percent(1.0), "+0%");
        assert_eq!(rate_percent(2.0), "+100%");
        assert_eq!(rate_percent(0.75), "-25%");
        assert_eq!(rate_percent(1.1), "+10%");
    }

    #[test]
    fn test_ssml_escapes_text() {
        let voice = VoiceSettings::new("en-US-GuyNeural", 1.2);
        let ssml = build_ssml("Tom & Jerry say <hi>", &voice);
        assert!(ssml.contains("<voice name=\"en-US-GuyNeural\">"));
        assert!(ssml.contains("<prosody rate=\"+20%\">"));
        assert!(ssml.contains("Tom &amp; Jerry say &lt;hi&gt;"));
        assert!(!ssml.contains("<hi>"));
    }

    #[test]
    fn test_long_reply_splits_into_requests() {
        let voice = VoiceSettings::new("en-US-GuyNeural", 1.0);
        let reply: String = (0..400).map(|n| format!("Line number {}. ", n)).collect();

        let requests = ssml_requests(&reply, &voice);
        assert!(requests.len() > 1);
        assert!(requests[0].contains("Line number 0."));
        assert!(requests.last().unwrap().contains("Line number 399."));
        for body in &requests {
            assert!(body.starts_with("<speak"));
            assert!(body.len() < AZURE_MAX_CHARS + 300);
        }

        assert_eq!(ssml_requests("Short.", &voice).len(), 1);
    }

    #[test]
    fn test_endpoint_from_region() {
        let endpoint = resolve_endpoint(None, Some("eastus")).unwrap();
        assert_eq!(
            endpoint,
            "https://eastus.tts.speech.microsoft.com/cognitiveservices/v1"
        );
    }

    #[test]
    fn test_endpoint_override_wins() {
        let endpoint =
            resolve_endpoint(Some("https://speech.example.com/"), Some("eastus")).unwrap();
        assert_eq!(endpoint, "https://speech.example.com/cognitiveservices/v1");

        let full = resolve_endpoint(
            Some("https://westeurope.tts.speech.microsoft.com/cognitiveservices/v1"),
            None,
        )
        .unwrap();
        assert!(full.ends_with(".com/cognitiveservices/v1"));
    }

    #[test]
    fn test_missing_speech_settings() {
        assert!(matches!(
            resolve_endpoint(None, None),
            Err(ColloquyError::ConfigError(_))
        ));

        let credentials = Credentials::default();
        let result = AzureSpeech::from_credentials(reqwest::Client::new(), &credentials);
        assert!(matches!(result, Err(ColloquyError::ConfigError(_))));
    }

    #[test]
    fn test_speech_status_classification() {
        assert!(speech_status_error(503, "busy".into()).is_transient());
        assert!(!speech_status_error(401, "denied".into()).is_transient());
    }

    #[test]
    fn test_voice_falls_back_to_default() {
        let narration = NarrationConfig::default();
        let persona = Persona::new(
            PersonaId::new("james").unwrap(),
            "James",
            ProviderKind::Scripted,
            "scripted",
            "You are James.",
        );
        assert_eq!(voice_for(&persona, &narration).name, narration.default_voice);

        let persona = persona.with_voice(VoiceSettings::new("en-US-GuyNeural", 0.9));
        assert_eq!(voice_for(&persona, &narration).name, "en-US-GuyNeural");
    }

    #[tokio::test]
    async fn test_disabled_narration_builds_nothing() {
        let mut config = Config::default();
        config.narration.backend = NarrationBackend::None;
        let narrator = build_narrator(&config, &Credentials::default()).await.unwrap();
        assert!(narrator.is_none());
    }
}

//! Synthetic request generators for calibration traffic
//!
//! Generators are called once per synthetic request. They may build fresh
//! payloads every call but never touch production state.

use crate::config::GeneratorConfig;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;

/// Builds one synthetic request per call
pub trait BenchmarkGenerator: Send + Sync {
    fn generate(&self) -> SyntheticRequest;
}

/// A calibration request, independent of any inbound connection
#[derive(Debug, Clone)]
pub struct SyntheticRequest {
    pub method: http::Method,
    pub body: SyntheticBody,
}

/// Body of a calibration request
#[derive(Debug, Clone)]
pub enum SyntheticBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

/// File field of a multipart upload
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl SyntheticRequest {
    /// Bytes the route's estimator sees for this request
    pub fn estimator_body(&self) -> Option<Bytes> {
        match &self.body {
            SyntheticBody::Empty => None,
            SyntheticBody::Json(value) => serde_json::to_vec(value).ok().map(Bytes::from),
            SyntheticBody::Multipart { file, .. } => Some(file.bytes.clone()),
        }
    }
}

/// Multipart upload of a silent WAV clip with an optional `language` field
#[derive(Debug, Clone)]
pub struct SilenceWavGenerator {
    seconds: f64,
    sample_rate: u32,
    language: Option<String>,
}

impl SilenceWavGenerator {
    pub fn new(seconds: f64, sample_rate: u32, language: Option<String>) -> Self {
        Self {
            seconds,
            sample_rate,
            language,
        }
    }
}

impl BenchmarkGenerator for SilenceWavGenerator {
    fn generate(&self) -> SyntheticRequest {
        let fields = self
            .language
            .iter()
            .map(|lang| ("language".to_string(), lang.clone()))
            .collect();
        SyntheticRequest {
            method: http::Method::POST,
            body: SyntheticBody::Multipart {
                fields,
                file: FilePart {
                    field: "file".to_string(),
                    filename: "benchmark.wav".to_string(),
                    content_type: "audio/wav".to_string(),
                    bytes: Bytes::from(silence_wav(self.seconds, self.sample_rate)),
                },
            },
        }
    }
}

/// JSON body carrying a base64-encoded silent WAV clip
#[derive(Debug, Clone)]
pub struct JsonAudioGenerator {
    field: String,
    seconds: f64,
    sample_rate: u32,
    language: Option<String>,
}

impl JsonAudioGenerator {
    pub fn new(field: String, seconds: f64, sample_rate: u32, language: Option<String>) -> Self {
        Self {
            field,
            seconds,
            sample_rate,
            language,
        }
    }
}

impl BenchmarkGenerator for JsonAudioGenerator {
    fn generate(&self) -> SyntheticRequest {
        let audio = base64::engine::general_purpose::STANDARD
            .encode(silence_wav(self.seconds, self.sample_rate));
        let mut body = serde_json::Map::new();
        body.insert(self.field.clone(), serde_json::Value::String(audio));
        if let Some(ref lang) = self.language {
            body.insert("language".to_string(), serde_json::Value::String(lang.clone()));
        }
        SyntheticRequest {
            method: http::Method::POST,
            body: SyntheticBody::Json(serde_json::Value::Object(body)),
        }
    }
}

/// Bodiless GET
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyGenerator;

impl BenchmarkGenerator for EmptyGenerator {
    fn generate(&self) -> SyntheticRequest {
        SyntheticRequest {
            method: http::Method::GET,
            body: SyntheticBody::Empty,
        }
    }
}

/// Build the generator a route's benchmark is configured with
pub fn build_generator(config: &GeneratorConfig) -> Arc<dyn BenchmarkGenerator> {
    match config {
        GeneratorConfig::SilenceWav {
            seconds,
            sample_rate,
            language,
        } => Arc::new(SilenceWavGenerator::new(
            *seconds,
            *sample_rate,
            language.clone(),
        )),
        GeneratorConfig::JsonAudio {
            field,
            seconds,
            sample_rate,
            language,
        } => Arc::new(JsonAudioGenerator::new(
            field.clone(),
            *seconds,
            *sample_rate,
            language.clone(),
        )),
        GeneratorConfig::Empty => Arc::new(EmptyGenerator),
    }
}

/// A 16-bit mono PCM WAV file of silence
pub fn silence_wav(seconds: f64, sample_rate: u32) -> Vec<u8> {
    let num_samples = (sample_rate as f64 * seconds) as u32;
    let data_size = num_samples * 2;
    let byte_rate = sample_rate * 2;

    let mut wav = Vec::with_capacity(44 + data_size as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.resize(44 + data_size as usize, 0);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_wav_layout() {
        let wav = silence_wav(1.0, 16_000);
        assert_eq!(wav.len(), 44 + 32_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 32_000);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 32_000);
        assert_eq!(&wav[36..40], b"data");
        assert!(wav[44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_silence_wav_generator() {
        let gen = SilenceWavGenerator::new(1.0, 16_000, Some("hi".into()));
        let req = gen.generate();
        assert_eq!(req.method, http::Method::POST);
        match req.body {
            SyntheticBody::Multipart { ref fields, ref file } => {
                assert_eq!(fields, &vec![("language".to_string(), "hi".to_string())]);
                assert_eq!(file.field, "file");
                assert_eq!(file.filename, "benchmark.wav");
                assert_eq!(file.content_type, "audio/wav");
                assert_eq!(file.bytes.len(), 44 + 32_000);
            }
            _ => panic!("expected multipart body"),
        }
        assert_eq!(req.estimator_body().unwrap().len(), 44 + 32_000);
    }

    #[test]
    fn test_generator_is_repeatable() {
        let gen = SilenceWavGenerator::new(0.5, 8_000, None);
        let a = gen.generate().estimator_body().unwrap();
        let b = gen.generate().estimator_body().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_audio_generator() {
        let gen = JsonAudioGenerator::new("audio".into(), 1.0, 16_000, Some("hi".into()));
        let req = gen.generate();
        let SyntheticBody::Json(value) = req.body else {
            panic!("expected json body");
        };
        let encoded = value["audio"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, silence_wav(1.0, 16_000));
        assert_eq!(value["language"], "hi");
    }

    #[test]
    fn test_empty_generator() {
        let req = EmptyGenerator.generate();
        assert_eq!(req.method, http::Method::GET);
        assert!(req.estimator_body().is_none());
    }
}

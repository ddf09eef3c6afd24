//! Audio buffer helpers shared by the narration backends.

use std::path::Path;

use crate::error::ColloquyError;
use crate::persona::PersonaId;

/// Sample rate of every clip we write.
pub const SAMPLE_RATE: u32 = 24_000;

/// Split text into chunks of at most `max_chars` characters for synthesis.
///
/// Breaks fall at sentence ends where possible, then at commas, then at
/// whitespace. A word longer than the limit is cut mid-word.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut packer = ChunkPacker::new(max_chars.max(1));
    for sentence in text.split_inclusive(['.', '!', '?', ';', '\n']) {
        packer.push_fitting(sentence, &[',', ' ']);
    }
    packer.finish()
}

/// Greedily joins pieces with single spaces while they fit.
struct ChunkPacker {
    max_chars: usize,
    chunks: Vec<String>,
    current: String,
    current_chars: usize,
}

impl ChunkPacker {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            current: String::new(),
            current_chars: 0,
        }
    }

    /// Push `piece`, breaking it at each of `separators` in turn until the
    /// parts fit.
    fn push_fitting(&mut self, piece: &str, separators: &[char]) {
        let piece = piece.trim();
        if piece.is_empty() {
            return;
        }
        if piece.chars().count() <= self.max_chars {
            self.push(piece);
            return;
        }
        match separators.split_first() {
            Some((&sep, rest)) => {
                for part in piece.split_inclusive(sep) {
                    self.push_fitting(part, rest);
                }
            }
            None => {
                let chars: Vec<char> = piece.chars().collect();
                for slice in chars.chunks(self.max_chars) {
                    self.push(&slice.iter().collect::<String>());
                }
            }
        }
    }

    fn push(&mut self, piece: &str) {
        let len = piece.chars().count();
        if self.current_chars > 0 && self.current_chars + 1 + len > self.max_chars {
            self.chunks.push(std::mem::take(&mut self.current));
            self.current_chars = 0;
        }
        if self.current_chars > 0 {
            self.current.push(' ');
            self.current_chars += 1;
        }
        self.current.push_str(piece);
        self.current_chars += len;
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() {
            self.chunks.push(self.current);
        }
        self.chunks
    }
}

/// Resample by linear interpolation. A `rate` of 0.75 plays at 75% speed,
/// 1.5 at 150%. Non-positive rates leave the samples alone.
pub fn adjust_audio_speed(samples: Vec<f32>, rate: f32) -> Vec<f32> {
    if rate <= 0.0 || (rate - 1.0).abs() < 0.001 || samples.is_empty() {
        return samples;
    }

    let last = samples.len() - 1;
    let out_len = (samples.len() as f32 / rate) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 * rate;
            let lo = (pos as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = pos - lo as f32;
            samples[lo] + (samples[hi] - samples[lo]) * frac
        })
        .collect()
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write float samples in [-1, 1] as a 16-bit mono WAV. Returns the
/// clip length in seconds.
pub fn write_wav_f32(path: &Path, samples: &[f32], sample_rate: u32) -> Result<f32, ColloquyError> {
    let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(samples.len() as f32 / sample_rate as f32)
}

/// Write raw little-endian 16-bit mono PCM as a WAV. Returns the clip
/// length in seconds.
pub fn write_wav_pcm16(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<f32, ColloquyError> {
    let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))?;
    let mut count = 0usize;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        count += 1;
    }
    writer.finalize()?;
    Ok(count as f32 / sample_rate as f32)
}

/// File name for a narrated turn, e.g. `0003-james.wav`.
pub fn audio_file_name(sequence: u32, persona: &PersonaId) -> String {
    format!("{:04}-{}.wav", sequence, persona)
}

//! Lazy audio handles and the sample-rate conformer.
//!
//! An [`AudioHandle`] never decodes on construction. Header-level facts
//! (rate, channel count, frame count) come from the container header, so the
//! validation filter can compute durations cheaply. RIFF/WAVE data is read
//! with hound; every other container (FLAC, MP3, Ogg Vorbis, AAC/MP4) goes
//! through symphonia. Full decoding, mono down-mixing, and resampling to the
//! declared target rate happen only when a consumer calls
//! [`AudioHandle::decode`].

use std::fmt;
use std::fs::{self, File};
use std::io::{Cursor, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hound::{SampleFormat, WavReader};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use serde_json::{Map, Value};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::warn;

use crate::constants::columns::{
    AUDIO_ARRAY_KEY, AUDIO_BYTES_KEY, AUDIO_PATH_KEY, AUDIO_SAMPLING_RATE_KEY,
};
use crate::data::RecordSet;
use crate::errors::CorpusError;

/// Input frames handed to rubato per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Where the waveform behind a handle lives.
#[derive(Clone)]
pub enum AudioPayload {
    /// Encoded audio file on disk.
    File(PathBuf),
    /// Encoded audio bytes embedded in a table row.
    Encoded {
        /// Container bytes.
        bytes: Arc<[u8]>,
        /// Original file name; its extension hints the container.
        path: Option<String>,
    },
    /// Already-decoded mono samples.
    Samples {
        /// Mono waveform.
        samples: Arc<[f32]>,
        /// Rate of `samples` in Hz.
        sample_rate: u32,
    },
}

impl fmt::Debug for AudioPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioPayload::File(path) => f.debug_tuple("File").field(path).finish(),
            AudioPayload::Encoded { bytes, path } => f
                .debug_struct("Encoded")
                .field("len", &bytes.len())
                .field("path", path)
                .finish(),
            AudioPayload::Samples {
                samples,
                sample_rate,
            } => f
                .debug_struct("Samples")
                .field("len", &samples.len())
                .field("sample_rate", sample_rate)
                .finish(),
        }
    }
}

/// Header-level facts about a waveform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioInfo {
    /// Native sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Samples per channel.
    pub frames: u64,
}

impl AudioInfo {
    /// Duration in seconds at the native rate.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / self.sample_rate as f64
    }
}

/// Decoded mono waveform.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Rate of `samples` in Hz.
    pub sample_rate: u32,
}

/// Lazy handle to a waveform plus an optional decode-target sample rate.
#[derive(Clone, Debug)]
pub struct AudioHandle {
    payload: AudioPayload,
    target_sample_rate: Option<u32>,
}

impl AudioHandle {
    /// Handle over an audio file on disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            payload: AudioPayload::File(path.into()),
            target_sample_rate: None,
        }
    }

    /// Handle over encoded bytes; `path` is kept for messages and container hints.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, path: Option<String>) -> Self {
        Self {
            payload: AudioPayload::Encoded {
                bytes: bytes.into(),
                path,
            },
            target_sample_rate: None,
        }
    }

    /// Handle over decoded mono samples.
    pub fn from_samples(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            payload: AudioPayload::Samples {
                samples: samples.into(),
                sample_rate,
            },
            target_sample_rate: None,
        }
    }

    /// The underlying waveform source.
    pub fn payload(&self) -> &AudioPayload {
        &self.payload
    }

    /// Declared decode target, if any.
    pub fn target_sample_rate(&self) -> Option<u32> {
        self.target_sample_rate
    }

    /// Declare a decode target without touching the waveform.
    pub fn with_target_sample_rate(mut self, sample_rate: u32) -> Self {
        self.target_sample_rate = Some(sample_rate);
        self
    }

    /// Human-readable location used in error messages.
    pub fn location(&self) -> String {
        match &self.payload {
            AudioPayload::File(path) => path.display().to_string(),
            AudioPayload::Encoded { path, .. } => path
                .clone()
                .unwrap_or_else(|| "<embedded audio>".to_string()),
            AudioPayload::Samples { .. } => "<decoded samples>".to_string(),
        }
    }

    /// Read header-level facts without decoding samples.
    pub fn info(&self) -> Result<AudioInfo, CorpusError> {
        match &self.payload {
            AudioPayload::Samples {
                samples,
                sample_rate,
            } => Ok(AudioInfo {
                sample_rate: *sample_rate,
                channels: 1,
                frames: samples.len() as u64,
            }),
            _ if !self.is_riff_wave()? => {
                container_info(self.open_container()?).map_err(|reason| self.audio_err(reason))
            }
            AudioPayload::File(path) => {
                let reader = WavReader::open(path).map_err(|err| self.audio_err(err))?;
                Ok(header_info(&reader))
            }
            AudioPayload::Encoded { bytes, .. } => {
                let reader =
                    WavReader::new(Cursor::new(&bytes[..])).map_err(|err| self.audio_err(err))?;
                Ok(header_info(&reader))
            }
        }
    }

    /// Duration in seconds, computed from the header.
    pub fn duration_seconds(&self) -> Result<f64, CorpusError> {
        Ok(self.info()?.duration_seconds())
    }

    /// Decode to mono and resample to the declared target rate.
    pub fn decode(&self) -> Result<DecodedAudio, CorpusError> {
        let (samples, native_rate) = match &self.payload {
            AudioPayload::Samples {
                samples,
                sample_rate,
            } => (samples.to_vec(), *sample_rate),
            _ if !self.is_riff_wave()? => {
                decode_container(self.open_container()?).map_err(|reason| self.audio_err(reason))?
            }
            AudioPayload::File(path) => {
                let reader = WavReader::open(path).map_err(|err| self.audio_err(err))?;
                read_mono(reader).map_err(|err| self.audio_err(err))?
            }
            AudioPayload::Encoded { bytes, .. } => {
                let reader =
                    WavReader::new(Cursor::new(&bytes[..])).map_err(|err| self.audio_err(err))?;
                read_mono(reader).map_err(|err| self.audio_err(err))?
            }
        };
        match self.target_sample_rate {
            Some(target) if target != native_rate => Ok(DecodedAudio {
                samples: resample(&samples, native_rate, target)
                    .map_err(|reason| self.audio_err(reason))?,
                sample_rate: target,
            }),
            _ => Ok(DecodedAudio {
                samples,
                sample_rate: native_rate,
            }),
        }
    }

    /// Serialize the handle into a structured row cell.
    ///
    /// With `embed` set, on-disk files are inlined as base64 bytes so the row
    /// stays valid once it leaves the machine it was built on.
    pub fn to_cell(&self, embed: bool) -> Result<Value, CorpusError> {
        let mut cell = Map::new();
        match &self.payload {
            AudioPayload::File(path) => {
                if embed {
                    let bytes = fs::read(path).map_err(|err| self.audio_err(err))?;
                    cell.insert(AUDIO_BYTES_KEY.into(), Value::String(BASE64.encode(bytes)));
                    cell.insert(AUDIO_PATH_KEY.into(), file_name_value(path));
                } else {
                    cell.insert(AUDIO_BYTES_KEY.into(), Value::Null);
                    cell.insert(
                        AUDIO_PATH_KEY.into(),
                        Value::String(path.display().to_string()),
                    );
                }
            }
            AudioPayload::Encoded { bytes, path } => {
                cell.insert(
                    AUDIO_BYTES_KEY.into(),
                    Value::String(BASE64.encode(&bytes[..])),
                );
                cell.insert(
                    AUDIO_PATH_KEY.into(),
                    path.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }
            AudioPayload::Samples {
                samples,
                sample_rate,
            } => {
                cell.insert(
                    AUDIO_ARRAY_KEY.into(),
                    Value::Array(samples.iter().map(|s| Value::from(*s as f64)).collect()),
                );
                cell.insert(AUDIO_SAMPLING_RATE_KEY.into(), Value::from(*sample_rate));
            }
        }
        Ok(Value::Object(cell))
    }

    /// Sniff the first twelve bytes for a RIFF/WAVE header.
    fn is_riff_wave(&self) -> Result<bool, CorpusError> {
        let head = match &self.payload {
            AudioPayload::File(path) => {
                let mut head = Vec::with_capacity(12);
                File::open(path)
                    .and_then(|file| file.take(12).read_to_end(&mut head))
                    .map_err(|err| self.audio_err(err))?;
                head
            }
            AudioPayload::Encoded { bytes, .. } => bytes[..bytes.len().min(12)].to_vec(),
            AudioPayload::Samples { .. } => return Ok(false),
        };
        Ok(head.len() == 12 && &head[..4] == b"RIFF" && &head[8..] == b"WAVE")
    }

    fn open_container(&self) -> Result<Box<dyn FormatReader>, CorpusError> {
        let source: Box<dyn MediaSource> = match &self.payload {
            AudioPayload::File(path) => Box::new(File::open(path).map_err(|err| self.audio_err(err))?),
            AudioPayload::Encoded { bytes, .. } => Box::new(Cursor::new(Arc::clone(bytes))),
            AudioPayload::Samples { .. } => {
                return Err(self.audio_err("decoded samples have no container"));
            }
        };
        let location = self.location();
        let extension = Path::new(&location).extension().and_then(|ext| ext.to_str());
        open_format(source, extension).map_err(|reason| self.audio_err(reason))
    }

    fn audio_err(&self, reason: impl fmt::Display) -> CorpusError {
        CorpusError::Audio {
            location: self.location(),
            reason: reason.to_string(),
        }
    }
}

fn file_name_value(path: &Path) -> Value {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| Value::String(name.to_string()))
        .unwrap_or(Value::Null)
}

fn header_info<R: Read>(reader: &WavReader<R>) -> AudioInfo {
    let spec = reader.spec();
    AudioInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames: reader.duration() as u64,
    }
}

fn read_mono<R: Read>(mut reader: WavReader<R>) -> Result<(Vec<f32>, u32), hound::Error> {
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok((downmix(interleaved, spec.channels as usize), spec.sample_rate))
}

fn downmix(interleaved: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved;
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn open_format(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<Box<dyn FormatReader>, String> {
    let stream = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }
    let opened = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| format!("unsupported container: {err}"))?;
    Ok(opened.format)
}

fn default_track(format: &dyn FormatReader) -> Result<(u32, CodecParameters), String> {
    format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .map(|track| (track.id, track.codec_params.clone()))
        .ok_or_else(|| "no audio track".to_string())
}

/// Header facts from the container; decodes only when the frame count is absent.
fn container_info(format: Box<dyn FormatReader>) -> Result<AudioInfo, String> {
    let (_, params) = default_track(format.as_ref())?;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| "unknown sample rate".to_string())?;
    let channels = params.channels.map_or(1, |channels| channels.count() as u16);
    let frames = match params.n_frames {
        Some(frames) => frames,
        None => decode_container(format)?.0.len() as u64,
    };
    Ok(AudioInfo {
        sample_rate,
        channels,
        frames,
    })
}

fn decode_container(mut format: Box<dyn FormatReader>) -> Result<(Vec<f32>, u32), String> {
    let (track_id, params) = default_track(format.as_ref())?;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| "unknown sample rate".to_string())?;
    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|err| format!("unsupported codec: {err}"))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(format!("reading packet: {err}")),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!("[asr_corpus:audio] skipping undecodable packet: {reason}");
                continue;
            }
            Err(err) => return Err(format!("decoding: {err}")),
        };
        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        mono.extend(downmix(buffer.samples().to_vec(), spec.channels.count()));
    }
    Ok((mono, sample_rate))
}

/// Resample a mono buffer from `from` Hz to `to` Hz.
///
/// The output is trimmed of the resampler's delay and truncated to the
/// length implied by the rate ratio.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, String> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from == 0 || to == 0 {
        return Err(format!("invalid resampling rates {from} -> {to}"));
    }
    let ratio = to as f64 / from as f64;
    let mut resampler =
        FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, RESAMPLE_CHUNK, 1)
            .map_err(|err| format!("resampler init: {err}"))?;
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let produced = resampler
            .process(&[chunk], None)
            .map_err(|err| format!("resampler process: {err}"))?;
        output.extend_from_slice(&produced[0]);
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let tail: [&[f32]; 1] = [remainder];
        let produced = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|err| format!("resampler process: {err}"))?;
        output.extend_from_slice(&produced[0]);
    }
    // Flush the delay line with silence.
    let mut flushes = 0;
    while output.len() < expected + delay && flushes < 8 {
        let produced = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|err| format!("resampler flush: {err}"))?;
        if produced[0].is_empty() {
            break;
        }
        output.extend_from_slice(&produced[0]);
        flushes += 1;
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Declare `target_sample_rate` on every record's audio without decoding.
///
/// A `None` target leaves the set untouched. Non-audio fields pass through.
pub fn conform(records: RecordSet, target_sample_rate: Option<u32>) -> RecordSet {
    let Some(target) = target_sample_rate else {
        return records;
    };
    records.map_infallible(move |mut record| {
        record.audio = record.audio.with_target_sample_rate(target);
        record
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Record;
    use hound::{WavSpec, WavWriter};

    fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for idx in 0..frames * channels as usize {
                writer.write_sample(((idx % 100) as i16) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn info_reads_header_only() {
        let handle = AudioHandle::from_bytes(wav_bytes(8_000, 2, 12_000), None);
        let info = handle.info().unwrap();
        assert_eq!(info.sample_rate, 8_000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.frames, 12_000);
        assert!((info.duration_seconds() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn decode_mixes_stereo_down_to_mono() {
        let handle = AudioHandle::from_bytes(wav_bytes(8_000, 2, 400), None);
        let decoded = handle.decode().unwrap();
        assert_eq!(decoded.sample_rate, 8_000);
        assert_eq!(decoded.samples.len(), 400);
    }

    #[test]
    fn decode_resamples_to_declared_target() {
        let handle =
            AudioHandle::from_bytes(wav_bytes(48_000, 1, 48_000), None).with_target_sample_rate(16_000);
        let decoded = handle.decode().unwrap();
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), 16_000);
    }

    fn crc8(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |mut crc, byte| {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
            }
            crc
        })
    }

    fn crc16(data: &[u8]) -> u16 {
        data.iter().fold(0u16, |mut crc, byte| {
            crc ^= (*byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
            }
            crc
        })
    }

    /// Mono 16-bit FLAC of silence, one constant subframe per block.
    fn silent_flac(sample_rate: u32, frames: u64) -> Vec<u8> {
        const BLOCK: u64 = 4096;
        let mut out = b"fLaC".to_vec();
        out.extend_from_slice(&[0x80, 0x00, 0x00, 34]);
        out.extend_from_slice(&(BLOCK as u16).to_be_bytes());
        out.extend_from_slice(&(BLOCK as u16).to_be_bytes());
        out.extend_from_slice(&[0; 6]);
        let packed = ((sample_rate as u64) << 44) | (15 << 36) | frames;
        out.extend_from_slice(&packed.to_be_bytes());
        out.extend_from_slice(&[0; 16]);

        let mut start = 0;
        let mut index = 0u8;
        while start < frames {
            let block = BLOCK.min(frames - start);
            let mut frame = vec![0xFF, 0xF8, 0x70, 0x08, index];
            frame.extend_from_slice(&((block - 1) as u16).to_be_bytes());
            frame.push(crc8(&frame));
            frame.extend_from_slice(&[0x00, 0x00, 0x00]);
            let crc = crc16(&frame);
            frame.extend_from_slice(&crc.to_be_bytes());
            out.extend(frame);
            start += block;
            index += 1;
        }
        out
    }

    #[test]
    fn flac_bytes_are_read_through_symphonia() {
        let handle = AudioHandle::from_bytes(silent_flac(16_000, 32_000), Some("clip.flac".into()));
        let info = handle.info().unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.frames, 32_000);
        assert!((handle.duration_seconds().unwrap() - 2.0).abs() < 1e-9);

        let decoded = handle.decode().unwrap();
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), 32_000);
        assert!(decoded.samples.iter().all(|sample| *sample == 0.0));
    }

    #[test]
    fn flac_file_on_disk_is_read_through_symphonia() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flac");
        fs::write(&path, silent_flac(16_000, 8_000)).unwrap();
        let info = AudioHandle::from_path(&path).info().unwrap();
        assert_eq!(info.frames, 8_000);
    }

    #[test]
    fn resample_is_identity_for_equal_rates() {
        let samples = vec![0.25f32; 300];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn corrupt_bytes_surface_audio_error() {
        let handle = AudioHandle::from_bytes(vec![1u8, 2, 3], Some("broken.wav".into()));
        let err = handle.info().unwrap_err();
        assert!(matches!(err, CorpusError::Audio { ref location, .. } if location == "broken.wav"));
    }

    #[test]
    fn conform_declares_target_and_keeps_other_fields() {
        let record = Record::new("r1", AudioHandle::from_samples(vec![0.0; 10], 8_000), "hej");
        let conformed = conform(RecordSet::Table(vec![record]), Some(16_000))
            .materialize()
            .unwrap();
        assert_eq!(conformed[0].audio.target_sample_rate(), Some(16_000));
        assert_eq!(conformed[0].text, "hej");
        assert_eq!(conformed[0].id, "r1");
    }

    #[test]
    fn conform_without_target_is_a_no_op() {
        let record = Record::new("r1", AudioHandle::from_samples(vec![0.0; 10], 8_000), "hej");
        let out = conform(RecordSet::Table(vec![record]), None)
            .materialize()
            .unwrap();
        assert_eq!(out[0].audio.target_sample_rate(), None);
    }
}

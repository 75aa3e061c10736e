//! Artifact format shared by every collector.
//!
//! Artifacts are gzip-compressed `perftools.profiles.Profile` protobufs, so
//! `pprof` opens them directly. In memory a [`Profile`] keeps frames as plain
//! name stacks; [`encode`] turns every distinct frame name into one function
//! and one location.

pub mod proto;
mod strings;

pub use strings::StringTable;

use crate::collector::CollectorKind;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::warn;

/// First two bytes of every gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A measured quantity: what is counted and in which unit (`cpu`/`nanoseconds`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueType {
    pub kind: i64,
    pub unit: i64,
}

/// One observation. `frames` are interned, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub frames: Vec<i64>,
    /// One value per entry of `Profile::sample_types`.
    pub values: Vec<i64>,
    /// Interned key/value pairs.
    pub labels: Vec<(i64, i64)>,
}

/// A complete profile as persisted in one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub kind: CollectorKind,
    pub sample_types: Vec<ValueType>,
    /// What `period` counts; the last sample type.
    pub period_type: Option<ValueType>,
    pub samples: Vec<Sample>,
    pub strings: StringTable,
    /// Sampling period in the unit of the collector's rate (0 when unsampled).
    pub period: u64,
    /// Capture start, nanoseconds since the Unix epoch.
    pub time_nanos: i64,
    /// Length of the capture window (0 for point-in-time captures).
    pub duration_nanos: i64,
    pub comments: Vec<i64>,
}

impl Profile {
    /// Creates an empty profile stamped with the current time.
    pub fn new(kind: CollectorKind, sample_types: &[(&str, &str)], period: u64) -> Self {
        let mut strings = StringTable::new();
        let sample_types: Vec<ValueType> = sample_types
            .iter()
            .map(|(kind, unit)| ValueType {
                kind: strings.intern(kind),
                unit: strings.intern(unit),
            })
            .collect();
        Self {
            kind,
            period_type: sample_types.last().copied(),
            sample_types,
            samples: Vec::new(),
            strings,
            period,
            time_nanos: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default(),
            duration_nanos: 0,
            comments: Vec::new(),
        }
    }

    /// Appends a sample with `frames` outermost first. `values` should match
    /// `sample_types` in length; extra values are dropped and missing ones
    /// are zero-filled.
    pub fn add_sample(&mut self, frames: &[&str], values: &[i64], labels: &[(&str, &str)]) {
        let mut values = values.to_vec();
        values.resize(self.sample_types.len(), 0);
        let frames = frames.iter().map(|f| self.strings.intern(f)).collect();
        let labels = labels
            .iter()
            .map(|(k, v)| (self.strings.intern(k), self.strings.intern(v)))
            .collect();
        self.samples.push(Sample {
            frames,
            values,
            labels,
        });
    }

    pub fn add_comment(&mut self, comment: &str) {
        let id = self.strings.intern(comment);
        self.comments.push(id);
    }

    /// Resolved frame names of a sample.
    pub fn frames_of(&self, sample: &Sample) -> Vec<&str> {
        sample
            .frames
            .iter()
            .filter_map(|id| self.strings.resolve(*id))
            .collect()
    }

    /// Resolved label value of a sample.
    pub fn label_of(&self, sample: &Sample, key: &str) -> Option<&str> {
        sample
            .labels
            .iter()
            .find(|(k, _)| self.strings.resolve(*k) == Some(key))
            .and_then(|(_, v)| self.strings.resolve(*v))
    }

    /// Resolved comments.
    pub fn comment_texts(&self) -> Vec<&str> {
        self.comments
            .iter()
            .filter_map(|id| self.strings.resolve(*id))
            .collect()
    }

    /// Index of a sample type by name.
    pub fn value_index(&self, kind: &str) -> Option<usize> {
        self.sample_types
            .iter()
            .position(|vt| self.strings.resolve(vt.kind) == Some(kind))
    }

    /// Sum of one value column over all samples.
    pub fn total(&self, kind: &str) -> i64 {
        self.value_index(kind)
            .map(|idx| {
                self.samples
                    .iter()
                    .filter_map(|s| s.values.get(idx))
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// Encodes `profile` as gzip-compressed `profile.proto`, the `pprof` format.
pub fn encode(profile: &Profile) -> io::Result<Vec<u8>> {
    let raw = to_proto(profile).encode_to_vec();
    let mut gz = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    gz.write_all(&raw)?;
    gz.finish()
}

fn to_proto(profile: &Profile) -> proto::Profile {
    let value_type = |vt: &ValueType| proto::ValueType {
        r#type: vt.kind,
        unit: vt.unit,
    };

    // One function and one location per distinct frame name, sharing an id.
    let mut ids: HashMap<i64, u64> = HashMap::new();
    let mut functions = Vec::new();
    let mut locations = Vec::new();
    let mut samples = Vec::with_capacity(profile.samples.len());
    for sample in &profile.samples {
        let mut location_id = Vec::with_capacity(sample.frames.len());
        for &name in sample.frames.iter().rev() {
            let id = *ids.entry(name).or_insert_with(|| {
                let id = functions.len() as u64 + 1;
                functions.push(proto::Function {
                    id,
                    name,
                    system_name: name,
                    ..Default::default()
                });
                locations.push(proto::Location {
                    id,
                    line: vec![proto::Line {
                        function_id: id,
                        line: 0,
                    }],
                    ..Default::default()
                });
                id
            });
            location_id.push(id);
        }
        samples.push(proto::Sample {
            location_id,
            value: sample.values.clone(),
            label: sample
                .labels
                .iter()
                .map(|&(key, value)| proto::Label {
                    key,
                    str: value,
                    ..Default::default()
                })
                .collect(),
        });
    }

    proto::Profile {
        sample_type: profile.sample_types.iter().map(value_type).collect(),
        sample: samples,
        location: locations,
        function: functions,
        string_table: profile.strings.entries().to_vec(),
        time_nanos: profile.time_nanos,
        duration_nanos: profile.duration_nanos,
        period_type: profile.period_type.as_ref().map(value_type),
        period: i64::try_from(profile.period).unwrap_or(i64::MAX),
        comment: profile.comments.clone(),
        default_sample_type: 0,
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Decodes a gzip-compressed `profile.proto` written by [`encode`].
pub fn decode(kind: CollectorKind, data: &[u8]) -> io::Result<Profile> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Err(invalid("not a gzip stream"));
    }
    let mut raw = Vec::new();
    GzDecoder::new(data).read_to_end(&mut raw)?;
    let message = proto::Profile::decode(raw.as_slice()).map_err(|e| {
        warn!(%kind, len = raw.len(), error = %e, "profile: protobuf decoding failed");
        invalid(e.to_string())
    })?;
    from_proto(kind, message)
}

fn from_proto(kind: CollectorKind, message: proto::Profile) -> io::Result<Profile> {
    let strings = StringTable::from_entries(message.string_table)
        .ok_or_else(|| invalid("string table does not start with \"\""))?;
    let value_type = |vt: proto::ValueType| ValueType {
        kind: vt.r#type,
        unit: vt.unit,
    };

    let function_names: HashMap<u64, i64> =
        message.function.iter().map(|f| (f.id, f.name)).collect();
    let mut location_frames: HashMap<u64, Vec<i64>> = HashMap::new();
    for location in &message.location {
        let mut names = Vec::with_capacity(location.line.len());
        for line in &location.line {
            let name = function_names.get(&line.function_id).ok_or_else(|| {
                invalid(format!(
                    "location {} names unknown function {}",
                    location.id, line.function_id
                ))
            })?;
            names.push(*name);
        }
        location_frames.insert(location.id, names);
    }

    let mut samples = Vec::with_capacity(message.sample.len());
    for sample in message.sample {
        // Leaf first on the wire, outermost first in memory.
        let mut frames = Vec::new();
        for id in &sample.location_id {
            let names = location_frames
                .get(id)
                .ok_or_else(|| invalid(format!("sample references unknown location {}", id)))?;
            frames.extend_from_slice(names);
        }
        frames.reverse();
        samples.push(Sample {
            frames,
            values: sample.value,
            labels: sample.label.iter().map(|l| (l.key, l.str)).collect(),
        });
    }

    Ok(Profile {
        kind,
        sample_types: message.sample_type.into_iter().map(value_type).collect(),
        period_type: message.period_type.map(value_type),
        samples,
        strings,
        period: u64::try_from(message.period).unwrap_or(0),
        time_nanos: message.time_nanos,
        duration_nanos: message.duration_nanos,
        comments: message.comment,
    })
}

/// Reads and decodes an artifact file. The kind comes from the file name.
pub fn read_artifact(path: &Path) -> io::Result<Profile> {
    let kind = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(CollectorKind::from_artifact_name)
        .ok_or_else(|| invalid(format!("{} is not an artifact name", path.display())))?;
    let data = std::fs::read(path)?;
    decode(kind, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> Profile {
        let mut profile = Profile::new(
            CollectorKind::Cpu,
            &[("samples", "count"), ("cpu", "nanoseconds")],
            10_000_000,
        );
        profile.add_sample(&["sleep", "main"], &[3, 30_000_000], &[("pid", "42")]);
        profile.add_sample(&["sleep", "worker"], &[1], &[]);
        profile.add_comment("stop: requested");
        profile
    }

    fn raw_message(bytes: &[u8]) -> proto::Profile {
        let mut raw = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut raw).unwrap();
        proto::Profile::decode(raw.as_slice()).unwrap()
    }

    #[test]
    fn test_encoded_bytes_are_gzipped_pprof() {
        let bytes = encode(&sample_profile()).unwrap();
        assert_eq!(bytes[..2], GZIP_MAGIC);

        let message = raw_message(&bytes);
        let name = |id: i64| message.string_table[id as usize].as_str();
        assert_eq!(message.string_table[0], "");
        assert_eq!(message.sample.len(), 2);
        assert_eq!(message.period, 10_000_000);
        let period_type = message.period_type.unwrap();
        assert_eq!((name(period_type.r#type), name(period_type.unit)), ("cpu", "nanoseconds"));

        // "sleep" is shared, so three functions back three locations.
        assert_eq!(message.function.len(), 3);
        assert_eq!(message.location.len(), 3);
        let first = &message.sample[0];
        let leaf = message
            .location
            .iter()
            .find(|l| l.id == first.location_id[0])
            .unwrap();
        let function = message
            .function
            .iter()
            .find(|f| f.id == leaf.line[0].function_id)
            .unwrap();
        assert_eq!(name(function.name), "main");
        assert_eq!(first.value, vec![3, 30_000_000]);
        assert_eq!(name(first.label[0].key), "pid");
        assert_eq!(name(first.label[0].str), "42");
        assert_eq!(name(message.comment[0]), "stop: requested");
    }

    #[test]
    fn test_encode_decode() {
        let profile = sample_profile();
        let bytes = encode(&profile).unwrap();
        assert_eq!(decode(CollectorKind::Cpu, &bytes).unwrap(), profile);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let profile = sample_profile();
        assert_eq!(encode(&profile).unwrap(), encode(&profile.clone()).unwrap());
    }

    #[test]
    fn test_sample_helpers() {
        let profile = sample_profile();
        let first = &profile.samples[0];
        assert_eq!(profile.frames_of(first), vec!["sleep", "main"]);
        assert_eq!(profile.label_of(first, "pid"), Some("42"));
        assert_eq!(profile.label_of(first, "tid"), None);
        // Missing values are zero-filled.
        assert_eq!(profile.samples[1].values, vec![1, 0]);
        assert_eq!(profile.total("samples"), 4);
        assert_eq!(profile.total("cpu"), 30_000_000);
        assert_eq!(profile.total("bogus"), 0);
        assert_eq!(profile.comment_texts(), vec!["stop: requested"]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = decode(CollectorKind::Cpu, b"not a profile").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bytes = encode(&sample_profile()).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(decode(CollectorKind::Cpu, &bytes).is_err());
    }

    #[test]
    fn test_dangling_location_is_rejected() {
        let mut message = to_proto(&sample_profile());
        message.location.clear();
        let err = from_proto(CollectorKind::Cpu, message).unwrap_err();
        assert!(err.to_string().contains("unknown location"));
    }

    #[test]
    fn test_read_artifact_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.prof");
        std::fs::write(&path, encode(&sample_profile()).unwrap()).unwrap();
        let profile = read_artifact(&path).unwrap();
        assert_eq!(profile.kind, CollectorKind::Cpu);
        assert_eq!(profile.samples.len(), 2);

        assert!(read_artifact(&dir.path().join("missing.prof")).is_err());
        let renamed = dir.path().join("profile.bin");
        std::fs::rename(&path, &renamed).unwrap();
        assert!(read_artifact(&renamed).is_err());
    }
}

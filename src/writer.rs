// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame Writer (C6): single-pass binary capture serialization (§6.1).
//!
//! Field layout and encoding (little-endian throughout, `byteorder`) mirror
//! the way `device/mod.rs` reads/writes multi-byte registers in this
//! crate's own driver layer — the same crate, the same discipline.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{ArgusError, Result};
use crate::pipeline::Chunk;
use crate::position::Fix;

const MAGIC: &[u8; 5] = b"ARGUS";
const FORMAT_VERSION: u16 = 1;
const MAX_STRING_LEN: usize = 255;

/// Fixed capture metadata, known before the first sample is written (§6.1).
#[derive(Debug, Clone)]
pub struct CaptureHeader {
    pub center_frequency: u64,
    pub sample_rate: u32,
    pub collection_time: SystemTime,
    pub fix: Fix,
    pub gps_time: SystemTime,
    pub device_descriptor: String,
    pub collection_id: String,
}

/// Result of a successful `FrameWriter::close` (§4.6).
#[derive(Debug, Clone)]
pub struct FinalizedCapture {
    pub path: PathBuf,
    pub sample_count: u32,
}

fn write_string_field<W: Write>(w: &mut W, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(ArgusError::StringTooLong(format!(
            "{:?} is {} bytes, max {}",
            s,
            bytes.len(),
            MAX_STRING_LEN
        )));
    }
    w.write_u8(bytes.len() as u8)
        .map_err(|e| ArgusError::Write(e.to_string()))?;
    w.write_all(bytes)
        .map_err(|e| ArgusError::Write(e.to_string()))?;
    Ok(())
}

fn systemtime_to_secs_nanos(t: SystemTime) -> (i64, i32) {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i32),
        Err(e) => {
            let d = e.duration();
            (-(d.as_secs() as i64), -(d.subsec_nanos() as i32))
        }
    }
}

/// Serializes one capture file in a single forward pass (§4.6). Not
/// `Clone`/`Copy`: owns the open file handle and a running sample count
/// until [`FrameWriter::close`] consumes it.
pub struct FrameWriter {
    file: BufWriter<File>,
    path: PathBuf,
    sample_count: u32,
    sample_count_offset: u64,
}

impl FrameWriter {
    /// Creates (or truncates) `{output_dir}/{collection_id}.dat` and writes
    /// the fixed-size header, leaving the writer positioned at the start of
    /// the sample payload (§6.1, §6.2).
    pub fn create(output_dir: &Path, header: &CaptureHeader) -> Result<Self> {
        fs::create_dir_all(output_dir).map_err(|e| ArgusError::OutputOpen(e.to_string()))?;
        let path = output_dir.join(format!("{}.dat", header.collection_id));
        let file = File::create(&path).map_err(|e| ArgusError::OutputOpen(e.to_string()))?;
        let mut writer = BufWriter::new(file);

        writer
            .write_all(MAGIC)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_u16::<LittleEndian>(FORMAT_VERSION)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_u64::<LittleEndian>(header.center_frequency)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_u32::<LittleEndian>(header.sample_rate)
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        let (ct_secs, ct_nanos) = systemtime_to_secs_nanos(header.collection_time);
        writer
            .write_i64::<LittleEndian>(ct_secs)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_i32::<LittleEndian>(ct_nanos)
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        writer
            .write_f64::<LittleEndian>(header.fix.latitude)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_f64::<LittleEndian>(header.fix.longitude)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_f64::<LittleEndian>(header.fix.altitude)
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        let (gps_secs, gps_nanos) = systemtime_to_secs_nanos(header.gps_time);
        writer
            .write_i64::<LittleEndian>(gps_secs)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_i32::<LittleEndian>(gps_nanos)
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        write_string_field(&mut writer, &header.device_descriptor)?;
        write_string_field(&mut writer, &header.collection_id)?;

        // sample_count isn't known until the payload is fully written, so
        // this field starts as a placeholder and is backfilled by seeking
        // to `sample_count_offset` in `close`.
        let sample_count_offset = writer
            .stream_position()
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        writer
            .write_u32::<LittleEndian>(0)
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        Ok(FrameWriter {
            file: writer,
            path,
            sample_count: 0,
            sample_count_offset,
        })
    }

    /// Appends one chunk's samples to the payload, in order (§4.6).
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        for sample in &chunk.samples {
            self.file
                .write_f32::<LittleEndian>(sample.i)
                .map_err(|e| ArgusError::Write(e.to_string()))?;
            self.file
                .write_f32::<LittleEndian>(sample.q)
                .map_err(|e| ArgusError::Write(e.to_string()))?;
        }
        self.sample_count = self
            .sample_count
            .saturating_add(chunk.samples.len() as u32);
        Ok(())
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Flushes, backfills the `sample_count` field, fsyncs, and returns the
    /// finalized path/count (§4.6). A partial file is left in place if this
    /// returns an error; there is no rename dance.
    pub fn close(mut self) -> Result<FinalizedCapture> {
        self.file.flush().map_err(|e| ArgusError::Write(e.to_string()))?;
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| ArgusError::Write(e.to_string()))?;

        file.seek(std::io::SeekFrom::Start(self.sample_count_offset))
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        file.write_u32::<LittleEndian>(self.sample_count)
            .map_err(|e| ArgusError::Write(e.to_string()))?;
        file.flush().map_err(|e| ArgusError::Write(e.to_string()))?;
        file.sync_all().map_err(|e| ArgusError::Write(e.to_string()))?;

        Ok(FinalizedCapture {
            path: self.path,
            sample_count: self.sample_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IqSample;
    use crate::position::FixQuality;
    use std::io::Read;
    use tempfile::tempdir;

    fn test_header() -> CaptureHeader {
        CaptureHeader {
            center_frequency: 915_000_000,
            sample_rate: 2_048_000,
            collection_time: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_754_589_730),
            fix: Fix {
                latitude: 35.533,
                longitude: -97.621,
                altitude: 365.0,
                quality: FixQuality::Fix,
                satellites: 7,
                timestamp: SystemTime::UNIX_EPOCH,
            },
            gps_time: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_754_589_730),
            device_descriptor: "rtl-sdr-01".to_string(),
            collection_id: "station-a-20250807".to_string(),
        }
    }

    #[test]
    fn header_then_payload_round_trips() {
        let dir = tempdir().unwrap();
        let header = test_header();
        let mut writer = FrameWriter::create(dir.path(), &header).unwrap();

        let mut chunk = Chunk::with_capacity(2);
        chunk.samples.push(IqSample { i: 0.5, q: -0.5 });
        chunk.samples.push(IqSample { i: 1.0, q: 0.0 });
        writer.write_chunk(&chunk).unwrap();

        let finalized = writer.close().unwrap();
        assert_eq!(finalized.sample_count, 2);
        assert!(finalized.path.ends_with("station-a-20250807.dat"));

        let mut bytes = Vec::new();
        File::open(&finalized.path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(&bytes[0..5], MAGIC);
        let version = u16::from_le_bytes([bytes[5], bytes[6]]);
        assert_eq!(version, FORMAT_VERSION);
        let center_freq = u64::from_le_bytes(bytes[7..15].try_into().unwrap());
        assert_eq!(center_freq, 915_000_000);
    }

    #[test]
    fn overlong_string_is_rejected() {
        let dir = tempdir().unwrap();
        let mut header = test_header();
        header.collection_id = "x".repeat(300);
        let result = FrameWriter::create(dir.path(), &header);
        assert!(matches!(result, Err(ArgusError::StringTooLong(_))));
    }

    #[test]
    fn existing_file_is_overwritten() {
        let dir = tempdir().unwrap();
        let header = test_header();
        let path = dir.path().join("station-a-20250807.dat");
        fs::write(&path, b"stale data").unwrap();

        let writer = FrameWriter::create(dir.path(), &header).unwrap();
        let finalized = writer.close().unwrap();
        let bytes = fs::read(&finalized.path).unwrap();
        assert_eq!(&bytes[0..5], MAGIC);
    }

    #[test]
    fn output_dir_created_if_absent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("deeper");
        let header = test_header();
        let writer = FrameWriter::create(&nested, &header).unwrap();
        writer.close().unwrap();
        assert!(nested.is_dir());
    }
}

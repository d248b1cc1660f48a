// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Position Source abstraction (C3): a timing/position reference yielded
//! on demand, with serial-NMEA, gpsd-like daemon-client, and fixed-operator
//! variants (§4.3).

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use log::debug;
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::{ArgusError, Result};

/// Validated position report (§3 "Fix").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub quality: FixQuality,
    pub satellites: u8,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixQuality {
    None,
    Fix,
    Differential,
    Manual,
}

impl Fix {
    /// §3 invariant: a fix with quality != none has in-range coordinates.
    pub fn is_valid(&self) -> bool {
        if self.quality == FixQuality::None {
            return false;
        }
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

pub trait PositionSource: Send {
    fn wait_for_fix(&self, cancel: &CancelToken, timeout: Duration) -> Result<Fix>;
    fn current_position(&self) -> Result<Fix>;
    fn close(&mut self);
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------
// Fixed
// ---------------------------------------------------------------------

/// Returns operator-supplied coordinates immediately (§4.3 "Fixed").
pub struct FixedSource {
    fix: Fix,
}

impl FixedSource {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ArgusError::InvalidCoordinate(format!(
                "lat={} lon={} out of range",
                latitude, longitude
            )));
        }
        Ok(FixedSource {
            fix: Fix {
                latitude,
                longitude,
                altitude,
                quality: FixQuality::Manual,
                satellites: 0,
                timestamp: SystemTime::now(),
            },
        })
    }
}

impl PositionSource for FixedSource {
    fn wait_for_fix(&self, _cancel: &CancelToken, _timeout: Duration) -> Result<Fix> {
        Ok(self.fix)
    }
    fn current_position(&self) -> Result<Fix> {
        Ok(self.fix)
    }
    fn close(&mut self) {}
}

// ---------------------------------------------------------------------
// Serial-NMEA
// ---------------------------------------------------------------------

/// Shared last-known fix, written by the serial reader thread and read by
/// any number of callers, per §4.3/§5's reader/writer discipline.
struct SharedFix {
    fix: RwLock<Option<Fix>>,
    parse_errors: AtomicU64,
}

/// Reads framed NMEA sentences from a serial device (§4.3 "Serial-NMEA").
pub struct NmeaSource {
    shared: Arc<SharedFix>,
    stop: CancelToken,
    reader_thread: Option<JoinHandle<()>>,
}

impl NmeaSource {
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let serial = serialport::new(port, baud)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| ArgusError::SerialOpen(format!("{}: {}", port, e)))?;

        let shared = Arc::new(SharedFix {
            fix: RwLock::new(None),
            parse_errors: AtomicU64::new(0),
        });
        let stop = CancelToken::new();

        let shared_for_thread = shared.clone();
        let stop_for_thread = stop.clone();
        let reader_thread = std::thread::spawn(move || {
            reader_loop(serial, shared_for_thread, stop_for_thread);
        });

        Ok(NmeaSource {
            shared,
            stop,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn parse_error_count(&self) -> u64 {
        self.shared.parse_errors.load(Ordering::Relaxed)
    }
}

fn reader_loop(serial: Box<dyn serialport::SerialPort>, shared: Arc<SharedFix>, stop: CancelToken) {
    let mut reader = BufReader::new(serial);
    let mut line = String::new();
    let mut last_date: Option<NaiveDate> = None;
    loop {
        if stop.is_cancelled() {
            return;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(_) => continue,
        }
        let sentence = line.trim();
        if sentence.is_empty() {
            continue;
        }
        match parse_sentence(sentence, &mut last_date) {
            Ok(Some(fix)) => {
                *shared.fix.write().unwrap() = Some(fix);
            }
            Ok(None) => {}
            Err(msg) => {
                shared.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("nmea: skipping unparsable sentence {:?}: {}", sentence, msg);
            }
        }
    }
}

fn nmea_checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    let Some((data, checksum)) = body.split_once('*') else {
        return false;
    };
    let Ok(expected) = u8::from_str_radix(checksum.trim(), 16) else {
        return false;
    };
    let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
    actual == expected
}

/// Parses a `$GPGGA`/`$GNGGA` (position/altitude/quality/satellites) or
/// `$GPRMC`/`$GNRMC` (time-of-day/date) sentence (§4.3). Returns `Ok(None)`
/// for sentence types this source ignores; `Err` for malformed input, which
/// the caller counts and discards (per-sentence, non-fatal, §7).
fn parse_sentence(sentence: &str, last_date: &mut Option<NaiveDate>) -> std::result::Result<Option<Fix>, String> {
    if !nmea_checksum_ok(sentence) {
        return Err("checksum mismatch".to_string());
    }
    let body = sentence
        .strip_prefix('$')
        .and_then(|s| s.split('*').next())
        .ok_or("malformed frame")?;
    let fields: Vec<&str> = body.split(',').collect();
    if fields.is_empty() {
        return Err("empty sentence".to_string());
    }
    let talker = fields[0];
    if talker.ends_with("RMC") {
        if fields.len() < 10 {
            return Err("RMC: too few fields".to_string());
        }
        *last_date = parse_ddmmyy(fields[9]);
        return Ok(None);
    }
    if talker.ends_with("GGA") {
        if fields.len() < 10 {
            return Err("GGA: too few fields".to_string());
        }
        let time_of_day = parse_hhmmss(fields[1]).ok_or("GGA: bad time field")?;
        let lat = parse_lat(fields[2], fields[3]).ok_or("GGA: bad latitude")?;
        let lon = parse_lon(fields[4], fields[5]).ok_or("GGA: bad longitude")?;
        let quality = parse_gga_quality(fields[6]);
        let satellites: u8 = fields[7].parse().unwrap_or(0);
        let altitude: f64 = fields[9].parse().unwrap_or(0.0);

        let date = last_date.unwrap_or_else(|| Utc::now().date_naive());
        let naive = date.and_time(time_of_day);
        let timestamp = UNIX_EPOCH + Duration::from_secs(naive.and_utc().timestamp() as u64);

        return Ok(Some(Fix {
            latitude: lat,
            longitude: lon,
            altitude,
            quality,
            satellites,
            timestamp,
        }));
    }
    Ok(None)
}

fn parse_gga_quality(field: &str) -> FixQuality {
    match field.trim() {
        "1" => FixQuality::Fix,
        "2" => FixQuality::Differential,
        _ => FixQuality::None,
    }
}

fn parse_hhmmss(field: &str) -> Option<NaiveTime> {
    if field.len() < 6 {
        return None;
    }
    let hh: u32 = field[0..2].parse().ok()?;
    let mm: u32 = field[2..4].parse().ok()?;
    let ss: f64 = field[4..].parse().ok()?;
    NaiveTime::from_hms_opt(hh, mm, ss.trunc() as u32)
}

fn parse_ddmmyy(field: &str) -> Option<NaiveDate> {
    if field.len() != 6 {
        return None;
    }
    let dd: u32 = field[0..2].parse().ok()?;
    let mm: u32 = field[2..4].parse().ok()?;
    let yy: i32 = field[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
}

fn parse_lat(field: &str, hemisphere: &str) -> Option<f64> {
    // ddmm.mmmm
    if field.len() < 4 {
        return None;
    }
    let deg: f64 = field[0..2].parse().ok()?;
    let min: f64 = field[2..].parse().ok()?;
    let mut v = deg + min / 60.0;
    if hemisphere.eq_ignore_ascii_case("S") {
        v = -v;
    }
    Some(v)
}

fn parse_lon(field: &str, hemisphere: &str) -> Option<f64> {
    // dddmm.mmmm
    if field.len() < 5 {
        return None;
    }
    let deg: f64 = field[0..3].parse().ok()?;
    let min: f64 = field[3..].parse().ok()?;
    let mut v = deg + min / 60.0;
    if hemisphere.eq_ignore_ascii_case("W") {
        v = -v;
    }
    Some(v)
}

impl PositionSource for NmeaSource {
    fn wait_for_fix(&self, cancel: &CancelToken, timeout: Duration) -> Result<Fix> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            cancel.check()?;
            if let Some(fix) = *self.shared.fix.read().unwrap() {
                if fix.is_valid() {
                    return Ok(fix);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(ArgusError::GpsTimeout(format!(
                    "no valid fix within {:?}",
                    timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout));
        }
    }

    fn current_position(&self) -> Result<Fix> {
        self.shared
            .fix
            .read()
            .unwrap()
            .filter(|f| f.is_valid())
            .ok_or_else(|| ArgusError::NoFix("no fix received yet".to_string()))
    }

    fn close(&mut self) {
        self.stop.cancel("upstream error");
        if let Some(h) = self.reader_thread.take() {
            let _ = h.join();
        }
    }
}

// ---------------------------------------------------------------------
// Daemon-client (gpsd-like)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TpvReport {
    class: String,
    #[serde(default)]
    mode: Option<u8>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    alt: Option<f64>,
}

/// Opens a TCP session to a gpsd-like coordinate daemon and negotiates a
/// streaming watch mode (§4.3 "Daemon-client").
pub struct DaemonSource {
    shared: Arc<SharedFix>,
    stop: CancelToken,
    reader_thread: Option<JoinHandle<()>>,
}

impl DaemonSource {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| ArgusError::DaemonConnect(format!("{}:{}: {}", host, port, e)))?;
        let mut writer = stream
            .try_clone()
            .map_err(|e| ArgusError::DaemonConnect(e.to_string()))?;
        writer
            .write_all(b"?WATCH={\"enable\":true,\"json\":true}\n")
            .map_err(|e| ArgusError::DaemonConnect(e.to_string()))?;

        let shared = Arc::new(SharedFix {
            fix: RwLock::new(None),
            parse_errors: AtomicU64::new(0),
        });
        let stop = CancelToken::new();

        let shared_for_thread = shared.clone();
        let stop_for_thread = stop.clone();
        let reader_thread = std::thread::spawn(move || {
            daemon_reader_loop(stream, shared_for_thread, stop_for_thread);
        });

        Ok(DaemonSource {
            shared,
            stop,
            reader_thread: Some(reader_thread),
        })
    }
}

fn daemon_reader_loop(stream: TcpStream, shared: Arc<SharedFix>, stop: CancelToken) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        if stop.is_cancelled() {
            return;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return,
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(report) = serde_json::from_str::<TpvReport>(trimmed) else {
            shared.parse_errors.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if report.class != "TPV" {
            continue;
        }
        let mode = report.mode.unwrap_or(0);
        if mode <= 1 {
            continue;
        }
        let (Some(lat), Some(lon)) = (report.lat, report.lon) else {
            continue;
        };
        let quality = if mode == 2 || mode == 3 {
            FixQuality::Fix
        } else {
            FixQuality::Differential
        };
        let fix = Fix {
            latitude: lat,
            longitude: lon,
            altitude: report.alt.unwrap_or(0.0),
            quality,
            satellites: 0,
            timestamp: SystemTime::now(),
        };
        *shared.fix.write().unwrap() = Some(fix);
    }
}

impl PositionSource for DaemonSource {
    fn wait_for_fix(&self, cancel: &CancelToken, timeout: Duration) -> Result<Fix> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            cancel.check()?;
            if let Some(fix) = *self.shared.fix.read().unwrap() {
                if fix.is_valid() {
                    return Ok(fix);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(ArgusError::GpsTimeout(format!(
                    "no valid fix within {:?}",
                    timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout));
        }
    }

    fn current_position(&self) -> Result<Fix> {
        self.shared
            .fix
            .read()
            .unwrap()
            .filter(|f| f.is_valid())
            .ok_or_else(|| ArgusError::NoFix("no fix received yet".to_string()))
    }

    fn close(&mut self) {
        self.stop.cancel("upstream error");
        if let Some(h) = self.reader_thread.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_source_returns_manual_quality() {
        let src = FixedSource::new(35.533, -97.621, 365.0).unwrap();
        let cancel = CancelToken::new();
        let fix = src.wait_for_fix(&cancel, Duration::from_secs(0)).unwrap();
        assert_eq!(fix.quality, FixQuality::Manual);
        assert_eq!(fix.satellites, 0);
        assert!(fix.is_valid());
    }

    #[test]
    fn fixed_source_rejects_out_of_range_coordinates() {
        let res = FixedSource::new(95.0, 0.0, 0.0);
        assert!(matches!(res, Err(ArgusError::InvalidCoordinate(_))));
    }

    #[test]
    fn zero_zero_is_valid_when_quality_is_fix() {
        let fix = Fix {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            quality: FixQuality::Fix,
            satellites: 4,
            timestamp: SystemTime::now(),
        };
        assert!(fix.is_valid());
    }

    #[test]
    fn none_quality_is_never_valid() {
        let fix = Fix {
            latitude: 35.0,
            longitude: -97.0,
            altitude: 0.0,
            quality: FixQuality::None,
            satellites: 8,
            timestamp: SystemTime::now(),
        };
        assert!(!fix.is_valid());
    }

    #[test]
    fn gga_checksum_validated() {
        let sentence = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let mut last_date = None;
        let result = parse_sentence(sentence, &mut last_date);
        // checksum in this well-known example sentence is correct.
        assert!(result.is_ok());
    }

    #[test]
    fn gga_bad_checksum_is_rejected() {
        let sentence = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00";
        let mut last_date = None;
        let result = parse_sentence(sentence, &mut last_date);
        assert!(result.is_err());
    }

    #[test]
    fn rmc_date_composes_with_later_gga_time() {
        let rmc = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        let gga = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let mut last_date = None;
        let _ = parse_sentence(rmc, &mut last_date);
        assert!(last_date.is_some());
        let fix = parse_sentence(gga, &mut last_date).unwrap().unwrap();
        assert_eq!(fix.quality, FixQuality::Fix);
    }
}

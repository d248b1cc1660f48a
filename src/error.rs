// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{error, fmt, result};

/// A result of a function that may return an `ArgusError`.
pub type Result<T> = result::Result<T, ArgusError>;

// Macro to create an error enum with From converters for each input error class.
macro_rules! define_errcodes {
    [ $typename:ident => $( $name:ident $(: $class:ty)? ),+ $(,)? ] => {
        #[derive(Debug)]
        pub enum $typename {
            $(
                $name $( ($class) )?,
            )+
        }

        impl fmt::Display for $typename {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match *self {
                    $(
                        $typename::$name(ref err) => write!(f, "{}: {}", stringify!($name), err),
                    )+
                }
            }
        }

        $( $(
            impl From<$class> for $typename {
                fn from(e: $class) -> Self {
                    $typename::$name(e)
                }
            } )?
        )+
    };
}

define_errcodes![
    ArgusError =>
    // --- wraps an external error source ---
    Usb: rusb::Error,
    SerialIo: serialport::Error,
    Io: std::io::Error,
    Json: serde_json::Error,

    // --- Configuration (§7) ---
    InvalidCoordinate: String,
    InvalidDeadline: String,
    MissingPositionSource: String,
    UnknownGainMode: String,

    // --- Device (§7) ---
    NotFound: String,
    Busy: String,
    Unsupported: String,
    DeviceRead: String,
    NoValidRate: String,

    // --- Position (§7) ---
    GpsTimeout: String,
    NoFix: String,
    SerialOpen: String,
    DaemonConnect: String,
    PositionParse: String,

    // --- Pipeline (§7) ---
    Cancelled: String,
    PipelineClosed: String,

    // --- I/O (§7) ---
    OutputOpen: String,
    Write: String,
    StringTooLong: String,
    FinalizeTimeout: String,

    // --- Timing (§7) ---
    CollectionTimeout: String,
    DeadlineOverrun: String,

    // Catch-all for low-level register/USB plumbing inherited from the
    // original driver, kept for messages that don't fit a taxonomy kind.
    RtlsdrErr: String
];

impl error::Error for ArgusError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ArgusError::Usb(e) => Some(e),
            ArgusError::SerialIo(e) => Some(e),
            ArgusError::Io(e) => Some(e),
            ArgusError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl ArgusError {
    /// `true` for the cancellation kind, which §7 says takes precedence over
    /// every other concurrently observed failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArgusError::Cancelled(_))
    }

    /// `true` for the timing kinds, which §7 ranks above device errors.
    pub fn is_timing(&self) -> bool {
        matches!(
            self,
            ArgusError::CollectionTimeout(_) | ArgusError::GpsTimeout(_) | ArgusError::FinalizeTimeout(_)
        )
    }
}

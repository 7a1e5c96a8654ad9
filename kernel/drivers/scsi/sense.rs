// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Parses fixed and descriptor format sense data.

/// The sense key, which describes the general
/// category of a failure.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xa,
    AbortedCommand = 0xb,
    VolumeOverflow = 0xd,
    Miscompare = 0xe,
    Completed = 0xf,
}

impl SenseKey {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n & 0x0f {
            0x0 => Some(SenseKey::NoSense),
            0x1 => Some(SenseKey::RecoveredError),
            0x2 => Some(SenseKey::NotReady),
            0x3 => Some(SenseKey::MediumError),
            0x4 => Some(SenseKey::HardwareError),
            0x5 => Some(SenseKey::IllegalRequest),
            0x6 => Some(SenseKey::UnitAttention),
            0x7 => Some(SenseKey::DataProtect),
            0x8 => Some(SenseKey::BlankCheck),
            0x9 => Some(SenseKey::VendorSpecific),
            0xa => Some(SenseKey::CopyAborted),
            0xb => Some(SenseKey::AbortedCommand),
            0xd => Some(SenseKey::VolumeOverflow),
            0xe => Some(SenseKey::Miscompare),
            0xf => Some(SenseKey::Completed),
            _ => None,
        }
    }
}

/// The additional sense code and qualifier.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdditionalSense {
    pub code: u8,
    pub qualifier: u8,
}

/// Parses sense data in either fixed (0x70/0x71)
/// or descriptor (0x72/0x73) format, returning the
/// sense key and additional sense, if present.
///
pub fn parse_sense_data(sense: &[u8]) -> (Option<SenseKey>, Option<AdditionalSense>) {
    if sense.is_empty() {
        return (None, None);
    }

    match sense[0] & 0x7f {
        0x70 | 0x71 => {
            let key = sense.get(2).and_then(|&b| SenseKey::from_u8(b));
            let additional = match (sense.get(12), sense.get(13)) {
                (Some(&code), Some(&qualifier)) => Some(AdditionalSense { code, qualifier }),
                _ => None,
            };

            (key, additional)
        }
        0x72 | 0x73 => {
            let key = sense.get(1).and_then(|&b| SenseKey::from_u8(b));
            let additional = match (sense.get(2), sense.get(3)) {
                (Some(&code), Some(&qualifier)) => Some(AdditionalSense { code, qualifier }),
                _ => None,
            };

            (key, additional)
        }
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_format() {
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x06;
        sense[12] = 0x29;
        sense[13] = 0x00;
        assert_eq!(
            parse_sense_data(&sense[..]),
            (
                Some(SenseKey::UnitAttention),
                Some(AdditionalSense {
                    code: 0x29,
                    qualifier: 0x00
                })
            )
        );

        // Truncated data still yields the key.
        assert_eq!(parse_sense_data(&sense[..4]), (Some(SenseKey::UnitAttention), None));
        assert_eq!(parse_sense_data(&[]), (None, None));
    }
}

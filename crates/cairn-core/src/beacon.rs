//! Beacon identity, advertisement parsing, and proximity zones.
//!
//! A beacon is identified by its immutable footprint: proximity UUID plus the
//! major/minor pair ([`BeaconId`]). Every received advertisement becomes one
//! [`Detection`] sample, which derives a distance estimate from signal
//! attenuation and buckets it into a [`Zone`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Manufacturer id under which iBeacon frames are advertised (Apple).
pub const IBEACON_COMPANY_ID: u16 = 0x004c;

/// Stable identity of one physical beacon: proximity UUID, major, minor.
///
/// Equality and hashing are structural; this is the primary key for
/// registrations, configuration entries, and watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconId {
    /// 128-bit proximity UUID advertised by the beacon.
    pub uuid: Uuid,

    /// Major group number.
    pub major: u16,

    /// Minor number within the major group.
    pub minor: u16,
}

impl BeaconId {
    /// Create a new beacon identity.
    #[must_use]
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self { uuid, major, minor }
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.uuid, self.major, self.minor)
    }
}

/// Discrete proximity bucket derived from a distance estimate.
///
/// The declaration order is the total order used by the smoothing rules:
/// `Immediate < Near < Far` (nearer is smaller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Estimated distance of at most one meter.
    Immediate,
    /// Estimated distance of one to ten meters.
    Near,
    /// Anything beyond ten meters.
    Far,
}

impl Zone {
    /// Bucket a distance estimate (meters) into a zone.
    #[must_use]
    pub fn from_distance(distance: f64) -> Self {
        if distance <= 1.0 {
            Self::Immediate
        } else if distance <= 10.0 {
            Self::Near
        } else {
            Self::Far
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Near => write!(f, "near"),
            Self::Far => write!(f, "far"),
        }
    }
}

/// One advertisement observation of a beacon.
///
/// Produced by the scanner, consumed immediately by the smoothing engine;
/// never retained beyond its derived values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// Which beacon was seen.
    pub beacon: BeaconId,

    /// Received signal strength in dBm.
    pub rssi: i16,

    /// Reference transmit power at one meter, in dBm, from the frame.
    pub tx_power: i16,

    /// When the advertisement was observed.
    pub at: Instant,
}

impl Detection {
    /// Create a detection sample.
    #[must_use]
    pub const fn new(beacon: BeaconId, rssi: i16, tx_power: i16, at: Instant) -> Self {
        Self {
            beacon,
            rssi,
            tx_power,
            at,
        }
    }

    /// Distance estimate in meters: `sqrt(10 ^ ((tx_power - rssi) / 10))`.
    #[must_use]
    pub fn distance(&self) -> f64 {
        10.0_f64
            .powf(f64::from(self.tx_power - self.rssi) / 10.0)
            .sqrt()
    }

    /// Proximity zone for this sample.
    #[must_use]
    pub fn zone(&self) -> Zone {
        Zone::from_distance(self.distance())
    }
}

/// Decoded iBeacon advertisement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IBeaconFrame {
    /// Beacon identity carried by the frame.
    pub beacon: BeaconId,

    /// Calibrated transmit power at one meter, in dBm.
    pub tx_power: i16,
}

impl IBeaconFrame {
    /// Parse the manufacturer-specific payload advertised under
    /// [`IBEACON_COMPANY_ID`].
    ///
    /// Layout: `0x02 0x15`, 16-byte proximity UUID, big-endian major and
    /// minor, one signed tx-power byte. Anything else returns `None`;
    /// malformed advertisements are dropped silently upstream.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 23 || data[0] != 0x02 || data[1] != 0x15 {
            return None;
        }
        let uuid = Uuid::from_slice(&data[2..18]).ok()?;
        let major = u16::from_be_bytes([data[18], data[19]]);
        let minor = u16::from_be_bytes([data[20], data[21]]);
        #[allow(clippy::cast_possible_wrap)]
        let tx_power = i16::from(data[22] as i8);
        Some(Self {
            beacon: BeaconId::new(uuid, major, minor),
            tx_power,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn frame_bytes(uuid: Uuid, major: u16, minor: u16, tx: i8) -> Vec<u8> {
        let mut data = vec![0x02, 0x15];
        data.extend_from_slice(uuid.as_bytes());
        data.extend_from_slice(&major.to_be_bytes());
        data.extend_from_slice(&minor.to_be_bytes());
        #[allow(clippy::cast_sign_loss)]
        data.push(tx as u8);
        data
    }

    #[test]
    fn test_zone_order_is_nearest_first() {
        assert!(Zone::Immediate < Zone::Near);
        assert!(Zone::Near < Zone::Far);
    }

    #[test]
    fn test_zone_thresholds() {
        assert_eq!(Zone::from_distance(0.3), Zone::Immediate);
        assert_eq!(Zone::from_distance(1.0), Zone::Immediate);
        assert_eq!(Zone::from_distance(1.01), Zone::Near);
        assert_eq!(Zone::from_distance(10.0), Zone::Near);
        assert_eq!(Zone::from_distance(10.5), Zone::Far);
        assert_eq!(Zone::from_distance(400.0), Zone::Far);
    }

    #[test]
    fn test_distance_at_reference_power_is_one_meter() {
        let beacon = BeaconId::new(Uuid::new_v4(), 1, 2);
        let det = Detection::new(beacon, -60, -60, Instant::now());
        assert!((det.distance() - 1.0).abs() < f64::EPSILON);
        assert_eq!(det.zone(), Zone::Immediate);
    }

    #[test]
    fn test_distance_grows_as_signal_fades() {
        let beacon = BeaconId::new(Uuid::new_v4(), 1, 2);
        let near = Detection::new(beacon, -70, -60, Instant::now());
        let far = Detection::new(beacon, -90, -60, Instant::now());
        assert!(near.distance() < far.distance());
        assert_eq!(near.zone(), Zone::Near);
        assert_eq!(far.zone(), Zone::Far);
    }

    #[test]
    fn test_beacon_id_is_a_usable_map_key() {
        let uuid = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert(BeaconId::new(uuid, 7, 9), "registered");
        assert_eq!(map.get(&BeaconId::new(uuid, 7, 9)), Some(&"registered"));
        assert_eq!(map.get(&BeaconId::new(uuid, 7, 10)), None);
    }

    #[test]
    fn test_beacon_id_serde_round_trip() {
        let id = BeaconId::new(Uuid::new_v4(), 513, 42);
        let json = serde_json::to_string(&id).unwrap();
        let back: BeaconId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_parse_valid_frame() {
        let uuid = Uuid::new_v4();
        let data = frame_bytes(uuid, 0x0102, 0xFFFE, -59);
        let frame = IBeaconFrame::parse(&data).unwrap();
        assert_eq!(frame.beacon, BeaconId::new(uuid, 0x0102, 0xFFFE));
        assert_eq!(frame.tx_power, -59);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let mut data = frame_bytes(Uuid::new_v4(), 1, 1, -59);
        data[0] = 0x01;
        assert!(IBeaconFrame::parse(&data).is_none());

        let mut data = frame_bytes(Uuid::new_v4(), 1, 1, -59);
        data[1] = 0x14;
        assert!(IBeaconFrame::parse(&data).is_none());
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let data = frame_bytes(Uuid::new_v4(), 1, 1, -59);
        assert!(IBeaconFrame::parse(&data[..22]).is_none());
        assert!(IBeaconFrame::parse(&[]).is_none());
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut data = frame_bytes(Uuid::new_v4(), 3, 4, 4);
        data.extend_from_slice(&[0xAA, 0xBB]);
        let frame = IBeaconFrame::parse(&data).unwrap();
        assert_eq!(frame.beacon.major, 3);
        assert_eq!(frame.tx_power, 4);
    }
}

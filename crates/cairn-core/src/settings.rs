//! Tag attribute map, validated settings, and the command codec.
//!
//! [`TagSettings`] is what callers hand to the monitor when registering a
//! beacon: a trigger policy for detection plus the values to push the next
//! time the tag shows up in configuration mode. Setters validate against the
//! tag's accepted ranges and silently ignore values outside them, keeping
//! whatever was set before. [`TagSettings::commands`] lowers the settings
//! into the [`WriteCommand`] batch the updater converges attribute by
//! attribute.

use uuid::{uuid, Uuid};

use crate::beacon::BeaconId;
use crate::gatt::CharacteristicId;
use crate::trigger::TriggerPolicy;

/// Primary configuration service, also advertised while the tag is in
/// configuration mode.
pub const CONFIGURATION_SERVICE: Uuid = uuid!("59ec0800-0b1e-4063-8b16-b00b50aa3a7e");

/// Auxiliary wake-up service carrying the sensor trigger attributes. Not
/// present on every firmware revision.
pub const WAKE_UP_SERVICE: Uuid = uuid!("59ec0802-0b1e-4063-8b16-b00b50aa3a7e");

/// Proximity UUID of the advertised frame.
pub const UUID_CHARACTERISTIC: Uuid = uuid!("59ec0a00-0b1e-4063-8b16-b00b50aa3a7e");
/// Minor of the advertised frame.
pub const MINOR_CHARACTERISTIC: Uuid = uuid!("59ec0a01-0b1e-4063-8b16-b00b50aa3a7e");
/// Major of the advertised frame.
pub const MAJOR_CHARACTERISTIC: Uuid = uuid!("59ec0a02-0b1e-4063-8b16-b00b50aa3a7e");
/// Advertising interval, little-endian u16 milliseconds.
pub const ADV_INTERVAL_CHARACTERISTIC: Uuid = uuid!("59ec0a04-0b1e-4063-8b16-b00b50aa3a7e");
/// Radio transmit power, one signed byte of dBm.
pub const TX_POWER_CHARACTERISTIC: Uuid = uuid!("59ec0a05-0b1e-4063-8b16-b00b50aa3a7e");
/// Sleep control: status byte plus little-endian u16 delay.
pub const SLEEP_CHARACTERISTIC: Uuid = uuid!("59ec0a07-0b1e-4063-8b16-b00b50aa3a7e");
/// Temperature wake-up window: status byte plus signed lower and upper
/// bounds.
pub const TEMPERATURE_CHARACTERISTIC: Uuid = uuid!("59ec0a08-0b1e-4063-8b16-b00b50aa3a7e");
/// Angular speed wake-up threshold: status byte plus little-endian f32.
pub const ANGULAR_SPEED_CHARACTERISTIC: Uuid = uuid!("59ec0a09-0b1e-4063-8b16-b00b50aa3a7e");
/// Acceleration wake-up threshold: status byte plus little-endian f32.
pub const ACCELERATION_CHARACTERISTIC: Uuid = uuid!("59ec0a0b-0b1e-4063-8b16-b00b50aa3a7e");

/// Transmit power levels the radio accepts, in dBm.
pub const TX_POWER_LEVELS: [i8; 15] = [
    -62, -52, -48, -44, -40, -36, -32, -30, -20, -16, -12, -8, -4, 0, 4,
];

/// Advertising intervals the tag accepts, in milliseconds.
pub const ADV_INTERVAL_RANGE: std::ops::RangeInclusive<u16> = 160..=16_000;

/// Acceleration thresholds the tag accepts, in m/s².
pub const ACCELERATION_RANGE: std::ops::RangeInclusive<f32> = 0.156_906_4..=156.906_4;

/// How a command's target value is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteIntent {
    /// Write these bytes verbatim.
    Payload(Vec<u8>),
    /// Patch the status byte of whatever is currently on the device,
    /// keeping the rest of the payload.
    Switch(bool),
}

/// One attribute the updater has to converge on a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    /// Service the attribute lives under.
    pub service: Uuid,
    /// The attribute itself.
    pub characteristic: Uuid,
    /// Target value, literal or patched.
    pub intent: WriteIntent,
}

impl WriteCommand {
    /// Command writing `bytes` verbatim.
    #[must_use]
    pub const fn payload(service: Uuid, characteristic: Uuid, bytes: Vec<u8>) -> Self {
        Self {
            service,
            characteristic,
            intent: WriteIntent::Payload(bytes),
        }
    }

    /// Command flipping the attribute's status byte.
    #[must_use]
    pub const fn switch(service: Uuid, characteristic: Uuid, enable: bool) -> Self {
        Self {
            service,
            characteristic,
            intent: WriteIntent::Switch(enable),
        }
    }

    /// The attribute this command targets.
    #[must_use]
    pub const fn characteristic_id(&self) -> CharacteristicId {
        CharacteristicId::new(self.service, self.characteristic)
    }

    /// Value this command wants on the device, given the value just read
    /// from it.
    #[must_use]
    pub fn desired_value(&self, current: &[u8]) -> Vec<u8> {
        match &self.intent {
            WriteIntent::Payload(bytes) => bytes.clone(),
            WriteIntent::Switch(enable) => {
                let mut value = current.to_vec();
                if self.characteristic == SLEEP_CHARACTERISTIC {
                    // Sleep is only ever switched off this way; delays go
                    // through the payload form.
                    if let Some(byte) = value.first_mut() {
                        *byte = 0;
                    }
                    if let Some(byte) = value.get_mut(1) {
                        *byte = 0;
                    }
                } else if let Some(byte) = value.first_mut() {
                    *byte = u8::from(*enable);
                }
                value
            }
        }
    }
}

/// Detection policy and configuration payload for one registered beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSettings {
    beacon: BeaconId,
    policy: TriggerPolicy,
    sleep_delay: u16,
    temperature: Option<(i8, i8)>,
    acceleration: Option<f32>,
    angular_speed: Option<f32>,
    tx_power: Option<i8>,
    adv_interval: Option<u16>,
}

impl TagSettings {
    /// Settings for `beacon` with the default policy, no sleep delay, and
    /// every optional attribute disabled.
    #[must_use]
    pub fn new(beacon: BeaconId) -> Self {
        Self {
            beacon,
            policy: TriggerPolicy::default(),
            sleep_delay: 0,
            temperature: None,
            acceleration: None,
            angular_speed: None,
            tx_power: None,
            adv_interval: None,
        }
    }

    /// The beacon these settings apply to.
    #[must_use]
    pub const fn beacon(&self) -> BeaconId {
        self.beacon
    }

    /// The trigger policy used for detection events.
    #[must_use]
    pub const fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    /// Select the trigger policy.
    pub fn set_policy(&mut self, policy: TriggerPolicy) {
        self.policy = policy;
    }

    /// Configured sleep delay; 0 means sleep stays disabled.
    #[must_use]
    pub const fn sleep_delay(&self) -> u16 {
        self.sleep_delay
    }

    /// Set the sleep delay. Accepted range is 1..=65534; anything outside
    /// clears the delay to 0.
    pub fn set_sleep_delay(&mut self, delay: u16) {
        self.sleep_delay = if delay > 0 && delay < u16::MAX { delay } else { 0 };
    }

    /// Configured temperature wake-up window in °C, as (lower, upper).
    #[must_use]
    pub const fn temperature_window(&self) -> Option<(i8, i8)> {
        self.temperature
    }

    /// Enable the temperature wake-up with a window of `lower..upper` °C.
    /// Ignored unless `upper` is strictly greater than `lower`.
    pub fn set_temperature_window(&mut self, lower: i8, upper: i8) {
        if upper > lower {
            self.temperature = Some((lower, upper));
        }
    }

    /// Disable the temperature wake-up.
    pub fn disable_temperature(&mut self) {
        self.temperature = None;
    }

    /// Configured acceleration wake-up threshold in m/s².
    #[must_use]
    pub const fn acceleration_threshold(&self) -> Option<f32> {
        self.acceleration
    }

    /// Enable the acceleration wake-up. Ignored outside
    /// [`ACCELERATION_RANGE`].
    pub fn set_acceleration_threshold(&mut self, threshold: f32) {
        if ACCELERATION_RANGE.contains(&threshold) {
            self.acceleration = Some(threshold);
        }
    }

    /// Disable the acceleration wake-up.
    pub fn disable_acceleration(&mut self) {
        self.acceleration = None;
    }

    /// Configured angular speed wake-up threshold in degrees per second.
    #[must_use]
    pub const fn angular_speed_threshold(&self) -> Option<f32> {
        self.angular_speed
    }

    /// Enable the angular speed wake-up. Ignored unless the threshold is
    /// finite and positive.
    pub fn set_angular_speed_threshold(&mut self, threshold: f32) {
        if threshold.is_finite() && threshold > 0.0 {
            self.angular_speed = Some(threshold);
        }
    }

    /// Disable the angular speed wake-up.
    pub fn disable_angular_speed(&mut self) {
        self.angular_speed = None;
    }

    /// Configured transmit power in dBm.
    #[must_use]
    pub const fn tx_power(&self) -> Option<i8> {
        self.tx_power
    }

    /// Set the transmit power. Ignored unless `dbm` is one of
    /// [`TX_POWER_LEVELS`].
    pub fn set_tx_power(&mut self, dbm: i8) {
        if TX_POWER_LEVELS.contains(&dbm) {
            self.tx_power = Some(dbm);
        }
    }

    /// Configured advertising interval in milliseconds.
    #[must_use]
    pub const fn advertising_interval(&self) -> Option<u16> {
        self.adv_interval
    }

    /// Set the advertising interval. Ignored outside [`ADV_INTERVAL_RANGE`].
    pub fn set_advertising_interval(&mut self, millis: u16) {
        if ADV_INTERVAL_RANGE.contains(&millis) {
            self.adv_interval = Some(millis);
        }
    }

    /// Lower the settings into the updater's command batch.
    ///
    /// Transmit power and advertising interval only appear when set. Sleep
    /// is always written as a full payload (status byte, then the delay
    /// little-endian). Each sensor wake-up is written as a full payload
    /// when enabled and as an off-switch otherwise, so a previously
    /// configured tag gets its leftovers turned off.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn commands(&self) -> Vec<WriteCommand> {
        let mut commands = Vec::new();

        if let Some(dbm) = self.tx_power {
            commands.push(WriteCommand::payload(
                CONFIGURATION_SERVICE,
                TX_POWER_CHARACTERISTIC,
                vec![dbm as u8],
            ));
        }
        if let Some(millis) = self.adv_interval {
            commands.push(WriteCommand::payload(
                CONFIGURATION_SERVICE,
                ADV_INTERVAL_CHARACTERISTIC,
                millis.to_le_bytes().to_vec(),
            ));
        }

        let delay = self.sleep_delay.to_le_bytes();
        commands.push(WriteCommand::payload(
            WAKE_UP_SERVICE,
            SLEEP_CHARACTERISTIC,
            vec![1, delay[0], delay[1]],
        ));

        commands.push(match self.temperature {
            Some((lower, upper)) => WriteCommand::payload(
                WAKE_UP_SERVICE,
                TEMPERATURE_CHARACTERISTIC,
                vec![1, lower as u8, upper as u8],
            ),
            None => WriteCommand::switch(WAKE_UP_SERVICE, TEMPERATURE_CHARACTERISTIC, false),
        });
        commands.push(match self.acceleration {
            Some(threshold) => {
                let mut bytes = vec![1];
                bytes.extend_from_slice(&threshold.to_le_bytes());
                WriteCommand::payload(WAKE_UP_SERVICE, ACCELERATION_CHARACTERISTIC, bytes)
            }
            None => WriteCommand::switch(WAKE_UP_SERVICE, ACCELERATION_CHARACTERISTIC, false),
        });
        commands.push(match self.angular_speed {
            Some(threshold) => {
                let mut bytes = vec![1];
                bytes.extend_from_slice(&threshold.to_le_bytes());
                WriteCommand::payload(WAKE_UP_SERVICE, ANGULAR_SPEED_CHARACTERISTIC, bytes)
            }
            None => WriteCommand::switch(WAKE_UP_SERVICE, ANGULAR_SPEED_CHARACTERISTIC, false),
        });

        commands
    }
}

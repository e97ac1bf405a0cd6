use crate::bus::bluez::DEVICE_IFACE;
use crate::bus::{PropertyValue, RawEvent};
use crate::error::MalformedEventError;
use chrono::{DateTime, Utc};

/// One report of a detected device.
///
/// Field values are taken verbatim from the daemon's device attributes: `address` from
/// `Address`, `display_name` from `Alias`, `signal_strength` (dBm) from `RSSI`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub address: String,
    pub display_name: String,
    pub signal_strength: i16,
    pub observed_at: DateTime<Utc>,
}

impl Sighting {
    pub(crate) fn from_event(
        event: &RawEvent,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, MalformedEventError> {
        let device = event
            .interfaces
            .get(DEVICE_IFACE)
            .ok_or(MalformedEventError::NotADevice)?;

        let text = |name: &'static str| match device.get(name) {
            Some(PropertyValue::Str(value)) => Ok(value.clone()),
            Some(_) => Err(MalformedEventError::WrongType(name)),
            None => Err(MalformedEventError::MissingAttribute(name)),
        };

        let address = text("Address")?;
        let display_name = text("Alias")?;
        let signal_strength = match device.get("RSSI") {
            Some(PropertyValue::Int(rssi)) => {
                i16::try_from(*rssi).map_err(|_| MalformedEventError::WrongType("RSSI"))?
            }
            Some(_) => return Err(MalformedEventError::WrongType("RSSI")),
            None => return Err(MalformedEventError::MissingAttribute("RSSI")),
        };

        Ok(Self {
            address,
            display_name,
            signal_strength,
            observed_at,
        })
    }
}

//! Output device catalogue.
//!
//! Enumeration goes through cpal regardless of which mixer is active; the
//! list always contains a synthetic "Default" entry so a device selector is
//! never empty, and a "No sound" sentinel exists for the degraded state.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, warn};

/// Which mixer family a device entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// Placeholder for the "No sound" sentinel.
    #[default]
    None,
    /// Tempo backend (kira).
    Tempo,
    /// Simple-mix backend (cpal software mixer).
    Mix,
}

/// One selectable audio output.
#[derive(Debug, Clone)]
pub struct OutputDevice {
    /// Position in the enumeration; -1 for synthetic entries.
    pub id: i32,
    pub name: String,
    pub is_default: bool,
    pub enabled: bool,
    pub driver: DriverKind,
}

impl OutputDevice {
    /// The synthetic always-present default entry.
    pub fn default_sentinel(driver: DriverKind) -> Self {
        Self {
            id: -1,
            name: "Default".to_string(),
            is_default: true,
            enabled: true,
            driver,
        }
    }

    /// The degraded-state sentinel shown when no device works at all.
    pub fn no_sound() -> Self {
        Self {
            id: 0,
            name: "No sound".to_string(),
            is_default: true,
            enabled: true,
            driver: DriverKind::None,
        }
    }

    pub fn is_no_sound(&self) -> bool {
        self.driver == DriverKind::None
    }
}

/// Enumerate hardware outputs, prepending the synthetic default sentinel.
///
/// Enumeration failures degrade to just the sentinel; they are logged but
/// never propagate, since a selector with one entry beats a crash.
pub fn enumerate(driver: DriverKind) -> Vec<OutputDevice> {
    let mut devices = vec![OutputDevice::default_sentinel(driver)];

    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(iter) => {
            for (i, device) in iter.enumerate() {
                let name = match device.name() {
                    Ok(name) => name,
                    Err(e) => {
                        warn!("skipping unnameable output device: {e}");
                        continue;
                    }
                };
                let enabled = device.default_output_config().is_ok();
                devices.push(OutputDevice {
                    id: i as i32,
                    is_default: Some(&name) == default_name.as_ref(),
                    name,
                    enabled,
                    driver,
                });
            }
        }
        Err(e) => warn!("output device enumeration failed: {e}"),
    }

    debug!("enumerated {} output device(s)", devices.len());
    devices
}

/// Resolve a persisted device-name preference against the catalogue.
///
/// Exact name match first, then case-insensitive substring match (device
/// names drift across driver updates), then the default device.
pub fn resolve_wanted<'a>(
    devices: &'a [OutputDevice],
    wanted_name: &str,
) -> Option<&'a OutputDevice> {
    if !wanted_name.is_empty() {
        if let Some(found) = devices
            .iter()
            .find(|d| d.enabled && d.name == wanted_name)
        {
            return Some(found);
        }

        let wanted_lower = wanted_name.to_lowercase();
        if let Some(found) = devices
            .iter()
            .find(|d| d.enabled && d.name.to_lowercase().contains(&wanted_lower))
        {
            debug!(
                "no exact match for device '{wanted_name}', using '{}'",
                found.name
            );
            return Some(found);
        }

        warn!("could not find sound device '{wanted_name}', falling back to default");
    }

    devices.iter().find(|d| d.enabled && d.is_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> Vec<OutputDevice> {
        vec![
            OutputDevice::default_sentinel(DriverKind::Mix),
            OutputDevice {
                id: 0,
                name: "Speakers (Realtek High Definition Audio)".to_string(),
                is_default: false,
                enabled: true,
                driver: DriverKind::Mix,
            },
            OutputDevice {
                id: 1,
                name: "HDMI Output".to_string(),
                is_default: false,
                enabled: false,
                driver: DriverKind::Mix,
            },
        ]
    }

    #[test]
    fn exact_match_wins() {
        let devices = catalogue();
        let found = resolve_wanted(&devices, "HDMI Output");
        // exact name but disabled: falls through to substring, then default
        assert_eq!(found.unwrap().name, "Default");

        let found = resolve_wanted(&devices, "Speakers (Realtek High Definition Audio)");
        assert_eq!(found.unwrap().id, 0);
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let devices = catalogue();
        let found = resolve_wanted(&devices, "realtek");
        assert_eq!(found.unwrap().id, 0);
    }

    #[test]
    fn empty_preference_gives_default() {
        let devices = catalogue();
        let found = resolve_wanted(&devices, "");
        assert!(found.unwrap().is_default);
    }

    #[test]
    fn unknown_preference_gives_default() {
        let devices = catalogue();
        let found = resolve_wanted(&devices, "Bluetooth Earbuds");
        assert!(found.unwrap().is_default);
    }

    #[test]
    fn sentinels() {
        let default = OutputDevice::default_sentinel(DriverKind::Tempo);
        assert!(default.is_default && default.enabled);
        assert!(!default.is_no_sound());

        let none = OutputDevice::no_sound();
        assert!(none.is_no_sound());
        assert_eq!(none.name, "No sound");
    }
}

// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Port enumeration.
//!
//! A port is described by an open-ended attribute map; nothing in the rest
//! of the library assumes a fixed schema. The live source walks the host's
//! serial class devices, but the snapshot can be replaced wholesale through
//! [`SCAN_OVERRIDE_ENV`] or an injected [`ScanSource`], which is how the
//! tests and the tracker reconnect scenarios drive enumeration.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, Result};

/// Environment variable holding a JSON array of attribute maps used in
/// place of live enumeration. Read once, at [`Scanner`] construction.
pub const SCAN_OVERRIDE_ENV: &str = "OK_SERIAL_SCAN_OVERRIDE";

/// Attribute names every provider is encouraged to fill when it can.
///
/// The set is open-ended; these are only the keys scoped match terms can
/// resolve eagerly at compile time.
pub const WELL_KNOWN_KEYS: &[&str] = &[
    "device",
    "name",
    "description",
    "hwid",
    "vid",
    "pid",
    "vid_pid",
    "serial_number",
    "location",
    "manufacturer",
    "product",
    "interface",
    "subsystem",
    "device_path",
    "usb_device_path",
    "usb_interface_path",
];

/// Immutable attribute map describing one present serial port.
///
/// Keys are normalized to lowercase on construction; lookups are
/// case-insensitive, values are the provider's raw strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAttributes {
    map: BTreeMap<String, String>,
}

impl PortAttributes {
    pub fn new<I, K, V>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let map = attrs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        PortAttributes { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// The filesystem path of the device node, when the provider knew it.
    pub fn device(&self) -> Option<&str> {
        self.get("device")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// One-line human summary, used by the CLI listing.
    pub fn summary(&self) -> String {
        let device = self.device().unwrap_or("<no device>");
        match (self.get("description"), self.get("hwid")) {
            (Some(desc), Some(hwid)) => format!("{device} - {desc} ({hwid})"),
            (Some(desc), None) => format!("{device} - {desc}"),
            (None, Some(hwid)) => format!("{device} ({hwid})"),
            (None, None) => device.to_string(),
        }
    }
}

/// A source of enumeration snapshots.
pub trait ScanSource: Send + Sync {
    fn scan(&self) -> Vec<PortAttributes>;
}

impl<F> ScanSource for F
where
    F: Fn() -> Vec<PortAttributes> + Send + Sync,
{
    fn scan(&self) -> Vec<PortAttributes> {
        self()
    }
}

/// A fixed snapshot, returned verbatim on every scan.
pub struct FixedScan {
    ports: Vec<PortAttributes>,
}

impl ScanSource for FixedScan {
    fn scan(&self) -> Vec<PortAttributes> {
        self.ports.clone()
    }
}

/// Live enumeration from the host.
pub struct SystemScan;

impl ScanSource for SystemScan {
    fn scan(&self) -> Vec<PortAttributes> {
        sysfs::scan()
    }
}

/// Handle on a chosen [`ScanSource`].
///
/// Construction decides the source once; [`SCAN_OVERRIDE_ENV`] is never
/// re-read per call.
#[derive(Clone)]
pub struct Scanner {
    source: Arc<dyn ScanSource>,
}

impl Scanner {
    /// Live enumeration, unless [`SCAN_OVERRIDE_ENV`] is set, in which case
    /// its JSON payload becomes the fixed snapshot. A malformed payload is
    /// reported rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        match std::env::var(SCAN_OVERRIDE_ENV) {
            Ok(payload) => Self::from_override(&payload),
            Err(_) => Ok(Scanner {
                source: Arc::new(SystemScan),
            }),
        }
    }

    /// Parses a [`SCAN_OVERRIDE_ENV`]-style JSON payload into a fixed
    /// scanner.
    pub fn from_override(payload: &str) -> Result<Self> {
        let maps: Vec<BTreeMap<String, String>> = serde_json::from_str(payload)
            .map_err(|e| Error::Config(format!("bad scan override: {e}")))?;
        Ok(Self::fixed(maps.into_iter().map(PortAttributes::new)))
    }

    pub fn fixed<I: IntoIterator<Item = PortAttributes>>(ports: I) -> Self {
        Scanner {
            source: Arc::new(FixedScan {
                ports: ports.into_iter().collect(),
            }),
        }
    }

    pub fn from_source(source: Arc<dyn ScanSource>) -> Self {
        Scanner { source }
    }

    /// Point-in-time snapshot of present ports. No ordering guarantee
    /// beyond stability within one call.
    pub fn scan(&self) -> Vec<PortAttributes> {
        self.source.scan()
    }
}

#[cfg(target_os = "linux")]
mod sysfs {
    use super::PortAttributes;
    use std::fs;
    use std::path::{Path, PathBuf};

    const TTY_CLASS: &str = "/sys/class/tty";

    /// Walks `/sys/class/tty`, keeping entries with a backing `device/`
    /// node (which filters out virtual consoles), and fills USB metadata
    /// from the nearest ancestor carrying `idVendor`/`idProduct`.
    pub(super) fn scan() -> Vec<PortAttributes> {
        let Ok(entries) = fs::read_dir(TTY_CLASS) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let class_path = entry.path();
            if !class_path.join("device").exists() {
                continue;
            }
            out.push(describe(&name, &class_path));
        }
        out
    }

    fn describe(name: &str, class_path: &Path) -> PortAttributes {
        let mut attrs: Vec<(String, String)> = vec![
            ("device".into(), format!("/dev/{name}")),
            ("name".into(), name.to_string()),
        ];
        let device_path = fs::canonicalize(class_path.join("device")).ok();
        if let Some(dev) = &device_path {
            attrs.push(("device_path".into(), dev.display().to_string()));
            if let Some(subsystem) = read_link_basename(&dev.join("subsystem")) {
                attrs.push(("subsystem".into(), subsystem));
            }
            if let Some(usb_device) = find_usb_device(dev) {
                fill_usb(&mut attrs, dev, &usb_device);
            }
        }
        let description = attrs
            .iter()
            .find(|(k, _)| k == "product")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| name.to_string());
        attrs.push(("description".into(), description));
        attrs.push(("hwid".into(), hwid(&attrs)));
        PortAttributes::new(attrs)
    }

    /// Nearest ancestor directory carrying USB device descriptors.
    fn find_usb_device(start: &Path) -> Option<PathBuf> {
        let mut cursor = start.to_path_buf();
        for _ in 0..6 {
            if cursor.join("idVendor").exists() && cursor.join("idProduct").exists() {
                return Some(cursor);
            }
            cursor = cursor.parent()?.to_path_buf();
        }
        None
    }

    fn fill_usb(attrs: &mut Vec<(String, String)>, interface: &Path, device: &Path) {
        let vid = read_trimmed(&device.join("idVendor"));
        let pid = read_trimmed(&device.join("idProduct"));
        if let (Some(vid), Some(pid)) = (&vid, &pid) {
            attrs.push(("vid_pid".into(), format!("{vid}:{pid}")));
        }
        if let Some(vid) = vid {
            attrs.push(("vid".into(), vid));
        }
        if let Some(pid) = pid {
            attrs.push(("pid".into(), pid));
        }
        for (key, file) in [
            ("serial_number", "serial"),
            ("manufacturer", "manufacturer"),
            ("product", "product"),
        ] {
            if let Some(value) = read_trimmed(&device.join(file)) {
                attrs.push((key.into(), value));
            }
        }
        if let Some(location) = read_trimmed(&device.join("devpath")) {
            attrs.push(("location".into(), location));
        }
        if let Some(iface) = read_trimmed(&interface.join("../interface")) {
            attrs.push(("interface".into(), iface));
        }
        attrs.push(("usb_device_path".into(), device.display().to_string()));
        if let Some(parent) = interface.parent() {
            attrs.push(("usb_interface_path".into(), parent.display().to_string()));
        }
    }

    fn hwid(attrs: &[(String, String)]) -> String {
        let get = |key: &str| attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        match get("vid_pid") {
            Some(vid_pid) => match get("serial_number") {
                Some(serial) => format!("USB VID:PID={vid_pid} SER={serial}"),
                None => format!("USB VID:PID={vid_pid}"),
            },
            None => get("device_path").unwrap_or_default().to_string(),
        }
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        let raw = fs::read_to_string(path).ok()?;
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn read_link_basename(path: &Path) -> Option<String> {
        let target = fs::read_link(path).ok()?;
        Some(target.file_name()?.to_string_lossy().into_owned())
    }
}

#[cfg(not(target_os = "linux"))]
mod sysfs {
    use super::PortAttributes;

    pub(super) fn scan() -> Vec<PortAttributes> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_to_lowercase() {
        let attrs = PortAttributes::new([("Device", "/dev/ttyACM0"), ("VID", "239a")]);
        assert_eq!(attrs.get("device"), Some("/dev/ttyACM0"));
        assert_eq!(attrs.get("DEVICE"), Some("/dev/ttyACM0"));
        assert_eq!(attrs.get("vid"), Some("239a"));
        assert_eq!(attrs.device(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn values_stay_case_sensitive() {
        let attrs = PortAttributes::new([("manufacturer", "Adafruit")]);
        assert_eq!(attrs.get("manufacturer"), Some("Adafruit"));
    }

    #[test]
    fn override_payload_round_trips() {
        let scanner = Scanner::from_override(
            r#"[{"Device": "/dev/ttyACM0", "manufacturer": "Adafruit"},
                {"device": "/dev/ttyUSB3"}]"#,
        )
        .unwrap();
        let ports = scanner.scan();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].device(), Some("/dev/ttyACM0"));
        assert_eq!(ports[0].get("manufacturer"), Some("Adafruit"));
        assert_eq!(ports[1].device(), Some("/dev/ttyUSB3"));
    }

    #[test]
    fn bad_override_payload_is_a_config_error() {
        assert!(matches!(
            Scanner::from_override("not json"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Scanner::from_override(r#"{"device": "scalar, not array"}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn closure_sources_work() {
        let scanner = Scanner::from_source(Arc::new(|| {
            vec![PortAttributes::new([("device", "/dev/ttyS9")])]
        }));
        assert_eq!(scanner.scan().len(), 1);
    }

    #[test]
    fn summary_prefers_description_and_hwid() {
        let attrs = PortAttributes::new([
            ("device", "/dev/ttyACM0"),
            ("description", "Feather M4"),
            ("hwid", "USB VID:PID=239a:8014"),
        ]);
        assert_eq!(
            attrs.summary(),
            "/dev/ttyACM0 - Feather M4 (USB VID:PID=239a:8014)"
        );
    }
}

//! USB device identity
//!
//! Immutable information read once from the device descriptor, and the
//! canonical identity string under which persistent state is kept.

use uuid::Uuid;

/// Descriptor-level device information. Read once per arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub manufacturer: String,
    pub product_name: String,
}

impl UsbDeviceInfo {
    /// Stable identity string, suitable as a filesystem key:
    /// `vvvv-serial-productName` with non-identifier characters mapped
    /// to `-`. Devices without a serial get a synthesized one so that
    /// two serial-less models still land on distinct state files.
    pub fn ident(&self) -> String {
        let serial = if self.serial.is_empty() {
            self.synthesized_serial()
        } else {
            self.serial.clone()
        };
        canonicalize(&format!("{:04x}-{}-{}", self.vendor, serial, self.product_name))
    }

    /// Manufacturer and product, with the manufacturer dropped when the
    /// product name already starts with it.
    pub fn mfg_and_product(&self) -> String {
        if !self.product_name.starts_with(&self.manufacturer) {
            format!("{} {}", self.manufacturer, self.product_name)
        } else {
            self.product_name.clone()
        }
    }

    /// Short human-readable description, stored in the device state file.
    pub fn comment(&self) -> String {
        format!("{} serial={}", self.mfg_and_product(), self.serial)
    }

    /// Deterministic UUID for devices that do not advertise one.
    pub fn uuid(&self) -> String {
        let seed = format!(
            "{:04x}:{:04x}:{}:{}",
            self.vendor, self.product, self.serial, self.product_name
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
            .hyphenated()
            .to_string()
    }

    fn synthesized_serial(&self) -> String {
        let seed = format!("{:04x}:{:04x}:{}", self.vendor, self.product, self.product_name);
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes());
        uuid.simple().to_string()[..12].to_string()
    }
}

/// Map everything outside `[0-9a-zA-Z_-]` to `-`. Idempotent.
pub fn canonicalize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '0'..='9' | 'a'..='z' | 'A'..='Z' | '-' | '_' => c,
            _ => '-',
        })
        .collect()
}

/// Strip an optional `urn:uuid:` prefix and bring a UUID to canonical
/// lowercase hyphenated form. Returns `None` when the rest does not parse.
pub fn uuid_normalize(s: &str) -> Option<String> {
    let s = s.trim();
    let s = s
        .strip_prefix("urn:uuid:")
        .or_else(|| s.strip_prefix("URN:UUID:"))
        .unwrap_or(s);
    Uuid::parse_str(s)
        .ok()
        .map(|u| u.hyphenated().to_string())
}

use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Device-tree serial first (unique per SoC), machine-id as fallback.
pub const IDENTITY_SOURCES: [&str; 2] = [
    "/sys/firmware/devicetree/base/serial-number",
    "/etc/machine-id",
];

/// Placeholder replaced by the identity in hostname and topic templates.
pub const UID_PLACEHOLDER: &str = "{uid}";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("No usable hardware identifier found in {0:?}")]
    Unavailable(Vec<String>),
}

/// Hardware-derived identifier, lowercase hex. Used as MQTT client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn detect() -> Result<Self, IdentityError> {
        let sources: Vec<&Path> = IDENTITY_SOURCES.iter().map(Path::new).collect();
        Self::from_sources(&sources)
    }

    /// Returns the identity from the first readable, non-empty source.
    pub fn from_sources(sources: &[&Path]) -> Result<Self, IdentityError> {
        for source in sources {
            match fs::read(source) {
                Ok(raw) => match Self::from_raw(&raw) {
                    Some(identity) => {
                        info!("Device identity {} (from {:?})", identity, source);
                        return Ok(identity);
                    }
                    None => debug!("Identity source {:?} is empty", source),
                },
                Err(e) => debug!("Identity source {:?} not readable: {}", source, e),
            }
        }

        Err(IdentityError::Unavailable(
            sources
                .iter()
                .map(|source| source.display().to_string())
                .collect(),
        ))
    }

    /// Normalizes a raw identifier. Hex text is lowercased, anything else is
    /// hex-encoded byte for byte.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let trimmed = trim_identifier(raw);
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.iter().all(u8::is_ascii_hexdigit) {
            let text = String::from_utf8_lossy(trimmed).to_ascii_lowercase();
            Some(Self(text))
        } else {
            Some(Self(hex::encode(trimmed)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replaces every `{uid}` in `template`.
    pub fn expand(&self, template: &str) -> String {
        template.replace(UID_PLACEHOLDER, &self.0)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn trim_identifier(raw: &[u8]) -> &[u8] {
    let is_padding = |b: &u8| *b == 0 || b.is_ascii_whitespace();
    let start = raw.iter().position(|b| !is_padding(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !is_padding(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

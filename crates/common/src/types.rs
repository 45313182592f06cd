//! Core types shared between Fleetdeck components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote session client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Remote desktop (xfreerdp)
    Rdp,
    /// Screen share (VNC viewer)
    Vnc,
    /// Shell in a terminal emulator
    Ssh,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rdp => "rdp",
            Self::Vnc => "vnc",
            Self::Ssh => "ssh",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a session process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Requested,
    Spawned,
    Running,
    Failed,
    Terminated,
}

/// Horizontal slot on the owning monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScreenPosition {
    Left,
    #[default]
    Center,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Named fraction of the owning monitor used when sizing a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizePreset {
    #[default]
    Full,
    Half,
    Quarter,
}

impl SizePreset {
    /// Width/height fractions of the monitor resolution
    pub fn fractions(&self) -> (f64, f64) {
        match self {
            Self::Full => (0.95, 0.95),
            Self::Half => (0.48, 0.95),
            Self::Quarter => (0.48, 0.47),
        }
    }
}

/// Window geometry in pixels. Serialized as a `"WxH"` string, the form
/// used in fleet files and preset labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Serialize for Geometry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Geometry {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| crate::Error::InvalidInput(format!("bad geometry: {}", s)))?;
        Ok(Self {
            width: w
                .trim()
                .parse()
                .map_err(|_| crate::Error::InvalidInput(format!("bad geometry: {}", s)))?,
            height: h
                .trim()
                .parse()
                .map_err(|_| crate::Error::InvalidInput(format!("bad geometry: {}", s)))?,
        })
    }
}

/// Result of scanning one host for reachability and services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedHost {
    pub address: String,
    pub hostname: String,
    /// Coarse OS guess derived from the open service set
    pub os_guess: String,
    pub online: bool,
    pub rdp: bool,
    pub vnc: bool,
    pub ssh: bool,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_parse_roundtrip() {
        let g: Geometry = "1717x1402".parse().unwrap();
        assert_eq!(g, Geometry::new(1717, 1402));
        assert_eq!(g.to_string(), "1717x1402");
        assert_eq!(serde_json::to_string(&g).unwrap(), "\"1717x1402\"");
        let back: Geometry = serde_json::from_str("\"1717x1402\"").unwrap();
        assert_eq!(back, g);
        assert!("1717".parse::<Geometry>().is_err());
        assert!("ax b".parse::<Geometry>().is_err());
    }

    #[test]
    fn test_size_preset_fractions() {
        assert_eq!(SizePreset::Full.fractions(), (0.95, 0.95));
        assert_eq!(SizePreset::Quarter.fractions(), (0.48, 0.47));
    }

    #[test]
    fn test_session_kind_serde() {
        let k: SessionKind = serde_json::from_str("\"rdp\"").unwrap();
        assert_eq!(k, SessionKind::Rdp);
        assert_eq!(serde_json::to_string(&SessionKind::Vnc).unwrap(), "\"vnc\"");
    }
}

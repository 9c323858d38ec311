//! Audio device enumeration and name matching.

use serde::{Deserialize, Serialize};

use super::PortDirection;

/// Metadata about one capture or playback device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// Human-readable device name reported by the host.
    pub name: String,
    pub direction: PortDirection,
    /// Whether this is the host's default device for `direction`.
    pub is_default: bool,
    /// Default channel count, when the host reports one.
    pub channels: Option<u16>,
    /// Default sample rate in Hz, when the host reports one.
    pub sample_rate: Option<u32>,
}

/// Does `candidate` satisfy the user's `preferred` device name?
///
/// Exact matches win; otherwise a case-insensitive substring match is
/// accepted so `"usb"` finds `"USB Audio CODEC"`.
pub fn device_name_matches(candidate: &str, preferred: &str) -> bool {
    let preferred = preferred.trim();
    if preferred.is_empty() {
        return false;
    }
    if candidate == preferred {
        return true;
    }
    candidate
        .to_ascii_lowercase()
        .contains(&preferred.to_ascii_lowercase())
}

/// Pick the best match for `preferred` among `names`, preferring exact
/// matches over substring matches. Returns the index into `names`.
pub fn best_match<'a, I>(names: I, preferred: &str) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut substring = None;
    for (idx, name) in names.into_iter().enumerate() {
        if name == preferred.trim() {
            return Some(idx);
        }
        if substring.is_none() && device_name_matches(name, preferred) {
            substring = Some(idx);
        }
    }
    substring
}

/// Order ports for display: capture before playback, defaults first, then by
/// name.
pub fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by_key(|p| {
        (
            p.direction == PortDirection::Playback,
            !p.is_default,
            p.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, direction: PortDirection, is_default: bool) -> PortInfo {
        PortInfo {
            name: name.into(),
            direction,
            is_default,
            channels: Some(2),
            sample_rate: Some(48_000),
        }
    }

    #[test]
    fn matches_exact_and_case_insensitive_substring() {
        assert!(device_name_matches("USB Audio CODEC", "USB Audio CODEC"));
        assert!(device_name_matches("USB Audio CODEC", "usb"));
        assert!(!device_name_matches("HDA Intel PCH", "usb"));
        assert!(!device_name_matches("anything", "   "));
    }

    #[test]
    fn best_match_prefers_exact_name() {
        let names = ["system capture 2", "system", "system capture"];
        assert_eq!(best_match(names, "system"), Some(1));
        assert_eq!(best_match(names, "capture"), Some(0));
        assert_eq!(best_match(names, "missing"), None);
    }

    #[test]
    fn sorts_capture_first_then_defaults() {
        let mut ports = vec![
            port("zeta out", PortDirection::Playback, false),
            port("alpha out", PortDirection::Playback, true),
            port("beta in", PortDirection::Capture, false),
            port("gamma in", PortDirection::Capture, true),
        ];
        sort_ports(&mut ports);
        let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["gamma in", "beta in", "alpha out", "zeta out"]);
    }
}

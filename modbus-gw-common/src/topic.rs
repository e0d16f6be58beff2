//! Topic builders for device state, commands and discovery.
//!
//! Topics follow Zenoh key-expression syntax: chunks separated by `/`,
//! `*` matching exactly one chunk and `**` matching zero or more chunks.

use serde::{Deserialize, Serialize};

/// Prefix shared by every discovery message.
pub const DISCOVERY_PREFIX: &str = "discovery";

/// How a device's root topic is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicFormat {
    /// `<domain>/<device>` (default)
    #[default]
    DeviceUid,
    /// `<domain>/<gateway uid>-<device>`
    GwDeviceUid,
    /// `<domain>/[<room>/]<alias or device>`
    Fancy,
}

impl TopicFormat {
    /// Build the root topic for a device.
    ///
    /// # Example
    /// ```
    /// use modbus_gw_common::topic::TopicFormat;
    ///
    /// let root = TopicFormat::DeviceUid.device_root("modbus-gw", "gw01", "boiler", None, None);
    /// assert_eq!(root, "modbus-gw/boiler");
    ///
    /// let root = TopicFormat::GwDeviceUid.device_root("modbus-gw", "gw01", "boiler", None, None);
    /// assert_eq!(root, "modbus-gw/gw01-boiler");
    ///
    /// let root = TopicFormat::Fancy.device_root("home", "gw01", "boiler", Some("Heater"), Some("cellar"));
    /// assert_eq!(root, "home/cellar/Heater");
    /// ```
    pub fn device_root(
        &self,
        domain: &str,
        gateway_uid: &str,
        device: &str,
        alias: Option<&str>,
        room: Option<&str>,
    ) -> String {
        match self {
            TopicFormat::DeviceUid => format!("{}/{}", domain, device),
            TopicFormat::GwDeviceUid => format!("{}/{}-{}", domain, gateway_uid, device),
            TopicFormat::Fancy => {
                let name = alias.unwrap_or(device);
                match room {
                    Some(room) => format!("{}/{}/{}", domain, room, name),
                    None => format!("{}/{}", domain, name),
                }
            }
        }
    }
}

/// Broadcast handshake topic.
pub fn handshake_topic() -> String {
    format!("{}/handshake", DISCOVERY_PREFIX)
}

/// Directed reply channel for handshakes addressed to `uid`.
///
/// # Example
/// ```
/// use modbus_gw_common::topic::handshake_thread_topic;
///
/// assert_eq!(handshake_thread_topic("boiler-1"), "discovery/handshake/boiler-1");
/// ```
pub fn handshake_thread_topic(uid: &str) -> String {
    format!("{}/handshake/{}", DISCOVERY_PREFIX, uid)
}

/// Heartbeat topic.
pub fn alive_topic() -> String {
    format!("{}/alive", DISCOVERY_PREFIX)
}

/// Departure topic.
pub fn death_topic() -> String {
    format!("{}/death", DISCOVERY_PREFIX)
}

/// Subscription patterns a discovery participant with `uid` listens on:
/// all broadcast kinds plus replies threaded to itself.
pub fn discovery_patterns(uid: &str) -> [String; 2] {
    [
        format!("{}/*", DISCOVERY_PREFIX),
        format!("{}/*/{}", DISCOVERY_PREFIX, uid),
    ]
}

/// Check whether `topic` matches a key-expression `pattern`.
///
/// # Example
/// ```
/// use modbus_gw_common::topic::topic_matches;
///
/// assert!(topic_matches("modbus-gw/boiler/*", "modbus-gw/boiler/set"));
/// assert!(!topic_matches("modbus-gw/boiler/*", "modbus-gw/boiler"));
/// assert!(topic_matches("discovery/**", "discovery/handshake/x"));
/// ```
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let topic: Vec<&str> = topic.split('/').collect();
    matches_chunks(&pattern, &topic)
}

fn matches_chunks(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"**", rest)) => (0..=topic.len()).any(|skip| matches_chunks(rest, &topic[skip..])),
        Some((head, rest)) => match topic.split_first() {
            Some((chunk, tail)) => (*head == "*" || head == chunk) && matches_chunks(rest, tail),
            None => false,
        },
    }
}

/// Split a command topic into its device root and command name.
///
/// Returns `None` unless `topic` is exactly one chunk below `root`.
pub fn command_of<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(root)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

//! Integration tests for modbus-gw-common library.

use modbus_gw_common::{
    TopicFormat, command_of, discovery_patterns, handshake_thread_topic, topic_matches,
};

#[test]
fn test_device_topic_roundtrip() {
    let root = TopicFormat::DeviceUid.device_root("modbus-gw", "gw01", "boiler", None, None);

    // Commands published below the root are recognised and attributed to it
    for command in ["set", "get", "refresh", "command"] {
        let topic = format!("{}/{}", root, command);
        assert!(topic_matches(&format!("{}/*", root), &topic));
        assert_eq!(command_of(&root, &topic), Some(command));
    }

    // The state topic itself is not a command
    assert!(!topic_matches(&format!("{}/*", root), &root));
}

#[test]
fn test_handshake_reply_reaches_only_its_thread() {
    let [broadcast, directed] = discovery_patterns("boiler-1");
    let thread = handshake_thread_topic("boiler-1");
    let other = handshake_thread_topic("pump-2");

    assert!(!topic_matches(&broadcast, &thread));
    assert!(topic_matches(&directed, &thread));
    assert!(!topic_matches(&directed, &other));
    assert!(topic_matches(&broadcast, "discovery/handshake"));
}

#[test]
fn test_fancy_format_without_room_or_alias() {
    let root = TopicFormat::Fancy.device_root("home", "gw01", "pump", None, None);
    assert_eq!(root, "home/pump");
}

#[test]
fn test_distinct_formats_can_collide() {
    // A device named "gw01-pump" under device-uid collides with "pump" under gw-device-uid
    let a = TopicFormat::DeviceUid.device_root("d", "gw01", "gw01-pump", None, None);
    let b = TopicFormat::GwDeviceUid.device_root("d", "gw01", "pump", None, None);
    assert_eq!(a, b);
}

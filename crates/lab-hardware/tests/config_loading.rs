use std::io::Write;

use lab_hardware::{ConfigError, HardwareConfig};

#[test]
fn loads_hardware_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[devices]]
id = "laser"
name = "Cobolt 06-01"
driver = "cobolt0601"

[devices.config]
max_power_w = 0.05

[devices.config.connection]
type = "serial"
port = "/dev/ttyUSB1"
"#
    )
    .unwrap();

    let config = HardwareConfig::load(file.path()).unwrap();
    assert_eq!(config.devices.len(), 1);
    let laser = &config.devices[0];
    assert_eq!(laser.driver, "cobolt0601");
    assert_eq!(laser.config["max_power_w"].as_float(), Some(0.05));
    assert_eq!(
        laser.config["connection"]["port"].as_str(),
        Some("/dev/ttyUSB1")
    );
}

#[test]
fn malformed_file_is_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[[devices]\nid = ").unwrap();
    assert!(matches!(
        HardwareConfig::load(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn example_config_validates_against_default_factories() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/hardware.example.toml");
    let config = HardwareConfig::load(path).unwrap();
    let registry = lab_hardware::DeviceRegistry::with_default_factories();
    for device in &config.devices {
        if let Err(e) = registry.validate(device) {
            panic!("{} failed validation: {e}", device.id);
        }
    }
    assert_eq!(config.enabled_devices().count(), config.devices.len() - 1);
}

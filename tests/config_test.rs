use slv_lludp::config::{load_network_settings, CircuitSettings, NetworkProfile, NetworkSettings, XferSettings};
use std::time::Duration;

#[tokio::test]
async fn test_network_profiles() {
    for profile in [NetworkProfile::Lan, NetworkProfile::Internet, NetworkProfile::Lossy] {
        let settings = NetworkSettings::for_profile(profile);

        assert_eq!(settings.profile, profile);
        assert!(settings.circuit.retransmit_timeout_ms > 0);
        assert_eq!(settings.circuit.dedup_window, 256);
        assert_eq!(settings.xfer.window, 1);

        match profile {
            NetworkProfile::Lan => {
                assert_eq!(settings.circuit.retransmit_timeout(), Duration::from_millis(500));
                assert_eq!(settings.circuit.ping_interval(), Duration::from_secs(2));
            }
            NetworkProfile::Internet => {
                assert_eq!(settings.circuit, CircuitSettings::default());
            }
            NetworkProfile::Lossy => {
                assert_eq!(settings.circuit.max_retries, 5);
                assert_eq!(settings.circuit.missed_pings_close, 5);
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_defaults() {
    let settings = NetworkSettings::default();
    assert_eq!(settings.profile, NetworkProfile::Internet);
    assert_eq!(settings.circuit.retransmit_timeout(), Duration::from_secs(3));
    assert_eq!(settings.circuit.max_retries, 3);
    assert_eq!(settings.circuit.max_acks_per_packet, 255);
    assert_eq!(settings.circuit.rtt_weight, 0.125);
    assert_eq!(settings.xfer, XferSettings::default());
    assert_eq!(settings.xfer.chunk_size, 1000);
    assert_eq!(settings.logging.level, "info");
}

#[tokio::test]
async fn test_partial_toml_keeps_defaults() {
    let text = r#"
        profile = "Lossy"

        [circuit]
        retransmit_timeout_ms = 1000
        max_retries = 4

        [xfer]
        window = 3

        [transport]
        bind_addr = "127.0.0.1:13000"
    "#;
    let settings = NetworkSettings::from_toml_str(text).unwrap();
    assert_eq!(settings.profile, NetworkProfile::Lossy);
    assert_eq!(settings.circuit.retransmit_timeout_ms, 1000);
    assert_eq!(settings.circuit.max_retries, 4);
    assert_eq!(settings.circuit.dedup_window, 256);
    assert_eq!(settings.xfer.window, 3);
    assert_eq!(settings.xfer.chunk_size, 1000);
    assert_eq!(settings.transport.bind_addr.port(), 13000);
}

#[tokio::test]
async fn test_invalid_toml_is_an_error() {
    assert!(NetworkSettings::from_toml_str("[circuit]\nmax_retries = \"many\"").is_err());
}

#[tokio::test]
async fn test_settings_persistence() {
    let dir = std::env::temp_dir().join(format!("slv-lludp-config-{}", std::process::id()));
    let path = dir.join("lludp.toml");

    let mut original = NetworkSettings::for_profile(NetworkProfile::Lan);
    original.logging.log_file = Some("lludp.log".to_string());
    original.save(&path).unwrap();

    let loaded = NetworkSettings::load(&path).unwrap();
    assert_eq!(loaded, original);
    assert_eq!(load_network_settings(&path), original);

    let _ = std::fs::remove_dir_all(&dir);
    assert_eq!(load_network_settings(&path), NetworkSettings::default());
}

#[tokio::test]
async fn test_profile_key_selects_preset() {
    let settings = NetworkSettings::from_toml_str("profile = \"Lan\"").unwrap();
    assert_eq!(settings, NetworkSettings::for_profile(NetworkProfile::Lan));
    assert_eq!(settings.circuit.retransmit_timeout(), Duration::from_millis(500));
    assert_eq!(settings.circuit.ping_interval(), Duration::from_secs(2));

    // explicit keys still win over the preset
    let text = "profile = \"Lan\"\n\n[circuit]\nmax_retries = 4\n";
    let settings = NetworkSettings::from_toml_str(text).unwrap();
    assert_eq!(settings.circuit.max_retries, 4);
    assert_eq!(settings.circuit.retransmit_timeout(), Duration::from_millis(500));
    assert_eq!(settings.circuit.ping_interval(), Duration::from_secs(2));
}

#[tokio::test]
async fn test_out_of_range_values_are_rejected() {
    NetworkSettings::default().validate().unwrap();
    for profile in [NetworkProfile::Lan, NetworkProfile::Internet, NetworkProfile::Lossy] {
        NetworkSettings::for_profile(profile).validate().unwrap();
    }

    assert!(NetworkSettings::from_toml_str("[xfer]\nchunk_size = 70000").is_err());
    assert!(NetworkSettings::from_toml_str("[xfer]\nchunk_size = 4").is_err());
    assert!(NetworkSettings::from_toml_str("[xfer]\nwindow = 0").is_err());
    assert!(NetworkSettings::from_toml_str("[circuit]\nmax_acks_per_packet = 300").is_err());
    assert!(NetworkSettings::from_toml_str("[xfer]\nchunk_size = 65535").is_ok());
}

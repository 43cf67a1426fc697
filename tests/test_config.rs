// tests/test_config.rs — HogConfig as loaded from JSON, through to a session.

use hogpipe::error::{GeometryError, HogError};
use hogpipe::geometry::HogConfig;
use hogpipe::image::Image;
use hogpipe::pipeline::{CpuDevice, HogPipeline};

#[test]
fn partial_json_fills_in_defaults() {
    let cfg: HogConfig = serde_json::from_str(r#"{ "cell_size": 8, "tile_size": [2, 2] }"#).unwrap();
    assert_eq!(cfg.cell_size, 8);
    assert_eq!(cfg.tile_size, [2, 2]);
    assert_eq!(cfg.insensitive_bin_count, HogConfig::default().insensitive_bin_count);
    assert_eq!(cfg.truncation, HogConfig::default().truncation);

    let settings = cfg.settings_for(64, 48).unwrap();
    assert_eq!(settings.cell_count(), [8, 6]);
}

#[test]
fn json_config_drives_a_pipeline() {
    let cfg: HogConfig = serde_json::from_str(
        r#"{ "cell_size": 4, "insensitive_bin_count": 6, "truncation": 0.3, "tile_size": [4, 2] }"#,
    )
    .unwrap();
    let mut p = HogPipeline::new(CpuDevice::new().unwrap());
    p.configure_for(&cfg, 32, 16).unwrap();
    let desc = p.process(&Image::from_fn(32, 16, |x, _| (x * 8) as u8), None).unwrap();
    assert_eq!(desc.channels_per_block(), 22);
    assert_eq!(desc.cell_count(), [8, 4]);
}

#[test]
fn config_survives_a_json_round_trip() {
    let cfg = HogConfig {
        cell_size: 6,
        insensitive_bin_count: 12,
        truncation: 0.15,
        tile_size: [3, 1],
    };
    let back: HogConfig = serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn invalid_values_are_caught_at_setup() {
    let cfg: HogConfig = serde_json::from_str(r#"{ "truncation": -1.0 }"#).unwrap();
    assert!(matches!(cfg.settings_for(32, 32), Err(GeometryError::InvalidTruncation(_))));

    let cfg: HogConfig = serde_json::from_str(r#"{ "tile_size": [3, 4] }"#).unwrap();
    let mut p = HogPipeline::new(CpuDevice::new().unwrap());
    let err = p.configure_for(&cfg, 32, 32).unwrap_err();
    assert!(matches!(err, HogError::InvalidGeometry(GeometryError::TileMismatch { .. })), "{err}");
}

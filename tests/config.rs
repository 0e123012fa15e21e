use std::fs;

use twincam::capture::PixelFormat;
use twincam::{CaptureBackend, Config, DisplayBackend};

#[test]
fn file_then_environment_override_defaults() {
    let path = std::env::temp_dir().join(format!("twincam-{}.toml", std::process::id()));
    fs::write(
        &path,
        r#"
[capture]
backend = "synthetic"
width = 1280
height = 720
format = "nv12"

[display]
backend = "virtual"
connector = 42
"#,
    )
    .unwrap();

    std::env::set_var("TWINCAM__CAPTURE__WIDTH", "800");
    std::env::set_var("TWINCAM__PIPELINE__FRAME_LIMIT", "12");
    let loaded = Config::load(Some(path.as_path()));
    std::env::remove_var("TWINCAM__CAPTURE__WIDTH");
    std::env::remove_var("TWINCAM__PIPELINE__FRAME_LIMIT");
    fs::remove_file(&path).unwrap();
    let config = loaded.unwrap();

    assert_eq!(config.capture.backend, CaptureBackend::Synthetic);
    assert_eq!(config.capture.width, 800);
    assert_eq!(config.capture.height, 720);
    assert_eq!(config.capture.format, PixelFormat::Nv12);
    assert_eq!(config.capture.buffer_count, 4);
    assert_eq!(config.display.backend, DisplayBackend::Virtual);
    assert_eq!(config.display.connector, Some(42));
    assert_eq!(config.pipeline.frame_limit, Some(12));
    assert_eq!(config.pipeline_options().frame_limit, Some(12));
}

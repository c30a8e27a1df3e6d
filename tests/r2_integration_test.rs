use std::sync::Arc;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use tokio::time::{sleep, Duration};

use layerpress::config::EngineConfig;
use layerpress::engine::ConversionEngine;
use layerpress::models::job::{InputDescriptor, InputKind, JobStatus};
use layerpress::models::options::ConversionOptions;
use layerpress::services::storage::{R2Client, R2Config};

/// Integration test: full conversion flow against a live R2/S3 bucket.
///
/// Verifies end to end:
/// 1. Engine construction from environment configuration
/// 2. Job submission, worker processing and artifact upload
/// 3. Retention sweep deleting the stored object
///
/// Note: this requires reachable S3-compatible credentials configured via
/// `LAYERPRESS_R2_*` environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test r2_integration_test -- --ignored
async fn test_full_r2_flow() {
    let store_config = R2Config::from_env().expect("Failed to load R2 config");
    let store = Arc::new(R2Client::from_config(&store_config).expect("Failed to initialize R2"));

    let mut config = EngineConfig::from_env().expect("Failed to load engine config");
    config.retention_secs = 0;
    config.artifact_ttl_secs = 0;

    let engine = ConversionEngine::with_default_codec(config, store);

    // Submit a small PNG
    let img = RgbaImage::from_fn(32, 32, |x, y| Rgba([(x * 8) as u8, (y * 8) as u8, 128, 255]));
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(img.as_raw(), 32, 32, ExtendedColorType::Rgba8)
        .expect("png fixture");

    let id = engine
        .submit(
            png.clone(),
            InputDescriptor::new("integration.png", png.len() as u64, InputKind::SingleAsset),
            ConversionOptions::default(),
        )
        .expect("Failed to submit job");

    // Poll until the worker finishes the round trip through R2
    let mut snapshot = engine.get_job(id).expect("Job not found");
    for _ in 0..240 {
        if snapshot.status.is_terminal() {
            break;
        }
        sleep(Duration::from_millis(500)).await;
        snapshot = engine.get_job(id).expect("Job not found");
    }

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.progress, 100);
    let artifact = snapshot.items[0]
        .outcome
        .artifact()
        .expect("No artifact on converted item");

    assert!(artifact.byte_size > 0);

    // The sweep removes the stored object once retention has elapsed
    let report = engine.run_cleanup().await;
    assert_eq!(report.purged_jobs, 1);
    assert_eq!(report.purged_artifacts, 1);
    assert_eq!(report.reclaimed_bytes, artifact.byte_size);

    println!("✅ R2 integration test passed");
}

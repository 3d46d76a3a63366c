//! End-to-end pipeline scenarios.
//!
//! These tests drive a real GPU and load the compiled compute shaders
//! from `shaders/`, so they are ignored by default. Run them with
//! `cargo test -- --ignored --test-threads=1` on a host with a Vulkan
//! ICD; the Vulkan context is process-global, hence the single thread.

use vksift::{Config, Feature, Instance};

fn ensure_vulkan() {
    // Repeated loads fail by design; the first one wins.
    let _ = vksift::load_vulkan();
}

/// `pixel(x, y) = (x + y) mod 256`.
fn gradient_image(width: u32, height: u32) -> Vec<u8> {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| ((x + y) % 256) as u8))
        .collect()
}

fn synthetic_grid_features(count: u32) -> Vec<Feature> {
    (0..count)
        .map(|index| {
            let mut feature = Feature {
                x: (index % 10) as f32 * 10.0,
                y: (index / 10) as f32 * 10.0,
                orig_x: (index % 10) * 10,
                orig_y: (index / 10) * 10,
                scale_index: 0,
                sigma: 1.6,
                scale_factor: 1.0,
                theta: 0.0,
                value: 0.04,
                descriptor: [0; 128],
            };
            for (i, byte) in feature.descriptor.iter_mut().enumerate() {
                *byte = ((i as u32 + index) % 256) as u8;
            }
            feature
        })
        .collect()
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn detection_finds_features_on_a_gradient() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    let (width, height) = (640u32, 480u32);
    instance.detect(&gradient_image(width, height), width, height, 0);

    let count = instance.feature_count(0);
    assert!(count > 0, "no features detected on the gradient image");

    let features = instance.download_features(0);
    assert_eq!(features.len(), count as usize);
    for feature in &features {
        assert!(feature.x >= 0.0 && feature.x < width as f32);
        assert!(feature.y >= 0.0 && feature.y < height as f32);
        assert!(
            feature.descriptor.iter().any(|&byte| byte != 0),
            "all-zero descriptor at ({}, {})",
            feature.x,
            feature.y
        );
    }
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn detection_is_repeatable_on_identical_input() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    let image = gradient_image(640, 480);
    instance.detect(&image, 640, 480, 0);
    instance.detect(&image, 640, 480, 1);

    assert_eq!(instance.feature_count(0), instance.feature_count(1));
    let features_a = instance.download_features(0);
    let features_b = instance.download_features(1);
    assert_eq!(
        bytemuck_bytes(&features_a),
        bytemuck_bytes(&features_b),
        "identical input produced diverging feature sets"
    );
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn matching_a_buffer_against_its_twin_yields_zero_distances() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    let image = gradient_image(640, 480);
    instance.detect(&image, 640, 480, 0);
    instance.detect(&image, 640, 480, 1);

    instance.match_features(0, 1);
    let matches = instance.download_matches();
    assert_eq!(matches.len(), instance.match_count() as usize);
    assert!(!matches.is_empty());

    let exact = matches.iter().filter(|record| record.dist_a_b1 == 0.0).count();
    assert!(
        exact * 100 >= matches.len() * 99,
        "only {}/{} self-matches at distance zero",
        exact,
        matches.len()
    );
    for record in &matches {
        assert!(record.idx_b1 != record.idx_b2);
        assert!(record.dist_a_b1 <= record.dist_a_b2);
        assert!(record.dist_a_b1 >= 0.0);
    }
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn uploaded_features_round_trip_and_self_match() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    let features = synthetic_grid_features(100);
    instance.upload_features(&features, 0);
    instance.upload_features(&features, 1);

    assert_eq!(instance.feature_count(0), 100);
    let downloaded = instance.download_features(0);
    assert_eq!(bytemuck_bytes(&downloaded), bytemuck_bytes(&features));

    instance.match_features(0, 1);
    let matches = instance.download_matches();
    assert_eq!(matches.len(), 100);
    for record in &matches {
        assert_eq!(record.idx_a, record.idx_b1);
        assert_eq!(record.dist_a_b1, 0.0);
    }
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn resolution_changes_reuse_the_allocated_memory() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    instance.detect(&gradient_image(320, 240), 320, 240, 0);
    assert_eq!(instance.octave_resolution(0), (640, 480));

    instance.detect(&gradient_image(1280, 720), 1280, 720, 0);
    assert_eq!(instance.octave_resolution(0), (2560, 1440));
    assert!(instance.feature_count(0) > 0);
}

#[test]
#[ignore = "needs a Vulkan device and the compiled compute shaders"]
fn pyramid_layers_can_be_downloaded() {
    ensure_vulkan();
    let mut instance = Instance::new(&Config::default()).unwrap();

    instance.detect(&gradient_image(640, 480), 640, 480, 0);

    let octaves = instance.octave_count();
    assert!(octaves > 0);
    let (width, height) = instance.octave_resolution(0);
    let blurred = instance.download_scale_space_image(0, 0);
    assert_eq!(blurred.len(), (width * height) as usize);
    assert!(blurred.iter().any(|&texel| texel != 0.0));

    let dog = instance.download_dog_image(0, 0);
    assert_eq!(dog.len(), (width * height) as usize);
}

fn bytemuck_bytes(features: &[Feature]) -> &[u8] {
    bytemuck::cast_slice(features)
}

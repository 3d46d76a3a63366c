use log::error;

use crate::error::{Error, Result};

/// Texel format used for the Gaussian and Difference-of-Gaussian pyramid
/// images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidPrecision {
    /// 16-bit floating point texels (faster, slightly noisier keypoints).
    Float16,
    /// 32-bit floating point texels.
    Float32,
}

/// Instance creation parameters.
///
/// `Config::default()` reproduces the reference SIFT parameters from
/// Lowe's paper together with sizing defaults suited to 1080p inputs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum input size in pixels (`max_width * max_height`) accepted by
    /// [`Instance::detect`](crate::Instance::detect).
    pub input_image_max_size: u32,
    /// Number of GPU-resident SIFT buffers reserved by the instance.
    /// Matching needs at least two.
    pub sift_buffer_count: u32,
    /// Maximum number of features stored by one SIFT buffer.
    pub max_nb_sift_per_buffer: u32,
    /// Build the scale-space from a 2x upscaled input. Finds more features
    /// at the cost of processing time.
    pub use_input_upsampling: bool,
    /// Number of scale-space octaves. Zero lets the implementation derive
    /// it from the input resolution.
    pub nb_octaves: u8,
    /// Number of scales per octave.
    pub nb_scales_per_octave: u8,
    /// Assumed blur level of the input image.
    pub input_image_blur_level: f32,
    /// Blur level of the scale-space seed scale.
    pub seed_scale_sigma: f32,
    /// Minimum normalized DoG intensity for a keypoint. Divided by
    /// `nb_scales_per_octave` before use.
    pub intensity_threshold: f32,
    /// Edge-response rejection threshold.
    pub edge_threshold: f32,
    /// Maximum number of orientations (and therefore descriptors) emitted
    /// per keypoint. Zero means no limit.
    pub max_nb_orientations_per_keypoint: u8,
    /// Index of the GPU to use, as listed by
    /// [`available_gpus`](crate::available_gpus). Negative values select
    /// the highest-scoring device automatically.
    pub gpu_device_index: i32,
    /// Use hardware bilinear samplers to halve the texture fetches of the
    /// Gaussian blur passes.
    pub use_hardware_interpolated_blur: bool,
    /// Pyramid image precision.
    pub pyramid_precision: PyramidPrecision,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_image_max_size: 1920 * 1080,
            // minimum buffer count that supports the matching operation
            sift_buffer_count: 2,
            max_nb_sift_per_buffer: 100_000,
            use_input_upsampling: true,
            nb_octaves: 0,
            nb_scales_per_octave: 3,
            input_image_blur_level: 0.5,
            seed_scale_sigma: 1.6,
            intensity_threshold: 0.04,
            edge_threshold: 10.0,
            max_nb_orientations_per_keypoint: 0,
            gpu_device_index: -1,
            use_hardware_interpolated_blur: true,
            pyramid_precision: PyramidPrecision::Float32,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        let mut valid = true;
        let mut check = |cond: bool, msg: &str| {
            if !cond {
                error!("invalid configuration: {}", msg);
                valid = false;
            }
        };

        check(
            self.input_image_max_size > 0,
            "input image size must be more than zero",
        );
        check(
            self.sift_buffer_count > 0,
            "number of SIFT buffers must be more than zero",
        );
        check(
            self.max_nb_sift_per_buffer > 0,
            "number of SIFT features per buffer must be more than zero",
        );
        check(
            self.nb_scales_per_octave > 0,
            "number of scales per octave must be more than zero",
        );
        check(
            self.input_image_blur_level >= 0.0,
            "input image blur level cannot be negative",
        );
        check(
            self.seed_scale_sigma >= 0.0,
            "seed scale blur level cannot be negative",
        );
        // The first separable kernel blurs the input up to the seed level;
        // its sigma is only real when the (upsampling-adjusted) input blur
        // does not exceed the seed blur.
        let input_blur = (if self.use_input_upsampling { 2.0 } else { 1.0 }) * self.input_image_blur_level;
        check(
            input_blur <= self.seed_scale_sigma,
            "the input image blur level (2x when upsampling) must not exceed the seed scale blur level",
        );
        check(
            self.intensity_threshold >= 0.0,
            "the DoG intensity threshold cannot be negative",
        );
        check(
            self.edge_threshold >= 0.0,
            "the DoG edge threshold cannot be negative",
        );

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidConfig("one or more configuration values are invalid"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_image_max_size, 1920 * 1080);
        assert_eq!(config.sift_buffer_count, 2);
        assert_eq!(config.max_nb_sift_per_buffer, 100_000);
        assert!(config.use_input_upsampling);
        assert_eq!(config.nb_scales_per_octave, 3);
        assert_eq!(config.seed_scale_sigma, 1.6);
        assert_eq!(config.input_image_blur_level, 0.5);
        assert_eq!(config.intensity_threshold, 0.04);
        assert_eq!(config.edge_threshold, 10.0);
        assert_eq!(config.pyramid_precision, PyramidPrecision::Float32);
    }

    #[test]
    fn zero_sized_fields_are_rejected() {
        for field in 0..4 {
            let mut config = Config::default();
            match field {
                0 => config.input_image_max_size = 0,
                1 => config.sift_buffer_count = 0,
                2 => config.max_nb_sift_per_buffer = 0,
                _ => config.nb_scales_per_octave = 0,
            }
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn input_blur_must_stay_below_seed_sigma() {
        let mut config = Config {
            input_image_blur_level: 1.0,
            use_input_upsampling: true,
            ..Config::default()
        };
        // 2.0 * 1.0 > 1.6
        assert!(config.validate().is_err());

        // Without upsampling the same blur level fits under the seed sigma.
        config.use_input_upsampling = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn negative_thresholds_are_rejected() {
        let config = Config {
            intensity_threshold: -0.1,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            edge_threshold: -1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}

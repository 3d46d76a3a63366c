//! GPU SIFT feature detection and matching on a Vulkan compute pipeline.
//!
//! The library turns grayscale images into arrays of SIFT features
//! (position, scale, orientation and a 128-byte descriptor) entirely on
//! the device, keeps the results resident in GPU buffers, and matches two
//! resident buffers with a brute-force 2-nearest-neighbors kernel. Hosts
//! can download detected features, re-upload previously computed ones and
//! match them against freshly detected sets.
//!
//! The Vulkan runtime is loaded explicitly:
//!
//! ```no_run
//! use vksift::{Config, Instance};
//!
//! vksift::load_vulkan().unwrap();
//! {
//!     let mut instance = Instance::new(&Config::default()).unwrap();
//!
//!     let (width, height) = (640, 480);
//!     let image = vec![0u8; (width * height) as usize];
//!     instance.detect(&image, width, height, 0);
//!     let features = instance.download_features(0);
//!     println!("{} features", features.len());
//! }
//! vksift::unload_vulkan();
//! ```
//!
//! Every entry point blocks until the GPU work it depends on has finished;
//! the host side is synchronous and single-threaded by design.
//!
//! # Failure policy
//!
//! Construction ([`load_vulkan`], [`Instance::new`]) reports failures as
//! [`Error`] values and never leaves half-initialized state behind. The
//! runtime operations of an existing instance instead log and abort the
//! process on failure: a GPU fault at that point indicates a driver-level
//! problem the library cannot recover from, and argument preconditions are
//! documented and checked by callers.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

mod config;
mod detector;
mod device;
mod error;
mod feature;
mod matcher;
mod memory;

use std::sync::Arc;

use ash::vk;
use log::error;

pub use config::{Config, PyramidPrecision};
pub use device::{available_gpus, load_vulkan, unload_vulkan};
pub use error::{Error, Result};
pub use feature::{Feature, Match2NN, DESCRIPTOR_NB_HIST, DESCRIPTOR_NB_ORI, DESCRIPTOR_SIZE};

use detector::SiftDetector;
use device::{Device, DeviceConfig};
use matcher::SiftMatcher;
use memory::SiftMemory;

/// Process-global logging verbosity, mapped onto the `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Debug,
}

/// Caps the verbosity of every message the library emits through `log`.
/// The host installs whatever logger backend it prefers.
pub fn set_log_level(level: LogLevel) {
    let filter = match level {
        LogLevel::None => log::LevelFilter::Off,
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warning => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
    };
    log::set_max_level(filter);
}

fn fail(operation: &str, err: &Error) -> ! {
    error!("{} failed: {}", operation, err);
    std::process::abort();
}

/// A SIFT detection and matching engine bound to one GPU.
///
/// The instance owns the logical device and every GPU resource; dropping
/// it waits for the device to go idle and releases the subsystems in
/// reverse construction order.
pub struct Instance {
    matcher: SiftMatcher,
    detector: SiftDetector,
    memory: SiftMemory,
    device: Arc<Device>,
}

impl Instance {
    /// Builds the engine: selects a GPU, creates the logical device and
    /// allocates every buffer and image at the configured maxima.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, when no suitable GPU is found,
    /// or when any GPU object cannot be created. Partially built state is
    /// released before returning.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        // One general queue runs the pipelines. Two transfer-only queues,
        // when the hardware has them, split between the memory layer's
        // up/downloads and the matcher's ownership hand-offs.
        let device = Arc::new(Device::new(&DeviceConfig {
            extensions: Vec::new(),
            general_queue_count: 1,
            async_compute_queue_count: 0,
            async_transfer_queue_count: 2,
            target_device_index: config.gpu_device_index,
        })?);

        let memory = SiftMemory::new(Arc::clone(&device), config)?;
        let detector = SiftDetector::new(Arc::clone(&device), &memory, config)?;
        let matcher = SiftMatcher::new(Arc::clone(&device), &memory)?;

        Ok(Self {
            matcher,
            detector,
            memory,
            device,
        })
    }

    /// Number of SIFT buffers reserved by this instance.
    pub fn buffer_count(&self) -> u32 {
        self.memory.buffer_count
    }

    /// Runs the detection pipeline on a grayscale image, storing the
    /// features into the GPU buffer `target_buffer`.
    ///
    /// Blocks while a previous operation holds the target buffer or while
    /// a previous detection is in flight, then submits and returns; the
    /// next access to the buffer waits for completion.
    pub fn detect(&mut self, image_data: &[u8], width: u32, height: u32, target_buffer: usize) {
        if let Err(err) = self.try_detect(image_data, width, height, target_buffer) {
            fail("detect", &err);
        }
    }

    fn try_detect(
        &mut self,
        image_data: &[u8],
        width: u32,
        height: u32,
        target_buffer: usize,
    ) -> Result<()> {
        self.check_buffer_index(target_buffer)?;
        let input_size = width * height;
        if input_size > self.memory.max_image_size {
            return Err(Error::InvalidArgument(format!(
                "input size ({}x{}={}) exceeds the configured maximum ({})",
                width, height, input_size, self.memory.max_image_size
            )));
        }

        self.wait(&[
            self.memory.sift_buffer_fences[target_buffer],
            self.detector.end_of_detection_fence,
        ])?;

        let layout_updated =
            self.memory
                .prepare_for_detection(image_data, width, height, target_buffer)?;
        self.detector
            .dispatch(&self.memory, target_buffer, layout_updated)
    }

    /// Number of features currently stored in a buffer, clamped to the
    /// configured per-buffer maximum.
    pub fn feature_count(&mut self, buffer: usize) -> u32 {
        let result = self
            .check_buffer_index(buffer)
            .and_then(|_| self.wait(&[self.memory.sift_buffer_fences[buffer]]))
            .and_then(|_| self.memory.buffer_feature_count(buffer));
        match result {
            Ok(count) => count,
            Err(err) => fail("feature_count", &err),
        }
    }

    /// Downloads the features stored in a buffer. Blocking.
    pub fn download_features(&mut self, buffer: usize) -> Vec<Feature> {
        let result = self
            .check_buffer_index(buffer)
            .and_then(|_| self.wait(&[self.memory.sift_buffer_fences[buffer]]))
            .and_then(|_| self.memory.download_features(buffer));
        match result {
            Ok(features) => features,
            Err(err) => fail("download_features", &err),
        }
    }

    /// Uploads caller-provided features into a buffer, leaving it in
    /// packed form ready for matching.
    pub fn upload_features(&mut self, features: &[Feature], buffer: usize) {
        let result = self
            .check_buffer_index(buffer)
            .and_then(|_| {
                if features.len() as u64 > u64::from(self.memory.max_features_per_buffer) {
                    Err(Error::InvalidArgument(format!(
                        "feature count ({}) exceeds the per-buffer maximum ({})",
                        features.len(),
                        self.memory.max_features_per_buffer
                    )))
                } else {
                    Ok(())
                }
            })
            .and_then(|_| self.wait(&[self.memory.sift_buffer_fences[buffer]]))
            .and_then(|_| self.memory.upload_features(buffer, features));
        if let Err(err) = result {
            fail("upload_features", &err);
        }
    }

    /// Matches every feature of buffer `buffer_a` against buffer
    /// `buffer_b`, leaving one 2-nearest-neighbors record per query
    /// feature for [`download_matches`](Self::download_matches). The GPU
    /// does not filter; apply Lowe's ratio test on the host.
    pub fn match_features(&mut self, buffer_a: usize, buffer_b: usize) {
        if let Err(err) = self.try_match(buffer_a, buffer_b) {
            fail("match_features", &err);
        }
    }

    fn try_match(&mut self, buffer_a: usize, buffer_b: usize) -> Result<()> {
        self.check_buffer_index(buffer_a)?;
        self.check_buffer_index(buffer_b)?;

        let mut fences = vec![
            self.memory.sift_buffer_fences[buffer_a],
            self.matcher.end_of_matching_fence,
        ];
        if buffer_b != buffer_a {
            fences.push(self.memory.sift_buffer_fences[buffer_b]);
        }
        self.wait(&fences)?;

        self.memory.prepare_for_matching(buffer_a, buffer_b)?;
        self.matcher.dispatch(&self.memory, buffer_a, buffer_b)
    }

    /// Number of match records produced by the last
    /// [`match_features`](Self::match_features) call (the feature count of
    /// its buffer A).
    pub fn match_count(&self) -> u32 {
        self.memory.current_match_count
    }

    /// Downloads the match records of the last matching run. Blocking.
    pub fn download_matches(&mut self) -> Vec<Match2NN> {
        let result = self
            .wait(&[self.matcher.end_of_matching_fence])
            .and_then(|_| self.memory.download_matches());
        match result {
            Ok(matches) => matches,
            Err(err) => fail("download_matches", &err),
        }
    }

    /// Number of octaves in the current scale-space pyramid.
    pub fn octave_count(&self) -> u8 {
        self.memory.current_octave_count as u8
    }

    /// Image resolution of one octave of the current pyramid.
    pub fn octave_resolution(&self, octave: u8) -> (u32, u32) {
        if u32::from(octave) >= self.memory.current_octave_count {
            fail(
                "octave_resolution",
                &Error::InvalidArgument(format!(
                    "octave index {} out of range (current octave count: {})",
                    octave, self.memory.current_octave_count
                )),
            );
        }
        let resolution = self.memory.octave_resolutions[octave as usize];
        (resolution.width, resolution.height)
    }

    /// Downloads one blurred scale-space layer as float32 texels, for
    /// debugging and visualization. Blocking.
    pub fn download_scale_space_image(&mut self, octave: u8, scale: u8) -> Vec<f32> {
        let result = self
            .wait(&[self.detector.end_of_detection_fence])
            .and_then(|_| self.memory.download_pyramid_image(octave, scale, false));
        match result {
            Ok(texels) => texels,
            Err(err) => fail("download_scale_space_image", &err),
        }
    }

    /// Downloads one Difference-of-Gaussian layer as float32 texels, for
    /// debugging and visualization. Blocking.
    pub fn download_dog_image(&mut self, octave: u8, scale: u8) -> Vec<f32> {
        let result = self
            .wait(&[self.detector.end_of_detection_fence])
            .and_then(|_| self.memory.download_pyramid_image(octave, scale, true));
        match result {
            Ok(texels) => texels,
            Err(err) => fail("download_dog_image", &err),
        }
    }

    fn check_buffer_index(&self, buffer: usize) -> Result<()> {
        if buffer as u64 >= u64::from(self.memory.buffer_count) {
            Err(Error::InvalidArgument(format!(
                "buffer index {} out of range ({} buffers reserved)",
                buffer, self.memory.buffer_count
            )))
        } else {
            Ok(())
        }
    }

    fn wait(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe { self.device.device.wait_for_fences(fences, true, u64::MAX) }
            .map_err(Error::SubmitFailure)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Let any in-flight work finish before the subsystems tear down
        // in field order: matcher, detector, memory, then the device.
        unsafe {
            let _ = self.device.device.device_wait_idle();
        }
    }
}

use bytemuck::{Pod, Zeroable};

/// Spatial histogram cells per descriptor axis.
pub const DESCRIPTOR_NB_HIST: usize = 4;
/// Orientation bins per spatial cell.
pub const DESCRIPTOR_NB_ORI: usize = 8;
/// Total descriptor length in bytes (4x4 cells of 8 bins).
pub const DESCRIPTOR_SIZE: usize = DESCRIPTOR_NB_HIST * DESCRIPTOR_NB_HIST * DESCRIPTOR_NB_ORI;

/// A SIFT keypoint with its quantized descriptor.
///
/// The layout is shared bit-for-bit with the GPU buffers: 36 bytes of
/// keypoint data followed by the 128-byte descriptor, 164 bytes total with
/// no padding. Host arrays of `Feature` can therefore be uploaded and
/// downloaded with plain byte copies.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Feature {
    /// X position in original image coordinates.
    pub x: f32,
    /// Y position in original image coordinates.
    pub y: f32,
    /// Integer x position at the resolution of the keypoint's octave.
    pub orig_x: u32,
    /// Integer y position at the resolution of the keypoint's octave.
    pub orig_y: u32,
    /// Scale level inside the octave the keypoint was found at.
    pub scale_index: u32,
    /// Blur level of the keypoint's scale.
    pub sigma: f32,
    /// Image-scale multiplier of the keypoint's octave.
    pub scale_factor: f32,
    /// Dominant orientation in radians.
    pub theta: f32,
    /// Difference-of-Gaussian response value at the refined extremum.
    pub value: f32,
    /// L2-normalized, 0.2-clamped, 8-bit-quantized descriptor.
    pub descriptor: [u8; DESCRIPTOR_SIZE],
}

/// One 2-nearest-neighbors match record for a query feature.
///
/// The host applies Lowe's ratio test; the GPU reports both neighbors
/// unfiltered.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Match2NN {
    /// Index of the query feature in buffer A.
    pub idx_a: u32,
    /// Index of the nearest neighbor in buffer B.
    pub idx_b1: u32,
    /// Index of the second nearest neighbor in buffer B.
    pub idx_b2: u32,
    /// Squared L2 distance to the nearest neighbor.
    pub dist_a_b1: f32,
    /// Squared L2 distance to the second nearest neighbor.
    pub dist_a_b2: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_layouts_match_the_gpu() {
        assert_eq!(size_of::<Feature>(), 164);
        assert_eq!(size_of::<Match2NN>(), 20);
    }

    #[test]
    fn feature_byte_round_trip() {
        let mut feat = Feature::zeroed();
        feat.x = 12.5;
        feat.y = 7.25;
        feat.orig_x = 25;
        feat.orig_y = 14;
        feat.scale_index = 2;
        feat.sigma = 1.6;
        feat.scale_factor = 0.5;
        feat.theta = 0.75;
        feat.value = 0.04;
        for (i, byte) in feat.descriptor.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }

        let bytes = bytemuck::bytes_of(&feat).to_vec();
        assert_eq!(bytes.len(), 164);
        let back: Feature = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(back, feat);

        // The descriptor sits right after the 36 keypoint bytes.
        assert_eq!(&bytes[36..41], &[0, 1, 2, 3, 4]);
    }
}

//! GPU-ready packed vertex format for volumetric video meshes.
//!
//! Positions are quantized to u16 against the keyframe's bounding box,
//! texture coordinates to u16 against the texture, and each vertex blends the
//! affine transforms of up to four deformation graph nodes.
//!
//! The `w` position component is unused padding. Three-component 16-bit
//! vertex attributes have poor format support in practice, and the padded
//! layout keeps the struct at a 32-byte stride.

use bytemuck::{Pod, Zeroable};

/// Maximum number of deformation graph nodes a vertex can be assigned to.
pub const MAX_NODES_PER_VERTEX: usize = 4;

/// Sentinel in the encoded vertex weight stream for a vertex with no assigned
/// nodes. Decodes to all-zero indices and weights.
pub const NO_ASSIGNED_NODES: u16 = u16::MAX;

/// Renderable vertex (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MeshVertex {
    /// Position, quantized via the keyframe bounding box.
    pub pos: [u16; 3],
    /// Unused, for padding only.
    pub pad: u16,
    /// Texture coordinates, quantized as `0.5 / 65536 + i / 65536`.
    pub uv: [u16; 2],
    /// Deformation graph node indices.
    pub node_indices: [u16; MAX_NODES_PER_VERTEX],
    /// Quantized node weights; see [`dequantize_node_weight`].
    pub node_weights: [u8; MAX_NODES_PER_VERTEX],
}

/// Size of one renderable vertex in bytes.
pub const VERTEX_SIZE: usize = size_of::<MeshVertex>();

/// Dequantizes a stored node weight.
///
/// The quantization reserves 0 for an exact zero; 1 maps to half of the first
/// step so that the smallest nonzero weight stays distinguishable from zero.
/// The resulting per-vertex weights must be renormalized to sum to one.
pub fn dequantize_node_weight(weight: u8) -> f32 {
    match weight {
        0 => 0.0,
        1 => 0.5 * (0.5 / 254.0),
        255 => 253.75 / 254.0,
        w => (w as f32 - 1.0) / 254.0,
    }
}

/// Dequantizes a vertex's node weights and renormalizes them to sum to one.
///
/// All-zero weights (the [`NO_ASSIGNED_NODES`] case) stay all zero.
pub fn normalize_node_weights(weights: [u8; MAX_NODES_PER_VERTEX]) -> [f32; MAX_NODES_PER_VERTEX] {
    let mut result = weights.map(dequantize_node_weight);
    let sum: f32 = result.iter().sum();
    if sum > 0.0 {
        for weight in &mut result {
            *weight /= sum;
        }
    }
    result
}

/// Dequantizes a position component against a bounding box axis.
pub fn dequantize_position(quantized: u16, bbox_min: f32, factor: f32) -> f32 {
    bbox_min + factor * quantized as f32
}

/// Dequantizes a texture coordinate component.
pub fn dequantize_texcoord(quantized: u16) -> f32 {
    0.5 / 65536.0 + quantized as f32 / 65536.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(VERTEX_SIZE, 32);
        assert_eq!(core::mem::offset_of!(MeshVertex, uv), 8);
        assert_eq!(core::mem::offset_of!(MeshVertex, node_indices), 12);
        assert_eq!(core::mem::offset_of!(MeshVertex, node_weights), 20);
    }

    #[test]
    fn test_weight_dequantization_endpoints() {
        assert_eq!(dequantize_node_weight(0), 0.0);
        assert!(dequantize_node_weight(1) > 0.0);
        assert!(dequantize_node_weight(1) < dequantize_node_weight(2));
        assert!(dequantize_node_weight(255) < 1.0);
        assert!(dequantize_node_weight(254) < dequantize_node_weight(255));
    }

    #[test]
    fn test_weight_dequantization_is_monotonic() {
        let mut previous = -1.0f32;
        for w in 0..=255u8 {
            let value = dequantize_node_weight(w);
            assert!(value >= previous, "weight {w} not monotonic");
            previous = value;
        }
    }

    #[test]
    fn test_normalized_weights_sum_to_one() {
        for weights in [[255, 0, 0, 0], [128, 64, 32, 16], [1, 1, 1, 1], [2, 255, 7, 0]] {
            let normalized = normalize_node_weights(weights);
            let sum: f32 = normalized.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum for {weights:?} was {sum}");
        }

        // A vertex without assigned nodes keeps all-zero weights.
        assert_eq!(normalize_node_weights([0; 4]), [0.0; 4]);
    }

    #[test]
    fn test_position_quantization_error_bound() {
        // Quantize, then dequantize with the same bbox factors; the error per
        // axis must stay below one quantization step.
        let bbox_min = -0.75f32;
        let bbox_max = 1.25f32;
        let factor = (bbox_max - bbox_min) / u16::MAX as f32;

        for original in [-0.75, -0.2, 0.0, 0.333, 1.0, 1.25] {
            let quantized = (((original - bbox_min) / factor) as f32).round() as u16;
            let restored = dequantize_position(quantized, bbox_min, factor);
            assert!(
                (restored - original).abs() < factor,
                "error for {original} exceeds one step"
            );
        }
    }
}

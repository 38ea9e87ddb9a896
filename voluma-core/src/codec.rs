//! Frame payload codec.
//!
//! Decodes a frame chunk's payload from its compressed storage format into
//! GPU-ready buffers: the renderable vertex and index buffers (keyframes),
//! the deformation state, and the optional per-vertex alpha values. Texture
//! decode is not handled here; textures flow through the video-decode stage.
//!
//! [`decode_content`] is pure in the sense that it touches no shared state:
//! all decompression goes through a caller-owned [`DecodingContext`], and all
//! outputs land in caller-provided buffers.

use bytemuck::Zeroable;
use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use tracing::warn;
use voluma_shared::frame::{
    FRAME_HEADER_SIZE, FrameFlags, FrameHeader, KEYFRAME_HEADER_SIZE, KeyframeHeader,
};
use voluma_shared::vertex::{MAX_NODES_PER_VERTEX, MeshVertex, NO_ASSIGNED_NODES};

use crate::av1::Av1Picture;
use crate::error::{Result, VolumaError};

/// Fully parsed frame metadata: the frame header, the keyframe sub-header
/// (zeroed for dependent frames), and the derived payload sizes.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub start_timestamp: i64,
    pub end_timestamp: i64,

    pub is_keyframe: bool,
    pub has_vertex_alpha: bool,
    /// Texture is zstd-compressed raw RGB instead of an AV1 chunk.
    pub zstd_rgb_texture: bool,

    /// Unique vertices, excluding vertices duplicated for texturing
    /// (keyframes only).
    pub unique_vertex_count: u16,
    /// Renderable vertices, including duplicated ones (keyframes only).
    pub vertex_count: u16,
    /// Three times the triangle count (keyframes only).
    pub index_count: u32,

    pub texture_width: u32,
    pub texture_height: u32,

    pub bbox_min: [f32; 3],
    pub vertex_factor: [f32; 3],

    /// Deformation graph node count; stored for every frame so frames can be
    /// sized independently in advance.
    pub deformation_node_count: u16,

    pub compressed_mesh_size: u32,
    pub encoded_vertex_weights_size: u32,
    pub compressed_deformation_state_size: u32,
    pub compressed_texture_size: u32,
    pub compressed_vertex_alpha_size: u32,
}

impl FrameMetadata {
    /// Number of renderable vertices (keyframes only).
    pub fn renderable_vertex_count(&self) -> u32 {
        if self.is_keyframe { self.vertex_count as u32 } else { 0 }
    }

    /// Size in bytes of the renderable vertex buffer (keyframes only).
    pub fn renderable_vertex_data_size(&self) -> usize {
        self.renderable_vertex_count() as usize * size_of::<MeshVertex>()
    }

    /// Size in bytes of the index buffer.
    pub fn index_data_size(&self) -> usize {
        self.index_count as usize * 2
    }

    /// Length in `f32` values of the decoded deformation state.
    pub fn deformation_state_len(&self) -> usize {
        self.deformation_node_count as usize * 12
    }

    /// Size in bytes of the decoded texture: I420 YUV, or RGB when the
    /// zstd-RGB flag is set.
    pub fn texture_data_size(&self) -> usize {
        let pixels = self.texture_width as usize * self.texture_height as usize;
        if self.zstd_rgb_texture { pixels * 3 } else { pixels * 3 / 2 }
    }

    pub fn texture_luma_data_size(&self) -> usize {
        self.texture_width as usize * self.texture_height as usize
    }

    pub fn texture_chroma_data_size(&self) -> usize {
        self.texture_width as usize * self.texture_height as usize / 4
    }

    pub fn bbox_max(&self) -> [f32; 3] {
        [
            self.bbox_min[0] + self.vertex_factor[0] * u16::MAX as f32,
            self.bbox_min[1] + self.vertex_factor[1] * u16::MAX as f32,
            self.bbox_min[2] + self.vertex_factor[2] * u16::MAX as f32,
        ]
    }
}

/// Parses a frame chunk payload's headers.
///
/// Returns the metadata and the offset of the frame's encoded content (the
/// first byte after the headers), from which [`decode_content`] and the
/// texture path continue.
pub fn read_frame_metadata(data: &[u8]) -> Result<(FrameMetadata, usize)> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(VolumaError::Truncated("frame header"));
    }
    let header = FrameHeader::read_from(&mut &data[..FRAME_HEADER_SIZE])?;
    if header.version != 0 {
        warn!(version = header.version, "unknown frame header version");
    }

    let mut metadata = FrameMetadata {
        start_timestamp: header.start_timestamp,
        end_timestamp: header.end_timestamp,
        is_keyframe: header.is_keyframe(),
        has_vertex_alpha: header.flags.contains(FrameFlags::HAS_VERTEX_ALPHA),
        zstd_rgb_texture: header.flags.contains(FrameFlags::ZSTD_RGB_TEXTURE),
        texture_width: header.texture_width,
        texture_height: header.texture_height,
        deformation_node_count: header.deformation_node_count,
        compressed_deformation_state_size: header.compressed_deformation_state_size,
        compressed_texture_size: header.compressed_texture_size,
        ..FrameMetadata::default()
    };

    let mut content_offset = FRAME_HEADER_SIZE;

    if metadata.is_keyframe {
        if data.len() < FRAME_HEADER_SIZE + KEYFRAME_HEADER_SIZE {
            return Err(VolumaError::Truncated("keyframe header"));
        }
        let keyframe = KeyframeHeader::read_from(&mut &data[FRAME_HEADER_SIZE..])?;
        if keyframe.unique_vertex_count > keyframe.vertex_count {
            return Err(VolumaError::ContractViolation(
                "mesh has unique_vertex_count > vertex_count",
            ));
        }

        metadata.unique_vertex_count = keyframe.unique_vertex_count;
        metadata.vertex_count = keyframe.vertex_count;
        metadata.index_count = 3 * keyframe.triangle_count;
        metadata.bbox_min = [keyframe.bbox[0], keyframe.bbox[1], keyframe.bbox[2]];
        metadata.vertex_factor = [keyframe.bbox[3], keyframe.bbox[4], keyframe.bbox[5]];
        metadata.compressed_mesh_size = keyframe.compressed_mesh_size;
        metadata.encoded_vertex_weights_size = keyframe.encoded_vertex_weights_size;

        content_offset += KEYFRAME_HEADER_SIZE;
    }

    // The vertex alpha size has no header field; it is whatever remains of
    // the chunk after all other parts.
    let accounted = content_offset
        + metadata.compressed_mesh_size as usize
        + metadata.compressed_deformation_state_size as usize
        + metadata.compressed_texture_size as usize;
    metadata.compressed_vertex_alpha_size = data
        .len()
        .checked_sub(accounted)
        .ok_or(VolumaError::Truncated("frame payload"))? as u32;

    Ok((metadata, content_offset))
}

/// Decoded per-vertex node assignment.
#[derive(Debug, Clone, Copy, Default)]
struct VertexWeights {
    node_indices: [u16; MAX_NODES_PER_VERTEX],
    node_weights: [u8; MAX_NODES_PER_VERTEX],
}

/// Caller-owned decode state: the reusable zstd context plus scratch buffers
/// that survive across frames.
pub struct DecodingContext {
    zstd: zstd::bulk::Decompressor<'static>,
    mesh_scratch: Vec<u8>,
    deformation_scratch: Vec<u8>,
    weights_scratch: Vec<VertexWeights>,
}

impl DecodingContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            zstd: zstd::bulk::Decompressor::new()?,
            mesh_scratch: Vec::new(),
            deformation_scratch: Vec::new(),
            weights_scratch: Vec::new(),
        })
    }

    fn decompress_exact(&mut self, src: &[u8], dst: &mut [u8], what: &'static str) -> Result<()> {
        let n = self
            .zstd
            .decompress_to_buffer(src, dst)
            .map_err(|e| VolumaError::ZstdDecode(format!("{what}: {e}")))?;
        if n != dst.len() {
            return Err(VolumaError::ZstdDecode(format!(
                "{what}: decompressed to {n} bytes, expected {}",
                dst.len()
            )));
        }
        Ok(())
    }
}

/// Decoded CPU-side buffers of one frame, reused across decodes.
#[derive(Debug, Default)]
pub struct DecodedFrameContent {
    /// Renderable vertices (keyframes only).
    pub vertices: Vec<MeshVertex>,
    /// Triangle indices (keyframes only).
    pub indices: Vec<u16>,
    /// Source vertex index for each duplicated vertex (keyframes only).
    pub duplicated_vertex_source_indices: Vec<u16>,
    /// `12 * node_count` floats; column-major 3x4 affine matrices with the
    /// identity diagonal restored.
    pub deformation_state: Vec<f32>,
    /// One alpha byte per renderable vertex, empty when the frame has none.
    pub vertex_alpha: Vec<u8>,
}

/// Decompresses a frame's content (excluding the texture) into `out`.
///
/// `content` must be the frame payload starting at the content offset
/// returned by [`read_frame_metadata`].
pub fn decode_content(
    content: &[u8],
    metadata: &FrameMetadata,
    ctx: &mut DecodingContext,
    out: &mut DecodedFrameContent,
) -> Result<()> {
    let mut cursor = 0usize;

    // Mesh, keyframes only.
    if metadata.is_keyframe {
        decode_mesh(content, &mut cursor, metadata, ctx, out)?;
    } else {
        out.vertices.clear();
        out.indices.clear();
        out.duplicated_vertex_source_indices.clear();
    }

    // Deformation state.
    decode_deformation_state(content, &mut cursor, metadata, ctx, out)?;

    // Skip over the texture; it is decoded by the video stage.
    cursor += metadata.compressed_texture_size as usize;

    // Vertex alpha.
    out.vertex_alpha.clear();
    if metadata.compressed_vertex_alpha_size > 0 {
        decode_vertex_alpha(content, cursor, metadata, ctx, out)?;
    }

    Ok(())
}

fn take<'a>(content: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *cursor + len;
    if end > content.len() {
        return Err(VolumaError::Truncated("frame payload"));
    }
    let slice = &content[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn decode_mesh(
    content: &[u8],
    cursor: &mut usize,
    metadata: &FrameMetadata,
    ctx: &mut DecodingContext,
    out: &mut DecodedFrameContent,
) -> Result<()> {
    let unique_count = metadata.unique_vertex_count as usize;
    let vertex_count = metadata.vertex_count as usize;
    let duplicated_count = vertex_count - unique_count;

    let position_data_size = unique_count * 3 * 2;
    let duplicated_data_size = duplicated_count * 2;
    let texcoord_data_size = vertex_count * 2 * 2;
    let index_data_size = metadata.index_data_size();
    let weights_data_size = metadata.encoded_vertex_weights_size as usize;

    let mesh_data_size = position_data_size
        + duplicated_data_size
        + texcoord_data_size
        + index_data_size
        + weights_data_size;

    let compressed = take(content, cursor, metadata.compressed_mesh_size as usize)?;
    ctx.mesh_scratch.resize(mesh_data_size, 0);
    let mut mesh_scratch = std::mem::take(&mut ctx.mesh_scratch);
    let result = ctx.decompress_exact(compressed, &mut mesh_scratch, "mesh data");
    ctx.mesh_scratch = mesh_scratch;
    result?;

    // Partition the decompressed blob.
    let mesh = &ctx.mesh_scratch;
    let (positions, rest) = mesh.split_at(position_data_size);
    let (duplicated_sources, rest) = rest.split_at(duplicated_data_size);
    let (texcoords, rest) = rest.split_at(texcoord_data_size);
    let (index_data, encoded_weights) = rest.split_at(index_data_size);

    // Indices copy straight to the output.
    out.indices.resize(metadata.index_count as usize, 0);
    LittleEndian::read_u16_into(index_data, &mut out.indices);

    out.duplicated_vertex_source_indices.resize(duplicated_count, 0);
    LittleEndian::read_u16_into(duplicated_sources, &mut out.duplicated_vertex_source_indices);

    // Vertex weights (node indices and node weights).
    decode_vertex_weights(
        encoded_weights,
        unique_count,
        &mut ctx.weights_scratch,
    )?;

    // Write out the renderable vertices.
    out.vertices.resize(vertex_count, MeshVertex::zeroed());

    let u16_at = |bytes: &[u8], index: usize| LittleEndian::read_u16(&bytes[2 * index..]);

    for i in 0..unique_count {
        let weights = &ctx.weights_scratch[i];
        out.vertices[i] = MeshVertex {
            pos: [
                u16_at(positions, 3 * i),
                u16_at(positions, 3 * i + 1),
                u16_at(positions, 3 * i + 2),
            ],
            pad: 0,
            uv: [u16_at(texcoords, 2 * i), u16_at(texcoords, 2 * i + 1)],
            node_indices: weights.node_indices,
            node_weights: weights.node_weights,
        };
    }

    // Duplicated vertices reuse the source vertex's position and weights but
    // carry their own texture coordinates.
    for i in unique_count..vertex_count {
        let source = out.duplicated_vertex_source_indices[i - unique_count] as usize;
        if source >= unique_count {
            return Err(VolumaError::ContractViolation(
                "duplicated vertex references an out-of-range source vertex",
            ));
        }
        let weights = &ctx.weights_scratch[source];
        out.vertices[i] = MeshVertex {
            pos: [
                u16_at(positions, 3 * source),
                u16_at(positions, 3 * source + 1),
                u16_at(positions, 3 * source + 2),
            ],
            pad: 0,
            uv: [u16_at(texcoords, 2 * i), u16_at(texcoords, 2 * i + 1)],
            node_indices: weights.node_indices,
            node_weights: weights.node_weights,
        };
    }

    Ok(())
}

/// Decodes the variable-length vertex weight stream.
///
/// Per vertex: a leading u16 with `(count - 1)` in its top two bits and the
/// first node index in the low 14, then `count - 1` further u16 node indices,
/// then `count` u8 weights. Missing slots repeat the last node index with
/// weight zero. The sentinel `0xFFFF` marks a vertex without assigned nodes.
fn decode_vertex_weights(
    encoded: &[u8],
    unique_vertex_count: usize,
    out: &mut Vec<VertexWeights>,
) -> Result<()> {
    out.clear();
    out.reserve(unique_vertex_count);

    let mut cursor = 0usize;
    while cursor < encoded.len() {
        if cursor + 2 > encoded.len() {
            return Err(VolumaError::VertexWeights("truncated leading node index"));
        }
        let first = LittleEndian::read_u16(&encoded[cursor..]);
        cursor += 2;

        if first == NO_ASSIGNED_NODES {
            // Should not occur in valid files; decodes to all zeros.
            warn!("encountered a vertex without any assigned nodes");
            out.push(VertexWeights::default());
            continue;
        }

        let node_count = ((first & 0xc000) >> 14) as usize + 1;
        let mut weights = VertexWeights::default();
        weights.node_indices[0] = first & 0x3fff;

        if cursor + (node_count - 1) * 2 + node_count > encoded.len() {
            return Err(VolumaError::VertexWeights("truncated node assignment"));
        }

        for k in 1..node_count {
            weights.node_indices[k] = LittleEndian::read_u16(&encoded[cursor..]);
            cursor += 2;
        }
        for k in node_count..MAX_NODES_PER_VERTEX {
            weights.node_indices[k] = weights.node_indices[node_count - 1];
        }

        for k in 0..node_count {
            weights.node_weights[k] = encoded[cursor];
            cursor += 1;
        }

        out.push(weights);
    }

    if out.len() != unique_vertex_count {
        return Err(VolumaError::VertexWeights(
            "decoded weight count does not match the unique vertex count",
        ));
    }

    Ok(())
}

fn decode_deformation_state(
    content: &[u8],
    cursor: &mut usize,
    metadata: &FrameMetadata,
    ctx: &mut DecodingContext,
    out: &mut DecodedFrameContent,
) -> Result<()> {
    let state_len = metadata.deformation_state_len();
    out.deformation_state.clear();
    out.deformation_state.resize(state_len, 0.0);

    if metadata.compressed_deformation_state_size == 0 {
        // No stored deformation; every node is the identity transform.
        for (i, value) in out.deformation_state.iter_mut().enumerate() {
            if matches!(i % 12, 0 | 4 | 8) {
                *value = 1.0;
            }
        }
        return Ok(());
    }

    let compressed = take(
        content,
        cursor,
        metadata.compressed_deformation_state_size as usize,
    )?;

    let encoded_size = state_len * 2;
    ctx.deformation_scratch.resize(encoded_size, 0);
    let mut scratch = std::mem::take(&mut ctx.deformation_scratch);
    let result = ctx.decompress_exact(compressed, &mut scratch, "deformation state data");
    ctx.deformation_scratch = scratch;
    result?;

    // The values are stored as f16 offsets from the identity matrix; the
    // diagonal ones are added back here. Matrices are column-major 3x4, so
    // within each node's 12 values the diagonal sits at 0, 4, and 8.
    for (i, value) in out.deformation_state.iter_mut().enumerate() {
        let encoded = f16::from_le_bytes([
            ctx.deformation_scratch[2 * i],
            ctx.deformation_scratch[2 * i + 1],
        ]);
        let identity = if matches!(i % 12, 0 | 4 | 8) { 1.0 } else { 0.0 };
        *value = encoded.to_f32() + identity;
    }

    Ok(())
}

fn decode_vertex_alpha(
    content: &[u8],
    cursor: usize,
    metadata: &FrameMetadata,
    ctx: &mut DecodingContext,
    out: &mut DecodedFrameContent,
) -> Result<()> {
    let mut cursor = cursor;
    let compressed = take(
        content,
        &mut cursor,
        metadata.compressed_vertex_alpha_size as usize,
    )?;

    // The decompressed size is not in the metadata (for dependent frames the
    // vertex count is unknown during decode); discover it from the zstd frame.
    let size = zstd::zstd_safe::get_frame_content_size(compressed)
        .ok()
        .flatten()
        .ok_or_else(|| VolumaError::ZstdDecode("vertex alpha content size is unknown".into()))?
        as usize;

    out.vertex_alpha.resize(size, 0);
    let mut alpha = std::mem::take(&mut out.vertex_alpha);
    let result = ctx.decompress_exact(compressed, &mut alpha, "vertex alpha data");
    out.vertex_alpha = alpha;
    result
}

/// Copies the texture data out of a decoded picture into tight packing, the
/// Y, U, and V planes following each other in that order.
pub fn copy_texture_from_picture(picture: &Av1Picture, out: &mut [u8]) {
    let width = picture.width as usize;
    let height = picture.height as usize;
    let luma_size = width * height;
    let chroma_size = luma_size / 4;

    copy_plane(&picture.luma, width, height, &mut out[..luma_size]);
    copy_plane(
        &picture.chroma_u,
        width / 2,
        height / 2,
        &mut out[luma_size..luma_size + chroma_size],
    );
    copy_plane(
        &picture.chroma_v,
        width / 2,
        height / 2,
        &mut out[luma_size + chroma_size..luma_size + 2 * chroma_size],
    );
}

fn copy_plane(plane: &crate::av1::PicturePlane, width: usize, height: usize, out: &mut [u8]) {
    if plane.stride == width {
        out.copy_from_slice(&plane.data[..width * height]);
    } else {
        for y in 0..height {
            out[y * width..(y + 1) * width]
                .copy_from_slice(&plane.data[y * plane.stride..y * plane.stride + width]);
        }
    }
}

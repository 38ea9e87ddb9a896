//! Shared test utilities: a fixture video builder, a fake AV1 decoder, and a
//! recording no-op GPU backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use half::f16;
use voluma_shared::chunk::{ChunkHeader, ChunkType};
use voluma_shared::frame::{FRAME_VERSION, FrameFlags, FrameHeader, KeyframeHeader};
use voluma_shared::index::{INDEX_VERSION, IndexEntry, write_index_array};
use voluma_shared::metadata::VideoMetadata;

use crate::av1::{Av1Decoder, Av1DecoderFactory, Av1Picture, PicturePlane, PixelLayout};
use crate::backend::{GpuFrameBackend, TransferToken, ViewTransforms};
use crate::cache::FrameData;
use crate::error::{Result, VolumaError};

// ============================================================================
// Fixture video builder
// ============================================================================

/// How fixture frames store their texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureMode {
    /// Fake AV1 bitstream chunks, decoded by [`FakeAv1Decoder`].
    Av1,
    /// Zstd-compressed raw RGB.
    ZstdRgb,
    /// No texture data at all.
    Empty,
}

/// Builds valid container files for tests.
///
/// The mesh is a fixed small patch: four unique vertices, two of them
/// duplicated for texturing, two triangles. Deformation state offsets vary
/// per frame so decoded frames are distinguishable.
pub struct FixtureVideoBuilder {
    keyframes: Vec<bool>,
    frame_duration_ns: i64,
    node_count: u16,
    texture_width: u32,
    texture_height: u32,
    texture_mode: TextureMode,
    with_metadata: bool,
    with_index: bool,
    with_vertex_alpha: bool,
}

pub const UNIQUE_VERTEX_COUNT: u16 = 4;
pub const VERTEX_COUNT: u16 = 6;
pub const TRIANGLE_COUNT: u32 = 2;

impl FixtureVideoBuilder {
    /// A video with the given keyframe pattern; every frame lasts
    /// `frame_duration_ns`.
    pub fn new(keyframes: &[bool], frame_duration_ns: i64) -> Self {
        Self {
            keyframes: keyframes.to_vec(),
            frame_duration_ns,
            node_count: 2,
            texture_width: 4,
            texture_height: 4,
            texture_mode: TextureMode::Av1,
            with_metadata: true,
            with_index: true,
            with_vertex_alpha: false,
        }
    }

    pub fn texture_mode(mut self, mode: TextureMode) -> Self {
        self.texture_mode = mode;
        self
    }

    pub fn with_index(mut self, with_index: bool) -> Self {
        self.with_index = with_index;
        self
    }

    pub fn with_metadata(mut self, with_metadata: bool) -> Self {
        self.with_metadata = with_metadata;
        self
    }

    pub fn with_vertex_alpha(mut self, with_vertex_alpha: bool) -> Self {
        self.with_vertex_alpha = with_vertex_alpha;
        self
    }

    pub fn frame_duration_ns(&self) -> i64 {
        self.frame_duration_ns
    }

    /// Serializes the complete container file.
    pub fn build(&self) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = (0..self.keyframes.len())
            .map(|frame| self.build_frame_payload(frame))
            .collect();

        let mut file = Vec::new();

        if self.with_metadata {
            file.extend(
                VideoMetadata {
                    look_at: [0.0, 1.0, 0.0],
                    radius: 2.0,
                    yaw: 0.0,
                    pitch: 0.0,
                }
                .serialize_to_chunk(),
            );
        }

        if self.with_index {
            let entries: Vec<IndexEntry> = payloads
                .iter()
                .enumerate()
                .map(|(frame, payload)| {
                    IndexEntry::new(
                        payload.len() as u32,
                        self.keyframes[frame],
                        frame as i64 * self.frame_duration_ns,
                    )
                })
                .collect();
            let end_timestamp = self.keyframes.len() as i64 * self.frame_duration_ns;

            let mut array = Vec::new();
            write_index_array(&entries, end_timestamp, &mut array).unwrap();
            let compressed = zstd::bulk::compress(&array, 0).unwrap();

            let payload_size = 5 + compressed.len();
            ChunkHeader::new(payload_size as u32, ChunkType::Index)
                .write_to(&mut file)
                .unwrap();
            file.write_u8(INDEX_VERSION).unwrap();
            file.write_u32::<LittleEndian>(compressed.len() as u32)
                .unwrap();
            file.extend_from_slice(&compressed);
        }

        for payload in &payloads {
            ChunkHeader::new(payload.len() as u32, ChunkType::Frame)
                .write_to(&mut file)
                .unwrap();
            file.extend_from_slice(payload);
        }

        file
    }

    /// Serializes one frame chunk payload (without the chunk header).
    pub fn build_frame_payload(&self, frame: usize) -> Vec<u8> {
        let is_keyframe = self.keyframes[frame];

        let mesh = if is_keyframe {
            zstd::bulk::compress(&encode_mesh_blob(self.node_count), 0).unwrap()
        } else {
            Vec::new()
        };
        let deformation =
            zstd::bulk::compress(&encode_deformation_state(self.node_count, frame), 0).unwrap();
        let texture = self.build_texture_bytes(frame, is_keyframe);
        let alpha = if self.with_vertex_alpha {
            zstd::bulk::compress(&vec![200u8; VERTEX_COUNT as usize], 0).unwrap()
        } else {
            Vec::new()
        };

        let mut flags = FrameFlags::empty();
        if is_keyframe {
            flags |= FrameFlags::KEYFRAME;
        }
        if self.with_vertex_alpha {
            flags |= FrameFlags::HAS_VERTEX_ALPHA;
        }
        if self.texture_mode == TextureMode::ZstdRgb {
            flags |= FrameFlags::ZSTD_RGB_TEXTURE;
        }

        let mut payload = Vec::new();
        FrameHeader {
            version: FRAME_VERSION,
            flags,
            deformation_node_count: self.node_count,
            start_timestamp: frame as i64 * self.frame_duration_ns,
            end_timestamp: (frame as i64 + 1) * self.frame_duration_ns,
            texture_width: self.texture_width,
            texture_height: self.texture_height,
            compressed_deformation_state_size: deformation.len() as u32,
            compressed_texture_size: texture.len() as u32,
        }
        .write_to(&mut payload)
        .unwrap();

        if is_keyframe {
            KeyframeHeader {
                unique_vertex_count: UNIQUE_VERTEX_COUNT,
                vertex_count: VERTEX_COUNT,
                triangle_count: TRIANGLE_COUNT,
                bbox: [
                    -1.0,
                    -1.0,
                    0.0,
                    2.0 / 65535.0,
                    2.0 / 65535.0,
                    1.0 / 65535.0,
                ],
                compressed_mesh_size: mesh.len() as u32,
                encoded_vertex_weights_size: encode_vertex_weights().len() as u32,
            }
            .write_to(&mut payload)
            .unwrap();
        }

        payload.extend_from_slice(&mesh);
        payload.extend_from_slice(&deformation);
        payload.extend_from_slice(&texture);
        payload.extend_from_slice(&alpha);
        payload
    }

    fn build_texture_bytes(&self, frame: usize, is_keyframe: bool) -> Vec<u8> {
        match self.texture_mode {
            TextureMode::Av1 => {
                encode_fake_av1_chunk(frame, self.texture_width, self.texture_height, is_keyframe)
            }
            TextureMode::ZstdRgb => {
                let pixels = self.texture_width as usize * self.texture_height as usize;
                let rgb = vec![frame as u8; pixels * 3];
                zstd::bulk::compress(&rgb, 0).unwrap()
            }
            TextureMode::Empty => Vec::new(),
        }
    }
}

/// The fixture mesh blob: positions, duplicated-vertex sources, texcoords,
/// indices, and encoded weights, in container order.
pub fn encode_mesh_blob(node_count: u16) -> Vec<u8> {
    let mut blob = Vec::new();

    // Unique positions (quantized corners of the patch).
    let positions: [[u16; 3]; UNIQUE_VERTEX_COUNT as usize] = [
        [0, 0, 0],
        [65535, 0, 0],
        [0, 65535, 0],
        [65535, 65535, 65535],
    ];
    for position in positions {
        for value in position {
            blob.write_u16::<LittleEndian>(value).unwrap();
        }
    }

    // Source vertices of the two duplicated vertices.
    for source in [0u16, 1] {
        blob.write_u16::<LittleEndian>(source).unwrap();
    }

    // Texture coordinates for all six renderable vertices.
    for i in 0..VERTEX_COUNT {
        blob.write_u16::<LittleEndian>(i * 1000).unwrap();
        blob.write_u16::<LittleEndian>(i * 2000).unwrap();
    }

    // Two triangles.
    for index in [0u16, 1, 2, 3, 4, 5] {
        blob.write_u16::<LittleEndian>(index).unwrap();
    }

    let weights = encode_vertex_weights();
    assert!(node_count >= 2, "fixture weights address two nodes");
    blob.extend_from_slice(&weights);
    blob
}

/// Encoded vertex weights for the four unique vertices: node counts one, two,
/// two, and one, addressing nodes 0 and 1.
pub fn encode_vertex_weights() -> Vec<u8> {
    let mut encoded = Vec::new();

    // Vertex 0: one node (index 0), full weight.
    encoded.write_u16::<LittleEndian>(0).unwrap();
    encoded.write_u8(255).unwrap();

    // Vertex 1: two nodes (0, 1), equal weights.
    encoded.write_u16::<LittleEndian>(1 << 14).unwrap();
    encoded.write_u16::<LittleEndian>(1).unwrap();
    encoded.write_u8(128).unwrap();
    encoded.write_u8(128).unwrap();

    // Vertex 2: two nodes (1, 0), uneven weights.
    encoded.write_u16::<LittleEndian>((1 << 14) | 1).unwrap();
    encoded.write_u16::<LittleEndian>(0).unwrap();
    encoded.write_u8(200).unwrap();
    encoded.write_u8(56).unwrap();

    // Vertex 3: one node (1).
    encoded.write_u16::<LittleEndian>(1).unwrap();
    encoded.write_u8(255).unwrap();

    encoded
}

/// Deformation state offsets (f16, minus identity) for one frame: zero
/// rotation, a per-frame x translation.
pub fn encode_deformation_state(node_count: u16, frame: usize) -> Vec<u8> {
    let mut encoded = Vec::new();
    for _node in 0..node_count {
        for coefficient in 0..12 {
            let value = if coefficient == 9 {
                frame as f32 * 0.01
            } else {
                0.0
            };
            let bits = f16::from_f32(value).to_le_bytes();
            encoded.extend_from_slice(&bits);
        }
    }
    encoded
}

// ============================================================================
// Fake AV1 decoder
// ============================================================================

/// Fake bitstream chunk layout: frame index u32, width u32, height u32,
/// keyframe u8.
pub fn encode_fake_av1_chunk(frame: usize, width: u32, height: u32, is_keyframe: bool) -> Vec<u8> {
    let mut chunk = Vec::new();
    chunk.write_u32::<LittleEndian>(frame as u32).unwrap();
    chunk.write_u32::<LittleEndian>(width).unwrap();
    chunk.write_u32::<LittleEndian>(height).unwrap();
    chunk.write_u8(is_keyframe as u8).unwrap();
    chunk
}

/// Test control over the fake decoder's output side.
///
/// While blocked, `next_picture` stalls like a decoder that waits on its
/// worker pool, which parks the video stage mid-frame. Tests must unblock the
/// gate before dropping the engine.
#[derive(Default)]
pub struct FakeDecoderGate {
    blocked: Mutex<bool>,
    released: Condvar,
}

impl FakeDecoderGate {
    pub fn set_blocked(&self, blocked: bool) {
        *self.blocked.lock().unwrap() = blocked;
        self.released.notify_all();
    }

    fn wait_until_open(&self) {
        let mut blocked = self.blocked.lock().unwrap();
        while *blocked {
            blocked = self.released.wait(blocked).unwrap();
        }
    }
}

/// Deterministic stand-in for an AV1 decoder. Emits I420 pictures whose luma
/// is filled with the frame index, honoring the flush contract (the next
/// chunk after a flush must be a keyframe) and an optional output delay.
pub struct FakeAv1Decoder {
    queue: VecDeque<Av1Picture>,
    /// Number of pictures held back, emulating decoder-internal delay.
    delay: usize,
    flushed: bool,
    gate: Option<Arc<FakeDecoderGate>>,
}

impl Av1Decoder for FakeAv1Decoder {
    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 13 {
            return Err(VolumaError::Av1Decode("short fake bitstream chunk".into()));
        }
        let frame = LittleEndian::read_u32(&data[0..4]);
        let width = LittleEndian::read_u32(&data[4..8]);
        let height = LittleEndian::read_u32(&data[8..12]);
        let is_keyframe = data[12] != 0;

        if self.flushed && !is_keyframe {
            return Err(VolumaError::Av1Decode(
                "non-keyframe sent directly after a flush".into(),
            ));
        }
        self.flushed = false;

        let luma_stride = width as usize + 7;
        let chroma_stride = width as usize / 2 + 3;
        self.queue.push_back(Av1Picture {
            width,
            height,
            bits_per_component: 8,
            layout: PixelLayout::I420,
            luma: PicturePlane {
                data: vec![frame as u8; luma_stride * height as usize],
                stride: luma_stride,
            },
            chroma_u: PicturePlane {
                data: vec![100; chroma_stride * height as usize / 2],
                stride: chroma_stride,
            },
            chroma_v: PicturePlane {
                data: vec![200; chroma_stride * height as usize / 2],
                stride: chroma_stride,
            },
        });
        Ok(())
    }

    fn next_picture(&mut self) -> Result<Option<Av1Picture>> {
        if let Some(gate) = &self.gate {
            gate.wait_until_open();
        }
        if self.queue.len() <= self.delay {
            return Ok(None);
        }
        Ok(self.queue.pop_front())
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.flushed = true;
    }
}

/// Factory producing [`FakeAv1Decoder`]s.
#[derive(Default)]
pub struct FakeAv1DecoderFactory {
    pub delay: usize,
    pub gate: Option<Arc<FakeDecoderGate>>,
}

impl Av1DecoderFactory for FakeAv1DecoderFactory {
    fn new_decoder(&self) -> Result<Box<dyn Av1Decoder>> {
        Ok(Box::new(FakeAv1Decoder {
            queue: VecDeque::new(),
            delay: self.delay,
            flushed: false,
            gate: self.gate.clone(),
        }))
    }
}

// ============================================================================
// Recording no-op GPU backend
// ============================================================================

/// One recorded upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedUpload {
    pub slot_index: usize,
    pub frame_start_timestamp: i64,
    pub vertex_count: usize,
}

/// GPU backend for tests: uploads complete immediately and all recording
/// calls are logged for assertions.
#[derive(Default)]
pub struct NullGpuBackend {
    next_token: AtomicU64,
    pub uploads: Mutex<Vec<RecordedUpload>>,
    pub invalidated_slots: Mutex<Vec<usize>>,
    pub draws: Mutex<Vec<(usize, usize)>>,
    /// When set, uploads fail with a GPU error.
    pub fail_uploads: Mutex<bool>,
}

impl GpuFrameBackend for NullGpuBackend {
    fn upload_frame_resources(
        &self,
        slot_index: usize,
        frame: &FrameData,
    ) -> Result<TransferToken> {
        if *self.fail_uploads.lock().unwrap() {
            return Err(VolumaError::GpuUpload("injected upload failure".into()));
        }
        self.uploads.lock().unwrap().push(RecordedUpload {
            slot_index,
            frame_start_timestamp: frame.metadata.start_timestamp,
            vertex_count: frame.content.vertices.len(),
        });
        Ok(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn await_upload(&self, _token: TransferToken, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn invalidate_slot(&self, slot_index: usize) {
        self.invalidated_slots.lock().unwrap().push(slot_index);
    }

    fn record_interpolate_deformation_state(
        &self,
        _cmd: &mut dyn std::any::Any,
        _display_slot: usize,
        _predecessor_slot: Option<usize>,
        _factor: f32,
        _dst_buffer_index: usize,
    ) {
    }

    fn record_view_setup(
        &self,
        _cmd: &mut dyn std::any::Any,
        _view_index: u32,
        _use_surface_normal_shading: bool,
    ) {
    }

    fn record_draw(
        &self,
        _cmd: &mut dyn std::any::Any,
        display_slot: usize,
        keyframe_slot: usize,
        _view_index: u32,
        _transforms: Option<&ViewTransforms>,
        _intra_frame_factor: f32,
    ) {
        self.draws.lock().unwrap().push((display_slot, keyframe_slot));
    }

    fn frames_in_flight(&self) -> usize {
        2
    }
}

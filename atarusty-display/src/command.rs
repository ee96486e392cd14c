/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The rendering backend interface and replayable command lists.
use core::fmt;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

/// A texture created by a [RenderContext].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// A vertex or index buffer created by a [RenderContext].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Pixel formats of textures and render targets.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit per channel, linear.
    Rgba8,
    /// 8-bit per channel, sRGB encoded.
    Rgba8Srgb,
    /// 16-bit float per channel, scRGB when used for HDR output.
    Rgba16Float,
}

impl TextureFormat {
    pub fn is_hdr(self) -> bool {
        self == TextureFormat::Rgba16Float
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TextureFormat::Rgba8 => "RGBA8",
            TextureFormat::Rgba8Srgb => "RGBA8 sRGB",
            TextureFormat::Rgba16Float => "RGBA16F",
        })
    }
}

/// A rectangle in pixels.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rect { x, y, width, height }
    }
    /// A rectangle at the origin.
    pub const fn sized(width: u32, height: u32) -> Self {
        Rect { x: 0, y: 0, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }
    /// Returns `true` if `other` lies entirely within this rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y &&
        other.right() <= self.right() && other.bottom() <= self.bottom()
    }
}

/// Where drawing goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderTarget {
    /// The swap chain's back buffer.
    BackBuffer,
    Texture(TextureId),
}

/// A render target with the viewport the caller set up for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderView {
    pub target: RenderTarget,
    pub format: TextureFormat,
    /// The full size of the target.
    pub size: (u32, u32),
    pub viewport: Rect,
}

impl RenderView {
    /// A view covering the whole texture.
    pub fn texture(texture: TextureId, format: TextureFormat, width: u32, height: u32) -> Self {
        RenderView {
            target: RenderTarget::Texture(texture),
            format,
            size: (width, height),
            viewport: Rect::sized(width, height)
        }
    }

    pub fn with_viewport(self, viewport: Rect) -> Self {
        RenderView { viewport, ..self }
    }
}

/// Shader programs the display nodes use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Program {
    Blit,
    BlitSharp,
    PalArtifacting,
    StretchBicubicH,
    StretchBicubicV,
    ScreenFx,
    BloomThreshold,
    BloomDownsample,
    BloomUpsample,
    BloomFinal,
    /// A pass of a custom effect, by index.
    CustomPass(u32),
}

/// Texture sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sampler {
    Point,
    Bilinear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub u: f32,
    pub v: f32,
}

/// The number of texture slots a draw may bind.
pub const TEXTURE_SLOTS: usize = 4;
/// The number of shader constants a draw may set.
pub const MAX_CONSTANTS: usize = 16;

/// A single indexed draw.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawCall {
    pub program: Program,
    pub sampler: Sampler,
    pub textures: [Option<TextureId>; TEXTURE_SLOTS],
    pub constants: Vec<f32>,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub first_index: u32,
    pub index_count: u32,
}

/// The rendering backend.
///
/// Nodes draw into whatever target the caller selected with [RenderContext::set_render_target]
/// and restore it if they switch targets themselves.
pub trait RenderContext {
    /// Changes whenever previously uploaded buffers may have been lost, e.g. on device reset.
    fn generation(&self) -> u64;
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> TextureId;
    fn destroy_texture(&mut self, texture: TextureId);
    /// Uploads 32-bit pixels, `pitch` counted in pixels.
    fn upload_texture(&mut self, texture: TextureId, pixels: &[u32], pitch: usize);
    fn create_buffer(&mut self) -> BufferId;
    fn upload_vertices(&mut self, buffer: BufferId, vertices: &[Vertex]);
    fn upload_indices(&mut self, buffer: BufferId, indices: &[u16]);
    fn render_target(&self) -> RenderView;
    fn set_render_target(&mut self, view: RenderView);
    fn clear(&mut self, color: [f32; 4]);
    fn draw(&mut self, call: &DrawCall);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Uploaded {
    generation: u64,
    context_generation: u64,
    vertex_buffer: BufferId,
    index_buffer: BufferId,
}

/// A pass of a command list: a range of indices drawn with one program.
#[derive(Clone, Debug, PartialEq)]
pub struct Pass {
    pub program: Program,
    pub sampler: Sampler,
    pub first_index: u32,
    pub index_count: u32,
}

/// Geometry built once and replayed each frame.
///
/// Vertex and index data are uploaded on the first replay and again only after the list was
/// modified or the context's generation changed.
#[derive(Clone, Debug, Default)]
pub struct CommandList {
    vertices: Vec<Vertex>,
    indices: Vec<u16>,
    passes: Vec<Pass>,
    generation: u64,
    uploaded: Option<Uploaded>,
}

impl CommandList {
    pub fn new() -> Self {
        CommandList::default()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.passes.clear();
        self.generation = self.generation.wrapping_add(1);
    }
    /// Adds a quad covering `dst` in target pixels, sampling `uv` in normalized coordinates.
    pub fn add_quad(&mut self, program: Program, sampler: Sampler, dst: Rect, uv: [f32; 4]) {
        let base = self.vertices.len() as u16;
        let (x0, y0) = (dst.x as f32, dst.y as f32);
        let (x1, y1) = (x0 + dst.width as f32, y0 + dst.height as f32);
        let [u0, v0, u1, v1] = uv;
        self.vertices.extend_from_slice(&[
            Vertex { x: x0, y: y0, u: u0, v: v0 },
            Vertex { x: x1, y: y0, u: u1, v: v0 },
            Vertex { x: x0, y: y1, u: u0, v: v1 },
            Vertex { x: x1, y: y1, u: u1, v: v1 },
        ]);
        let first_index = self.indices.len() as u32;
        self.indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 1, base + 3]);
        self.passes.push(Pass { program, sampler, first_index, index_count: 6 });
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }
    /// Replays pass `index` with the given textures and constants.
    pub fn replay(
            &mut self,
            ctx: &mut dyn RenderContext,
            index: usize,
            textures: [Option<TextureId>; TEXTURE_SLOTS],
            constants: &[f32]
        )
    {
        let (vertex_buffer, index_buffer) = self.upload(ctx);
        if let Some(pass) = self.passes.get(index) {
            let constants = &constants[..constants.len().min(MAX_CONSTANTS)];
            ctx.draw(&DrawCall {
                program: pass.program,
                sampler: pass.sampler,
                textures,
                constants: constants.to_vec(),
                vertex_buffer,
                index_buffer,
                first_index: pass.first_index,
                index_count: pass.index_count
            });
        }
    }

    fn upload(&mut self, ctx: &mut dyn RenderContext) -> (BufferId, BufferId) {
        let context_generation = ctx.generation();
        let (vertex_buffer, index_buffer) = match self.uploaded {
            Some(up) if up.context_generation == context_generation => {
                if up.generation == self.generation {
                    return (up.vertex_buffer, up.index_buffer)
                }
                (up.vertex_buffer, up.index_buffer)
            }
            _ => (ctx.create_buffer(), ctx.create_buffer())
        };
        trace!("uploading {} vertices", self.vertices.len());
        ctx.upload_vertices(vertex_buffer, &self.vertices);
        ctx.upload_indices(index_buffer, &self.indices);
        self.uploaded = Some(Uploaded {
            generation: self.generation,
            context_generation,
            vertex_buffer,
            index_buffer
        });
        (vertex_buffer, index_buffer)
    }
}

/// Selects the back buffer format.
///
/// HDR scRGB is used only when it is both requested and supported by the monitor.
pub fn select_backbuffer_format(hdr_requested: bool, hdr_supported: bool, srgb: bool) -> TextureFormat {
    if hdr_requested && hdr_supported {
        TextureFormat::Rgba16Float
    }
    else if srgb {
        TextureFormat::Rgba8Srgb
    }
    else {
        TextureFormat::Rgba8
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records everything the nodes ask for.
    #[derive(Debug)]
    pub struct Recorder {
        pub generation: u64,
        pub next_id: u32,
        pub textures: Vec<(TextureId, u32, u32, TextureFormat)>,
        pub destroyed: Vec<TextureId>,
        pub uploads: Vec<TextureId>,
        pub vertex_uploads: usize,
        pub target: RenderView,
        pub targets: Vec<RenderView>,
        pub clears: Vec<(RenderView, [f32; 4])>,
        pub draws: Vec<(RenderView, DrawCall)>,
    }

    impl Recorder {
        pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
            Recorder {
                generation: 1,
                next_id: 1,
                textures: Vec::new(),
                destroyed: Vec::new(),
                uploads: Vec::new(),
                vertex_uploads: 0,
                target: RenderView {
                    target: RenderTarget::BackBuffer,
                    format,
                    size: (width, height),
                    viewport: Rect::sized(width, height)
                },
                targets: Vec::new(),
                clears: Vec::new(),
                draws: Vec::new(),
            }
        }

        pub fn programs(&self) -> Vec<Program> {
            self.draws.iter().map(|(_, call)| call.program).collect()
        }

        pub fn reset_log(&mut self) {
            self.uploads.clear();
            self.vertex_uploads = 0;
            self.targets.clear();
            self.clears.clear();
            self.draws.clear();
        }

        fn next(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id - 1
        }
    }

    impl RenderContext for Recorder {
        fn generation(&self) -> u64 {
            self.generation
        }

        fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> TextureId {
            let id = TextureId(self.next());
            self.textures.push((id, width, height, format));
            id
        }

        fn destroy_texture(&mut self, texture: TextureId) {
            self.destroyed.push(texture);
        }

        fn upload_texture(&mut self, texture: TextureId, _pixels: &[u32], _pitch: usize) {
            self.uploads.push(texture);
        }

        fn create_buffer(&mut self) -> BufferId {
            BufferId(self.next())
        }

        fn upload_vertices(&mut self, _buffer: BufferId, _vertices: &[Vertex]) {
            self.vertex_uploads += 1;
        }

        fn upload_indices(&mut self, _buffer: BufferId, _indices: &[u16]) {}

        fn render_target(&self) -> RenderView {
            self.target
        }

        fn set_render_target(&mut self, view: RenderView) {
            self.target = view;
            self.targets.push(view);
        }

        fn clear(&mut self, color: [f32; 4]) {
            self.clears.push((self.target, color));
        }

        fn draw(&mut self, call: &DrawCall) {
            self.draws.push((self.target, call.clone()));
        }
    }

    #[test]
    fn command_list_uploads_once() {
        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba8);
        let mut list = CommandList::new();
        list.add_quad(Program::Blit, Sampler::Point, Rect::new(10, 20, 100, 50), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(list.vertices()[3], Vertex { x: 110.0, y: 70.0, u: 1.0, v: 1.0 });
        let tex = [Some(TextureId(99)), None, None, None];
        for _ in 0..3 {
            list.replay(&mut ctx, 0, tex, &[]);
        }
        assert_eq!(ctx.vertex_uploads, 1);
        assert_eq!(ctx.draws.len(), 3);
        assert_eq!(ctx.draws[2].1.index_count, 6);
        // a lost device forces a fresh upload into new buffers
        let first = ctx.draws[0].1.vertex_buffer;
        ctx.generation += 1;
        list.replay(&mut ctx, 0, tex, &[]);
        assert_eq!(ctx.vertex_uploads, 2);
        assert_ne!(ctx.draws[3].1.vertex_buffer, first);
        // modifying the list reuses the buffers
        list.add_quad(Program::Blit, Sampler::Bilinear, Rect::sized(4, 4), [0.0, 0.0, 1.0, 1.0]);
        list.replay(&mut ctx, 1, tex, &[1.0; 20]);
        assert_eq!(ctx.vertex_uploads, 3);
        assert_eq!(ctx.draws[4].1.vertex_buffer, ctx.draws[3].1.vertex_buffer);
        assert_eq!(ctx.draws[4].1.first_index, 6);
        assert_eq!(ctx.draws[4].1.constants.len(), MAX_CONSTANTS);
    }

    #[test]
    fn backbuffer_format_selection() {
        assert_eq!(select_backbuffer_format(true, true, true), TextureFormat::Rgba16Float);
        assert_eq!(select_backbuffer_format(true, false, true), TextureFormat::Rgba8Srgb);
        assert_eq!(select_backbuffer_format(false, true, false), TextureFormat::Rgba8);
        assert!(TextureFormat::Rgba16Float.is_hdr());
        assert_eq!(TextureFormat::Rgba8Srgb.to_string(), "RGBA8 sRGB");
    }

    #[test]
    fn rect_containment() {
        let viewport = Rect::sized(640, 480);
        assert!(viewport.contains_rect(&Rect::new(0, 0, 640, 480)));
        assert!(!viewport.contains_rect(&Rect::new(-1, 0, 640, 480)));
        assert!(!viewport.contains_rect(&Rect::new(1, 0, 640, 480)));
        assert!(Rect::new(5, 5, 0, 3).is_empty());
    }
}

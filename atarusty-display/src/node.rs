/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Display graph nodes.
//!
//! Source nodes produce a texture, display nodes draw into the current render target. Nodes
//! never assume which target that is: a node rendering into its own textures saves the
//! caller's target and restores it when done.
use core::fmt;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use crate::command::{
    CommandList, Program, Rect, RenderContext, RenderView, Sampler, TextureFormat, TextureId,
    TEXTURE_SLOTS
};

/// A frame of emulated video, 32-bit pixels.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub pixels: &'a [u32],
    /// Pixels per row, including padding.
    pub pitch: usize,
    pub width: u32,
    pub height: u32,
    /// Changes whenever the pixels change.
    pub generation: u64,
}

impl<'a> Frame<'a> {
    pub fn new(pixels: &'a [u32], pitch: usize, width: u32, height: u32, generation: u64) -> Self {
        Frame { pixels, pitch, width, height, generation }
    }
    /// Returns `true` if the pixel data covers the frame's dimensions.
    pub fn is_complete(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false
        }
        self.pitch >= self.width as usize &&
        self.pixels.len() >= self.pitch * (self.height as usize - 1) + self.width as usize
    }
}

/// Where a source node's image lies within its texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceTexMapping {
    pub uv_offset: [f32; 2],
    pub texel_offset: [u32; 2],
    pub uv_size: [f32; 2],
    pub texel_size: [u32; 2],
    pub tex_width: u32,
    pub tex_height: u32,
}

impl SourceTexMapping {
    /// An image of `width` x `height` at the origin of a texture.
    pub fn new(width: u32, height: u32, tex_width: u32, tex_height: u32) -> Self {
        SourceTexMapping {
            uv_offset: [0.0, 0.0],
            texel_offset: [0, 0],
            uv_size: [width as f32 / tex_width.max(1) as f32, height as f32 / tex_height.max(1) as f32],
            texel_size: [width, height],
            tex_width,
            tex_height
        }
    }
    /// A texture holding exactly the image.
    pub fn exact(width: u32, height: u32) -> Self {
        SourceTexMapping::new(width, height, width, height)
    }
    /// Normalized `[u0, v0, u1, v1]`.
    pub fn uv_rect(&self) -> [f32; 4] {
        let [u, v] = self.uv_offset;
        let [w, h] = self.uv_size;
        [u, v, u + w, v + h]
    }

    pub fn width(&self) -> u32 {
        self.texel_size[0]
    }

    pub fn height(&self) -> u32 {
        self.texel_size[1]
    }
}

/// How the final image is scaled to the destination rectangle.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Point,
    Bilinear,
    /// Bilinear with pixel edges kept sharp.
    SharpBilinear,
    Bicubic,
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::SharpBilinear
    }
}

impl FilterMode {
    fn blit(self) -> (Program, Sampler) {
        match self {
            FilterMode::Point => (Program::Blit, Sampler::Point),
            FilterMode::SharpBilinear => (Program::BlitSharp, Sampler::Bilinear),
            FilterMode::Bilinear|FilterMode::Bicubic => (Program::Blit, Sampler::Bilinear),
        }
    }
}

/// The kind of aperture mask overlaid by [ScreenFxNode].
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaskKind {
    ApertureGrille = 1,
    SlotMask = 2,
    DotTriad = 3,
}

#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskParams {
    pub kind: MaskKind,
    /// Mask period in destination pixels.
    pub pitch: f32,
    pub intensity: f32,
}

/// CRT emulation parameters.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenFxParams {
    /// Horizontal barrel distortion, 0 is flat.
    pub distortion_x: f32,
    pub distortion_y_ratio: f32,
    /// 0 disables scanlines.
    pub scanline_intensity: f32,
    pub gamma: f32,
    /// Row-major 3x3 matrix applied to linear RGB.
    pub color_matrix: Option<[[f32; 3]; 3]>,
    pub mask: Option<MaskParams>,
}

impl Default for ScreenFxParams {
    fn default() -> Self {
        ScreenFxParams {
            distortion_x: 0.0,
            distortion_y_ratio: 0.0,
            scanline_intensity: 0.0,
            gamma: 1.0,
            color_matrix: None,
            mask: None
        }
    }
}

impl ScreenFxParams {
    fn constants(&self) -> [f32; 16] {
        let mut c = [0.0f32; 16];
        c[0] = self.distortion_x;
        c[1] = self.distortion_y_ratio;
        c[2] = self.scanline_intensity;
        c[3] = self.gamma;
        if let Some(mask) = self.mask {
            c[4] = mask.kind as u8 as f32;
            c[5] = mask.pitch;
            c[6] = mask.intensity;
        }
        let matrix = self.color_matrix.unwrap_or([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        for (dst, src) in c[7..].iter_mut().zip(matrix.iter().flatten()) {
            *dst = *src;
        }
        c
    }
}

#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BloomParams {
    pub threshold: f32,
    /// Blur radius in destination pixels.
    pub radius: f32,
    pub direct_intensity: f32,
    pub indirect_intensity: f32,
}

impl Default for BloomParams {
    fn default() -> Self {
        BloomParams { threshold: 0.5, radius: 8.0, direct_intensity: 1.0, indirect_intensity: 0.5 }
    }
}

/// The most bloom pyramid levels.
pub const MAX_BLOOM_LEVELS: u32 = 6;

impl BloomParams {
    /// Pyramid levels needed for the radius, each halving the resolution.
    pub fn levels(&self) -> u32 {
        let mut levels = 1;
        let mut reach = 2.0f32;
        while reach < self.radius && levels < MAX_BLOOM_LEVELS {
            reach *= 2.0;
            levels += 1;
        }
        levels
    }
}

/// A user supplied chain of effect passes.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomEffect {
    /// The effect file the passes were loaded from.
    pub path: String,
    pub passes: u32,
    /// Previous source frames the passes sample.
    pub history: usize,
}

/// A node producing a texture.
pub trait SourceNode: fmt::Debug {
    fn name(&self) -> &'static str;
    fn mapping(&self) -> SourceTexMapping;
    /// Brings the texture up to date with `frame` and returns it.
    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId;
    /// The texture of the frame `age` frames before the latest one.
    fn history(&self, _age: usize) -> Option<TextureId> {
        None
    }
    /// Requests `len` previous frames to be kept. Returns `false` if the node can't.
    fn set_queue_length(&mut self, _len: usize) -> bool {
        false
    }
    fn release(&mut self, ctx: &mut dyn RenderContext);
    /// Appends the names of this node and the nodes it draws from.
    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
    }
}

/// A node drawing into the current render target.
pub trait DisplayNode: fmt::Debug {
    fn name(&self) -> &'static str;
    fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>);
    fn release(&mut self, ctx: &mut dyn RenderContext);
    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
    }
}

/// An offscreen texture with the command list drawing into it.
#[derive(Debug)]
struct RenderPass {
    texture: Option<TextureId>,
    width: u32,
    height: u32,
    format: TextureFormat,
    list: CommandList,
}

impl RenderPass {
    fn new(program: Program, sampler: Sampler, width: u32, height: u32, format: TextureFormat, uv: [f32; 4]) -> Self {
        let mut list = CommandList::new();
        list.add_quad(program, sampler, Rect::sized(width, height), uv);
        RenderPass { texture: None, width, height, format, list }
    }

    fn run(&mut self, ctx: &mut dyn RenderContext, textures: [Option<TextureId>; TEXTURE_SLOTS], constants: &[f32]) -> TextureId {
        let (width, height, format) = (self.width, self.height, self.format);
        let texture = *self.texture.get_or_insert_with(|| ctx.create_texture(width, height, format));
        let saved = ctx.render_target();
        ctx.set_render_target(RenderView::texture(texture, format, width, height));
        self.list.replay(ctx, 0, textures, constants);
        ctx.set_render_target(saved);
        texture
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        if let Some(texture) = self.texture.take() {
            ctx.destroy_texture(texture);
        }
    }
}

fn single(texture: TextureId) -> [Option<TextureId>; TEXTURE_SLOTS] {
    [Some(texture), None, None, None]
}

/// Uploads the frame straight into a texture and draws it to the destination rectangle.
#[derive(Debug)]
pub struct ImageNode {
    texture: Option<TextureId>,
    width: u32,
    height: u32,
    dest: Rect,
    filter: FilterMode,
    last_generation: Option<u64>,
    list: CommandList,
}

impl ImageNode {
    pub fn new(width: u32, height: u32, dest: Rect, filter: FilterMode) -> Self {
        let (program, sampler) = filter.blit();
        let mut list = CommandList::new();
        list.add_quad(program, sampler, dest, SourceTexMapping::exact(width, height).uv_rect());
        ImageNode { texture: None, width, height, dest, filter, last_generation: None, list }
    }

    pub fn dest(&self) -> Rect {
        self.dest
    }

    pub fn filter(&self) -> FilterMode {
        self.filter
    }
}

impl DisplayNode for ImageNode {
    fn name(&self) -> &'static str {
        "image"
    }

    fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) {
        let (width, height) = (self.width, self.height);
        let texture = *self.texture.get_or_insert_with(|| {
            ctx.create_texture(width, height, TextureFormat::Rgba8)
        });
        if self.last_generation != Some(frame.generation) {
            ctx.upload_texture(texture, frame.pixels, frame.pitch);
            self.last_generation = Some(frame.generation);
        }
        self.list.replay(ctx, 0, single(texture), &[]);
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        if let Some(texture) = self.texture.take() {
            ctx.destroy_texture(texture);
        }
    }
}

/// Buffers uploaded frames for the nodes that process them.
///
/// Keeps a queue of previous frames once [SourceNode::set_queue_length] asks for it.
#[derive(Debug)]
pub struct ImageSourceNode {
    width: u32,
    height: u32,
    format: TextureFormat,
    /// Frame textures, `head` is the latest.
    queue: Vec<TextureId>,
    queue_length: usize,
    head: usize,
    filled: usize,
    last_generation: Option<u64>,
}

impl ImageSourceNode {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        ImageSourceNode {
            width, height, format,
            queue: Vec::new(),
            queue_length: 0,
            head: 0,
            filled: 0,
            last_generation: None
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length
    }
}

impl SourceNode for ImageSourceNode {
    fn name(&self) -> &'static str {
        "image-source"
    }

    fn mapping(&self) -> SourceTexMapping {
        SourceTexMapping::exact(self.width, self.height)
    }

    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId {
        let slots = self.queue_length + 1;
        while self.queue.len() < slots {
            let texture = ctx.create_texture(self.width, self.height, self.format);
            self.queue.push(texture);
        }
        if self.last_generation != Some(frame.generation) {
            if self.last_generation.is_some() {
                self.head = (self.head + 1) % slots;
            }
            ctx.upload_texture(self.queue[self.head], frame.pixels, frame.pitch);
            self.filled = (self.filled + 1).min(slots);
            self.last_generation = Some(frame.generation);
        }
        self.queue[self.head]
    }

    fn history(&self, age: usize) -> Option<TextureId> {
        if age >= self.filled {
            return None
        }
        let slots = self.queue.len();
        Some(self.queue[(self.head + slots - age) % slots])
    }

    fn set_queue_length(&mut self, len: usize) -> bool {
        if len != self.queue_length {
            debug!("source history: {} frames", len);
            self.queue_length = len;
            // the queue is rebuilt on the next frame
            self.queue.clear();
            self.head = 0;
            self.filled = 0;
            self.last_generation = None;
        }
        true
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        for texture in self.queue.drain(..) {
            ctx.destroy_texture(texture);
        }
        self.filled = 0;
        self.head = 0;
        self.last_generation = None;
    }
}

/// Blends PAL chroma of adjacent lines.
#[derive(Debug)]
pub struct ArtifactingNode {
    source: Box<dyn SourceNode>,
    pass: RenderPass,
    mapping: SourceTexMapping,
    last_generation: Option<u64>,
}

impl ArtifactingNode {
    pub fn new(source: Box<dyn SourceNode>, format: TextureFormat) -> Self {
        let src = source.mapping();
        let (width, height) = (src.width(), src.height());
        let pass = RenderPass::new(Program::PalArtifacting, Sampler::Point, width, height, format, src.uv_rect());
        ArtifactingNode { source, pass, mapping: SourceTexMapping::exact(width, height), last_generation: None }
    }
}

impl SourceNode for ArtifactingNode {
    fn name(&self) -> &'static str {
        "pal-artifacting"
    }

    fn mapping(&self) -> SourceTexMapping {
        self.mapping
    }

    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId {
        let input = self.source.prepare(ctx, frame);
        match (self.pass.texture, self.last_generation) {
            (Some(texture), Some(generation)) if generation == frame.generation => texture,
            _ => {
                self.last_generation = Some(frame.generation);
                let height = self.mapping.height() as f32;
                self.pass.run(ctx, single(input), &[1.0 / height])
            }
        }
    }

    fn history(&self, age: usize) -> Option<TextureId> {
        self.source.history(age)
    }

    fn set_queue_length(&mut self, len: usize) -> bool {
        self.source.set_queue_length(len)
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        self.pass.release(ctx);
        self.source.release(ctx);
        self.last_generation = None;
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// Runs a custom effect's passes over the source.
///
/// Every pass samples the previous pass output, the original source and the two most recent
/// history frames.
#[derive(Debug)]
pub struct CustomEffectNode {
    source: Box<dyn SourceNode>,
    effect: CustomEffect,
    passes: Vec<RenderPass>,
    mapping: SourceTexMapping,
}

impl CustomEffectNode {
    pub fn new(source: Box<dyn SourceNode>, effect: CustomEffect, format: TextureFormat) -> Self {
        let src = source.mapping();
        let (width, height) = (src.width(), src.height());
        let passes = (0..effect.passes.max(1)).map(|i| {
            let uv = if i == 0 { src.uv_rect() } else { [0.0, 0.0, 1.0, 1.0] };
            RenderPass::new(Program::CustomPass(i), Sampler::Bilinear, width, height, format, uv)
        }).collect();
        CustomEffectNode { source, effect, passes, mapping: SourceTexMapping::exact(width, height) }
    }
    /// Asks the source to keep the history frames the effect samples.
    ///
    /// Called once the node is built, the source node does not know the effect beforehand.
    pub fn request_history(&mut self) -> bool {
        let history = self.effect.history;
        if !self.source.set_queue_length(history) {
            warn!("custom effect {}: source can't keep {} frames", self.effect.path, history);
            return false
        }
        true
    }

    pub fn effect(&self) -> &CustomEffect {
        &self.effect
    }
}

impl SourceNode for CustomEffectNode {
    fn name(&self) -> &'static str {
        "custom-effect"
    }

    fn mapping(&self) -> SourceTexMapping {
        self.mapping
    }

    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId {
        let original = self.source.prepare(ctx, frame);
        let history = [self.source.history(1), self.source.history(2)];
        let constants = [frame.generation as f32];
        let mut input = original;
        for pass in self.passes.iter_mut() {
            input = pass.run(ctx, [Some(input), Some(original), history[0], history[1]], &constants);
        }
        input
    }

    fn history(&self, age: usize) -> Option<TextureId> {
        self.source.history(age)
    }

    fn set_queue_length(&mut self, len: usize) -> bool {
        self.source.set_queue_length(len.max(self.effect.history))
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        for pass in self.passes.iter_mut() {
            pass.release(ctx);
        }
        self.source.release(ctx);
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// Resamples the source to the destination size with a separable bicubic filter.
#[derive(Debug)]
pub struct StretchBicubicNode {
    source: Box<dyn SourceNode>,
    horizontal: RenderPass,
    vertical: RenderPass,
    mapping: SourceTexMapping,
}

impl StretchBicubicNode {
    pub fn new(source: Box<dyn SourceNode>, width: u32, height: u32, format: TextureFormat) -> Self {
        let src = source.mapping();
        let horizontal = RenderPass::new(Program::StretchBicubicH, Sampler::Point,
                                         width, src.height(), format, src.uv_rect());
        let vertical = RenderPass::new(Program::StretchBicubicV, Sampler::Point,
                                       width, height, format, [0.0, 0.0, 1.0, 1.0]);
        StretchBicubicNode { source, horizontal, vertical, mapping: SourceTexMapping::exact(width, height) }
    }
}

impl SourceNode for StretchBicubicNode {
    fn name(&self) -> &'static str {
        "stretch-bicubic"
    }

    fn mapping(&self) -> SourceTexMapping {
        self.mapping
    }

    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId {
        let src = self.source.mapping();
        let input = self.source.prepare(ctx, frame);
        let (dw, dh) = (self.mapping.width() as f32, self.mapping.height() as f32);
        let (sw, sh) = (src.width() as f32, src.height() as f32);
        let half = self.horizontal.run(ctx, single(input), &[sw, dw, src.uv_size[0]]);
        self.vertical.run(ctx, single(half), &[sh, dh, 1.0])
    }

    fn history(&self, age: usize) -> Option<TextureId> {
        self.source.history(age)
    }

    fn set_queue_length(&mut self, len: usize) -> bool {
        self.source.set_queue_length(len)
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        self.horizontal.release(ctx);
        self.vertical.release(ctx);
        self.source.release(ctx);
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// CRT emulation: distortion, scanlines, color matrix and aperture mask.
#[derive(Debug)]
pub struct ScreenFxNode {
    source: Box<dyn SourceNode>,
    params: ScreenFxParams,
    pass: RenderPass,
    mapping: SourceTexMapping,
}

impl ScreenFxNode {
    pub fn new(source: Box<dyn SourceNode>, params: ScreenFxParams, format: TextureFormat) -> Self {
        let src = source.mapping();
        let (width, height) = (src.width(), src.height());
        let pass = RenderPass::new(Program::ScreenFx, Sampler::Bilinear, width, height, format, src.uv_rect());
        ScreenFxNode { source, params, pass, mapping: SourceTexMapping::exact(width, height) }
    }

    pub fn params(&self) -> &ScreenFxParams {
        &self.params
    }
}

impl SourceNode for ScreenFxNode {
    fn name(&self) -> &'static str {
        "screen-fx"
    }

    fn mapping(&self) -> SourceTexMapping {
        self.mapping
    }

    fn prepare(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> TextureId {
        let input = self.source.prepare(ctx, frame);
        self.pass.run(ctx, single(input), &self.params.constants())
    }

    fn history(&self, age: usize) -> Option<TextureId> {
        self.source.history(age)
    }

    fn set_queue_length(&mut self, len: usize) -> bool {
        self.source.set_queue_length(len)
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        self.pass.release(ctx);
        self.source.release(ctx);
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// Draws a source to the destination rectangle.
#[derive(Debug)]
pub struct BlitNode {
    source: Box<dyn SourceNode>,
    list: CommandList,
}

impl BlitNode {
    pub fn new(source: Box<dyn SourceNode>, dest: Rect, filter: FilterMode) -> Self {
        let (program, sampler) = filter.blit();
        let mut list = CommandList::new();
        list.add_quad(program, sampler, dest, source.mapping().uv_rect());
        BlitNode { source, list }
    }
}

impl DisplayNode for BlitNode {
    fn name(&self) -> &'static str {
        "blit"
    }

    fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) {
        let texture = self.source.prepare(ctx, frame);
        self.list.replay(ctx, 0, single(texture), &[]);
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        self.source.release(ctx);
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// Adds glow around bright areas while drawing the source to the destination rectangle.
///
/// Bright areas are extracted at half resolution, downsampled through a pyramid with a
/// multi-tap filter, then upsampled back and combined with the source.
#[derive(Debug)]
pub struct BloomNode {
    source: Box<dyn SourceNode>,
    params: BloomParams,
    down: Vec<RenderPass>,
    up: Vec<RenderPass>,
    list: CommandList,
}

impl BloomNode {
    pub fn new(source: Box<dyn SourceNode>, params: BloomParams, dest: Rect, format: TextureFormat) -> Self {
        let src = source.mapping();
        let levels = params.levels();
        let mut sizes = Vec::with_capacity(levels as usize);
        let (mut width, mut height) = (dest.width.max(2), dest.height.max(2));
        for _ in 0..levels {
            width = (width / 2).max(1);
            height = (height / 2).max(1);
            sizes.push((width, height));
        }
        let down = sizes.iter().enumerate().map(|(i, &(w, h))| {
            let (program, uv) = if i == 0 {
                (Program::BloomThreshold, src.uv_rect())
            }
            else {
                (Program::BloomDownsample, [0.0, 0.0, 1.0, 1.0])
            };
            RenderPass::new(program, Sampler::Bilinear, w, h, format, uv)
        }).collect();
        let up = sizes.iter().rev().skip(1).map(|&(w, h)| {
            RenderPass::new(Program::BloomUpsample, Sampler::Bilinear, w, h, format, [0.0, 0.0, 1.0, 1.0])
        }).collect();
        let mut list = CommandList::new();
        list.add_quad(Program::BloomFinal, Sampler::Bilinear, dest, src.uv_rect());
        BloomNode { source, params, down, up, list }
    }

    pub fn levels(&self) -> usize {
        self.down.len()
    }
}

impl DisplayNode for BloomNode {
    fn name(&self) -> &'static str {
        "bloom"
    }

    fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) {
        let input = self.source.prepare(ctx, frame);
        let threshold = [self.params.threshold];
        let mut level = input;
        let mut pyramid = Vec::with_capacity(self.down.len());
        for pass in self.down.iter_mut() {
            level = pass.run(ctx, single(level), &threshold);
            pyramid.push(level);
        }
        // each upsample adds the next larger level of the pyramid
        let mut blurred = level;
        for (pass, &larger) in self.up.iter_mut().zip(pyramid.iter().rev().skip(1)) {
            blurred = pass.run(ctx, [Some(blurred), Some(larger), None, None], &[]);
        }
        let intensity = [self.params.direct_intensity, self.params.indirect_intensity];
        self.list.replay(ctx, 0, [Some(input), Some(blurred), None, None], &intensity);
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        for pass in self.down.iter_mut().chain(self.up.iter_mut()) {
            pass.release(ctx);
        }
        self.source.release(ctx);
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        self.source.chain(names);
    }
}

/// Clears the current viewport.
#[derive(Debug)]
pub struct ClearNode {
    pub color: [f32; 4],
}

impl DisplayNode for ClearNode {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn draw(&mut self, ctx: &mut dyn RenderContext, _frame: &Frame<'_>) {
        ctx.clear(self.color);
    }

    fn release(&mut self, _ctx: &mut dyn RenderContext) {}
}

/// Draws its nodes in order.
#[derive(Debug, Default)]
pub struct SequenceNode {
    nodes: Vec<Box<dyn DisplayNode>>,
}

impl SequenceNode {
    pub fn new() -> Self {
        SequenceNode::default()
    }

    pub fn push(&mut self, node: Box<dyn DisplayNode>) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl DisplayNode for SequenceNode {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) {
        for node in self.nodes.iter_mut() {
            node.draw(ctx, frame);
        }
    }

    fn release(&mut self, ctx: &mut dyn RenderContext) {
        for node in self.nodes.iter_mut() {
            node.release(ctx);
        }
    }

    fn chain(&self, names: &mut Vec<&'static str>) {
        names.push(self.name());
        for node in self.nodes.iter() {
            node.chain(names);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::Recorder;
    use crate::command::RenderTarget;

    fn frame(pixels: &[u32], generation: u64) -> Frame<'_> {
        Frame::new(pixels, 4, 4, 2, generation)
    }

    #[test]
    fn source_mapping_works() {
        let mapping = SourceTexMapping::new(336, 240, 512, 256);
        assert_eq!(mapping.uv_rect(), [0.0, 0.0, 336.0 / 512.0, 240.0 / 256.0]);
        assert_eq!((mapping.width(), mapping.height()), (336, 240));
        assert_eq!(SourceTexMapping::exact(8, 8).uv_rect(), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn frame_completeness() {
        let pixels = [0u32; 8];
        assert!(frame(&pixels, 0).is_complete());
        assert!(!Frame::new(&pixels, 3, 4, 2, 0).is_complete());
        assert!(!Frame::new(&pixels, 5, 4, 2, 0).is_complete());
        assert!(!Frame::new(&pixels[..7], 4, 4, 2, 0).is_complete());
        assert!(!Frame::new(&pixels, 4, 0, 2, 0).is_complete());
    }

    #[test]
    fn image_node_uploads_changed_frames_only() {
        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba8);
        let mut node = ImageNode::new(4, 2, Rect::new(0, 0, 640, 480), FilterMode::Point);
        let pixels = [0u32; 8];
        node.draw(&mut ctx, &frame(&pixels, 1));
        node.draw(&mut ctx, &frame(&pixels, 1));
        node.draw(&mut ctx, &frame(&pixels, 2));
        assert_eq!(ctx.uploads.len(), 2);
        assert_eq!(ctx.programs(), [Program::Blit; 3]);
        assert_eq!(ctx.draws[0].1.sampler, Sampler::Point);
        assert_eq!(ctx.vertex_uploads, 1);
        node.release(&mut ctx);
        assert_eq!(ctx.destroyed.len(), 1);
    }

    #[test]
    fn image_source_keeps_history() {
        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba8);
        let mut node = ImageSourceNode::new(4, 2, TextureFormat::Rgba8);
        assert!(node.set_queue_length(2));
        let pixels = [0u32; 8];
        let first = node.prepare(&mut ctx, &frame(&pixels, 1));
        assert_eq!(node.history(0), Some(first));
        assert_eq!(node.history(1), None);
        assert_eq!(node.prepare(&mut ctx, &frame(&pixels, 1)), first);
        let second = node.prepare(&mut ctx, &frame(&pixels, 2));
        let third = node.prepare(&mut ctx, &frame(&pixels, 3));
        assert_eq!(node.history(1), Some(second));
        assert_eq!(node.history(2), Some(first));
        let fourth = node.prepare(&mut ctx, &frame(&pixels, 4));
        assert_eq!(fourth, first);
        assert_eq!(node.history(1), Some(third));
        assert_eq!(ctx.textures.len(), 3);
        assert_eq!(ctx.uploads.len(), 4);
    }

    #[test]
    fn offscreen_passes_restore_target() {
        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba8);
        let source = Box::new(ImageSourceNode::new(4, 2, TextureFormat::Rgba8));
        let fx = Box::new(ScreenFxNode::new(source, ScreenFxParams::default(), TextureFormat::Rgba8));
        let mut node = BlitNode::new(fx, Rect::new(10, 10, 8, 4), FilterMode::Bilinear);
        let pixels = [0u32; 8];
        node.draw(&mut ctx, &frame(&pixels, 1));
        assert_eq!(ctx.programs(), [Program::ScreenFx, Program::Blit]);
        assert!(matches!(ctx.draws[0].0.target, RenderTarget::Texture(..)));
        assert_eq!(ctx.draws[1].0.target, RenderTarget::BackBuffer);
        assert_eq!(ctx.target.target, RenderTarget::BackBuffer);
        assert_eq!(ctx.draws[0].1.constants[3], 1.0);
        assert_eq!(ctx.draws[0].1.constants[7], 1.0);
        let mut names = Vec::new();
        node.chain(&mut names);
        assert_eq!(names, ["blit", "screen-fx", "image-source"]);
    }

    #[test]
    fn bloom_pyramid() {
        let params = BloomParams { radius: 16.0, ..BloomParams::default() };
        assert_eq!(params.levels(), 4);
        assert_eq!(BloomParams { radius: 1.0, ..params }.levels(), 1);
        assert_eq!(BloomParams { radius: 1.0e6, ..params }.levels(), MAX_BLOOM_LEVELS);

        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba16Float);
        let source = Box::new(ImageSourceNode::new(4, 2, TextureFormat::Rgba16Float));
        let mut node = BloomNode::new(source, params, Rect::sized(640, 480), TextureFormat::Rgba16Float);
        assert_eq!(node.levels(), 4);
        let pixels = [0u32; 8];
        node.draw(&mut ctx, &frame(&pixels, 1));
        assert_eq!(ctx.programs(), [
            Program::BloomThreshold, Program::BloomDownsample, Program::BloomDownsample,
            Program::BloomDownsample, Program::BloomUpsample, Program::BloomUpsample,
            Program::BloomUpsample, Program::BloomFinal
        ]);
        let sizes: Vec<_> = ctx.textures.iter().skip(1).map(|&(_, w, h, _)| (w, h)).collect();
        assert_eq!(&sizes[..4], [(320, 240), (160, 120), (80, 60), (40, 30)]);
        assert_eq!(&sizes[4..], [(80, 60), (160, 120), (320, 240)]);
        assert_eq!(ctx.draws[7].0.target, RenderTarget::BackBuffer);
    }

    #[test]
    fn custom_effect_requests_history_after_construction() {
        let mut ctx = Recorder::new(640, 480, TextureFormat::Rgba8);
        let effect = CustomEffect { path: "crt.fx".into(), passes: 2, history: 2 };
        let source = Box::new(ImageSourceNode::new(4, 2, TextureFormat::Rgba8));
        let pal = Box::new(ArtifactingNode::new(source, TextureFormat::Rgba8));
        let mut node = CustomEffectNode::new(pal, effect, TextureFormat::Rgba8);
        assert!(node.request_history());
        let pixels = [0u32; 8];
        node.prepare(&mut ctx, &frame(&pixels, 1));
        let out = node.prepare(&mut ctx, &frame(&pixels, 2));
        assert_eq!(ctx.programs().iter().filter(|&&p| p == Program::PalArtifacting).count(), 2);
        assert_eq!(ctx.programs().iter().filter(|&&p| p == Program::CustomPass(1)).count(), 2);
        let last = &ctx.draws.last().unwrap().1;
        assert_eq!(last.program, Program::CustomPass(1));
        assert!(last.textures[2].is_some());
        assert!(last.textures[3].is_none());
        assert_ne!(Some(out), last.textures[0]);
        let mut names = Vec::new();
        node.chain(&mut names);
        assert_eq!(names, ["custom-effect", "pal-artifacting", "image-source"]);
    }
}

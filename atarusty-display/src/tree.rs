/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Assembles the display graph from the display parameters.
use core::fmt;
use std::error::Error;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use crate::command::{Rect, RenderContext, TextureFormat};
use crate::node::*;

/// Everything the composition depends on. A change of any of these rebuilds the graph.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayParams {
    pub source_width: u32,
    pub source_height: u32,
    pub filter: FilterMode,
    /// Where the image goes within the viewport.
    pub dest: Rect,
    pub viewport: Rect,
    pub pal_artifacting: bool,
    pub hdr: bool,
    pub screen_fx: Option<ScreenFxParams>,
    pub bloom: Option<BloomParams>,
    pub custom_effect: Option<CustomEffect>,
    /// The color of the viewport area outside of `dest`.
    pub border_color: [f32; 4],
}

impl DisplayParams {
    /// An image of `width` x `height` filling the `viewport`.
    pub fn new(width: u32, height: u32, viewport: Rect) -> Self {
        DisplayParams {
            source_width: width,
            source_height: height,
            filter: FilterMode::default(),
            dest: viewport,
            viewport,
            pal_artifacting: false,
            hdr: false,
            screen_fx: None,
            bloom: None,
            custom_effect: None,
            border_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
    /// Returns `true` if the frame must be buffered in a source node before drawing.
    pub fn needs_source(&self) -> bool {
        self.pal_artifacting || self.hdr || self.custom_effect.is_some() ||
        self.screen_fx.is_some() || self.bloom.is_some() || self.filter == FilterMode::Bicubic
    }
    /// The format of intermediate textures.
    pub fn intermediate_format(&self) -> TextureFormat {
        if self.hdr { TextureFormat::Rgba16Float } else { TextureFormat::Rgba8 }
    }

    fn validate(&self) -> Result<(), DisplayError> {
        if self.source_width == 0 || self.source_height == 0 {
            return Err(DisplayError::InvalidSourceSize)
        }
        if self.dest.is_empty() || self.viewport.is_empty() {
            return Err(DisplayError::InvalidDestination)
        }
        if let Some(effect) = self.custom_effect.as_ref() {
            if effect.passes == 0 {
                return Err(DisplayError::InvalidEffect(effect.path.clone()))
            }
        }
        Ok(())
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    InvalidSourceSize,
    InvalidDestination,
    /// A custom effect without passes.
    InvalidEffect(String),
    /// The frame doesn't match the source size, or its pixels don't cover it.
    FrameMismatch { width: u32, height: u32 },
    NotBuilt,
}

impl Error for DisplayError {}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::InvalidSourceSize => f.write_str("display source has no pixels"),
            DisplayError::InvalidDestination => f.write_str("display destination rectangle is empty"),
            DisplayError::InvalidEffect(path) => write!(f, "custom effect {} has no passes", path),
            DisplayError::FrameMismatch { width, height } => {
                write!(f, "frame doesn't match the {}x{} display source", width, height)
            }
            DisplayError::NotBuilt => f.write_str("display tree has not been built"),
        }
    }
}

/// The display composition graph.
#[derive(Debug, Default)]
pub struct DisplayTree {
    params: Option<DisplayParams>,
    root: Option<Box<dyn DisplayNode>>,
    rebuilds: u32,
}

impl DisplayTree {
    pub fn new() -> Self {
        DisplayTree::default()
    }

    pub fn params(&self) -> Option<&DisplayParams> {
        self.params.as_ref()
    }
    /// How many times the graph was built.
    pub fn rebuild_count(&self) -> u32 {
        self.rebuilds
    }
    /// Builds the graph for `params` unless it was built for the same parameters.
    ///
    /// Returns `true` if the graph was rebuilt.
    pub fn rebuild_tree(&mut self, ctx: &mut dyn RenderContext, params: &DisplayParams) -> Result<bool, DisplayError> {
        if self.root.is_some() && self.params.as_ref() == Some(params) {
            return Ok(false)
        }
        params.validate()?;
        self.release(ctx);
        self.root = Some(build(params));
        self.params = Some(params.clone());
        self.rebuilds += 1;
        debug!("display tree: {}", self.describe().join(" <- "));
        Ok(true)
    }
    /// Draws `frame` into the current render target.
    pub fn draw(&mut self, ctx: &mut dyn RenderContext, frame: &Frame<'_>) -> Result<(), DisplayError> {
        let (params, root) = match (self.params.as_ref(), self.root.as_mut()) {
            (Some(params), Some(root)) => (params, root),
            _ => return Err(DisplayError::NotBuilt)
        };
        if frame.width != params.source_width || frame.height != params.source_height || !frame.is_complete() {
            return Err(DisplayError::FrameMismatch { width: params.source_width, height: params.source_height })
        }
        root.draw(ctx, frame);
        Ok(())
    }
    /// Destroys the graph and its textures.
    pub fn release(&mut self, ctx: &mut dyn RenderContext) {
        if let Some(mut root) = self.root.take() {
            root.release(ctx);
        }
        self.params = None;
    }
    /// Names of the nodes, from the root down the source chain.
    pub fn describe(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if let Some(root) = self.root.as_ref() {
            root.chain(&mut names);
        }
        names
    }
}

fn build(params: &DisplayParams) -> Box<dyn DisplayNode> {
    let (width, height) = (params.source_width, params.source_height);
    let dest = params.dest;
    let format = params.intermediate_format();
    let node: Box<dyn DisplayNode> = if !params.needs_source() {
        Box::new(ImageNode::new(width, height, dest, params.filter))
    }
    else {
        let mut source: Box<dyn SourceNode> = Box::new(ImageSourceNode::new(width, height, format));
        if params.pal_artifacting {
            source = Box::new(ArtifactingNode::new(source, format));
        }
        if let Some(effect) = params.custom_effect.as_ref() {
            let mut node = CustomEffectNode::new(source, effect.clone(), format);
            node.request_history();
            source = Box::new(node);
        }
        if params.filter == FilterMode::Bicubic {
            source = Box::new(StretchBicubicNode::new(source, dest.width, dest.height, format));
        }
        if let Some(fx) = params.screen_fx {
            source = Box::new(ScreenFxNode::new(source, fx, format));
        }
        // the stretch already scaled the image, the remaining blit is 1:1
        let filter = if params.filter == FilterMode::Bicubic { FilterMode::Point } else { params.filter };
        match params.bloom {
            Some(bloom) => Box::new(BloomNode::new(source, bloom, dest, format)),
            None => Box::new(BlitNode::new(source, dest, filter))
        }
    };
    if dest.contains_rect(&params.viewport) {
        return node
    }
    let mut sequence = SequenceNode::new();
    sequence.push(Box::new(ClearNode { color: params.border_color }));
    sequence.push(node);
    Box::new(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::Recorder;
    use crate::command::Program;

    const VIEWPORT: Rect = Rect::sized(800, 600);

    fn params() -> DisplayParams {
        DisplayParams::new(336, 240, VIEWPORT)
    }

    #[test]
    fn plain_image_is_uploaded_directly() {
        let mut ctx = Recorder::new(800, 600, TextureFormat::Rgba8Srgb);
        let mut tree = DisplayTree::new();
        assert_eq!(tree.rebuild_tree(&mut ctx, &params()), Ok(true));
        assert_eq!(tree.describe(), ["image"]);
        assert_eq!(tree.rebuild_tree(&mut ctx, &params()), Ok(false));
        assert_eq!(tree.rebuild_count(), 1);

        let pixels = vec![0u32; 336 * 240];
        tree.draw(&mut ctx, &Frame::new(&pixels, 336, 336, 240, 1)).unwrap();
        assert_eq!(ctx.programs(), [Program::BlitSharp]);
        assert!(ctx.clears.is_empty());
        assert_eq!(tree.draw(&mut ctx, &Frame::new(&pixels, 336, 320, 240, 2)),
                   Err(DisplayError::FrameMismatch { width: 336, height: 240 }));
    }

    #[test]
    fn full_chain_order() {
        let mut ctx = Recorder::new(800, 600, TextureFormat::Rgba16Float);
        let mut params = params();
        params.pal_artifacting = true;
        params.hdr = true;
        params.filter = FilterMode::Bicubic;
        params.screen_fx = Some(ScreenFxParams { scanline_intensity: 0.5, ..ScreenFxParams::default() });
        params.bloom = Some(BloomParams::default());
        params.custom_effect = Some(CustomEffect { path: "crt.fx".into(), passes: 1, history: 1 });
        let mut tree = DisplayTree::new();
        assert!(tree.rebuild_tree(&mut ctx, &params).unwrap());
        assert_eq!(tree.describe(), [
            "bloom", "screen-fx", "stretch-bicubic", "custom-effect", "pal-artifacting", "image-source"
        ]);
        let pixels = vec![0u32; 336 * 240];
        tree.draw(&mut ctx, &Frame::new(&pixels, 336, 336, 240, 1)).unwrap();
        let programs = ctx.programs();
        assert_eq!(&programs[..5], [
            Program::PalArtifacting, Program::CustomPass(0), Program::StretchBicubicH,
            Program::StretchBicubicV, Program::ScreenFx
        ]);
        assert_eq!(programs.last(), Some(&Program::BloomFinal));
        assert!(ctx.textures.iter().all(|&(.., format)| format == TextureFormat::Rgba16Float));
        // the source keeps the frame the effect samples
        assert_eq!(ctx.textures[..2].iter().filter(|&&(_, w, h, _)| (w, h) == (336, 240)).count(), 2);
    }

    #[test]
    fn border_is_cleared_when_dest_does_not_cover_viewport() {
        let mut ctx = Recorder::new(800, 600, TextureFormat::Rgba8);
        let mut params = params();
        params.dest = Rect::new(64, 0, 672, 600);
        params.border_color = [0.25, 0.0, 0.0, 1.0];
        let mut tree = DisplayTree::new();
        tree.rebuild_tree(&mut ctx, &params).unwrap();
        assert_eq!(tree.describe(), ["sequence", "clear", "image"]);
        let pixels = vec![0u32; 336 * 240];
        tree.draw(&mut ctx, &Frame::new(&pixels, 336, 336, 240, 1)).unwrap();
        assert_eq!(ctx.clears.len(), 1);
        assert_eq!(ctx.clears[0].1, [0.25, 0.0, 0.0, 1.0]);
        assert_eq!(ctx.draws.len(), 1);
    }

    #[test]
    fn parameter_change_rebuilds_and_releases() {
        let mut ctx = Recorder::new(800, 600, TextureFormat::Rgba8);
        let mut tree = DisplayTree::new();
        let mut params = params();
        params.screen_fx = Some(ScreenFxParams::default());
        tree.rebuild_tree(&mut ctx, &params).unwrap();
        let pixels = vec![0u32; 336 * 240];
        tree.draw(&mut ctx, &Frame::new(&pixels, 336, 336, 240, 1)).unwrap();
        assert_eq!(ctx.textures.len(), 2);
        params.filter = FilterMode::Point;
        assert_eq!(tree.rebuild_tree(&mut ctx, &params), Ok(true));
        assert_eq!(ctx.destroyed.len(), 2);
        assert_eq!(tree.rebuild_count(), 2);
        assert_eq!(tree.params().map(|p| p.filter), Some(FilterMode::Point));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut ctx = Recorder::new(800, 600, TextureFormat::Rgba8);
        let mut tree = DisplayTree::new();
        let pixels = [0u32; 4];
        assert_eq!(tree.draw(&mut ctx, &Frame::new(&pixels, 2, 2, 2, 0)), Err(DisplayError::NotBuilt));
        let mut params = params();
        params.source_width = 0;
        assert_eq!(tree.rebuild_tree(&mut ctx, &params), Err(DisplayError::InvalidSourceSize));
        let mut params = self::params();
        params.custom_effect = Some(CustomEffect { path: "empty.fx".into(), passes: 0, history: 0 });
        let err = tree.rebuild_tree(&mut ctx, &params).unwrap_err();
        assert_eq!(err.to_string(), "custom effect empty.fx has no passes");
    }

    #[test]
    fn params_serde() {
        let mut params = params();
        params.bloom = Some(BloomParams::default());
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"palArtifacting\":false"));
        let back: DisplayParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}

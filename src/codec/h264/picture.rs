// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::codec::h264::dpb::DpbError;

/// Size of a macroblock in luma samples.
pub const MB_SIZE: usize = 16;
/// Size of the smallest motion partition in luma samples.
pub const BLOCK_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PictureStructure {
    #[default]
    Frame,
    TopField,
    BottomField,
}

impl PictureStructure {
    /// Returns the parity opposite to this one. Only meaningful for fields.
    pub fn opposite(self) -> Self {
        match self {
            PictureStructure::Frame => PictureStructure::Frame,
            PictureStructure::TopField => PictureStructure::BottomField,
            PictureStructure::BottomField => PictureStructure::TopField,
        }
    }

    pub fn is_field(self) -> bool {
        !matches!(self, PictureStructure::Frame)
    }
}

/// `nal_ref_idc`: pictures with `Disposable` priority are never used for
/// reference.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NalPriority {
    Disposable = 0,
    Low = 1,
    #[default]
    High = 2,
    Highest = 3,
}

/// A single pixel plane: one flat allocation addressed through a computed
/// stride. Freeing the plane frees every row; rows are never owned
/// individually.
#[derive(Clone, PartialEq, Eq)]
pub struct Plane {
    data: Vec<u8>,
    width: usize,
    height: usize,
    stride: usize,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Result<Self, DpbError> {
        let stride = width;
        let mut data = Vec::new();
        data.try_reserve_exact(stride * height)
            .map_err(|_| DpbError::OutOfMemory("pixel plane"))?;
        data.resize(stride * height, 0);

        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.stride..y * self.stride + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.stride..y * self.stride + self.width]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plane")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// Motion data attached to one 4x4 block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMotion {
    pub mv: [MotionVector; 2],
    pub ref_idx: [i8; 2],
    /// Whether this block carries field motion.
    pub field_flag: bool,
}

/// Per-4x4-block motion grid for a whole picture, flat with a computed
/// stride like `Plane`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotionGrid {
    blocks: Vec<BlockMotion>,
    width: usize,
    height: usize,
}

impl MotionGrid {
    pub fn new(width: usize, height: usize) -> Result<Self, DpbError> {
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(width * height)
            .map_err(|_| DpbError::OutOfMemory("motion grid"))?;
        blocks.resize(width * height, BlockMotion::default());

        Ok(Self {
            blocks,
            width,
            height,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn at(&self, x: usize, y: usize) -> BlockMotion {
        self.blocks[y * self.width + x]
    }

    pub fn at_mut(&mut self, x: usize, y: usize) -> &mut BlockMotion {
        &mut self.blocks[y * self.width + x]
    }

    /// Marks every block as carrying field motion. Used when a lone field is
    /// stored without its complement.
    pub fn set_all_field(&mut self) {
        for block in &mut self.blocks {
            block.field_flag = true;
        }
    }
}

/// A decoded frame or field together with its reference metadata. Produced by
/// the slice decoder, then owned and mutated by the DPB until it is evicted
/// and no longer needed for output or field pairing.
#[derive(Clone, Debug)]
pub struct StorablePicture {
    pub structure: PictureStructure,

    /// Picture order count of this picture (min of the field POCs for a
    /// frame).
    pub poc: i32,
    pub top_poc: i32,
    pub bottom_poc: i32,

    pub frame_num: i32,
    /// Wrap-aware picture number, recomputed against the current picture by
    /// `Dpb::update_pic_nums`. Fields count in 2x`frame_num` units.
    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: i32,

    pub used_for_reference: bool,
    pub is_long_term: bool,
    pub is_output: bool,

    /// Whether this picture was coded as a frame (as opposed to being a field
    /// view generated by splitting).
    pub coded_frame: bool,
    pub mb_aff_frame_flag: bool,
    /// Per-macroblock field coding flags, populated for MBAFF frames only.
    pub mb_field_flags: Vec<bool>,

    pub temporal_layer: u8,
    pub nal_priority: NalPriority,

    pub luma: Plane,
    pub chroma: [Plane; 2],
    pub motion: MotionGrid,

    /// Quarter-pel reference copy for motion search, generated at most once
    /// when the picture becomes a usable reference inside a frame store.
    subpel: Option<Plane>,
}

impl StorablePicture {
    /// Allocates a zeroed picture. `width` and `height` are luma sample
    /// dimensions of this picture (i.e. half the frame height for a field);
    /// chroma is 4:2:0.
    pub fn new(
        structure: PictureStructure,
        width: usize,
        height: usize,
    ) -> Result<Self, DpbError> {
        Ok(Self {
            structure,
            poc: 0,
            top_poc: 0,
            bottom_poc: 0,
            frame_num: 0,
            pic_num: 0,
            long_term_pic_num: 0,
            long_term_frame_idx: -1,
            used_for_reference: false,
            is_long_term: false,
            is_output: false,
            coded_frame: matches!(structure, PictureStructure::Frame),
            mb_aff_frame_flag: false,
            mb_field_flags: Vec::new(),
            temporal_layer: 0,
            nal_priority: NalPriority::default(),
            luma: Plane::new(width, height)?,
            chroma: [
                Plane::new(width / 2, height / 2)?,
                Plane::new(width / 2, height / 2)?,
            ],
            motion: MotionGrid::new(width / BLOCK_SIZE, height / BLOCK_SIZE)?,
            subpel: None,
        })
    }

    pub fn is_short_ref(&self) -> bool {
        self.used_for_reference && !self.is_long_term
    }

    pub fn is_long_ref(&self) -> bool {
        self.used_for_reference && self.is_long_term
    }

    pub fn has_subpel(&self) -> bool {
        self.subpel.is_some()
    }

    /// Generates the quarter-pel reference copy used by motion search. This
    /// is expensive and must run exactly once per picture transition; a
    /// second request on the same picture is a logic defect.
    ///
    /// The samples are placed on the quarter-pel grid by replication; the
    /// actual interpolation kernel belongs to the prediction layer and plugs
    /// in here.
    pub fn generate_subpel(&mut self) -> Result<(), DpbError> {
        debug_assert!(
            self.subpel.is_none(),
            "quarter-pel buffer generated twice for the same picture"
        );
        if self.subpel.is_some() {
            return Ok(());
        }

        let mut up = Plane::new(self.luma.width() * 4, self.luma.height() * 4)?;
        for y in 0..up.height() {
            let src = self.luma.row(y / 4);
            for (x, value) in up.row_mut(y).iter_mut().enumerate() {
                *value = src[x / 4];
            }
        }

        self.subpel = Some(up);
        Ok(())
    }
}

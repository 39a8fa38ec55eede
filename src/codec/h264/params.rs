// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::picture::MB_SIZE;

/// Maximum size of the DPB in frames, as allowed by the standard.
pub const DPB_MAX_SIZE: usize = 16;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    #[default]
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1B = 9,
    #[default]
    L1 = 10,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs for this level, per Table A-1.
    pub fn max_dpb_mbs(self) -> u32 {
        match self {
            Level::L1B => 396,
            Level::L1 => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        }
    }
}

/// The stream-level parameters this core consumes, resolved by the parameter
/// set layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceParams {
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,

    pub pic_width_in_mbs: usize,
    /// Height in map units: frame macroblock rows for progressive streams,
    /// field macroblock rows otherwise.
    pub pic_height_in_map_units: usize,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,

    /// `max_num_ref_frames`: bound on the short-term plus long-term
    /// reference census.
    pub num_ref_frames: usize,
    pub log2_max_frame_num_minus4: u8,

    /// Optional stream-signaled clamp on the derived DPB size.
    pub max_dec_frame_buffering: Option<usize>,
}

impl SequenceParams {
    pub fn builder() -> SequenceParamsBuilder {
        SequenceParamsBuilder::default()
    }

    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Frame width in luma samples.
    pub fn width(&self) -> usize {
        self.pic_width_in_mbs * MB_SIZE
    }

    /// Frame height in luma samples.
    pub fn height(&self) -> usize {
        let map_unit_rows = if self.frame_mbs_only_flag { 1 } else { 2 };
        self.pic_height_in_map_units * map_unit_rows * MB_SIZE
    }

    fn effective_level(&self) -> Result<Level, DpbError> {
        // A.3.1: level 1b is signaled as level 1.1 plus constraint_set3_flag
        // for the Baseline and Main profiles.
        if self.level_idc == Level::L1_1 as u8
            && self.constraint_set3_flag
            && (self.profile_idc == Profile::Baseline as u8
                || self.profile_idc == Profile::Main as u8)
        {
            return Ok(Level::L1B);
        }

        Level::n(self.level_idc).ok_or(DpbError::UndefinedLevel(self.level_idc))
    }

    /// Derives the DPB capacity in frames: MaxDpbMbs for the level divided
    /// by the picture size in macroblocks, capped at [`DPB_MAX_SIZE`], then
    /// overridden by `max_dec_frame_buffering` when signaled. It is a fatal
    /// conformance error for `max_dec_frame_buffering` to exceed the
    /// level-derived bound.
    pub fn max_dpb_frames(&self) -> Result<usize, DpbError> {
        let level = self.effective_level()?;

        let map_unit_rows = if self.frame_mbs_only_flag { 1 } else { 2 };
        let pic_size_in_mbs = self.pic_width_in_mbs * self.pic_height_in_map_units * map_unit_rows;

        let mut size = std::cmp::min(
            level.max_dpb_mbs() as usize / pic_size_in_mbs,
            DPB_MAX_SIZE,
        );

        if let Some(max_dec_frame_buffering) = self.max_dec_frame_buffering {
            if max_dec_frame_buffering > size {
                return Err(DpbError::MaxDecFrameBufferingTooLarge {
                    max_dec_frame_buffering,
                    max_dpb_frames: size,
                });
            }
            size = std::cmp::max(1, max_dec_frame_buffering);
        }

        Ok(size)
    }
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            profile_idc: Profile::Baseline as u8,
            constraint_set3_flag: false,
            level_idc: Level::L4 as u8,
            pic_width_in_mbs: 4,
            pic_height_in_map_units: 4,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            num_ref_frames: 1,
            log2_max_frame_num_minus4: 0,
            max_dec_frame_buffering: None,
        }
    }
}

/// Builder pattern to construct a [`SequenceParams`] in tests and in the
/// parameter set layer.
#[derive(Clone, Default)]
pub struct SequenceParamsBuilder(SequenceParams);

impl SequenceParamsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn constraint_set3_flag(mut self, value: bool) -> Self {
        self.0.constraint_set3_flag = value;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value as u8;
        self
    }

    pub fn resolution_in_mbs(mut self, width: usize, height_in_map_units: usize) -> Self {
        self.0.pic_width_in_mbs = width;
        self.0.pic_height_in_map_units = height_in_map_units;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn mb_adaptive_frame_field_flag(mut self, value: bool) -> Self {
        self.0.mb_adaptive_frame_field_flag = value;
        self
    }

    pub fn num_ref_frames(mut self, value: usize) -> Self {
        self.0.num_ref_frames = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_dec_frame_buffering(mut self, value: usize) -> Self {
        self.0.max_dec_frame_buffering = Some(value);
        self
    }

    pub fn build(self) -> SequenceParams {
        self.0
    }
}

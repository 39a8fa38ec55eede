// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

use crate::codec::h264::picture::PictureStructure;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// The per-slice state the reference list machinery consumes, resolved by
/// the slice decoder: coding type, picture structure, numbering and the
/// signaled active reference counts.
#[derive(Clone, Debug)]
pub struct SliceRefInfo {
    pub slice_type: SliceType,
    pub structure: PictureStructure,

    pub frame_num: i32,
    pub max_frame_num: i32,
    /// POC of the picture this slice belongs to.
    pub poc: i32,
    pub temporal_layer: u8,

    /// Signaled `num_ref_idx_active` for list 0 and list 1.
    pub num_ref_idx_active: [usize; 2],

    pub mb_aff_frame_flag: bool,
}

impl SliceRefInfo {
    /// `CurrPicNum`: the picture number of the current picture in the units
    /// used for short-term reference addressing.
    pub fn curr_pic_num(&self) -> i32 {
        if matches!(self.structure, PictureStructure::Frame) {
            self.frame_num
        } else {
            2 * self.frame_num + 1
        }
    }

    /// `MaxPicNum`: the wrap modulus matching [`Self::curr_pic_num`].
    pub fn max_pic_num(&self) -> i32 {
        if matches!(self.structure, PictureStructure::Frame) {
            self.max_frame_num
        } else {
            2 * self.max_frame_num
        }
    }
}

impl Default for SliceRefInfo {
    fn default() -> Self {
        Self {
            slice_type: SliceType::P,
            structure: PictureStructure::Frame,
            frame_num: 0,
            max_frame_num: 16,
            poc: 0,
            temporal_layer: 0,
            num_ref_idx_active: [1, 1],
            mb_aff_frame_flag: false,
        }
    }
}

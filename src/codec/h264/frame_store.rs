// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::picture::PictureStructure;
use crate::codec::h264::picture::StorablePicture;
use crate::codec::h264::picture::BLOCK_SIZE;
use crate::codec::h264::picture::MB_SIZE;

/// Bit of the top field in the `is_used`/`is_reference`/`is_long_term`
/// masks.
pub const TOP: u8 = 1;
/// Bit of the bottom field.
pub const BOTTOM: u8 = 2;
/// Both fields present, or a coded frame.
pub const BOTH: u8 = 3;

/// Row index used when sampling frame motion for a field view: rounds a 4x4
/// block coordinate to the one shared by both fields.
fn rsd(x: usize) -> usize {
    if x & 2 != 0 {
        x | 1
    } else {
        x & !1
    }
}

/// One DPB slot. Holds a coded frame, a complementary field pair, or a
/// single field awaiting its complement, together with the aggregated
/// reference state of its constituents.
///
/// The store owns every picture it contains; the `frame` and field slots are
/// alternative views generated by splitting or combining, never aliases.
#[derive(Debug, Default)]
pub struct FrameStore {
    pub frame: Option<StorablePicture>,
    pub top_field: Option<StorablePicture>,
    pub bottom_field: Option<StorablePicture>,

    /// Which constituents are present (TOP | BOTTOM; BOTH for a coded
    /// frame).
    pub is_used: u8,
    pub is_reference: u8,
    pub is_long_term: u8,
    /// Reference mask as it was when the constituents were stored; survives
    /// unmarking and drives complementary-field pairing.
    pub is_orig_reference: u8,

    pub is_output: bool,

    pub frame_num: i32,
    /// Wrap-corrected frame number, recomputed per slice against the current
    /// picture.
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,
    /// Smallest POC of the constituents once both are present.
    pub poc: i32,
}

impl FrameStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Recycles the slot: drops all pictures and resets the state so the
    /// store can be reused for a new picture.
    pub fn clear(&mut self) {
        *self = Default::default();
    }

    pub fn is_empty(&self) -> bool {
        self.is_used == 0
    }

    /// Whether any constituent is still used for reference.
    pub fn is_used_for_reference(&self) -> bool {
        if self.is_reference != 0 {
            return true;
        }

        if self.is_used == BOTH {
            if let Some(frame) = &self.frame {
                if frame.used_for_reference {
                    return true;
                }
            }
        }

        if self.is_used & TOP != 0 {
            if let Some(top) = &self.top_field {
                if top.used_for_reference {
                    return true;
                }
            }
        }

        if self.is_used & BOTTOM != 0 {
            if let Some(bottom) = &self.bottom_field {
                if bottom.used_for_reference {
                    return true;
                }
            }
        }

        false
    }

    /// Whether any constituent is a short-term reference.
    pub fn is_short_term_reference(&self) -> bool {
        if self.is_used == BOTH {
            if let Some(frame) = &self.frame {
                if frame.is_short_ref() {
                    return true;
                }
            }
        }

        if self.is_used & TOP != 0 {
            if let Some(top) = &self.top_field {
                if top.is_short_ref() {
                    return true;
                }
            }
        }

        if self.is_used & BOTTOM != 0 {
            if let Some(bottom) = &self.bottom_field {
                if bottom.is_short_ref() {
                    return true;
                }
            }
        }

        false
    }

    /// Whether any constituent is a long-term reference.
    pub fn is_long_term_reference(&self) -> bool {
        if self.is_used == BOTH {
            if let Some(frame) = &self.frame {
                if frame.is_long_ref() {
                    return true;
                }
            }
        }

        if self.is_used & TOP != 0 {
            if let Some(top) = &self.top_field {
                if top.is_long_ref() {
                    return true;
                }
            }
        }

        if self.is_used & BOTTOM != 0 {
            if let Some(bottom) = &self.bottom_field {
                if bottom.is_long_ref() {
                    return true;
                }
            }
        }

        false
    }

    /// Marks every constituent unused for reference, keeping long-term flags
    /// untouched.
    pub fn unmark_for_reference(&mut self) {
        if let Some(top) = &mut self.top_field {
            top.used_for_reference = false;
        }
        if let Some(bottom) = &mut self.bottom_field {
            bottom.used_for_reference = false;
        }
        if let Some(frame) = &mut self.frame {
            frame.used_for_reference = false;
        }

        self.is_reference = 0;
    }

    /// Marks every constituent unused for reference and clears long-term
    /// state.
    pub fn unmark_for_long_term_reference(&mut self) {
        if let Some(top) = &mut self.top_field {
            top.used_for_reference = false;
            top.is_long_term = false;
        }
        if let Some(bottom) = &mut self.bottom_field {
            bottom.used_for_reference = false;
            bottom.is_long_term = false;
        }
        if let Some(frame) = &mut self.frame {
            frame.used_for_reference = false;
            frame.is_long_term = false;
        }

        self.is_reference = 0;
        self.is_long_term = 0;
    }

    /// The picture handed to the output sink for this store: the frame view
    /// when present, otherwise the lone field.
    pub fn output_view(&self) -> &StorablePicture {
        self.frame
            .as_ref()
            .or(self.top_field.as_ref())
            .or(self.bottom_field.as_ref())
            .expect("output from an empty frame store")
    }

    fn mark_output(&mut self) {
        self.is_output = true;
        if let Some(frame) = &mut self.frame {
            frame.is_output = true;
        }
        if let Some(top) = &mut self.top_field {
            top.is_output = true;
        }
        if let Some(bottom) = &mut self.bottom_field {
            bottom.is_output = true;
        }
    }

    /// Marks the store as output and returns the view to emit.
    pub fn take_output(&mut self) -> &StorablePicture {
        self.mark_output();
        self.output_view()
    }

    /// Stores `pic` into this slot, generating the missing frame or field
    /// views as required. A reference-usable picture gets its quarter-pel
    /// copy here, before it is consulted by motion search.
    pub fn insert_picture(
        &mut self,
        mut pic: StorablePicture,
        frame_mbs_only: bool,
    ) -> Result<(), DpbError> {
        // A picture that went through a split already carries its
        // quarter-pel copy; the buffer is generated once per transition.
        if pic.used_for_reference && !pic.has_subpel() {
            pic.generate_subpel()?;
        }

        let used_for_reference = pic.used_for_reference;
        let is_long_term = pic.is_long_term;
        let long_term_frame_idx = pic.long_term_frame_idx;
        let frame_num = pic.frame_num;
        let is_output = pic.is_output;
        let poc = pic.poc;

        match pic.structure {
            PictureStructure::Frame => {
                self.frame = Some(pic);
                self.is_used = BOTH;
                if used_for_reference {
                    self.is_reference = BOTH;
                    self.is_orig_reference = BOTH;
                    if is_long_term {
                        self.is_long_term = BOTH;
                        self.long_term_frame_idx = long_term_frame_idx;
                    }
                }
                self.split_frame(frame_mbs_only)?;
            }
            PictureStructure::TopField => {
                self.top_field = Some(pic);
                self.is_used |= TOP;
                if used_for_reference {
                    self.is_reference |= TOP;
                    self.is_orig_reference |= TOP;
                    if is_long_term {
                        self.is_long_term |= TOP;
                        self.long_term_frame_idx = long_term_frame_idx;
                    }
                }
                if self.is_used == BOTH {
                    self.combine_fields()?;
                } else {
                    self.poc = poc;
                    self.top_field.as_mut().unwrap().motion.set_all_field();
                }
            }
            PictureStructure::BottomField => {
                self.bottom_field = Some(pic);
                self.is_used |= BOTTOM;
                if used_for_reference {
                    self.is_reference |= BOTTOM;
                    self.is_orig_reference |= BOTTOM;
                    if is_long_term {
                        self.is_long_term |= BOTTOM;
                        self.long_term_frame_idx = long_term_frame_idx;
                    }
                }
                if self.is_used == BOTH {
                    self.combine_fields()?;
                } else {
                    self.poc = poc;
                    self.bottom_field.as_mut().unwrap().motion.set_all_field();
                }
            }
        }

        self.frame_num = frame_num;
        self.is_output = is_output;

        Ok(())
    }

    /// Generates the field views of a coded frame: even pixel rows to the top
    /// field, odd rows to the bottom field, with the motion grid mapped
    /// per-macroblock when the frame is MBAFF-coded.
    fn split_frame(&mut self, frame_mbs_only: bool) -> Result<(), DpbError> {
        let frame = self.frame.as_mut().expect("split without a frame");
        assert!(
            matches!(frame.structure, PictureStructure::Frame),
            "split of a non-frame picture"
        );

        self.poc = frame.poc;

        if frame_mbs_only {
            // Progressive stream: no field views to generate.
            self.top_field = None;
            self.bottom_field = None;
            for y in 0..frame.motion.height() {
                for x in 0..frame.motion.width() {
                    frame.motion.at_mut(x, y).field_flag = false;
                }
            }
            return Ok(());
        }

        let width = frame.luma.width();
        let field_height = frame.luma.height() / 2;

        let mut top = StorablePicture::new(PictureStructure::TopField, width, field_height)?;
        let mut bottom =
            StorablePicture::new(PictureStructure::BottomField, width, field_height)?;

        for y in 0..field_height {
            top.luma.row_mut(y).copy_from_slice(frame.luma.row(2 * y));
            bottom
                .luma
                .row_mut(y)
                .copy_from_slice(frame.luma.row(2 * y + 1));
        }
        for plane in 0..2 {
            for y in 0..frame.chroma[plane].height() / 2 {
                top.chroma[plane]
                    .row_mut(y)
                    .copy_from_slice(frame.chroma[plane].row(2 * y));
                bottom.chroma[plane]
                    .row_mut(y)
                    .copy_from_slice(frame.chroma[plane].row(2 * y + 1));
            }
        }

        top.poc = frame.top_poc;
        bottom.poc = frame.bottom_poc;
        top.top_poc = frame.top_poc;
        bottom.top_poc = frame.top_poc;
        top.bottom_poc = frame.bottom_poc;
        bottom.bottom_poc = frame.bottom_poc;

        top.frame_num = frame.frame_num;
        bottom.frame_num = frame.frame_num;
        top.used_for_reference = frame.used_for_reference;
        bottom.used_for_reference = frame.used_for_reference;
        top.is_long_term = frame.is_long_term;
        bottom.is_long_term = frame.is_long_term;
        top.long_term_frame_idx = frame.long_term_frame_idx;
        bottom.long_term_frame_idx = frame.long_term_frame_idx;
        if frame.is_long_term {
            self.long_term_frame_idx = frame.long_term_frame_idx;
        }
        top.coded_frame = true;
        bottom.coded_frame = true;
        top.mb_aff_frame_flag = frame.mb_aff_frame_flag;
        bottom.mb_aff_frame_flag = frame.mb_aff_frame_flag;

        let width_in_blocks = frame.motion.width();
        let field_block_rows = frame.motion.height() / 2;
        let width_in_mbs = width / MB_SIZE;

        // Field motion attached to field-coded macroblocks of an MBAFF frame
        // keeps its parity: the frame stores the two fields' block rows
        // interleaved at 8-row granularity.
        if frame.mb_aff_frame_flag {
            for j in 0..field_block_rows {
                let jj = 8 * (j >> 2) + (j & 0x03);
                let jj4 = jj + 4;
                let jdiv = j >> 1;
                for i in 0..width_in_blocks {
                    let idiv = i / BLOCK_SIZE;
                    let current_mb = 2 * width_in_mbs * (jdiv >> 1) + idiv * 2 + (jdiv & 0x01);

                    if frame.mb_field_flags.get(current_mb).copied().unwrap_or(false) {
                        let mut from_top = frame.motion.at(i, jj);
                        let mut from_bottom = frame.motion.at(i, jj4);
                        from_top.field_flag = true;
                        from_bottom.field_flag = true;
                        *top.motion.at_mut(i, j) = from_top;
                        *bottom.motion.at_mut(i, j) = from_bottom;

                        frame.motion.at_mut(i, 2 * j).field_flag = true;
                        frame.motion.at_mut(i, 2 * j + 1).field_flag = true;
                    }
                }
            }
        }

        // Frame-coded blocks: both fields sample the same frame motion.
        for j in 0..field_block_rows {
            let jdiv = j >> 1;
            for i in 0..width_in_blocks {
                let idiv = i / BLOCK_SIZE;
                let current_mb = 2 * width_in_mbs * (jdiv >> 1) + idiv * 2 + (jdiv & 0x01);

                let mb_is_field = frame.mb_aff_frame_flag
                    && frame.mb_field_flags.get(current_mb).copied().unwrap_or(false);

                if !mb_is_field {
                    let mut sampled = frame.motion.at(rsd(i), 2 * rsd(j));
                    sampled.field_flag = false;
                    *top.motion.at_mut(i, j) = sampled;
                    *bottom.motion.at_mut(i, j) = sampled;

                    frame.motion.at_mut(i, 2 * j).field_flag = false;
                    frame.motion.at_mut(i, 2 * j + 1).field_flag = false;
                }
            }
        }

        if frame.used_for_reference {
            top.generate_subpel()?;
            bottom.generate_subpel()?;
        }

        self.top_field = Some(top);
        self.bottom_field = Some(bottom);

        Ok(())
    }

    /// Generates the frame view of a complementary field pair by
    /// interleaving rows. The combined POC is the smaller field POC; the
    /// frame is a reference only if both fields are.
    fn combine_fields(&mut self) -> Result<(), DpbError> {
        let top = self.top_field.as_mut().expect("combine without a top field");
        let bottom = self
            .bottom_field
            .as_mut()
            .expect("combine without a bottom field");

        let width = top.luma.width();
        let field_height = top.luma.height();

        let mut frame = StorablePicture::new(PictureStructure::Frame, width, field_height * 2)?;

        for y in 0..field_height {
            frame.luma.row_mut(2 * y).copy_from_slice(top.luma.row(y));
            frame
                .luma
                .row_mut(2 * y + 1)
                .copy_from_slice(bottom.luma.row(y));
        }
        for plane in 0..2 {
            for y in 0..top.chroma[plane].height() {
                frame.chroma[plane]
                    .row_mut(2 * y)
                    .copy_from_slice(top.chroma[plane].row(y));
                frame.chroma[plane]
                    .row_mut(2 * y + 1)
                    .copy_from_slice(bottom.chroma[plane].row(y));
            }
        }

        frame.poc = std::cmp::min(top.poc, bottom.poc);
        self.poc = frame.poc;
        frame.top_poc = top.poc;
        frame.bottom_poc = bottom.poc;
        top.bottom_poc = bottom.poc;
        bottom.top_poc = top.poc;

        frame.frame_num = top.frame_num;
        frame.used_for_reference = top.used_for_reference && bottom.used_for_reference;
        frame.is_long_term = top.is_long_term && bottom.is_long_term;
        if frame.is_long_term {
            frame.long_term_frame_idx = self.long_term_frame_idx;
        }
        frame.coded_frame = false;
        frame.is_output = top.is_output && bottom.is_output;

        // Field block rows interleave into the frame grid at 8-row
        // granularity.
        for j in 0..top.motion.height() {
            let jj = 8 * (j >> 2) + (j & 0x03);
            let jj4 = jj + 4;
            for i in 0..top.motion.width() {
                let mut from_top = top.motion.at(i, j);
                let mut from_bottom = bottom.motion.at(i, j);
                from_top.field_flag = true;
                from_bottom.field_flag = true;
                *frame.motion.at_mut(i, jj) = from_top;
                *frame.motion.at_mut(i, jj4) = from_bottom;

                top.motion.at_mut(i, j).field_flag = true;
                bottom.motion.at_mut(i, j).field_flag = true;
            }
        }

        if frame.used_for_reference {
            frame.generate_subpel()?;
        }

        self.frame = Some(frame);

        Ok(())
    }
}

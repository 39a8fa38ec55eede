// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::h264::frame_store::FrameStore;
use crate::codec::h264::frame_store::BOTH;
use crate::codec::h264::frame_store::BOTTOM;
use crate::codec::h264::frame_store::TOP;
use crate::codec::h264::mmco::MarkingOp;
use crate::codec::h264::mmco::RefPicMarking;
use crate::codec::h264::output::FrameSink;
use crate::codec::h264::params::SequenceParams;
use crate::codec::h264::picture::NalPriority;
use crate::codec::h264::picture::PictureStructure;
use crate::codec::h264::picture::StorablePicture;

/// The conformance and resource failure taxonomy of the DPB. Every variant
/// is fatal for the stream being decoded: continuing after any of them would
/// desynchronize the decoder from the bitstream.
#[derive(Debug, Error)]
pub enum DpbError {
    #[error("duplicate frame_num {0} in the short-term reference buffer")]
    DuplicateFrameNum(i32),
    #[error("number of reference frames ({found}) exceeds max(1, num_ref_frames) = {allowed}")]
    TooManyReferenceFrames { found: usize, allowed: usize },
    #[error("output POC must be strictly increasing, got {poc} after {last}")]
    NonMonotonicOutput { last: i32, poc: i32 },
    #[error(
        "DPB size {max_dpb_frames} at the signaled level is smaller than num_ref_frames \
         {num_ref_frames}"
    )]
    SizeBelowNumRefFrames {
        max_dpb_frames: usize,
        num_ref_frames: usize,
    },
    #[error(
        "max_dec_frame_buffering {max_dec_frame_buffering} larger than the level-derived DPB \
         size {max_dpb_frames}"
    )]
    MaxDecFrameBufferingTooLarge {
        max_dec_frame_buffering: usize,
        max_dpb_frames: usize,
    },
    #[error("undefined level_idc {0}")]
    UndefinedLevel(u8),
    #[error("unknown memory_management_control_operation {0}")]
    UnknownMmco(u8),
    #[error("memory_management_control_operation 0 is not the last command")]
    MmcoEndNotLast,
    #[error("no short-term reference with pic_num {0}")]
    NoShortTermWithPicNum(i32),
    #[error("no long-term reference with long_term_pic_num {0}")]
    NoLongTermWithPicNum(i32),
    #[error("unknown modification_of_pic_nums_idc {0}")]
    UnknownReorderIdc(u8),
    #[error("cannot output a picture, none is available")]
    EmptyOutput,
    #[error("out of memory allocating a {0}")]
    OutOfMemory(&'static str),
    #[error("frame sink: {0}")]
    Sink(anyhow::Error),
}

/// The decoded picture buffer: a fixed pool of [`FrameStore`] slots, the
/// derived short-term and long-term reference censuses, and the output
/// bookkeeping that enforces strictly increasing emission order.
pub struct Dpb {
    /// All slots. The first `used_size` are active, in insertion order;
    /// eviction recycles a slot to the back of the pool.
    pub(crate) fs: Vec<FrameStore>,
    pub(crate) size: usize,
    pub(crate) used_size: usize,

    /// Indices of active stores holding short-term references. Rebuilt after
    /// every marking or storage mutation; stale views must never be read.
    pub(crate) fs_ref: Vec<usize>,
    /// Indices of active stores holding long-term references.
    pub(crate) fs_ltref: Vec<usize>,

    pub(crate) num_ref_frames: usize,
    pub(crate) max_frame_num: i32,
    pub(crate) frame_mbs_only: bool,

    pub(crate) max_long_term_pic_idx: i32,
    /// POC of the most recently emitted picture; `i32::MIN` right after a
    /// buffer reset.
    pub(crate) last_output_poc: i32,
    /// Store of the most recently inserted lone field, awaiting its
    /// complement.
    pub(crate) last_picture: Option<usize>,
    pub(crate) last_has_mmco5: bool,
}

impl Dpb {
    /// Allocates the frame store pool for the given stream parameters.
    pub fn new(params: &SequenceParams) -> Result<Self, DpbError> {
        let size = params.max_dpb_frames()?;

        if size < params.num_ref_frames {
            return Err(DpbError::SizeBelowNumRefFrames {
                max_dpb_frames: size,
                num_ref_frames: params.num_ref_frames,
            });
        }

        Ok(Self {
            fs: (0..size).map(|_| FrameStore::new()).collect(),
            size,
            used_size: 0,
            fs_ref: Vec::new(),
            fs_ltref: Vec::new(),
            num_ref_frames: params.num_ref_frames,
            max_frame_num: params.max_frame_num(),
            frame_mbs_only: params.frame_mbs_only_flag,
            max_long_term_pic_idx: -1,
            last_output_poc: i32::MIN,
            last_picture: None,
            last_has_mmco5: false,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }

    pub fn store(&self, index: usize) -> &FrameStore {
        &self.fs[index]
    }

    /// The active stores, in insertion order.
    pub fn active_stores(&self) -> &[FrameStore] {
        &self.fs[..self.used_size]
    }

    /// Indices of the short-term reference stores.
    pub fn short_term_refs(&self) -> &[usize] {
        &self.fs_ref
    }

    /// Indices of the long-term reference stores.
    pub fn long_term_refs(&self) -> &[usize] {
        &self.fs_ltref
    }

    pub fn ref_frames_in_buffer(&self) -> usize {
        self.fs_ref.len()
    }

    pub fn ltref_frames_in_buffer(&self) -> usize {
        self.fs_ltref.len()
    }

    pub fn last_output_poc(&self) -> i32 {
        self.last_output_poc
    }

    pub fn max_long_term_pic_idx(&self) -> i32 {
        self.max_long_term_pic_idx
    }

    pub fn max_frame_num(&self) -> i32 {
        self.max_frame_num
    }

    /// Whether the picture stored last carried a memory management control
    /// operation resetting the reference state.
    pub fn last_has_mmco5(&self) -> bool {
        self.last_has_mmco5
    }

    /// Rebuilds the short-term reference view.
    pub(crate) fn update_ref_list(&mut self) {
        self.fs_ref = (0..self.used_size)
            .filter(|&i| self.fs[i].is_short_term_reference())
            .collect();
    }

    /// Rebuilds the long-term reference view.
    pub(crate) fn update_ltref_list(&mut self) {
        self.fs_ltref = (0..self.used_size)
            .filter(|&i| self.fs[i].is_long_term_reference())
            .collect();
    }

    /// 7.4.2.1.1: the total reference census must never exceed
    /// `max(1, num_ref_frames)`.
    fn check_num_ref(&self) -> Result<(), DpbError> {
        let found = self.fs_ref.len() + self.fs_ltref.len();
        let allowed = std::cmp::max(1, self.num_ref_frames);

        if found > allowed {
            return Err(DpbError::TooManyReferenceFrames { found, allowed });
        }

        Ok(())
    }

    /// Stores a finished picture, running reference marking, field pairing,
    /// eviction and output as required. This is the per-picture entry point
    /// of the DPB; emitted pictures leave through `sink` in strictly
    /// increasing POC order.
    pub fn store_picture(
        &mut self,
        mut pic: StorablePicture,
        marking: &RefPicMarking,
        sink: &mut dyn FrameSink,
    ) -> Result<(), DpbError> {
        pic.used_for_reference = !matches!(pic.nal_priority, NalPriority::Disposable);

        self.last_has_mmco5 = false;

        if marking.idr {
            self.idr_memory_management(&mut pic, marking, sink)?;
        } else if pic.used_for_reference && marking.adaptive_ref_pic_marking_mode_flag {
            self.adaptive_memory_management(&mut pic, &marking.ops, sink)?;
        }

        // A field picture may complete the pair started by the previous
        // field in decode order.
        if pic.structure.is_field() {
            if let Some(last) = self.last_picture {
                let fs = &self.fs[last];
                let parity_matches = match pic.structure {
                    PictureStructure::TopField => fs.is_used == BOTTOM,
                    PictureStructure::BottomField => fs.is_used == TOP,
                    PictureStructure::Frame => false,
                };
                let reference_matches = (pic.used_for_reference && fs.is_orig_reference != 0)
                    || (!pic.used_for_reference && fs.is_orig_reference == 0);

                if fs.frame_num == pic.frame_num && parity_matches && reference_matches {
                    self.fs[last].insert_picture(pic, self.frame_mbs_only)?;
                    self.update_ref_list();
                    self.update_ltref_list();
                    self.last_picture = None;
                    log::trace!("DPB after field pairing: {:#?}", self);
                    return Ok(());
                }
            }
        }

        // This is a frame, or a field with no stored complement.
        if !marking.idr && pic.used_for_reference && !marking.adaptive_ref_pic_marking_mode_flag
        {
            self.sliding_window_memory_management(&mut pic);
        }

        if self.used_size == self.size {
            self.remove_unused_frame();
        }

        while self.used_size == self.size {
            if !pic.used_for_reference {
                // A non-reference picture preceding everything still
                // buffered can bypass the DPB entirely.
                let emit_directly = match self.get_smallest_poc() {
                    None => true,
                    Some((poc, _)) => pic.poc < poc,
                };

                if emit_directly {
                    return self.direct_output(pic, sink);
                }
            }

            self.output_one_frame(sink)?;
        }

        if pic.is_short_ref() {
            for &i in &self.fs_ref {
                if self.fs[i].frame_num == pic.frame_num {
                    return Err(DpbError::DuplicateFrameNum(pic.frame_num));
                }
            }
        }

        let is_field = pic.structure.is_field();
        let slot = self.used_size;
        self.fs[slot].insert_picture(pic, self.frame_mbs_only)?;
        self.last_picture = if is_field { Some(slot) } else { None };
        self.used_size += 1;

        self.update_ref_list();
        self.update_ltref_list();
        self.check_num_ref()?;

        log::trace!("DPB after store: {:#?}", self);

        Ok(())
    }

    /// 8.2.5.1: reference handling at an IDR boundary. Prior pictures are
    /// either dropped or flushed, and the output tracking state resets.
    fn idr_memory_management(
        &mut self,
        pic: &mut StorablePicture,
        marking: &RefPicMarking,
        sink: &mut dyn FrameSink,
    ) -> Result<(), DpbError> {
        if marking.no_output_of_prior_pics_flag {
            debug!(
                "IDR with no_output_of_prior_pics, dropping {} stores",
                self.used_size
            );
            for i in 0..self.used_size {
                self.fs[i].clear();
            }
            self.used_size = 0;
        } else {
            self.flush(sink)?;
        }

        self.last_picture = None;
        self.update_ref_list();
        self.update_ltref_list();
        self.last_output_poc = i32::MIN;

        if marking.long_term_reference_flag {
            self.max_long_term_pic_idx = 0;
            pic.is_long_term = true;
            pic.long_term_frame_idx = 0;
        } else {
            self.max_long_term_pic_idx = -1;
            pic.is_long_term = false;
        }

        Ok(())
    }

    /// 8.2.5.3: unmark the oldest short-term reference, in insertion order,
    /// once the census is full.
    fn sliding_window_memory_management(&mut self, pic: &mut StorablePicture) {
        if self.fs_ref.len() + self.fs_ltref.len() >= std::cmp::max(1, self.num_ref_frames) {
            for i in 0..self.used_size {
                if self.fs[i].is_reference != 0 && self.fs[i].is_long_term == 0 {
                    debug!(
                        "sliding window unmarks frame_num {} (poc {})",
                        self.fs[i].frame_num, self.fs[i].poc
                    );
                    self.fs[i].unmark_for_reference();
                    self.update_ref_list();
                    break;
                }
            }
        }

        pic.is_long_term = false;
    }

    /// 8.2.5.4: applies the explicit marking command list, in order. Each
    /// command observes the censuses left by the previous one.
    fn adaptive_memory_management(
        &mut self,
        pic: &mut StorablePicture,
        ops: &[MarkingOp],
        sink: &mut dyn FrameSink,
    ) -> Result<(), DpbError> {
        for (i, op) in ops.iter().enumerate() {
            log::trace!(
                "DPB before MMCO {}: {:#?}",
                op.memory_management_control_operation,
                self
            );

            match op.memory_management_control_operation {
                0 => {
                    if i + 1 != ops.len() {
                        return Err(DpbError::MmcoEndNotLast);
                    }
                }
                1 => {
                    self.mm_unmark_short_term_for_reference(
                        pic,
                        op.difference_of_pic_nums_minus1,
                    );
                    self.update_ref_list();
                }
                2 => {
                    self.mm_unmark_long_term_for_reference(pic, op.long_term_pic_num);
                    self.update_ltref_list();
                }
                3 => {
                    self.mm_assign_long_term_frame_idx(
                        pic,
                        op.difference_of_pic_nums_minus1,
                        op.long_term_frame_idx,
                    );
                    self.update_ref_list();
                    self.update_ltref_list();
                }
                4 => {
                    self.mm_update_max_long_term_frame_idx(op.max_long_term_frame_idx_plus1);
                    self.update_ltref_list();
                }
                5 => {
                    self.mm_unmark_all_short_term_for_reference();
                    self.mm_unmark_all_long_term_for_reference();
                    self.last_has_mmco5 = true;
                }
                6 => {
                    self.mm_mark_current_picture_long_term(pic, op.long_term_frame_idx);
                    self.check_num_ref()?;
                }
                other => return Err(DpbError::UnknownMmco(other)),
            }
        }

        if self.last_has_mmco5 {
            // The current picture is inferred to have frame_num 0, and its
            // order counts rebase to zero.
            pic.pic_num = 0;
            pic.frame_num = 0;

            match pic.structure {
                PictureStructure::TopField => {
                    pic.poc = 0;
                    pic.top_poc = 0;
                }
                PictureStructure::BottomField => {
                    pic.poc = 0;
                    pic.bottom_poc = 0;
                }
                PictureStructure::Frame => {
                    pic.top_poc -= pic.poc;
                    pic.bottom_poc -= pic.poc;
                    pic.poc = std::cmp::min(pic.top_poc, pic.bottom_poc);
                }
            }

            self.flush(sink)?;
        }

        Ok(())
    }

    /// `picNumX` for marking commands addressing a short-term picture by a
    /// picture-number difference.
    fn get_pic_num_x(pic: &StorablePicture, difference_of_pic_nums_minus1: u32) -> i32 {
        let curr_pic_num = if matches!(pic.structure, PictureStructure::Frame) {
            pic.frame_num
        } else {
            2 * pic.frame_num + 1
        };

        curr_pic_num - (difference_of_pic_nums_minus1 as i32 + 1)
    }

    /// MMCO 1: unmark a short-term reference picture.
    fn mm_unmark_short_term_for_reference(
        &mut self,
        pic: &StorablePicture,
        difference_of_pic_nums_minus1: u32,
    ) {
        let pic_num_x = Self::get_pic_num_x(pic, difference_of_pic_nums_minus1);
        debug!("MMCO 1 for pic_num {}", pic_num_x);

        let refs = self.fs_ref.clone();
        for i in refs {
            let fs = &mut self.fs[i];

            if matches!(pic.structure, PictureStructure::Frame) {
                if fs.is_reference == BOTH && fs.is_long_term == 0 {
                    let matches_num = fs
                        .frame
                        .as_ref()
                        .map(|f| f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if matches_num {
                        fs.unmark_for_reference();
                        return;
                    }
                }
            } else {
                if fs.is_reference & TOP != 0 && fs.is_long_term & TOP == 0 {
                    let matches_num = fs
                        .top_field
                        .as_ref()
                        .map(|f| f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if matches_num {
                        fs.top_field.as_mut().unwrap().used_for_reference = false;
                        fs.is_reference &= BOTTOM;
                        if fs.is_used == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.used_for_reference = false;
                            }
                        }
                        return;
                    }
                }
                if fs.is_reference & BOTTOM != 0 && fs.is_long_term & BOTTOM == 0 {
                    let matches_num = fs
                        .bottom_field
                        .as_ref()
                        .map(|f| f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if matches_num {
                        fs.bottom_field.as_mut().unwrap().used_for_reference = false;
                        fs.is_reference &= TOP;
                        if fs.is_used == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.used_for_reference = false;
                            }
                        }
                        return;
                    }
                }
            }
        }
    }

    /// MMCO 2: unmark a long-term reference picture.
    fn mm_unmark_long_term_for_reference(&mut self, pic: &StorablePicture, long_term_pic_num: i32) {
        debug!("MMCO 2 for long_term_pic_num {}", long_term_pic_num);

        let refs = self.fs_ltref.clone();
        for i in refs {
            let fs = &mut self.fs[i];

            if matches!(pic.structure, PictureStructure::Frame) {
                if fs.is_reference == BOTH && fs.is_long_term == BOTH {
                    let matches_num = fs
                        .frame
                        .as_ref()
                        .map(|f| f.long_term_pic_num == long_term_pic_num)
                        .unwrap_or(false);
                    if matches_num {
                        fs.unmark_for_long_term_reference();
                    }
                }
            } else {
                if fs.is_reference & TOP != 0 && fs.is_long_term & TOP != 0 {
                    let matches_num = fs
                        .top_field
                        .as_ref()
                        .map(|f| f.long_term_pic_num == long_term_pic_num)
                        .unwrap_or(false);
                    if matches_num {
                        let top = fs.top_field.as_mut().unwrap();
                        top.used_for_reference = false;
                        top.is_long_term = false;
                        fs.is_reference &= BOTTOM;
                        fs.is_long_term &= BOTTOM;
                        if fs.is_used == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.used_for_reference = false;
                                frame.is_long_term = false;
                            }
                        }
                        return;
                    }
                }
                if fs.is_reference & BOTTOM != 0 && fs.is_long_term & BOTTOM != 0 {
                    let matches_num = fs
                        .bottom_field
                        .as_ref()
                        .map(|f| f.long_term_pic_num == long_term_pic_num)
                        .unwrap_or(false);
                    if matches_num {
                        let bottom = fs.bottom_field.as_mut().unwrap();
                        bottom.used_for_reference = false;
                        bottom.is_long_term = false;
                        fs.is_reference &= TOP;
                        fs.is_long_term &= TOP;
                        if fs.is_used == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.used_for_reference = false;
                                frame.is_long_term = false;
                            }
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Unmark the long-term reference frame or complementary pair holding
    /// `long_term_frame_idx`.
    fn unmark_long_term_frame_for_reference_by_frame_idx(&mut self, long_term_frame_idx: i32) {
        let refs = self.fs_ltref.clone();
        for i in refs {
            if self.fs[i].long_term_frame_idx == long_term_frame_idx {
                self.fs[i].unmark_for_long_term_reference();
            }
        }
    }

    /// Unmark the long-term reference field holding `long_term_frame_idx`,
    /// unless it is the complementary field of the picture being marked.
    fn unmark_long_term_field_for_reference_by_frame_idx(
        &mut self,
        structure: PictureStructure,
        long_term_frame_idx: i32,
        mark_current: bool,
        curr_frame_num: i32,
        curr_pic_num: i32,
    ) {
        assert!(structure.is_field());

        let curr_pic_num = if curr_pic_num < 0 {
            curr_pic_num + 2 * self.max_frame_num
        } else {
            curr_pic_num
        };

        let same_parity = match structure {
            PictureStructure::TopField => TOP,
            PictureStructure::BottomField => BOTTOM,
            PictureStructure::Frame => unreachable!(),
        };

        let last_picture = self.last_picture;
        let refs = self.fs_ltref.clone();
        for i in refs {
            let fs = &self.fs[i];
            if fs.long_term_frame_idx != long_term_frame_idx {
                continue;
            }

            let unmark = if fs.is_long_term == BOTH || fs.is_long_term == same_parity {
                true
            } else if mark_current {
                match last_picture {
                    Some(last) => last != i || fs.frame_num != curr_frame_num,
                    None => true,
                }
            } else {
                fs.frame_num != curr_pic_num >> 1
            };

            if unmark {
                self.fs[i].unmark_for_long_term_reference();
            }
        }
    }

    /// Mark the short-term picture with `pic_num_x` as long-term. Not
    /// finding it, or disagreeing with a sibling field on the index, is a
    /// recoverable stream defect: warn and skip.
    fn mark_pic_long_term(
        &mut self,
        pic: &StorablePicture,
        long_term_frame_idx: i32,
        pic_num_x: i32,
    ) {
        if matches!(pic.structure, PictureStructure::Frame) {
            let refs = self.fs_ref.clone();
            for i in refs {
                let fs = &mut self.fs[i];
                if fs.is_reference != BOTH {
                    continue;
                }

                let matches_num = fs
                    .frame
                    .as_ref()
                    .map(|f| !f.is_long_term && f.pic_num == pic_num_x)
                    .unwrap_or(false);
                if !matches_num {
                    continue;
                }

                fs.long_term_frame_idx = long_term_frame_idx;
                let frame = fs.frame.as_mut().unwrap();
                frame.long_term_frame_idx = long_term_frame_idx;
                frame.long_term_pic_num = long_term_frame_idx;
                frame.is_long_term = true;

                if fs.top_field.is_some() && fs.bottom_field.is_some() {
                    for field in [fs.top_field.as_mut(), fs.bottom_field.as_mut()]
                        .into_iter()
                        .flatten()
                    {
                        field.long_term_frame_idx = long_term_frame_idx;
                        field.long_term_pic_num = long_term_frame_idx;
                        field.is_long_term = true;
                    }
                }
                fs.is_long_term = BOTH;
                return;
            }

            warn!("reference frame for long-term marking not found");
        } else {
            let (add_top, add_bottom) = if matches!(pic.structure, PictureStructure::TopField) {
                (1, 0)
            } else {
                (0, 1)
            };

            let refs = self.fs_ref.clone();
            for i in refs {
                let fs = &mut self.fs[i];

                if fs.is_reference & TOP != 0 {
                    let matches_num = fs
                        .top_field
                        .as_ref()
                        .map(|f| !f.is_long_term && f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if matches_num {
                        if fs.is_long_term != 0 && fs.long_term_frame_idx != long_term_frame_idx
                        {
                            warn!("assigning long_term_frame_idx different from other field");
                        }

                        fs.long_term_frame_idx = long_term_frame_idx;
                        let top = fs.top_field.as_mut().unwrap();
                        top.long_term_frame_idx = long_term_frame_idx;
                        top.long_term_pic_num = 2 * long_term_frame_idx + add_top;
                        top.is_long_term = true;
                        fs.is_long_term |= TOP;
                        if fs.is_long_term == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.is_long_term = true;
                                frame.long_term_frame_idx = long_term_frame_idx;
                                frame.long_term_pic_num = long_term_frame_idx;
                            }
                        }
                        return;
                    }
                }
                if fs.is_reference & BOTTOM != 0 {
                    let matches_num = fs
                        .bottom_field
                        .as_ref()
                        .map(|f| !f.is_long_term && f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if matches_num {
                        if fs.is_long_term != 0 && fs.long_term_frame_idx != long_term_frame_idx
                        {
                            warn!("assigning long_term_frame_idx different from other field");
                        }

                        fs.long_term_frame_idx = long_term_frame_idx;
                        let bottom = fs.bottom_field.as_mut().unwrap();
                        bottom.long_term_frame_idx = long_term_frame_idx;
                        bottom.long_term_pic_num = 2 * long_term_frame_idx + add_bottom;
                        bottom.is_long_term = true;
                        fs.is_long_term |= BOTTOM;
                        if fs.is_long_term == BOTH {
                            if let Some(frame) = &mut fs.frame {
                                frame.is_long_term = true;
                                frame.long_term_frame_idx = long_term_frame_idx;
                                frame.long_term_pic_num = long_term_frame_idx;
                            }
                        }
                        return;
                    }
                }
            }

            warn!("reference field for long-term marking not found");
        }
    }

    /// MMCO 3: assign a long-term frame index to a short-term picture,
    /// stripping the index from any current holder first.
    fn mm_assign_long_term_frame_idx(
        &mut self,
        pic: &StorablePicture,
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: i32,
    ) {
        let pic_num_x = Self::get_pic_num_x(pic, difference_of_pic_nums_minus1);
        debug!(
            "MMCO 3: pic_num {} takes long_term_frame_idx {}",
            pic_num_x, long_term_frame_idx
        );

        if matches!(pic.structure, PictureStructure::Frame) {
            self.unmark_long_term_frame_for_reference_by_frame_idx(long_term_frame_idx);
        } else {
            // The target's parity decides which field the index eviction
            // must spare.
            let mut structure = PictureStructure::Frame;
            for &i in &self.fs_ref {
                let fs = &self.fs[i];
                if fs.is_reference & TOP != 0 {
                    let found = fs
                        .top_field
                        .as_ref()
                        .map(|f| f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if found {
                        structure = PictureStructure::TopField;
                        break;
                    }
                }
                if fs.is_reference & BOTTOM != 0 {
                    let found = fs
                        .bottom_field
                        .as_ref()
                        .map(|f| f.pic_num == pic_num_x)
                        .unwrap_or(false);
                    if found {
                        structure = PictureStructure::BottomField;
                        break;
                    }
                }
            }

            if matches!(structure, PictureStructure::Frame) {
                warn!("reference field for long-term marking not found, skipping MMCO 3");
                return;
            }

            self.unmark_long_term_field_for_reference_by_frame_idx(
                structure,
                long_term_frame_idx,
                false,
                0,
                pic_num_x,
            );
        }

        self.mark_pic_long_term(pic, long_term_frame_idx, pic_num_x);
    }

    /// MMCO 4: set a new bound on long-term frame indices; holders above it
    /// stop being references.
    fn mm_update_max_long_term_frame_idx(&mut self, max_long_term_frame_idx_plus1: i32) {
        debug!(
            "MMCO 4, max_long_term_frame_idx_plus1 {}",
            max_long_term_frame_idx_plus1
        );

        self.max_long_term_pic_idx = max_long_term_frame_idx_plus1 - 1;

        let refs = self.fs_ltref.clone();
        for i in refs {
            if self.fs[i].long_term_frame_idx > self.max_long_term_pic_idx {
                self.fs[i].unmark_for_long_term_reference();
            }
        }
    }

    fn mm_unmark_all_short_term_for_reference(&mut self) {
        debug!("MMCO 5, unmarking all short-term references");
        let refs = self.fs_ref.clone();
        for i in refs {
            self.fs[i].unmark_for_reference();
        }
        self.update_ref_list();
    }

    fn mm_unmark_all_long_term_for_reference(&mut self) {
        debug!("MMCO 5, unmarking all long-term references");
        self.mm_update_max_long_term_frame_idx(0);
        self.update_ltref_list();
    }

    /// MMCO 6: mark the current, not-yet-stored picture long-term.
    fn mm_mark_current_picture_long_term(
        &mut self,
        pic: &mut StorablePicture,
        long_term_frame_idx: i32,
    ) {
        debug!("MMCO 6, long_term_frame_idx {}", long_term_frame_idx);

        if matches!(pic.structure, PictureStructure::Frame) {
            self.unmark_long_term_frame_for_reference_by_frame_idx(long_term_frame_idx);
        } else {
            self.unmark_long_term_field_for_reference_by_frame_idx(
                pic.structure,
                long_term_frame_idx,
                true,
                pic.frame_num,
                0,
            );
        }

        pic.is_long_term = true;
        pic.long_term_frame_idx = long_term_frame_idx;
        self.update_ltref_list();
    }

    /// Recycles one already-output store no constituent of which is still a
    /// reference. Returns whether a slot was freed.
    fn remove_unused_frame(&mut self) -> bool {
        for i in 0..self.used_size {
            if self.fs[i].is_output && !self.fs[i].is_used_for_reference() {
                self.remove_frame(i);
                return true;
            }
        }

        false
    }

    /// Clears the store at `pos` and moves the empty slot behind the active
    /// region.
    fn remove_frame(&mut self, pos: usize) {
        debug!(
            "removing store (frame_num {}, poc {}) from the DPB",
            self.fs[pos].frame_num, self.fs[pos].poc
        );

        self.fs[pos].clear();
        self.fs[pos..self.used_size].rotate_left(1);
        self.used_size -= 1;

        match self.last_picture {
            Some(last) if last == pos => self.last_picture = None,
            Some(last) if last > pos => self.last_picture = Some(last - 1),
            _ => (),
        }

        self.update_ref_list();
        self.update_ltref_list();
    }

    /// Smallest POC among the stores not yet output, with its position.
    fn get_smallest_poc(&self) -> Option<(i32, usize)> {
        self.fs[..self.used_size]
            .iter()
            .enumerate()
            .filter(|(_, fs)| !fs.is_output)
            .min_by_key(|(_, fs)| fs.poc)
            .map(|(pos, fs)| (fs.poc, pos))
    }

    /// Emits the smallest-POC picture still pending output. The emission
    /// order oracle lives here: POC must strictly increase between resets.
    fn output_one_frame(&mut self, sink: &mut dyn FrameSink) -> Result<(), DpbError> {
        if self.used_size < 1 {
            return Err(DpbError::EmptyOutput);
        }

        let (poc, pos) = self.get_smallest_poc().ok_or(DpbError::EmptyOutput)?;

        if poc <= self.last_output_poc {
            return Err(DpbError::NonMonotonicOutput {
                last: self.last_output_poc,
                poc,
            });
        }

        debug!(
            "outputting store (frame_num {}, poc {})",
            self.fs[pos].frame_num, poc
        );

        let pic = self.fs[pos].take_output();
        sink.write_frame(pic).map_err(DpbError::Sink)?;

        self.last_output_poc = poc;

        if !self.fs[pos].is_used_for_reference() {
            self.remove_frame(pos);
        }

        Ok(())
    }

    /// Emits a picture that never enters the buffer.
    fn direct_output(
        &mut self,
        mut pic: StorablePicture,
        sink: &mut dyn FrameSink,
    ) -> Result<(), DpbError> {
        debug!("direct output of poc {}", pic.poc);

        if pic.poc <= self.last_output_poc {
            return Err(DpbError::NonMonotonicOutput {
                last: self.last_output_poc,
                poc: pic.poc,
            });
        }

        pic.is_output = true;
        sink.write_frame(&pic).map_err(DpbError::Sink)?;
        self.last_output_poc = pic.poc;

        Ok(())
    }

    /// Empties the buffer: unmark everything, recycle what is already out,
    /// then emit the remainder in POC order. Used at stream end and at IDR
    /// boundaries.
    pub fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<(), DpbError> {
        debug!("flushing the DPB, {} stores active", self.used_size);

        for i in 0..self.used_size {
            self.fs[i].unmark_for_reference();
        }
        self.update_ref_list();
        self.update_ltref_list();

        while self.remove_unused_frame() {}

        while self.used_size > 0 {
            self.output_one_frame(sink)?;
        }

        self.last_output_poc = i32::MIN;

        Ok(())
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.fs[..self.used_size]
            .iter()
            .enumerate()
            .map(|(i, fs)| {
                (
                    i,
                    fs.frame_num,
                    fs.poc,
                    fs.is_used,
                    fs.is_reference,
                    fs.is_long_term,
                    fs.is_output,
                )
            })
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("size", &self.size)
            .field("used_size", &self.used_size)
            .field("stores (frame_num, poc, used, ref, lt, out)", &stores)
            .field("fs_ref", &self.fs_ref)
            .field("fs_ltref", &self.fs_ltref)
            .field("last_output_poc", &self.last_output_poc)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::h264::output::CollectSink;
    use crate::codec::h264::params::Level;
    use crate::codec::h264::picture::NalPriority;

    pub(crate) fn test_params(num_ref_frames: usize) -> SequenceParams {
        // 64x64 at level 1.2: 2376/16 = 148, capped at 16; clamp with
        // max_dec_frame_buffering to keep tests small.
        SequenceParams::builder()
            .level_idc(Level::L1_2)
            .resolution_in_mbs(4, 4)
            .num_ref_frames(num_ref_frames)
            .max_dec_frame_buffering(4)
            .build()
    }

    pub(crate) fn frame(frame_num: i32, poc: i32, reference: bool) -> StorablePicture {
        let mut pic = StorablePicture::new(PictureStructure::Frame, 64, 64).unwrap();
        pic.frame_num = frame_num;
        pic.pic_num = frame_num;
        pic.poc = poc;
        pic.top_poc = poc;
        pic.bottom_poc = poc;
        pic.nal_priority = if reference {
            NalPriority::High
        } else {
            NalPriority::Disposable
        };
        pic
    }

    pub(crate) fn field(
        structure: PictureStructure,
        frame_num: i32,
        poc: i32,
        reference: bool,
    ) -> StorablePicture {
        let mut pic = StorablePicture::new(structure, 64, 32).unwrap();
        pic.frame_num = frame_num;
        pic.pic_num = 2 * frame_num + 1;
        pic.poc = poc;
        pic.top_poc = poc;
        pic.bottom_poc = poc;
        pic.nal_priority = if reference {
            NalPriority::High
        } else {
            NalPriority::Disposable
        };
        pic
    }

    #[test]
    fn dpb_size_must_cover_num_ref_frames() {
        let params = SequenceParams::builder()
            .level_idc(Level::L1_2)
            .resolution_in_mbs(4, 4)
            .num_ref_frames(6)
            .max_dec_frame_buffering(4)
            .build();

        assert!(matches!(
            Dpb::new(&params),
            Err(DpbError::SizeBelowNumRefFrames { .. })
        ));
    }

    #[test]
    fn sliding_window_unmarks_oldest_short_term() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();
        assert_eq!(dpb.ref_frames_in_buffer(), 2);

        dpb.store_picture(frame(2, 4, true), &marking, &mut sink)
            .unwrap();

        let ref_frame_nums: Vec<i32> = dpb
            .short_term_refs()
            .iter()
            .map(|&i| dpb.store(i).frame_num)
            .collect();
        assert_eq!(ref_frame_nums, vec![1, 2]);
    }

    #[test]
    fn reference_census_is_bounded_after_every_store() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        for n in 0..8 {
            dpb.store_picture(frame(n, 2 * n, true), &marking, &mut sink)
                .unwrap();
            assert!(dpb.ref_frames_in_buffer() + dpb.ltref_frames_in_buffer() <= 2);
            assert!(dpb.used_size() <= dpb.size());
        }
    }

    #[test]
    fn output_is_monotonic_in_poc() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        // Decode order I0 P8 B4, display order 0, 4, 8.
        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 8, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(2, 4, false), &marking, &mut sink)
            .unwrap();
        dpb.flush(&mut sink).unwrap();

        let pocs: Vec<i32> = sink.frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 4, 8]);
        assert!(pocs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn full_dpb_outputs_non_reference_directly() {
        let mut dpb = Dpb::new(&test_params(4)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        // Fill all four stores with references.
        for n in 0..4 {
            dpb.store_picture(frame(n, 4 + 2 * n, true), &marking, &mut sink)
                .unwrap();
        }
        assert_eq!(dpb.used_size(), 4);

        // A non-reference picture preceding everything buffered bypasses
        // the DPB.
        dpb.store_picture(frame(4, 0, false), &marking, &mut sink)
            .unwrap();
        assert_eq!(dpb.used_size(), 4);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].poc, 0);
    }

    #[test]
    fn non_monotonic_output_is_fatal() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        // Two pictures claiming the same display position.
        dpb.store_picture(frame(0, 4, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 4, true), &marking, &mut sink)
            .unwrap();

        let result = dpb.flush(&mut sink);
        assert!(matches!(
            result,
            Err(DpbError::NonMonotonicOutput { last: 4, poc: 4 })
        ));
    }

    #[test]
    fn duplicate_frame_num_is_fatal() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(3, 0, true), &marking, &mut sink)
            .unwrap();
        let result = dpb.store_picture(frame(3, 2, true), &marking, &mut sink);

        assert!(matches!(result, Err(DpbError::DuplicateFrameNum(3))));
    }

    #[test]
    fn idr_without_output_drops_prior_pictures() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();

        let idr = RefPicMarking::idr(true, false);
        dpb.store_picture(frame(0, 0, true), &idr, &mut sink)
            .unwrap();

        assert!(sink.frames.is_empty());
        assert_eq!(dpb.used_size(), 1);
        assert_eq!(dpb.ref_frames_in_buffer(), 1);
    }

    #[test]
    fn idr_with_output_flushes_in_poc_order() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 4, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();

        let idr = RefPicMarking::idr(false, false);
        dpb.store_picture(frame(0, 0, true), &idr, &mut sink)
            .unwrap();

        let pocs: Vec<i32> = sink.frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![2, 4]);
        // Output tracking restarts after the reset: POC 0 may follow POC 4.
        dpb.flush(&mut sink).unwrap();
        assert_eq!(sink.frames.last().unwrap().poc, 0);
    }

    #[test]
    fn idr_long_term_flag_marks_picture_long_term() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();

        let idr = RefPicMarking::idr(true, true);
        dpb.store_picture(frame(0, 0, true), &idr, &mut sink)
            .unwrap();

        assert_eq!(dpb.ltref_frames_in_buffer(), 1);
        assert_eq!(dpb.max_long_term_pic_idx(), 0);
    }

    #[test]
    fn mmco_unmark_short_term() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();

        // Current frame_num 2, difference_of_pic_nums_minus1 1 targets
        // pic_num 0.
        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::unmark_short_term(1),
            MarkingOp::end(),
        ]);
        dpb.store_picture(frame(2, 4, true), &adaptive, &mut sink)
            .unwrap();

        let ref_frame_nums: Vec<i32> = dpb
            .short_term_refs()
            .iter()
            .map(|&i| dpb.store(i).frame_num)
            .collect();
        assert_eq!(ref_frame_nums, vec![1, 2]);
    }

    #[test]
    fn mmco_assign_and_unmark_long_term() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();

        // frame_num 0 becomes long-term index 0.
        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::assign_long_term(0, 0),
            MarkingOp::end(),
        ]);
        dpb.store_picture(frame(1, 2, true), &adaptive, &mut sink)
            .unwrap();

        assert_eq!(dpb.ltref_frames_in_buffer(), 1);
        assert_eq!(dpb.ref_frames_in_buffer(), 1);

        // Long-term survives the sliding window.
        dpb.store_picture(frame(2, 4, true), &marking, &mut sink)
            .unwrap();
        assert_eq!(dpb.ltref_frames_in_buffer(), 1);

        // Unmark it via its long_term_pic_num.
        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::unmark_long_term(0),
            MarkingOp::end(),
        ]);
        dpb.store_picture(frame(3, 6, true), &adaptive, &mut sink)
            .unwrap();
        assert_eq!(dpb.ltref_frames_in_buffer(), 0);
    }

    #[test]
    fn mmco_op5_resets_census_and_numbering() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();

        let adaptive = RefPicMarking::adaptive(vec![MarkingOp::reset_all(), MarkingOp::end()]);
        dpb.store_picture(frame(2, 4, true), &adaptive, &mut sink)
            .unwrap();

        // Only the current picture remains referenced, with zeroed
        // numbering.
        assert_eq!(dpb.ref_frames_in_buffer(), 1);
        assert_eq!(dpb.ltref_frames_in_buffer(), 0);
        let current = dpb.store(dpb.short_term_refs()[0]);
        assert_eq!(current.frame_num, 0);
        assert_eq!(current.poc, 0);
        assert!(dpb.last_has_mmco5());

        // Everything buffered before the reset was flushed.
        let pocs: Vec<i32> = sink.frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 2]);
    }

    #[test]
    fn mmco_end_marker_must_be_last() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();

        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::end(),
            MarkingOp::unmark_short_term(0),
        ]);
        let result = dpb.store_picture(frame(0, 0, true), &adaptive, &mut sink);

        assert!(matches!(result, Err(DpbError::MmcoEndNotLast)));
    }

    #[test]
    fn unknown_mmco_is_fatal() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();

        let mut op = MarkingOp::end();
        op.memory_management_control_operation = 7;
        let adaptive = RefPicMarking::adaptive(vec![op]);
        let result = dpb.store_picture(frame(0, 0, true), &adaptive, &mut sink);

        assert!(matches!(result, Err(DpbError::UnknownMmco(7))));
    }

    #[test]
    fn mmco_mark_current_long_term() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();

        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::mark_current_long_term(0),
            MarkingOp::end(),
        ]);
        dpb.store_picture(frame(0, 0, true), &adaptive, &mut sink)
            .unwrap();

        assert_eq!(dpb.ltref_frames_in_buffer(), 1);
        assert_eq!(dpb.store(dpb.long_term_refs()[0]).long_term_frame_idx, 0);
    }

    #[test]
    fn fields_pair_into_one_store() {
        let params = SequenceParams::builder()
            .level_idc(Level::L1_2)
            .resolution_in_mbs(4, 2)
            .num_ref_frames(2)
            .max_dec_frame_buffering(4)
            .frame_mbs_only_flag(false)
            .build();
        let mut dpb = Dpb::new(&params).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(
            field(PictureStructure::TopField, 0, 0, true),
            &marking,
            &mut sink,
        )
        .unwrap();
        assert_eq!(dpb.used_size(), 1);
        assert_eq!(dpb.store(0).is_used, TOP);

        dpb.store_picture(
            field(PictureStructure::BottomField, 0, 1, true),
            &marking,
            &mut sink,
        )
        .unwrap();

        // The second field joined the first store and produced a frame view.
        assert_eq!(dpb.used_size(), 1);
        assert_eq!(dpb.store(0).is_used, BOTH);
        assert!(dpb.store(0).frame.is_some());
        assert_eq!(dpb.store(0).poc, 0);
    }

    #[test]
    fn flush_empties_the_buffer() {
        let mut dpb = Dpb::new(&test_params(2)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        for n in 0..3 {
            dpb.store_picture(frame(n, 2 * n, true), &marking, &mut sink)
                .unwrap();
        }
        dpb.flush(&mut sink).unwrap();

        assert!(dpb.is_empty());
        assert_eq!(dpb.ref_frames_in_buffer(), 0);
        let pocs: Vec<i32> = sink.frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 2, 4]);
        assert_eq!(dpb.last_output_poc(), i32::MIN);
    }
}

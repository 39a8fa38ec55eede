// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::frame_store::BOTH;
use crate::codec::h264::frame_store::BOTTOM;
use crate::codec::h264::frame_store::TOP;
use crate::codec::h264::picture::PictureStructure;
use crate::codec::h264::ref_list::PicSlot;
use crate::codec::h264::ref_list::RefPicHandle;
use crate::codec::h264::ref_list::RefPicLists;
use crate::codec::h264::slice::SliceRefInfo;

/// One reference picture list modification, as signaled in the slice
/// header. `modification_of_pic_nums_idc` 0 and 1 address a short-term
/// picture via `abs_diff_pic_num_minus1`, 2 addresses a long-term picture,
/// 3 terminates the command list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReorderingCommand {
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
    pub long_term_pic_num: i32,
}

impl ReorderingCommand {
    pub fn short_term(subtract: bool, abs_diff_pic_num_minus1: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: if subtract { 0 } else { 1 },
            abs_diff_pic_num_minus1,
            long_term_pic_num: 0,
        }
    }

    pub fn long_term(long_term_pic_num: i32) -> Self {
        Self {
            modification_of_pic_nums_idc: 2,
            abs_diff_pic_num_minus1: 0,
            long_term_pic_num,
        }
    }

    pub fn end() -> Self {
        Self {
            modification_of_pic_nums_idc: 3,
            abs_diff_pic_num_minus1: 0,
            long_term_pic_num: 0,
        }
    }
}

/// How a reference list gets reordered when the encoder decides the default
/// order is not the best predictor order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReorderMethod {
    /// Rank references by absolute POC distance to the current picture.
    #[default]
    PocDistance,
    /// POC distance, restricted to references at or below the current
    /// temporal layer.
    TemporalLayer,
}

impl Dpb {
    /// Finds the short-term reference picture with `pic_num`, in the units
    /// of the current picture structure.
    pub fn get_short_term_pic(
        &self,
        structure: PictureStructure,
        pic_num: i32,
    ) -> Option<RefPicHandle> {
        for &i in &self.fs_ref {
            let fs = self.store(i);

            if matches!(structure, PictureStructure::Frame) {
                if fs.is_reference == BOTH {
                    if let Some(frame) = &fs.frame {
                        if !frame.is_long_term && frame.pic_num == pic_num {
                            return Some(RefPicHandle::frame(i));
                        }
                    }
                }
            } else {
                if fs.is_reference & TOP != 0 {
                    if let Some(top) = &fs.top_field {
                        if !top.is_long_term && top.pic_num == pic_num {
                            return Some(RefPicHandle {
                                store: i,
                                slot: PicSlot::Top,
                            });
                        }
                    }
                }
                if fs.is_reference & BOTTOM != 0 {
                    if let Some(bottom) = &fs.bottom_field {
                        if !bottom.is_long_term && bottom.pic_num == pic_num {
                            return Some(RefPicHandle {
                                store: i,
                                slot: PicSlot::Bottom,
                            });
                        }
                    }
                }
            }
        }

        None
    }

    /// Finds the long-term reference picture with `long_term_pic_num`.
    pub fn get_long_term_pic(
        &self,
        structure: PictureStructure,
        long_term_pic_num: i32,
    ) -> Option<RefPicHandle> {
        for &i in &self.fs_ltref {
            let fs = self.store(i);

            if matches!(structure, PictureStructure::Frame) {
                if fs.is_reference == BOTH {
                    if let Some(frame) = &fs.frame {
                        if frame.is_long_term && frame.long_term_pic_num == long_term_pic_num {
                            return Some(RefPicHandle::frame(i));
                        }
                    }
                }
            } else {
                if fs.is_reference & TOP != 0 {
                    if let Some(top) = &fs.top_field {
                        if top.is_long_term && top.long_term_pic_num == long_term_pic_num {
                            return Some(RefPicHandle {
                                store: i,
                                slot: PicSlot::Top,
                            });
                        }
                    }
                }
                if fs.is_reference & BOTTOM != 0 {
                    if let Some(bottom) = &fs.bottom_field {
                        if bottom.is_long_term && bottom.long_term_pic_num == long_term_pic_num
                        {
                            return Some(RefPicHandle {
                                store: i,
                                slot: PicSlot::Bottom,
                            });
                        }
                    }
                }
            }
        }

        None
    }

    /// `PicNumF`: a long-term entry can never collide with a short-term
    /// picture number.
    fn pic_num_f(&self, handle: RefPicHandle, max_pic_num: i32) -> i32 {
        let pic = self.picture(handle);
        if !pic.is_long_term {
            pic.pic_num
        } else {
            max_pic_num
        }
    }

    /// `LongTermPicNumF`: the counterpart for long-term addressing.
    fn long_term_pic_num_f(&self, handle: RefPicHandle) -> i32 {
        let pic = self.picture(handle);
        if pic.is_long_term {
            pic.long_term_pic_num
        } else {
            2 * (self.max_long_term_pic_idx + 1)
        }
    }

    /// 8.2.4.3.1: move the short-term picture with `pic_num_lx` to the
    /// current output position, shift the remainder down and drop one
    /// duplicate occurrence further down the list.
    fn reorder_short_term_entry(
        &self,
        list: &mut Vec<RefPicHandle>,
        num_ref_idx_active: usize,
        max_pic_num: i32,
        pic_num_lx: i32,
        structure: PictureStructure,
        ref_idx_lx: &mut usize,
    ) -> Result<(), DpbError> {
        let handle = self
            .get_short_term_pic(structure, pic_num_lx)
            .ok_or(DpbError::NoShortTermWithPicNum(pic_num_lx))?;

        list.insert(*ref_idx_lx, handle);
        *ref_idx_lx += 1;

        let mut nidx = *ref_idx_lx;
        for cidx in *ref_idx_lx..=num_ref_idx_active {
            if cidx >= list.len() {
                break;
            }

            let target = list[cidx];
            if self.pic_num_f(target, max_pic_num) != pic_num_lx {
                list[nidx] = target;
                nidx += 1;
            }
        }

        while list.len() > num_ref_idx_active + 1 {
            list.pop();
        }

        Ok(())
    }

    /// 8.2.4.3.2: the long-term counterpart of the shift-and-compact step.
    fn reorder_long_term_entry(
        &self,
        list: &mut Vec<RefPicHandle>,
        num_ref_idx_active: usize,
        long_term_pic_num: i32,
        structure: PictureStructure,
        ref_idx_lx: &mut usize,
    ) -> Result<(), DpbError> {
        let handle = self
            .get_long_term_pic(structure, long_term_pic_num)
            .ok_or(DpbError::NoLongTermWithPicNum(long_term_pic_num))?;

        list.insert(*ref_idx_lx, handle);
        *ref_idx_lx += 1;

        let mut nidx = *ref_idx_lx;
        for cidx in *ref_idx_lx..=num_ref_idx_active {
            if cidx >= list.len() {
                break;
            }

            let target = list[cidx];
            if self.long_term_pic_num_f(target) != long_term_pic_num {
                list[nidx] = target;
                nidx += 1;
            }
        }

        while list.len() > num_ref_idx_active + 1 {
            list.pop();
        }

        Ok(())
    }

    /// 8.2.4.3: applies an explicit reordering command list to a built
    /// reference list. The final size is pinned to the slice's signaled
    /// active count regardless of how many commands ran.
    pub fn reorder_ref_pic_list(
        &self,
        slice: &SliceRefInfo,
        list: &mut Vec<RefPicHandle>,
        cur_list: usize,
        commands: &[ReorderingCommand],
    ) -> Result<(), DpbError> {
        let max_pic_num = slice.max_pic_num();
        let curr_pic_num = slice.curr_pic_num();
        let num_ref_idx_active = slice.num_ref_idx_active[cur_list];

        let mut pic_num_lx_pred = curr_pic_num;
        let mut ref_idx_lx = 0;

        for command in commands {
            match command.modification_of_pic_nums_idc {
                3 => break,
                idc @ (0 | 1) => {
                    let abs_diff = command.abs_diff_pic_num_minus1 as i32 + 1;

                    let pic_num_lx_no_wrap = if idc == 0 {
                        if pic_num_lx_pred - abs_diff < 0 {
                            pic_num_lx_pred - abs_diff + max_pic_num
                        } else {
                            pic_num_lx_pred - abs_diff
                        }
                    } else if pic_num_lx_pred + abs_diff >= max_pic_num {
                        pic_num_lx_pred + abs_diff - max_pic_num
                    } else {
                        pic_num_lx_pred + abs_diff
                    };
                    pic_num_lx_pred = pic_num_lx_no_wrap;

                    let pic_num_lx = if pic_num_lx_no_wrap > curr_pic_num {
                        pic_num_lx_no_wrap - max_pic_num
                    } else {
                        pic_num_lx_no_wrap
                    };

                    self.reorder_short_term_entry(
                        list,
                        num_ref_idx_active,
                        max_pic_num,
                        pic_num_lx,
                        slice.structure,
                        &mut ref_idx_lx,
                    )?;
                }
                2 => {
                    self.reorder_long_term_entry(
                        list,
                        num_ref_idx_active,
                        command.long_term_pic_num,
                        slice.structure,
                        &mut ref_idx_lx,
                    )?;
                }
                other => return Err(DpbError::UnknownReorderIdc(other)),
            }
        }

        list.truncate(num_ref_idx_active);

        Ok(())
    }
}

/// Translates a desired picture-number order into the explicit command
/// stream that produces it, stopping as soon as the remaining default order
/// already matches. Returns `None` when no command is needed.
fn signal_reorder_commands(
    default_order: &[i32],
    re_order: &[i32],
    num_ref_idx_active: usize,
    curr_pic_num: i32,
    max_pic_num: i32,
) -> Option<Vec<ReorderingCommand>> {
    let n = num_ref_idx_active
        .min(default_order.len())
        .min(re_order.len());
    if n == 0 {
        return None;
    }

    if (0..n).all(|i| default_order[i] == re_order[i]) {
        return None;
    }

    let mut default_order = default_order[..n].to_vec();
    let mut tmp_reorder = vec![0i32; n + 1];
    let mut commands = Vec::new();
    let mut pic_num_lx_pred = curr_pic_num;

    let mut i = 0;
    while i < n {
        let diff = re_order[i] - pic_num_lx_pred;
        if diff <= 0 {
            let mut abs_diff_minus1 = diff.abs() - 1;
            if abs_diff_minus1 < 0 {
                abs_diff_minus1 = max_pic_num - 1;
            }
            commands.push(ReorderingCommand::short_term(true, abs_diff_minus1 as u32));
        } else {
            commands.push(ReorderingCommand::short_term(false, (diff - 1) as u32));
        }
        pic_num_lx_pred = re_order[i];

        tmp_reorder[i] = re_order[i];
        let mut k = i;
        for j in i..n {
            if default_order[j] != re_order[i] {
                k += 1;
                tmp_reorder[k] = default_order[j];
            }
        }

        let reorder_stop = (i + 1..n).all(|j| tmp_reorder[j] == re_order[j]);
        if reorder_stop {
            break;
        }

        default_order.copy_from_slice(&tmp_reorder[..n]);
        i += 1;
    }

    commands.push(ReorderingCommand::end());
    Some(commands)
}

/// Decides a POC-distance reference order for a P slice in a frame and
/// returns the command stream signaling it, or `None` when the default
/// order is already optimal.
pub fn poc_ref_pic_reorder_frame(
    dpb: &Dpb,
    slice: &SliceRefInfo,
    list: &[RefPicHandle],
    list_no: usize,
) -> Option<Vec<ReorderingCommand>> {
    let num_ref_idx_active = slice.num_ref_idx_active[list_no].min(list.len());
    if num_ref_idx_active == 0 {
        return None;
    }

    let default_order: Vec<i32> = list[..num_ref_idx_active]
        .iter()
        .map(|&h| dpb.picture(h).pic_num)
        .collect();

    // Every short-term reference frame is a candidate; ineligible entries
    // keep an infinite distance and sink to the back.
    let mut candidates: Vec<(i32, i32, i32)> = Vec::new();
    for &i in dpb.short_term_refs() {
        let fs = dpb.store(i);
        let frame = match &fs.frame {
            Some(frame) => frame,
            None => continue,
        };

        let mut poc_diff = 0xFFFF;
        let mut list_sign = 0;
        if fs.is_used == BOTH && frame.is_short_ref() {
            poc_diff = (frame.poc - slice.poc).abs();
            list_sign = list_direction_sign(slice.poc, frame.poc, list_no);
        }

        candidates.push((poc_diff, list_sign, frame.pic_num));
    }

    candidates.sort_by_key(|&(poc_diff, sign, _)| (poc_diff, std::cmp::Reverse(sign)));
    let re_order: Vec<i32> = candidates.iter().map(|&(_, _, pic_num)| pic_num).collect();

    signal_reorder_commands(
        &default_order,
        &re_order,
        num_ref_idx_active,
        slice.frame_num,
        slice.max_frame_num,
    )
}

/// The field counterpart: candidate fields are ranked by POC distance, then
/// rearranged to alternating parity before signaling.
pub fn poc_ref_pic_reorder_field(
    dpb: &Dpb,
    slice: &SliceRefInfo,
    list: &[RefPicHandle],
    list_no: usize,
) -> Option<Vec<ReorderingCommand>> {
    let num_ref_idx_active = slice.num_ref_idx_active[list_no].min(list.len());
    if num_ref_idx_active == 0 {
        return None;
    }

    let default_order: Vec<i32> = list[..num_ref_idx_active]
        .iter()
        .map(|&h| dpb.picture(h).pic_num)
        .collect();

    // (poc_diff, sign, pic_num, parity)
    let mut candidates: Vec<(i32, i32, i32, PicSlot)> = Vec::new();
    for &i in dpb.short_term_refs() {
        let fs = dpb.store(i);

        // When coding the second field of the current frame, its own first
        // field is the only usable one in that store.
        let own_pair = matches!(slice.structure, PictureStructure::BottomField)
            && fs
                .top_field
                .as_ref()
                .map(|top| slice.poc == top.poc + 1)
                .unwrap_or(false);

        let fields: &[(u8, PicSlot)] = if own_pair {
            &[(TOP, PicSlot::Top)]
        } else {
            &[(TOP, PicSlot::Top), (BOTTOM, PicSlot::Bottom)]
        };

        for &(bit, slot) in fields {
            let pic = match slot {
                PicSlot::Top => fs.top_field.as_ref(),
                PicSlot::Bottom => fs.bottom_field.as_ref(),
                PicSlot::Frame => unreachable!(),
            };

            if let Some(pic) = pic {
                if fs.is_used & bit != 0 && pic.is_short_ref() {
                    candidates.push((
                        (pic.poc - slice.poc).abs(),
                        list_direction_sign(slice.poc, pic.poc, list_no),
                        pic.pic_num,
                        slot,
                    ));
                }
            }
        }
    }

    candidates.sort_by_key(|&(poc_diff, sign, _, _)| (poc_diff, std::cmp::Reverse(sign)));

    // Alternate parities starting with the current field's own.
    let (first, second) = match slice.structure {
        PictureStructure::TopField => (PicSlot::Top, PicSlot::Bottom),
        PictureStructure::BottomField => (PicSlot::Bottom, PicSlot::Top),
        PictureStructure::Frame => return None,
    };

    let next = |slot: PicSlot, cursor: &mut usize| -> Option<i32> {
        while *cursor < candidates.len() {
            let (_, _, pic_num, parity) = candidates[*cursor];
            *cursor += 1;
            if parity == slot {
                return Some(pic_num);
            }
        }
        None
    };

    let mut re_order = Vec::with_capacity(candidates.len());
    let mut first_cursor = 0;
    let mut second_cursor = 0;
    loop {
        let a = next(first, &mut first_cursor);
        if let Some(pic_num) = a {
            re_order.push(pic_num);
        }
        let b = next(second, &mut second_cursor);
        if let Some(pic_num) = b {
            re_order.push(pic_num);
        }
        if a.is_none() && b.is_none() {
            break;
        }
    }

    signal_reorder_commands(
        &default_order,
        &re_order,
        num_ref_idx_active,
        slice.curr_pic_num(),
        slice.max_pic_num(),
    )
}

/// The temporal-layer variant: ranks by POC distance within each prediction
/// direction, then pulls references at or below the current layer to the
/// front. Returns the command stream and the number of usable references.
pub fn tlyr_ref_pic_reorder_frame(
    dpb: &Dpb,
    slice: &SliceRefInfo,
    list: &[RefPicHandle],
    list_no: usize,
) -> (Option<Vec<ReorderingCommand>>, usize) {
    let num_ref_idx_active = slice.num_ref_idx_active[list_no].min(list.len());
    if num_ref_idx_active == 0 {
        return (None, 0);
    }

    let default_order: Vec<i32> = list[..num_ref_idx_active]
        .iter()
        .map(|&h| dpb.picture(h).pic_num)
        .collect();

    // (poc_diff, sign, pic_num, temporal_layer)
    let mut candidates: Vec<(i32, i32, i32, u8)> = Vec::new();
    for &i in dpb.short_term_refs() {
        let fs = dpb.store(i);
        let frame = match &fs.frame {
            Some(frame) => frame,
            None => continue,
        };

        let mut poc_diff = 0xFFFF;
        let mut list_sign = 0;
        if fs.is_used == BOTH && frame.is_short_ref() {
            poc_diff = (frame.poc - slice.poc).abs();
            list_sign = list_direction_sign(slice.poc, frame.poc, list_no);
        }

        candidates.push((poc_diff, list_sign, frame.pic_num, frame.temporal_layer));
    }

    // Distance ordering within each prediction direction only.
    let n = candidates.len();
    for i in 0..n.saturating_sub(1) {
        for j in i + 1..n {
            if candidates[i].1 == candidates[j].1 && candidates[i].0 > candidates[j].0 {
                candidates.swap(i, j);
            }
        }
    }

    // Stable-partition usable layers to the front.
    let mut begin_idx = 0;
    let mut valid_refs = 0;
    for i in 0..n {
        if candidates[i].3 <= slice.temporal_layer {
            let candidate = candidates[i];
            for j in (begin_idx + 1..=i).rev() {
                candidates[j] = candidates[j - 1];
            }
            candidates[begin_idx] = candidate;
            begin_idx += 1;
            valid_refs += 1;
        }
    }

    let re_order: Vec<i32> = candidates.iter().map(|&(_, _, pic_num, _)| pic_num).collect();

    let commands = signal_reorder_commands(
        &default_order,
        &re_order,
        num_ref_idx_active,
        slice.frame_num,
        slice.max_frame_num,
    );

    (commands, valid_refs)
}

fn list_direction_sign(curr_poc: i32, ref_poc: i32, list_no: usize) -> i32 {
    let future = if list_no == 0 {
        curr_poc < ref_poc
    } else {
        curr_poc > ref_poc
    };

    if future {
        1
    } else {
        -1
    }
}

/// Runs the selected automatic reordering policy over list 0 of a P slice,
/// applying the generated commands. Returns whether a reordering was
/// signaled. The slice's active count shrinks when the temporal-layer
/// policy finds fewer usable references.
pub fn reorder_lists(
    dpb: &Dpb,
    slice: &mut SliceRefInfo,
    lists: &mut RefPicLists,
    method: ReorderMethod,
) -> Result<bool, DpbError> {
    if !slice.slice_type.is_p() {
        return Ok(false);
    }

    let commands = match method {
        ReorderMethod::TemporalLayer => {
            if matches!(slice.structure, PictureStructure::Frame) {
                let (commands, valid_refs) =
                    tlyr_ref_pic_reorder_frame(dpb, slice, &lists.lists[0], 0);
                if valid_refs > 0 {
                    slice.num_ref_idx_active[0] = slice.num_ref_idx_active[0].min(valid_refs);
                }
                commands
            } else {
                None
            }
        }
        ReorderMethod::PocDistance => {
            if matches!(slice.structure, PictureStructure::Frame) {
                poc_ref_pic_reorder_frame(dpb, slice, &lists.lists[0], 0)
            } else {
                poc_ref_pic_reorder_field(dpb, slice, &lists.lists[0], 0)
            }
        }
    };

    match commands {
        Some(commands) => {
            dpb.reorder_ref_pic_list(slice, &mut lists.lists[0], 0, &commands)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

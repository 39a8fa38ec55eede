// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::picture::PictureStructure;

/// One memory management control operation, as signaled in the slice header.
/// The operation code selects which of the payload fields are meaningful
/// (Table 7-9); the DPB validates the code when applying the list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkingOp {
    pub memory_management_control_operation: u8,

    /// Used with operations 1 and 3 to address a short-term picture.
    pub difference_of_pic_nums_minus1: u32,
    /// Used with operation 2 to address a long-term picture.
    pub long_term_pic_num: i32,
    /// Used with operations 3 and 6 to assign a long-term frame index.
    pub long_term_frame_idx: i32,
    /// Used with operation 4; zero means "no long-term frame indices".
    pub max_long_term_frame_idx_plus1: i32,
}

impl MarkingOp {
    pub fn end() -> Self {
        Self {
            memory_management_control_operation: 0,
            ..Default::default()
        }
    }

    pub fn unmark_short_term(difference_of_pic_nums_minus1: u32) -> Self {
        Self {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1,
            ..Default::default()
        }
    }

    pub fn unmark_long_term(long_term_pic_num: i32) -> Self {
        Self {
            memory_management_control_operation: 2,
            long_term_pic_num,
            ..Default::default()
        }
    }

    pub fn assign_long_term(difference_of_pic_nums_minus1: u32, long_term_frame_idx: i32) -> Self {
        Self {
            memory_management_control_operation: 3,
            difference_of_pic_nums_minus1,
            long_term_frame_idx,
            ..Default::default()
        }
    }

    pub fn set_max_long_term_frame_idx(max_long_term_frame_idx_plus1: i32) -> Self {
        Self {
            memory_management_control_operation: 4,
            max_long_term_frame_idx_plus1,
            ..Default::default()
        }
    }

    pub fn reset_all() -> Self {
        Self {
            memory_management_control_operation: 5,
            ..Default::default()
        }
    }

    pub fn mark_current_long_term(long_term_frame_idx: i32) -> Self {
        Self {
            memory_management_control_operation: 6,
            long_term_frame_idx,
            ..Default::default()
        }
    }
}

/// The reference marking information attached to a picture: either the
/// implicit sliding window, or an ordered adaptive command list, plus the
/// IDR flags.
#[derive(Clone, Debug, Default)]
pub struct RefPicMarking {
    pub idr: bool,
    /// At an IDR: drop buffered pictures instead of flushing them.
    pub no_output_of_prior_pics_flag: bool,
    /// At an IDR: the IDR picture itself becomes long-term index 0.
    pub long_term_reference_flag: bool,

    pub adaptive_ref_pic_marking_mode_flag: bool,
    /// The command list; applied in order, terminated by operation 0.
    pub ops: Vec<MarkingOp>,
}

impl RefPicMarking {
    /// Implicit sliding-window marking.
    pub fn sliding_window() -> Self {
        Default::default()
    }

    pub fn idr(no_output_of_prior_pics_flag: bool, long_term_reference_flag: bool) -> Self {
        Self {
            idr: true,
            no_output_of_prior_pics_flag,
            long_term_reference_flag,
            ..Default::default()
        }
    }

    pub fn adaptive(ops: Vec<MarkingOp>) -> Self {
        Self {
            adaptive_ref_pic_marking_mode_flag: true,
            ops,
            ..Default::default()
        }
    }
}

/// POC-based reference management for frame coding: emit a command list
/// unmarking the short-term reference furthest in the past (smallest POC),
/// the policy a low-delay encoder uses instead of the sliding window.
///
/// Returns `None` when no command is applicable (IDR, or no references
/// buffered).
pub fn poc_based_ref_management_frame(
    dpb: &Dpb,
    idr: bool,
    current_pic_num: i32,
) -> Option<Vec<MarkingOp>> {
    if idr {
        return None;
    }

    if dpb.ref_frames_in_buffer() + dpb.ltref_frames_in_buffer() == 0 {
        return None;
    }

    let mut min_poc = i32::MAX;
    let mut pic_num = 0;

    for fs in dpb.active_stores() {
        if fs.is_reference != 0 && fs.is_long_term == 0 && fs.poc < min_poc {
            if let Some(frame) = &fs.frame {
                min_poc = frame.poc;
                pic_num = frame.pic_num;
            }
        }
    }

    Some(vec![
        MarkingOp::unmark_short_term((current_pic_num - pic_num - 1) as u32),
        MarkingOp::end(),
    ])
}

/// POC-based reference management for field coding. Both fields of the
/// oldest reference pair are unmarked when coding a top field; the bottom
/// field of the pair carries no further commands.
pub fn poc_based_ref_management_field(
    dpb: &Dpb,
    idr: bool,
    structure: PictureStructure,
    current_pic_num: i32,
) -> Option<Vec<MarkingOp>> {
    if idr {
        return None;
    }

    if dpb.ref_frames_in_buffer() + dpb.ltref_frames_in_buffer() == 0 {
        return None;
    }

    if !matches!(structure, PictureStructure::TopField) {
        return Some(vec![MarkingOp::end()]);
    }

    let mut min_poc = i32::MAX;
    let mut pic_nums = None;

    for fs in dpb.active_stores() {
        if fs.is_reference != 0 && fs.is_long_term == 0 && fs.poc < min_poc {
            if let (Some(top), Some(bottom)) = (&fs.top_field, &fs.bottom_field) {
                min_poc = fs.poc;
                pic_nums = Some((top.pic_num, bottom.pic_num));
            }
        }
    }

    let (pic_num1, pic_num2) = pic_nums?;

    Some(vec![
        MarkingOp::unmark_short_term((current_pic_num - pic_num2 - 1) as u32),
        MarkingOp::unmark_short_term((current_pic_num - pic_num1 - 1) as u32),
        MarkingOp::end(),
    ])
}

/// Temporal-layer-based reference management: unmark every short-term
/// reference above the current picture's temporal layer, so a layer switch
/// never predicts from a higher layer.
pub fn tlyr_based_ref_management_frame(
    dpb: &Dpb,
    idr: bool,
    temporal_layer: u8,
    current_pic_num: i32,
) -> Option<Vec<MarkingOp>> {
    if idr {
        return None;
    }

    if dpb.ref_frames_in_buffer() + dpb.ltref_frames_in_buffer() == 0 {
        return None;
    }

    let mut ops = Vec::new();

    for fs in dpb.active_stores() {
        if fs.is_reference == 0 || fs.is_long_term != 0 {
            continue;
        }

        if let Some(frame) = &fs.frame {
            if frame.temporal_layer > temporal_layer {
                ops.push(MarkingOp::unmark_short_term(
                    (current_pic_num - frame.pic_num - 1) as u32,
                ));
            }
        }
    }

    if ops.is_empty() {
        return None;
    }

    ops.push(MarkingOp::end());
    Some(ops)
}

/// Long-term reference management: promote the most recent short-term
/// reference to a long-term index. At an IDR this is expressed through the
/// long-term reference flag instead of a command.
pub fn long_term_ref_management(idr: bool, current_pic_num: i32, marking: &mut RefPicMarking) {
    if idr {
        marking.long_term_reference_flag = true;
        return;
    }

    if !marking.ops.is_empty() {
        return;
    }

    marking.adaptive_ref_pic_marking_mode_flag = true;
    marking.ops = vec![
        MarkingOp::assign_long_term(0, current_pic_num),
        MarkingOp::end(),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::dpb::tests::frame;
    use crate::codec::h264::dpb::tests::test_params;
    use crate::codec::h264::dpb::Dpb;
    use crate::codec::h264::output::CollectSink;

    #[test]
    fn poc_based_policy_targets_smallest_poc() {
        let mut dpb = Dpb::new(&test_params(3)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        for n in 0..3 {
            dpb.store_picture(frame(n, 2 * n, true), &marking, &mut sink)
                .unwrap();
        }

        // Current picture has frame_num 3; the oldest reference is pic_num
        // 0, so difference_of_pic_nums_minus1 is 2.
        let ops = poc_based_ref_management_frame(&dpb, false, 3).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], MarkingOp::unmark_short_term(2));
        assert_eq!(ops[1], MarkingOp::end());

        // Applying the generated commands removes exactly that reference.
        let adaptive = RefPicMarking::adaptive(ops);
        dpb.store_picture(frame(3, 6, true), &adaptive, &mut sink)
            .unwrap();

        let ref_frame_nums: Vec<i32> = dpb
            .short_term_refs()
            .iter()
            .map(|&i| dpb.store(i).frame_num)
            .collect();
        assert_eq!(ref_frame_nums, vec![1, 2, 3]);
    }

    #[test]
    fn poc_based_policy_is_inert_at_idr_or_empty_dpb() {
        let dpb = Dpb::new(&test_params(2)).unwrap();
        assert!(poc_based_ref_management_frame(&dpb, false, 0).is_none());
        assert!(poc_based_ref_management_frame(&dpb, true, 3).is_none());
    }

    #[test]
    fn tlyr_policy_unmarks_higher_layers() {
        let mut dpb = Dpb::new(&test_params(3)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        let mut layered = frame(0, 0, true);
        layered.temporal_layer = 0;
        dpb.store_picture(layered, &marking, &mut sink).unwrap();

        let mut layered = frame(1, 2, true);
        layered.temporal_layer = 1;
        dpb.store_picture(layered, &marking, &mut sink).unwrap();

        let mut layered = frame(2, 4, true);
        layered.temporal_layer = 2;
        dpb.store_picture(layered, &marking, &mut sink).unwrap();

        // Back at layer 0: both higher-layer references must go.
        let ops = tlyr_based_ref_management_frame(&dpb, false, 3, 0).unwrap();
        assert_eq!(
            ops,
            vec![
                MarkingOp::unmark_short_term(1),
                MarkingOp::unmark_short_term(0),
                MarkingOp::end(),
            ]
        );

        let adaptive = RefPicMarking::adaptive(ops);
        let mut current = frame(3, 6, true);
        current.temporal_layer = 0;
        dpb.store_picture(current, &adaptive, &mut sink).unwrap();

        let ref_frame_nums: Vec<i32> = dpb
            .short_term_refs()
            .iter()
            .map(|&i| dpb.store(i).frame_num)
            .collect();
        assert_eq!(ref_frame_nums, vec![0, 3]);
    }

    #[test]
    fn long_term_policy_promotes_previous_picture() {
        let mut marking = RefPicMarking::sliding_window();
        long_term_ref_management(false, 4, &mut marking);

        assert!(marking.adaptive_ref_pic_marking_mode_flag);
        assert_eq!(marking.ops[0], MarkingOp::assign_long_term(0, 4));

        let mut idr_marking = RefPicMarking::idr(false, false);
        long_term_ref_management(true, 0, &mut idr_marking);
        assert!(idr_marking.long_term_reference_flag);
    }
}

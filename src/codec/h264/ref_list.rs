// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::frame_store::BOTH;
use crate::codec::h264::frame_store::BOTTOM;
use crate::codec::h264::frame_store::TOP;
use crate::codec::h264::picture::PictureStructure;
use crate::codec::h264::picture::StorablePicture;
use crate::codec::h264::slice::SliceRefInfo;
use crate::codec::h264::slice::SliceType;

/// Which constituent of a frame store a list entry refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PicSlot {
    Frame,
    Top,
    Bottom,
}

/// A reference picture list entry: an index into the DPB's store pool plus
/// the constituent to use. Lists never own pictures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPicHandle {
    pub store: usize,
    pub slot: PicSlot,
}

impl RefPicHandle {
    pub fn frame(store: usize) -> Self {
        Self {
            store,
            slot: PicSlot::Frame,
        }
    }

    pub fn field(store: usize, structure: PictureStructure) -> Self {
        let slot = match structure {
            PictureStructure::TopField => PicSlot::Top,
            PictureStructure::BottomField => PicSlot::Bottom,
            PictureStructure::Frame => PicSlot::Frame,
        };
        Self { store, slot }
    }
}

/// The per-slice reference picture lists. Lists 0 and 1 are the frame (or
/// field) lists; lists 2 through 5 are the MBAFF per-parity variants
/// derived from them.
#[derive(Clone, Debug, Default)]
pub struct RefPicLists {
    pub lists: [Vec<RefPicHandle>; 6],
}

impl Dpb {
    /// Resolves a list entry to its picture.
    pub fn picture(&self, handle: RefPicHandle) -> &StorablePicture {
        let fs = self.store(handle.store);
        match handle.slot {
            PicSlot::Frame => fs.frame.as_ref().expect("stale frame handle"),
            PicSlot::Top => fs.top_field.as_ref().expect("stale top field handle"),
            PicSlot::Bottom => fs.bottom_field.as_ref().expect("stale bottom field handle"),
        }
    }

    /// 8.2.4.1: recomputes `FrameNumWrap`, `PicNum` and `LongTermPicNum` of
    /// every reference against the current slice. Must run before list
    /// construction or reordering for that slice.
    pub fn update_pic_nums(&mut self, slice: &SliceRefInfo) {
        let max_frame_num = slice.max_frame_num;

        if matches!(slice.structure, PictureStructure::Frame) {
            let refs = self.fs_ref.clone();
            for i in refs {
                let fs = &mut self.fs[i];
                if fs.is_used != BOTH {
                    continue;
                }

                let frame = match &mut fs.frame {
                    Some(frame) if frame.is_short_ref() => frame,
                    _ => continue,
                };

                fs.frame_num_wrap = if fs.frame_num > slice.frame_num {
                    fs.frame_num - max_frame_num
                } else {
                    fs.frame_num
                };
                frame.pic_num = fs.frame_num_wrap;
            }

            let refs = self.fs_ltref.clone();
            for i in refs {
                let fs = &mut self.fs[i];
                if fs.is_used != BOTH {
                    continue;
                }

                if let Some(frame) = &mut fs.frame {
                    if frame.is_long_term {
                        frame.long_term_pic_num = frame.long_term_frame_idx;
                    }
                }
            }
        } else {
            let (add_top, add_bottom) =
                if matches!(slice.structure, PictureStructure::TopField) {
                    (1, 0)
                } else {
                    (0, 1)
                };

            let refs = self.fs_ref.clone();
            for i in refs {
                let fs = &mut self.fs[i];
                if fs.is_reference == 0 {
                    continue;
                }

                fs.frame_num_wrap = if fs.frame_num > slice.frame_num {
                    fs.frame_num - max_frame_num
                } else {
                    fs.frame_num
                };

                if fs.is_reference & TOP != 0 {
                    if let Some(top) = &mut fs.top_field {
                        top.pic_num = 2 * fs.frame_num_wrap + add_top;
                    }
                }
                if fs.is_reference & BOTTOM != 0 {
                    if let Some(bottom) = &mut fs.bottom_field {
                        bottom.pic_num = 2 * fs.frame_num_wrap + add_bottom;
                    }
                }
            }

            let refs = self.fs_ltref.clone();
            for i in refs {
                let fs = &mut self.fs[i];

                if fs.is_long_term & TOP != 0 {
                    if let Some(top) = &mut fs.top_field {
                        top.long_term_pic_num = 2 * top.long_term_frame_idx + add_top;
                    }
                }
                if fs.is_long_term & BOTTOM != 0 {
                    if let Some(bottom) = &mut fs.bottom_field {
                        bottom.long_term_pic_num = 2 * bottom.long_term_frame_idx + add_bottom;
                    }
                }
            }
        }
    }

    /// Builds the initial reference picture lists for a slice, before any
    /// reordering. Lists are truncated to the signaled active counts; the
    /// MBAFF variants are derived when the slice requests them.
    pub fn build_ref_pic_lists(&self, slice: &SliceRefInfo) -> RefPicLists {
        let mut lists = RefPicLists::default();

        match slice.slice_type {
            SliceType::I | SliceType::Si => (),
            SliceType::P | SliceType::Sp => {
                lists.lists[0] = if matches!(slice.structure, PictureStructure::Frame) {
                    self.build_list_p_frame()
                } else {
                    self.build_list_p_field(slice)
                };
            }
            SliceType::B => {
                let (list0, list1) = if matches!(slice.structure, PictureStructure::Frame) {
                    self.build_lists_b_frame(slice)
                } else {
                    self.build_lists_b_field(slice)
                };
                lists.lists[0] = list0;
                lists.lists[1] = list1;
            }
        }

        lists.lists[0].truncate(slice.num_ref_idx_active[0]);
        lists.lists[1].truncate(slice.num_ref_idx_active[1]);

        if slice.mb_aff_frame_flag {
            self.init_mbaff_lists(&mut lists);
        }

        lists
    }

    /// 8.2.4.2.1: P slices in frames. Short-term references by descending
    /// `PicNum`, then long-term references by ascending `LongTermPicNum`.
    fn build_list_p_frame(&self) -> Vec<RefPicHandle> {
        let mut list: Vec<RefPicHandle> = self
            .fs_ref
            .iter()
            .filter(|&&i| {
                let fs = self.store(i);
                fs.is_used == BOTH
                    && fs
                        .frame
                        .as_ref()
                        .map(|f| f.is_short_ref())
                        .unwrap_or(false)
            })
            .map(|&i| RefPicHandle::frame(i))
            .collect();

        list.sort_by_key(|&h| std::cmp::Reverse(self.picture(h).pic_num));

        let num_short_term = list.len();

        list.extend(
            self.fs_ltref
                .iter()
                .filter(|&&i| {
                    let fs = self.store(i);
                    fs.is_used == BOTH
                        && fs.frame.as_ref().map(|f| f.is_long_term).unwrap_or(false)
                })
                .map(|&i| RefPicHandle::frame(i)),
        );
        list[num_short_term..].sort_by_key(|&h| self.picture(h).long_term_pic_num);

        list
    }

    /// 8.2.4.2.2: P slices in fields. Frame stores ordered by descending
    /// `FrameNumWrap`, then expanded to fields with alternating parity.
    fn build_list_p_field(&self, slice: &SliceRefInfo) -> Vec<RefPicHandle> {
        let mut fs_list: Vec<usize> = self
            .fs_ref
            .iter()
            .filter(|&&i| self.store(i).is_reference != 0)
            .copied()
            .collect();
        fs_list.sort_by_key(|&i| std::cmp::Reverse(self.store(i).frame_num_wrap));

        let mut list = self.gen_pic_list_from_frame_list(slice.structure, &fs_list, false);

        let mut fs_list_lt: Vec<usize> = self.fs_ltref.clone();
        fs_list_lt.sort_by_key(|&i| self.store(i).long_term_frame_idx);

        list.extend(self.gen_pic_list_from_frame_list(slice.structure, &fs_list_lt, true));

        list
    }

    /// 8.2.4.2.3: B slices in frames. List 0 is past references by
    /// descending POC then future by ascending POC; list 1 swaps the two
    /// groups. Long-term references append to both.
    fn build_lists_b_frame(
        &self,
        slice: &SliceRefInfo,
    ) -> (Vec<RefPicHandle>, Vec<RefPicHandle>) {
        let short_term: Vec<RefPicHandle> = self
            .fs_ref
            .iter()
            .filter(|&&i| {
                let fs = self.store(i);
                fs.is_used == BOTH
                    && fs
                        .frame
                        .as_ref()
                        .map(|f| f.is_short_ref())
                        .unwrap_or(false)
            })
            .map(|&i| RefPicHandle::frame(i))
            .collect();

        let mut past: Vec<RefPicHandle> = short_term
            .iter()
            .filter(|&&h| self.picture(h).poc < slice.poc)
            .copied()
            .collect();
        past.sort_by_key(|&h| std::cmp::Reverse(self.picture(h).poc));

        let mut future: Vec<RefPicHandle> = short_term
            .iter()
            .filter(|&&h| self.picture(h).poc > slice.poc)
            .copied()
            .collect();
        future.sort_by_key(|&h| self.picture(h).poc);

        let mut long_term: Vec<RefPicHandle> = self
            .fs_ltref
            .iter()
            .filter(|&&i| {
                let fs = self.store(i);
                fs.is_used == BOTH
                    && fs.frame.as_ref().map(|f| f.is_long_term).unwrap_or(false)
            })
            .map(|&i| RefPicHandle::frame(i))
            .collect();
        long_term.sort_by_key(|&h| self.picture(h).long_term_pic_num);

        let mut list0 = Vec::with_capacity(past.len() + future.len() + long_term.len());
        list0.extend(&past);
        list0.extend(&future);
        list0.extend(&long_term);

        let mut list1 = Vec::with_capacity(list0.len());
        list1.extend(&future);
        list1.extend(&past);
        list1.extend(&long_term);

        Self::swap_b1_if_identical(&list0, &mut list1);

        (list0, list1)
    }

    /// 8.2.4.2.4: B slices in fields. Same grouping as frames but over
    /// frame-store POC, then expanded with alternating parity.
    fn build_lists_b_field(
        &self,
        slice: &SliceRefInfo,
    ) -> (Vec<RefPicHandle>, Vec<RefPicHandle>) {
        let used: Vec<usize> = self
            .fs_ref
            .iter()
            .filter(|&&i| self.store(i).is_used != 0)
            .copied()
            .collect();

        let mut past: Vec<usize> = used
            .iter()
            .filter(|&&i| self.store(i).poc <= slice.poc)
            .copied()
            .collect();
        past.sort_by_key(|&i| std::cmp::Reverse(self.store(i).poc));

        let mut future: Vec<usize> = used
            .iter()
            .filter(|&&i| self.store(i).poc > slice.poc)
            .copied()
            .collect();
        future.sort_by_key(|&i| self.store(i).poc);

        let mut fs_list0 = Vec::with_capacity(past.len() + future.len());
        fs_list0.extend(&past);
        fs_list0.extend(&future);

        let mut fs_list1 = Vec::with_capacity(fs_list0.len());
        fs_list1.extend(&future);
        fs_list1.extend(&past);

        let mut fs_list_lt: Vec<usize> = self.fs_ltref.clone();
        fs_list_lt.sort_by_key(|&i| self.store(i).long_term_frame_idx);

        let mut list0 = self.gen_pic_list_from_frame_list(slice.structure, &fs_list0, false);
        list0.extend(self.gen_pic_list_from_frame_list(slice.structure, &fs_list_lt, true));

        let mut list1 = self.gen_pic_list_from_frame_list(slice.structure, &fs_list1, false);
        list1.extend(self.gen_pic_list_from_frame_list(slice.structure, &fs_list_lt, true));

        Self::swap_b1_if_identical(&list0, &mut list1);

        (list0, list1)
    }

    /// 8.2.4.2.5: expands an ordered frame-store list into a field list,
    /// alternating parities starting with the current field's own. A store
    /// whose requested-parity field is absent or of the wrong reference
    /// kind is skipped; the cursor of each parity advances independently.
    fn gen_pic_list_from_frame_list(
        &self,
        structure: PictureStructure,
        fs_list: &[usize],
        long_term: bool,
    ) -> Vec<RefPicHandle> {
        let (first, second) = match structure {
            PictureStructure::TopField => (PicSlot::Top, PicSlot::Bottom),
            PictureStructure::BottomField => (PicSlot::Bottom, PicSlot::Top),
            PictureStructure::Frame => panic!("field list generation for a frame slice"),
        };

        let eligible = |slot: PicSlot, store: usize| -> bool {
            let fs = self.store(store);
            let (bit, pic) = match slot {
                PicSlot::Top => (TOP, fs.top_field.as_ref()),
                PicSlot::Bottom => (BOTTOM, fs.bottom_field.as_ref()),
                PicSlot::Frame => unreachable!(),
            };

            fs.is_used & bit != 0
                && pic
                    .map(|p| {
                        if long_term {
                            p.is_long_ref()
                        } else {
                            p.is_short_ref()
                        }
                    })
                    .unwrap_or(false)
        };

        let next = |slot: PicSlot, cursor: &mut usize| -> Option<RefPicHandle> {
            while *cursor < fs_list.len() {
                let store = fs_list[*cursor];
                *cursor += 1;
                if eligible(slot, store) {
                    return Some(RefPicHandle { store, slot });
                }
            }
            None
        };

        let mut list = Vec::new();
        let mut first_cursor = 0;
        let mut second_cursor = 0;

        loop {
            let a = next(first, &mut first_cursor);
            if let Some(handle) = a {
                list.push(handle);
            }
            let b = next(second, &mut second_cursor);
            if let Some(handle) = b {
                list.push(handle);
            }
            if a.is_none() && b.is_none() {
                break;
            }
        }

        list
    }

    /// When list 1 came out identical to list 0 and holds more than one
    /// entry, its first two entries switch places so bi-prediction does not
    /// degenerate.
    fn swap_b1_if_identical(list0: &[RefPicHandle], list1: &mut [RefPicHandle]) {
        let identical = list1.len() > 1
            && list0.len() == list1.len()
            && list0.iter().zip(list1.iter()).all(|(a, b)| a == b);

        if identical {
            list1.swap(0, 1);
        }
    }

    /// Derives the MBAFF field lists 2..5 by doubling lists 0 and 1 into
    /// per-parity entries.
    fn init_mbaff_lists(&self, lists: &mut RefPicLists) {
        for i in 2..6 {
            lists.lists[i].clear();
        }

        for i in 0..2 {
            let (same, opposite) = (2 + i, 4 + i);
            let mut same_list = Vec::with_capacity(lists.lists[i].len() * 2);
            let mut opposite_list = Vec::with_capacity(lists.lists[i].len() * 2);

            for handle in &lists.lists[i] {
                same_list.push(RefPicHandle {
                    store: handle.store,
                    slot: PicSlot::Top,
                });
                same_list.push(RefPicHandle {
                    store: handle.store,
                    slot: PicSlot::Bottom,
                });
                opposite_list.push(RefPicHandle {
                    store: handle.store,
                    slot: PicSlot::Bottom,
                });
                opposite_list.push(RefPicHandle {
                    store: handle.store,
                    slot: PicSlot::Top,
                });
            }

            lists.lists[same] = same_list;
            lists.lists[opposite] = opposite_list;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::dpb::tests::field;
    use crate::codec::h264::dpb::tests::frame;
    use crate::codec::h264::dpb::tests::test_params;
    use crate::codec::h264::mmco::MarkingOp;
    use crate::codec::h264::mmco::RefPicMarking;
    use crate::codec::h264::output::CollectSink;
    use crate::codec::h264::params::Level;
    use crate::codec::h264::params::SequenceParams;

    fn slice(slice_type: SliceType, frame_num: i32, poc: i32) -> SliceRefInfo {
        SliceRefInfo {
            slice_type,
            structure: PictureStructure::Frame,
            frame_num,
            max_frame_num: 16,
            poc,
            temporal_layer: 0,
            num_ref_idx_active: [4, 4],
            mb_aff_frame_flag: false,
        }
    }

    fn dpb_with_ref_frames(num_ref_frames: usize, pocs: &[i32]) -> Dpb {
        let mut dpb = Dpb::new(&test_params(num_ref_frames)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        for (n, &poc) in pocs.iter().enumerate() {
            dpb.store_picture(frame(n as i32, poc, true), &marking, &mut sink)
                .unwrap();
        }

        dpb
    }

    fn list_pocs(dpb: &Dpb, list: &[RefPicHandle]) -> Vec<i32> {
        list.iter().map(|&h| dpb.picture(h).poc).collect()
    }

    fn list_pic_nums(dpb: &Dpb, list: &[RefPicHandle]) -> Vec<i32> {
        list.iter().map(|&h| dpb.picture(h).pic_num).collect()
    }

    #[test]
    fn i_slice_lists_are_empty() {
        let dpb = dpb_with_ref_frames(4, &[0, 2, 4]);
        let lists = dpb.build_ref_pic_lists(&slice(SliceType::I, 3, 6));

        assert!(lists.lists[0].is_empty());
        assert!(lists.lists[1].is_empty());
    }

    #[test]
    fn p_frame_list_orders_by_descending_pic_num() {
        let mut dpb = dpb_with_ref_frames(4, &[0, 2, 4]);
        let info = slice(SliceType::P, 3, 6);
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);
        assert_eq!(list_pic_nums(&dpb, &lists.lists[0]), vec![2, 1, 0]);
        assert!(lists.lists[1].is_empty());
    }

    #[test]
    fn pic_num_wraps_for_frame_nums_above_current() {
        // frame_num 14, 15 stored, then the counter wraps to 1.
        let mut dpb = Dpb::new(&test_params(4)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(14, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(15, 2, true), &marking, &mut sink)
            .unwrap();

        let info = slice(SliceType::P, 1, 4);
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);
        // 15 wraps to -1, 14 to -2; descending PicNum puts 15 first.
        assert_eq!(list_pic_nums(&dpb, &lists.lists[0]), vec![-1, -2]);
    }

    #[test]
    fn p_frame_list_appends_long_term_ascending() {
        let mut dpb = Dpb::new(&test_params(4)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        dpb.store_picture(frame(0, 0, true), &marking, &mut sink)
            .unwrap();
        dpb.store_picture(frame(1, 2, true), &marking, &mut sink)
            .unwrap();

        // Give frame_num 0 long-term index 1 and frame_num 1 index 0.
        let adaptive = RefPicMarking::adaptive(vec![
            MarkingOp::assign_long_term(1, 1),
            MarkingOp::assign_long_term(0, 0),
            MarkingOp::end(),
        ]);
        dpb.store_picture(frame(2, 4, true), &adaptive, &mut sink)
            .unwrap();

        let info = slice(SliceType::P, 3, 6);
        dpb.update_pic_nums(&info);
        let lists = dpb.build_ref_pic_lists(&info);

        // Short-term frame_num 2 first, then long-term indices 0, 1.
        let kinds: Vec<(bool, i32)> = lists.lists[0]
            .iter()
            .map(|&h| {
                let p = dpb.picture(h);
                (p.is_long_term, if p.is_long_term { p.long_term_pic_num } else { p.pic_num })
            })
            .collect();
        assert_eq!(kinds, vec![(false, 2), (true, 0), (true, 1)]);
    }

    #[test]
    fn b_frame_lists_partition_around_current_poc() {
        let mut dpb = dpb_with_ref_frames(4, &[4, 8, 12, 16]);
        let info = slice(SliceType::B, 4, 10);
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);

        assert_eq!(list_pocs(&dpb, &lists.lists[0]), vec![8, 4, 12, 16]);
        assert_eq!(list_pocs(&dpb, &lists.lists[1]), vec![12, 16, 8, 4]);
    }

    #[test]
    fn b_frame_identical_lists_swap_first_two() {
        // All references in the past: both lists come out identical.
        let mut dpb = dpb_with_ref_frames(4, &[0, 2]);
        let info = slice(SliceType::B, 2, 10);
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);

        assert_eq!(list_pocs(&dpb, &lists.lists[0]), vec![2, 0]);
        assert_eq!(list_pocs(&dpb, &lists.lists[1]), vec![0, 2]);
    }

    #[test]
    fn lists_truncate_to_active_count() {
        let mut dpb = dpb_with_ref_frames(4, &[0, 2, 4, 6]);
        let mut info = slice(SliceType::P, 4, 8);
        info.num_ref_idx_active = [2, 2];
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);
        assert_eq!(lists.lists[0].len(), 2);
        assert_eq!(list_pic_nums(&dpb, &lists.lists[0]), vec![3, 2]);
    }

    fn interlaced_params(num_ref_frames: usize) -> SequenceParams {
        SequenceParams::builder()
            .level_idc(Level::L1_2)
            .resolution_in_mbs(4, 2)
            .num_ref_frames(num_ref_frames)
            .max_dec_frame_buffering(4)
            .frame_mbs_only_flag(false)
            .build()
    }

    fn dpb_with_field_pairs(num_ref_frames: usize, pocs: &[(i32, i32)]) -> Dpb {
        let mut dpb = Dpb::new(&interlaced_params(num_ref_frames)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        for (n, &(top_poc, bottom_poc)) in pocs.iter().enumerate() {
            dpb.store_picture(
                field(PictureStructure::TopField, n as i32, top_poc, true),
                &marking,
                &mut sink,
            )
            .unwrap();
            dpb.store_picture(
                field(PictureStructure::BottomField, n as i32, bottom_poc, true),
                &marking,
                &mut sink,
            )
            .unwrap();
        }

        dpb
    }

    #[test]
    fn p_field_list_alternates_parity() {
        let mut dpb = dpb_with_field_pairs(4, &[(0, 1), (2, 3)]);

        let info = SliceRefInfo {
            slice_type: SliceType::P,
            structure: PictureStructure::TopField,
            frame_num: 2,
            max_frame_num: 16,
            poc: 4,
            temporal_layer: 0,
            num_ref_idx_active: [4, 4],
            mb_aff_frame_flag: false,
        };
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);

        let slots: Vec<PicSlot> = lists.lists[0].iter().map(|h| h.slot).collect();
        assert_eq!(
            slots,
            vec![PicSlot::Top, PicSlot::Bottom, PicSlot::Top, PicSlot::Bottom]
        );
        // Most recent pair first, top fields get odd pic_nums for a top
        // target.
        assert_eq!(list_pic_nums(&dpb, &lists.lists[0]), vec![3, 2, 1, 0]);
    }

    #[test]
    fn field_list_skips_missing_parity() {
        // Second store holds a lone top field.
        let mut dpb = dpb_with_field_pairs(4, &[(0, 1)]);
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();
        dpb.store_picture(
            field(PictureStructure::TopField, 1, 2, true),
            &marking,
            &mut sink,
        )
        .unwrap();

        let info = SliceRefInfo {
            slice_type: SliceType::P,
            structure: PictureStructure::TopField,
            frame_num: 2,
            max_frame_num: 16,
            poc: 4,
            temporal_layer: 0,
            num_ref_idx_active: [4, 4],
            mb_aff_frame_flag: false,
        };
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);
        let slots: Vec<PicSlot> = lists.lists[0].iter().map(|h| h.slot).collect();

        // The lone pair's missing bottom is skipped; alternation continues
        // with the next available field of that parity.
        assert_eq!(slots, vec![PicSlot::Top, PicSlot::Bottom, PicSlot::Top]);
        assert_eq!(list_pic_nums(&dpb, &lists.lists[0]), vec![3, 0, 1]);
    }

    #[test]
    fn b_field_lists_group_by_store_poc() {
        let mut dpb = dpb_with_field_pairs(4, &[(0, 1), (4, 5)]);

        let info = SliceRefInfo {
            slice_type: SliceType::B,
            structure: PictureStructure::BottomField,
            frame_num: 2,
            max_frame_num: 16,
            poc: 2,
            temporal_layer: 0,
            num_ref_idx_active: [4, 4],
            mb_aff_frame_flag: false,
        };
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);

        // List 0 starts from the past pair (store POC 0), list 1 from the
        // future pair (store POC 4); a bottom target leads with bottom
        // fields.
        assert_eq!(list_pocs(&dpb, &lists.lists[0]), vec![1, 0, 5, 4]);
        assert_eq!(list_pocs(&dpb, &lists.lists[1]), vec![5, 4, 1, 0]);
    }

    #[test]
    fn mbaff_lists_double_frame_entries() {
        let mut dpb = Dpb::new(&interlaced_params(4)).unwrap();
        let mut sink = CollectSink::default();
        let marking = RefPicMarking::sliding_window();

        // Coded frames in an interlaced stream get split field views.
        let mut pic = frame(0, 0, true);
        pic.top_poc = 0;
        pic.bottom_poc = 1;
        dpb.store_picture(pic, &marking, &mut sink).unwrap();

        let mut info = slice(SliceType::P, 1, 2);
        info.mb_aff_frame_flag = true;
        dpb.update_pic_nums(&info);

        let lists = dpb.build_ref_pic_lists(&info);
        assert_eq!(lists.lists[0].len(), 1);
        assert_eq!(lists.lists[2].len(), 2);
        assert_eq!(lists.lists[2][0].slot, PicSlot::Top);
        assert_eq!(lists.lists[2][1].slot, PicSlot::Bottom);
        assert_eq!(lists.lists[4][0].slot, PicSlot::Bottom);
        assert_eq!(lists.lists[4][1].slot, PicSlot::Top);
        assert!(lists.lists[3].is_empty());
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod frame_store;
pub mod mmco;
pub mod output;
pub mod params;
pub mod picture;
pub mod ref_list;
pub mod reorder;
pub mod slice;

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture buffering for H.264: decoded picture buffer storage and
//! eviction, reference marking (sliding window and adaptive memory
//! management), per-slice reference picture list construction, and list
//! reordering.
//!
//! The bitstream layer and the prediction layer are external to this crate: a
//! slice decoder hands us finished `StorablePicture`s together with per-slice
//! parameters, and emitted pictures leave through a `FrameSink`.

pub mod codec;

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use crate::codec::h264::picture::PictureStructure;
use crate::codec::h264::picture::StorablePicture;

/// Consumer of the pictures the DPB emits, in output order. Implemented by
/// the file writer or display path outside this crate.
pub trait FrameSink {
    fn write_frame(&mut self, picture: &StorablePicture) -> anyhow::Result<()>;
}

/// CRC32 fingerprint of a picture's pixel planes, in I420 layout order.
pub fn frame_crc(picture: &StorablePicture) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(picture.luma.data());
    hasher.update(picture.chroma[0].data());
    hasher.update(picture.chroma[1].data());
    hasher.finalize()
}

/// What a [`CollectSink`] records about each emitted picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmittedFrame {
    pub poc: i32,
    pub frame_num: i32,
    pub structure: PictureStructure,
    pub crc: u32,
}

/// Records emission order and frame fingerprints. Test double for the real
/// output path.
#[derive(Default)]
pub struct CollectSink {
    pub frames: Vec<EmittedFrame>,
}

impl FrameSink for CollectSink {
    fn write_frame(&mut self, picture: &StorablePicture) -> anyhow::Result<()> {
        self.frames.push(EmittedFrame {
            poc: picture.poc,
            frame_num: picture.frame_num,
            structure: picture.structure,
            crc: frame_crc(picture),
        });

        Ok(())
    }
}

/// Writes emitted pictures as raw I420 to `inner`, row by row so plane
/// padding never leaks into the file.
pub struct YuvWriter<W: Write> {
    inner: W,
}

impl<W: Write> YuvWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameSink for YuvWriter<W> {
    fn write_frame(&mut self, picture: &StorablePicture) -> anyhow::Result<()> {
        for y in 0..picture.luma.height() {
            self.inner.write_all(picture.luma.row(y))?;
        }
        for plane in &picture.chroma {
            for y in 0..plane.height() {
                self.inner.write_all(plane.row(y))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_writer_emits_all_planes() {
        let mut pic = StorablePicture::new(PictureStructure::Frame, 16, 16).unwrap();
        pic.luma.row_mut(0)[0] = 1;
        pic.chroma[0].row_mut(0)[0] = 2;
        pic.chroma[1].row_mut(0)[0] = 3;

        let mut sink = YuvWriter::new(Vec::new());
        sink.write_frame(&pic).unwrap();
        let bytes = sink.into_inner();

        // 16x16 luma + two 8x8 chroma planes.
        assert_eq!(bytes.len(), 256 + 64 + 64);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[256], 2);
        assert_eq!(bytes[256 + 64], 3);
    }

    #[test]
    fn crc_distinguishes_content() {
        let mut a = StorablePicture::new(PictureStructure::Frame, 16, 16).unwrap();
        let b = StorablePicture::new(PictureStructure::Frame, 16, 16).unwrap();
        assert_eq!(frame_crc(&a), frame_crc(&b));

        a.luma.row_mut(3)[3] = 17;
        assert_ne!(frame_crc(&a), frame_crc(&b));
    }
}

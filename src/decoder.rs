//! Decode pipeline: the inverse of [`crate::encoder`] -- parses a picture
//! packet's block-grid, stability, and motion sub-streams, then per plane
//! reverses HZCC and the subband transform before reconstructing via motion
//! compensation or a straight copy.
//!
//! Grounded in `dsv_decoder.c`'s `dsv_dec` state machine. `DSV_IMAGE`'s
//! refcounted `ref_frame`/`out_frame` handles collapse to a single
//! `Option<Frame>` reference slot, mirroring the encoder's own
//! simplification.

use crate::bitstream::{BitReader, RleReader};
use crate::error::{DsvError, DsvResult};
use crate::frame::{make_coefs, xf_dims, Frame};
use crate::hzcc::{self, BlockGrid, Stability};
use crate::mc::add_pred;
use crate::motion::{movec_pred, MotionVector, MvGrid};
use crate::packet::{decode_meta, decode_packet_hdr, Meta};
use crate::params::{
    div_round, pt_has_ref, pt_is_pic, pt_is_ref, FrameParams, MASK_ALL_INTRA, MAX_BLOCK_SIZE,
    MAX_QP_BITS, MIN_BLOCK_SIZE, PT_EOS, PT_META,
};
use crate::sbt::inv_sbt;

/// What [`Decoder::decode`] handed back for one input packet (`dsv_dec`'s
/// `DSV_DEC_*` return codes, reshaped as an enum since Rust has no output
/// parameter to leave untouched on the quiet paths).
pub enum DecodeEvent {
    /// A metadata packet was parsed; the decoder now has stream parameters.
    Metadata(Meta),
    /// A picture packet decoded to a displayable frame.
    Frame { fnum: u32, frame: Frame },
    /// The end-of-stream packet.
    EndOfStream,
    /// A picture packet arrived before any metadata packet; nothing to show.
    Skipped,
}

/// Parses the length-prefixed ZBRLE stability sub-stream into a
/// byte-per-block map (`decode_stability_blocks`). Only the stable bit
/// (`hzcc::IS_STABLE`) is set here; [`decode_motion`] ORs in the intra bit.
fn decode_stability_blocks(br: &mut BitReader, packet: &[u8], nblk: usize) -> DsvResult<Vec<u8>> {
    br.align();
    let len = br.get_ueg() as usize;
    br.align();
    let start = br.byte_pos();
    if start + len > packet.len() {
        return Err(DsvError::MalformedPacket {
            reason: "stability sub-stream out of bounds",
        });
    }
    let sub = &packet[start..start + len];
    br.skip_bytes(len);

    let mut rle = RleReader::new(sub);
    let mut stable_blocks = vec![0u8; nblk];
    for b in stable_blocks.iter_mut() {
        *b = rle.get() as u8;
    }
    Ok(stable_blocks)
}

/// Parses the four length-prefixed motion sub-streams (mode, mv-x, mv-y,
/// intra sub-block mask) and reconstructs every block's [`MotionVector`],
/// ORing the intra bit into `stable_blocks` along the way (`decode_motion`).
fn decode_motion(
    br: &mut BitReader,
    packet: &[u8],
    stable_blocks: &mut [u8],
    grid: MvGrid,
) -> DsvResult<Vec<MotionVector>> {
    let nblk = (grid.nblocks_h * grid.nblocks_v) as usize;

    let mut subs: [&[u8]; 4] = [&[], &[], &[], &[]];
    for sub in subs.iter_mut() {
        br.align();
        let len = br.get_ueg() as usize;
        br.align();
        let start = br.byte_pos();
        if start + len > packet.len() {
            return Err(DsvError::MalformedPacket {
                reason: "motion sub-stream out of bounds",
            });
        }
        *sub = &packet[start..start + len];
        br.skip_bytes(len);
    }

    let mut mode_rle = RleReader::new(subs[0]);
    let mut mvx_br = BitReader::new(subs[1]);
    let mut mvy_br = BitReader::new(subs[2]);
    let mut sbim_br = BitReader::new(subs[3]);

    let mut mvs = vec![MotionVector::default(); nblk];
    for j in 0..grid.nblocks_v {
        for i in 0..grid.nblocks_h {
            let idx = (i + j * grid.nblocks_h) as usize;
            if mode_rle.get() {
                let all = sbim_br.get_bit() != 0;
                let submask = if all { MASK_ALL_INTRA } else { sbim_br.get_bits(4) as u8 };
                mvs[idx] = MotionVector::intra(submask);
                stable_blocks[idx] |= hzcc::IS_INTRA;
            } else {
                let (px, py) = movec_pred(&mvs, grid, i, j);
                let x = (mvx_br.get_seg() + px) as i16;
                let y = (mvy_br.get_seg() + py) as i16;
                mvs[idx] = MotionVector::inter(x, y);
            }
        }
    }
    Ok(mvs)
}

/// Holds stream parameters once a metadata packet has arrived and the
/// single reconstructed frame a P-frame compensates against, `DSV_DECODER`.
pub struct Decoder {
    meta: Option<Meta>,
    reference: Option<Frame>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { meta: None, reference: None }
    }

    /// Stream parameters from the last metadata packet seen, if any
    /// (`dsv_get_metadata`).
    pub fn metadata(&self) -> Option<Meta> {
        self.meta
    }

    /// Parses one packet, `dsv_dec`. The caller is expected to split a
    /// stored stream on packet boundaries using the prev/next link fields
    /// before calling this (this decoder is handed one packet at a time and
    /// doesn't walk the link chain itself).
    pub fn decode(&mut self, packet: &[u8]) -> DsvResult<DecodeEvent> {
        let mut br = BitReader::new(packet);
        let pkt_type = decode_packet_hdr(&mut br)?;

        if !pt_is_pic(pkt_type) {
            return match pkt_type {
                PT_META => {
                    let meta = decode_meta(&mut br)?;
                    self.meta = Some(meta);
                    Ok(DecodeEvent::Metadata(meta))
                }
                PT_EOS => Ok(DecodeEvent::EndOfStream),
                _ => Err(DsvError::MalformedPacket { reason: "unknown packet type" }),
            };
        }

        let meta = match self.meta {
            Some(m) => m,
            None => {
                log::warn!("picture packet arrived before metadata, skipping");
                return Ok(DecodeEvent::Skipped);
            }
        };

        let has_ref = pt_has_ref(pkt_type);
        let is_ref = pt_is_ref(pkt_type);

        if has_ref && self.reference.is_none() {
            log::warn!("{}", DsvError::MissingReference);
            return Ok(DecodeEvent::Skipped);
        }

        br.align();
        let fnum = br.get_bits(32);

        br.align();
        let blk_w = (br.get_ueg() as i32) << 2;
        let blk_h = (br.get_ueg() as i32) << 2;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blk_w)
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blk_h)
        {
            return Err(DsvError::MalformedPacket { reason: "block size out of range" });
        }
        br.align();

        let nblocks_h = div_round(meta.width, blk_w);
        let nblocks_v = div_round(meta.height, blk_h);
        let nblk = (nblocks_h * nblocks_v) as usize;
        let grid = BlockGrid { nblocks_h, nblocks_v };
        let params = FrameParams {
            subsamp: meta.subsamp,
            width: meta.width,
            height: meta.height,
            is_ref,
            has_ref,
            blk_w,
            blk_h,
            nblocks_h,
            nblocks_v,
        };

        br.align();
        let mut stable_blocks = decode_stability_blocks(&mut br, packet, nblk)?;

        let mut mvs = vec![MotionVector::default(); nblk];
        if has_ref {
            br.align();
            mvs = decode_motion(
                &mut br,
                packet,
                &mut stable_blocks,
                MvGrid { nblocks_h, nblocks_v },
            )?;
        }

        br.align();
        let quant = br.get_bits(MAX_QP_BITS) as i32;

        let (xf_w, xf_h) = xf_dims(meta.width, meta.height);
        let mut residual = Frame::new(meta.subsamp, xf_w, xf_h, true);
        let mut coefs = make_coefs(meta.subsamp, xf_w, xf_h);

        // A plane whose declared length doesn't fit what's left in the
        // packet leaves the bit reader with no reliable position for any
        // later plane either, so once this happens the remaining planes
        // stay at their zeroed default -- the inverse transform below turns
        // that into a mid-grey region instead of failing the whole frame.
        let mut planes_corrupt = false;
        for (c, coef) in coefs.iter_mut().enumerate() {
            if planes_corrupt {
                break;
            }
            br.align();
            let plen = br.get_bits(32) as usize;
            let start = br.byte_pos();
            let framesz = (coef.width * coef.height) as usize * std::mem::size_of::<i32>();
            if plen > framesz * 2 || start + plen > packet.len() {
                log::error!(
                    "{}",
                    DsvError::CorruptPlane { plane: c, reason: "implausible plane length" }
                );
                planes_corrupt = true;
                break;
            }
            let plane_buf = &packet[start..start + plen];
            br.skip_bytes(plen);

            let stab = Stability { grid, stable_blocks: &stable_blocks, cur_plane: c, is_p: has_ref };
            hzcc::decode_plane(plane_buf, coef, quant, &stab);
        }
        for (c, coef) in coefs.iter_mut().enumerate() {
            inv_sbt(residual.plane_mut(c), coef, quant, has_ref, c);
        }

        let mut out_frame = Frame::new(meta.subsamp, meta.width, meta.height, true);
        if has_ref {
            let reference = self.reference.as_ref().expect("checked above");
            add_pred(&mvs, &params, &residual, &mut out_frame, reference);
        } else {
            out_frame.copy_from(&residual);
        }

        if is_ref {
            out_frame.extend();
            self.reference = Some(out_frame.clone());
        }

        Ok(DecodeEvent::Frame { fnum, frame: out_frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Encoder, EncoderConfig};
    use crate::subsamp::Subsamp;

    fn meta(w: i32, h: i32) -> Meta {
        Meta {
            width: w,
            height: h,
            subsamp: Subsamp::Yuv420,
            fps_num: 30,
            fps_den: 1,
            aspect_num: 1,
            aspect_den: 1,
        }
    }

    fn gradient_frame(w: i32, h: i32) -> Frame {
        let mut f = Frame::new(Subsamp::Yuv420, w, h, false);
        for j in 0..h {
            for i in 0..w {
                f.plane_mut(0).set(i, j, ((i * 5 + j * 3) % 251) as u8);
            }
        }
        for c in 1..3 {
            let (cw, ch) = (f.plane(c).width(), f.plane(c).height());
            for j in 0..ch {
                for i in 0..cw {
                    f.plane_mut(c).set(i, j, 128);
                }
            }
        }
        f
    }

    fn feed(dec: &mut Decoder, bufs: &[Vec<u8>]) -> Vec<(u32, Frame)> {
        let mut out = Vec::new();
        for buf in bufs {
            match dec.decode(buf).unwrap() {
                DecodeEvent::Metadata(_) => {}
                DecodeEvent::Frame { fnum, frame } => out.push((fnum, frame)),
                DecodeEvent::EndOfStream => {}
                DecodeEvent::Skipped => panic!("should not skip once metadata is known"),
            }
        }
        out
    }

    #[test]
    fn decoder_reports_metadata_from_the_first_packet() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let bufs = enc.push_frame(&gradient_frame(32, 32)).unwrap();

        let mut dec = Decoder::new();
        assert!(dec.metadata().is_none());
        match dec.decode(&bufs[0]).unwrap() {
            DecodeEvent::Metadata(m) => assert_eq!((m.width, m.height), (32, 32)),
            _ => panic!("expected metadata"),
        }
        assert!(dec.metadata().is_some());
    }

    #[test]
    fn picture_packet_before_metadata_is_skipped_not_an_error() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let bufs = enc.push_frame(&gradient_frame(32, 32)).unwrap();

        let mut dec = Decoder::new();
        match dec.decode(&bufs[1]).unwrap() {
            DecodeEvent::Skipped => {}
            _ => panic!("expected a skip"),
        }
    }

    #[test]
    fn intra_frame_round_trips_to_roughly_the_source_luma() {
        let w = 48;
        let h = 32;
        let mut enc = Encoder::new(meta(w, h), EncoderConfig::default()).unwrap();
        let src = gradient_frame(w, h);
        let bufs = enc.push_frame(&src).unwrap();

        let mut dec = Decoder::new();
        let frames = feed(&mut dec, &bufs);
        assert_eq!(frames.len(), 1);
        let (fnum, out) = &frames[0];
        assert_eq!(*fnum, 0);

        let mut max_err = 0i32;
        for j in 0..h {
            for i in 0..w {
                let a = src.plane(0).get(i, j) as i32;
                let b = out.plane(0).get(i, j) as i32;
                max_err = max_err.max((a - b).abs());
            }
        }
        assert!(max_err < 40, "max luma error too high: {max_err}");
    }

    #[test]
    fn p_frame_of_an_identical_source_decodes_without_error() {
        let w = 32;
        let h = 32;
        let mut enc = Encoder::new(meta(w, h), EncoderConfig::default()).unwrap();
        let src = gradient_frame(w, h);
        let mut dec = Decoder::new();

        let bufs = enc.push_frame(&src).unwrap();
        feed(&mut dec, &bufs);

        let bufs2 = enc.push_frame(&src).unwrap();
        let frames = feed(&mut dec, &bufs2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 1);
    }

    #[test]
    fn end_of_stream_is_reported_distinctly() {
        let mut enc = Encoder::new(meta(16, 16), EncoderConfig::default()).unwrap();
        let eos = enc.end_of_stream();
        let mut dec = Decoder::new();
        assert!(matches!(dec.decode(&eos).unwrap(), DecodeEvent::EndOfStream));
    }

    #[test]
    fn p_frame_with_no_stored_reference_is_skipped_not_an_error() {
        // Feed metadata only, then a P-frame packet directly -- the decoder
        // has stream parameters but never reconstructed a reference frame.
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let src = gradient_frame(32, 32);
        let first = enc.push_frame(&src).unwrap();
        let second = enc.push_frame(&src).unwrap();

        let mut dec = Decoder::new();
        dec.decode(&first[0]).unwrap();
        assert!(matches!(dec.decode(&second[0]).unwrap(), DecodeEvent::Skipped));
    }
}

//! Encode pipeline: per-frame orchestration of hierarchical motion
//! estimation, subband transform + HZCC coding, rate control, and packet
//! emission.
//!
//! Grounded in `dsv_encoder.c`. `DSV_ENCDATA`'s refcounted, multi-handle
//! frame graph (input/padded/pyramid/recon/refdata) collapses here to plain
//! ownership: the encoder keeps exactly the two frames (`padded`, `recon`)
//! that outlive a picture as the single-slot reference for the next one,
//! and drops everything else at the end of [`Encoder::push_frame`].

use crate::bitstream::BitWriter;
use crate::error::{DsvError, DsvResult};
use crate::frame::{make_coefs, xf_dims, Frame};
use crate::hme::Hme;
use crate::hzcc::{self, BlockGrid, Stability};
use crate::mc::{frame_add, sub_pred};
use crate::motion::{movec_pred, MotionVector, MvGrid};
use crate::packet::{encode_eos, encode_metadata, encode_packet_hdr, set_link_offsets, Meta};
use crate::params::{
    make_pt, quality_percent, FrameParams, BPF_RESET, GOP_INTRA, MASK_ALL_INTRA, MAX_QP_BITS,
    MAX_QUALITY, MODE_INTER, MODE_INTRA, RATE_CONTROL_ABR, RATE_CONTROL_CRF,
};
use crate::sbt::{fwd_sbt, inv_sbt};

/// `DSV_ENCODER`'s tunables, defaulted exactly like `dsv_enc_init`.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub quality: i32,
    pub gop: i32,
    pub do_scd: bool,
    pub rc_mode: u8,
    pub bitrate: i64,
    pub max_q_step: i32,
    pub min_quality: i32,
    pub max_quality: i32,
    pub min_i_frame_quality: i32,
    pub intra_pct_thresh: i32,
    pub scene_change_delta: i32,
    pub stable_refresh: i32,
    /// 0 selects the automatic level count (`encode_one_frame`'s
    /// `pyramid_levels == 0` branch).
    pub pyramid_levels: usize,
    pub rc_high_motion_nudge: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            quality: quality_percent(85),
            gop: 24,
            do_scd: true,
            rc_mode: RATE_CONTROL_CRF,
            bitrate: i32::MAX as i64,
            max_q_step: MAX_QUALITY * 1 / 200,
            min_quality: quality_percent(1),
            max_quality: quality_percent(95),
            min_i_frame_quality: quality_percent(5),
            intra_pct_thresh: 50,
            scene_change_delta: 4,
            stable_refresh: 14,
            pyramid_levels: 0,
            rc_high_motion_nudge: true,
        }
    }
}

/// What a P-frame needs from its predecessor: the original (unquantized)
/// pixels for motion search, and the reconstructed pixels for
/// compensation. `refdata->padded_frame` / `refdata->recon_frame` in the
/// original.
struct ReferenceFrame {
    padded: Frame,
    recon: Frame,
}

/// Per-frame rate-control and GOP bookkeeping, plus the single-slot
/// reference frame. One `Encoder` corresponds to one `DSV_ENCODER` instance.
pub struct Encoder {
    config: EncoderConfig,
    meta: Meta,
    pyramid_levels: usize,

    next_fnum: u32,
    prev_gop: i64,
    force_metadata: bool,
    prev_link: u32,

    rc_quant: i32,
    avg_p_frame_q: i32,
    bpf_total: i64,
    bpf_avg: i64,
    bpf_reset: i64,
    total_p_frame_q: i64,
    last_p_frame_over: bool,
    back_into_range: bool,

    prev_avg_luma: i32,
    refresh_ctr: i32,
    stability: Vec<(i32, i32)>,
    stable_blocks: Vec<u8>,

    reference: Option<ReferenceFrame>,
}

fn fps_scaled(meta: &Meta) -> i64 {
    let den = meta.fps_den.max(1) as i64;
    let num = meta.fps_num.max(0) as i64;
    let fps = (num << 5) / den;
    if fps == 0 {
        1
    } else {
        fps
    }
}

fn coarsest_avg_luma(padded: &Frame, levels: usize) -> i32 {
    let mut f = padded.clone();
    for _ in 0..levels {
        f = f.downsample_2x_luma();
    }
    f.avg_luma()
}

impl Encoder {
    /// Validates `meta` and resolves the encoder's fixed-for-life block
    /// grid and pyramid depth (`dsv_enc_init` + `dsv_enc_start` +
    /// `encode_one_frame`'s first-call setup).
    pub fn new(meta: Meta, config: EncoderConfig) -> DsvResult<Self> {
        if meta.width < 16 || meta.height < 16 {
            return Err(DsvError::Config(format!(
                "invalid dimensions {}x{}",
                meta.width, meta.height
            )));
        }
        if meta.fps_den == 0 {
            return Err(DsvError::Config("fps denominator is zero".into()));
        }

        let params = FrameParams::new(meta.subsamp, meta.width, meta.height, false, false);
        let nblk = (params.nblocks_h * params.nblocks_v) as usize;

        let pyramid_levels = if config.pyramid_levels == 0 {
            let mut lvls = hzcc::dsv_lb2(meta.width.min(meta.height).max(1) as u32);
            let maxdim = params.nblocks_h.max(params.nblocks_v);
            while (1i32 << lvls) > maxdim {
                lvls -= 1;
            }
            lvls.clamp(3, 5) as usize
        } else {
            config.pyramid_levels.clamp(1, 5)
        };

        let rc_quant = if config.rc_mode != RATE_CONTROL_CRF {
            config.quality.clamp(0, MAX_QUALITY)
        } else {
            0
        };

        Ok(Encoder {
            config,
            meta,
            pyramid_levels,
            next_fnum: 0,
            prev_gop: -1,
            force_metadata: true,
            prev_link: 0,
            rc_quant,
            avg_p_frame_q: rc_quant * 4 / 5,
            bpf_total: 0,
            bpf_avg: 0,
            bpf_reset: 0,
            total_p_frame_q: 0,
            last_p_frame_over: false,
            back_into_range: false,
            prev_avg_luma: 0,
            refresh_ctr: 0,
            stability: vec![(0, 0); nblk],
            stable_blocks: vec![0u8; nblk],
            reference: None,
        })
    }

    /// Forces the next `push_frame` call to emit a metadata packet, even if
    /// the GOP boundary hasn't been reached (`dsv_enc_force_metadata`).
    pub fn force_metadata(&mut self) {
        self.force_metadata = true;
    }

    /// CRF/ABR quantizer derivation, `quality2quant`. Returns the
    /// frame-level quantizer to feed the subband/HZCC stage; also updates
    /// `self.rc_quant` for ABR's running state.
    fn derive_quant(&mut self, is_p: bool, forced_intra: bool) -> i32 {
        let q = if self.config.rc_mode == RATE_CONTROL_CRF {
            self.rc_quant = self.config.quality;
            self.rc_quant
        } else {
            let fps = fps_scaled(&self.meta);
            let needed_bpf = ((self.config.bitrate << 5) / fps) >> 3;
            let bpf = if self.bpf_avg == 0 { needed_bpf } else { self.bpf_avg };

            let mut dir: i64 = if bpf - needed_bpf > 0 { -1 } else { 1 };
            let mut delta = ((bpf - needed_bpf).abs() << 9) / needed_bpf.max(1);
            if dir == 1 {
                delta *= 2;
            }

            let mut nudged = false;
            if self.config.rc_high_motion_nudge {
                if is_p {
                    if self.last_p_frame_over {
                        delta += 1;
                        delta *= 2;
                        dir = -1;
                        nudged = true;
                    } else if self.back_into_range {
                        delta += 1;
                        delta *= 2;
                        dir = 1;
                        nudged = true;
                    }
                } else if self.back_into_range {
                    delta += 1;
                    delta *= 2;
                    dir = 1;
                    nudged = true;
                }
            }

            delta = (self.rc_quant as i64 * delta) >> 9;

            let max_q_step = self.config.max_q_step.clamp(1, MAX_QUALITY) as i64;
            if nudged {
                delta = delta.min(max_q_step * 16);
            } else {
                delta = delta.min(max_q_step);
            }
            delta *= dir;

            let mut q = self.rc_quant as i64 + delta;
            let low_p = (self.avg_p_frame_q - quality_percent(4))
                .clamp(self.config.min_quality, self.config.max_quality);
            let minq = if is_p { low_p } else { self.config.min_i_frame_quality };

            if forced_intra {
                if q < quality_percent(60) as i64 {
                    q += quality_percent(15) as i64;
                } else if q < quality_percent(70) as i64 {
                    q += quality_percent(8) as i64;
                } else if q < quality_percent(75) as i64 {
                    q += quality_percent(3) as i64;
                }
                q = q.clamp(0, (self.config.max_quality - quality_percent(5)) as i64);
            }
            q = q.clamp(minq as i64, self.config.max_quality as i64);
            q = q.clamp(0, MAX_QUALITY as i64);

            self.rc_quant = q as i32;
            self.rc_quant
        };
        MAX_QUALITY - ((MAX_QUALITY - 5) * q / MAX_QUALITY)
    }

    /// Per-block stability accumulation and the stable-blocks map used as
    /// an adaptive-quantization hint (`encode_stable_blocks`). Writes the
    /// ZBRLE-coded, length-prefixed sub-stream into `bw`.
    fn encode_stable_blocks(&mut self, bw: &mut BitWriter, mvs: &[MotionVector], is_p: bool) {
        let nblk = self.stable_blocks.len();
        if self.refresh_ctr >= self.config.stable_refresh {
            self.refresh_ctr = 0;
            self.stability.iter_mut().for_each(|s| *s = (0, 0));
        }
        let avgdiv = self.refresh_ctr.max(1);

        let mut rle = crate::bitstream::RleWriter::new();
        for i in 0..nblk {
            let mut stable = false;
            let mut intra_block = false;
            if is_p {
                let mv = mvs[i];
                if mv.is_inter() {
                    self.stability[i].0 += (mv.x as i32).abs() >> 2;
                    self.stability[i].1 += (mv.y as i32).abs() >> 2;
                    stable = mv.high_detail;
                    let ax = self.stability[i].0 / avgdiv;
                    let ay = self.stability[i].1 / avgdiv;
                    stable |= ax == 0 && ay == 0 && !mv.lo_tex && !mv.lo_var;
                } else {
                    intra_block = true;
                }
                if mv.lo_tex || mv.lo_var {
                    self.stability[i] = (0x3fff, 0x3fff);
                }
            } else {
                let ax = self.stability[i].0 / avgdiv;
                let ay = self.stability[i].1 / avgdiv;
                stable = ax == 0 && ay == 0;
            }
            self.stable_blocks[i] = (stable as u8) | ((intra_block as u8) << 1);
            rle.put(self.stable_blocks[i] & 1 != 0);
        }
        let bytes = rle.finish();
        bw.align();
        bw.put_ueg(bytes.len() as u32);
        bw.align();
        bw.concat(&bytes);
    }

    /// B.2.3.2 Motion Data: four length-prefixed sub-streams (mode, mv-x,
    /// mv-y, intra sub-block mask), `encode_motion`.
    fn encode_motion(bw: &mut BitWriter, mvs: &[MotionVector], grid: MvGrid) {
        let mut mode_rle = crate::bitstream::RleWriter::new();
        let mut mvx_bw = BitWriter::new();
        let mut mvy_bw = BitWriter::new();
        let mut sbim_bw = BitWriter::new();

        for j in 0..grid.nblocks_v {
            for i in 0..grid.nblocks_h {
                let idx = (i + j * grid.nblocks_h) as usize;
                let mv = mvs[idx];
                mode_rle.put(mv.mode == MODE_INTRA);

                if mv.mode == MODE_INTER {
                    let (px, py) = movec_pred(mvs, grid, i, j);
                    mvx_bw.put_seg(mv.x as i32 - px);
                    mvy_bw.put_seg(mv.y as i32 - py);
                } else if mv.submask == MASK_ALL_INTRA {
                    sbim_bw.put_bit(1);
                } else {
                    sbim_bw.put_bit(0);
                    sbim_bw.put_bits(4, mv.submask as u32);
                }
            }
        }

        let mode_bytes = mode_rle.finish();
        for bytes in [&mode_bytes, &mvx_bw.as_bytes().to_vec(), &mvy_bw.as_bytes().to_vec(), &sbim_bw.as_bytes().to_vec()] {
            bw.align();
            bw.put_ueg(bytes.len() as u32);
            bw.align();
            bw.concat(bytes);
        }
    }

    /// Builds the B.2.3 picture packet body: header, block-grid, stability
    /// and motion sub-streams, then the three SBT/HZCC plane packets. Runs
    /// the closed encoder-side reconstruction loop (`fwd_sbt` ->
    /// `encode_plane` -> `inv_sbt`) on `xf_frame` in place, so after this
    /// call `xf_frame` holds the *quantized* prediction/intra signal ready
    /// for [`crate::mc::frame_add`] (`encode_picture`).
    #[allow(clippy::too_many_arguments)]
    fn encode_picture(
        &mut self,
        params: &FrameParams,
        fnum: u32,
        mvs: &[MotionVector],
        quant: i32,
        is_p: bool,
        xf_frame: &mut Frame,
    ) -> Vec<u8> {
        let mut bw = BitWriter::with_capacity(4096);
        encode_packet_hdr(&mut bw, make_pt(params.is_ref, params.has_ref));

        bw.align();
        bw.put_bits(32, fnum);

        bw.align();
        bw.put_ueg((params.blk_w >> 2) as u32);
        bw.put_ueg((params.blk_h >> 2) as u32);
        bw.align();

        self.encode_stable_blocks(&mut bw, mvs, is_p);

        if params.has_ref {
            bw.align();
            let grid = MvGrid { nblocks_h: params.nblocks_h, nblocks_v: params.nblocks_v };
            Self::encode_motion(&mut bw, mvs, grid);
        }

        bw.align();
        bw.put_bits(MAX_QP_BITS, quant as u32);

        let (xf_w, xf_h) = xf_dims(params.width, params.height);
        let mut coefs = make_coefs(params.subsamp, xf_w, xf_h);
        let grid = BlockGrid { nblocks_h: params.nblocks_h, nblocks_v: params.nblocks_v };
        let stable_blocks = &self.stable_blocks;

        for (c, coef) in coefs.iter_mut().enumerate() {
            let stab = Stability { grid, stable_blocks, cur_plane: c, is_p };
            fwd_sbt(xf_frame.plane(c), coef, is_p);
            hzcc::encode_plane(&mut bw, coef, quant, &stab);
            inv_sbt(xf_frame.plane_mut(c), coef, quant, is_p, c);
        }

        bw.align();
        bw.finish()
    }

    /// Runs one input picture through the full pipeline and returns the
    /// packets it produced, in wire order: a metadata packet first if this
    /// frame opens a new GOP, then the picture packet (`dsv_enc` +
    /// `encode_one_frame`).
    pub fn push_frame(&mut self, input: &Frame) -> DsvResult<Vec<Vec<u8>>> {
        if input.width != self.meta.width || input.height != self.meta.height {
            return Err(DsvError::Config(format!(
                "frame {}x{} does not match stream metadata {}x{}",
                input.width, input.height, self.meta.width, self.meta.height
            )));
        }

        let fnum = self.next_fnum;
        self.next_fnum += 1;

        let gop_intra = self.config.gop == GOP_INTRA;

        let mut gop_start = false;
        if self.force_metadata || (self.prev_gop + self.config.gop as i64) <= fnum as i64 {
            gop_start = true;
            self.prev_gop = fnum as i64;
            self.force_metadata = false;
        }

        let is_ref = !gop_intra;
        let mut has_ref = !gop_intra && !gop_start && self.reference.is_some();
        let mut forced_intra = false;

        // `dsv_clone_frame`: always bordered, even for all-intra streams --
        // `xf_frame` is rounded up to even dimensions and `copy_from` can
        // read one row/column past `padded`'s visible edge, which needs a
        // mirrored border to stay in bounds when width or height is odd.
        let padded = input.clone_bordered(true);

        if has_ref && self.config.do_scd {
            let al = coarsest_avg_luma(&padded, self.pyramid_levels);
            let delta = (self.prev_avg_luma - al).abs();
            if delta > self.config.scene_change_delta {
                log::info!("scene change detected, inserting I frame [{fnum}]");
                has_ref = false;
                forced_intra = true;
            }
            self.prev_avg_luma = al;
        }

        let geom = FrameParams::new(self.meta.subsamp, self.meta.width, self.meta.height, is_ref, has_ref);
        let nblk = (geom.nblocks_h * geom.nblocks_v) as usize;
        let mut mvs = vec![MotionVector::default(); nblk];

        if has_ref {
            let reference = self
                .reference
                .as_ref()
                .expect("has_ref implies a stored reference frame");
            let mut hme = Hme::new(geom, &padded, &reference.padded, self.pyramid_levels);
            let intra_pct = hme.run();
            mvs = std::mem::take(&mut hme.mvf[0]);
            log::debug!("intra block percent for frame {fnum} = {intra_pct}%");
            if intra_pct > self.config.intra_pct_thresh {
                log::info!("too much intra, inserting I frame {fnum} ({intra_pct}%)");
                has_ref = false;
                forced_intra = true;
            }
        }

        let params = FrameParams::new(self.meta.subsamp, self.meta.width, self.meta.height, is_ref, has_ref);

        let quant = self.derive_quant(has_ref, forced_intra);

        let (xf_w, xf_h) = xf_dims(self.meta.width, self.meta.height);
        let mut xf_frame = Frame::new(self.meta.subsamp, xf_w, xf_h, true);
        xf_frame.copy_from(&padded);

        if has_ref {
            let reference = self
                .reference
                .as_ref()
                .expect("has_ref implies a stored reference frame");
            let mut residual = Frame::new(self.meta.subsamp, self.meta.width, self.meta.height, true);
            sub_pred(&mvs, &params, &mut residual, &mut xf_frame, &reference.recon);
            let mut packet = self.encode_picture(&params, fnum, &mvs, quant, has_ref, &mut xf_frame);
            frame_add(&mut xf_frame, &residual);
            self.finish_frame(gop_start, is_ref, has_ref, &mut packet, &padded, &xf_frame)
        } else {
            let mut packet = self.encode_picture(&params, fnum, &mvs, quant, has_ref, &mut xf_frame);
            self.finish_frame(gop_start, is_ref, has_ref, &mut packet, &padded, &xf_frame)
        }
    }

    /// Shared tail of [`Encoder::push_frame`]: link-offset patching, GOP
    /// metadata emission, reference-frame storage, and rate-control
    /// bookkeeping (`dsv_enc`'s second half).
    #[allow(clippy::too_many_arguments)]
    fn finish_frame(
        &mut self,
        gop_start: bool,
        is_ref: bool,
        has_ref: bool,
        packet: &mut Vec<u8>,
        padded: &Frame,
        xf_frame: &Frame,
    ) -> DsvResult<Vec<Vec<u8>>> {
        if is_ref {
            let mut recon = Frame::new(self.meta.subsamp, self.meta.width, self.meta.height, true);
            recon.copy_from(xf_frame);
            self.reference = Some(ReferenceFrame { padded: padded.clone(), recon });
        }

        let next_link = packet.len() as u32;
        set_link_offsets(packet, self.prev_link, next_link);
        self.prev_link = next_link;

        let mut out = Vec::with_capacity(2);
        if gop_start {
            out.push(encode_metadata(&self.meta));
        }
        out.push(std::mem::take(packet));

        if has_ref {
            self.refresh_ctr += 1;
        }

        if self.config.rc_mode != RATE_CONTROL_CRF {
            let pic_len = out.last().map(|p| p.len()).unwrap_or(0) as i64;
            self.bpf_total += pic_len;
            self.bpf_reset += 1;

            if has_ref {
                self.total_p_frame_q += self.rc_quant as i64;
                self.avg_p_frame_q = (self.total_p_frame_q / self.bpf_reset) as i32;

                let fps = fps_scaled(&self.meta);
                let mut needed_bpf = ((self.config.bitrate << 5) / fps) >> 3;
                let went_under = pic_len < (needed_bpf * 3 / 4);
                needed_bpf = needed_bpf * 7 / 8;
                let went_over = pic_len > needed_bpf;
                self.back_into_range = self.last_p_frame_over && went_under;
                self.last_p_frame_over = went_over;
                log::info!(
                    "RC last P over? ({pic_len} > {needed_bpf}): {}",
                    self.last_p_frame_over
                );
            } else {
                self.last_p_frame_over = false;
                self.back_into_range = false;
            }

            self.bpf_avg = self.bpf_total / self.bpf_reset;
            if self.bpf_reset >= BPF_RESET as i64 {
                self.bpf_total = self.bpf_avg;
                self.total_p_frame_q /= self.bpf_reset;
                self.bpf_reset = 1;
            }
        }

        Ok(out)
    }

    /// Builds the end-of-stream packet, patching it into the same
    /// prev/next link chain as the picture packets (`dsv_enc_end_of_stream`).
    pub fn end_of_stream(&mut self) -> Vec<u8> {
        let mut buf = encode_eos();
        set_link_offsets(&mut buf, self.prev_link, 0);
        self.prev_link = 0;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitReader;
    use crate::packet::decode_packet_hdr;
    use crate::params::{pt_is_pic, PT_META};
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

    fn solid_frame(w: i32, h: i32, y: u8) -> Frame {
        let mut f = Frame::new(Subsamp::Yuv420, w, h, false);
        for j in 0..h {
            for i in 0..w {
                f.plane_mut(0).set(i, j, y);
            }
        }
        f
    }

    #[test]
    fn first_frame_emits_metadata_then_a_picture_packet() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let frame = solid_frame(32, 32, 128);
        let bufs = enc.push_frame(&frame).unwrap();

        assert_eq!(bufs.len(), 2);
        let mut br = BitReader::new(&bufs[0]);
        assert_eq!(decode_packet_hdr(&mut br).unwrap(), PT_META);

        let mut br = BitReader::new(&bufs[1]);
        let pkt_type = decode_packet_hdr(&mut br).unwrap();
        assert!(pt_is_pic(pkt_type));
    }

    #[test]
    fn second_frame_within_gop_has_no_metadata_packet() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let frame = solid_frame(32, 32, 128);
        let _ = enc.push_frame(&frame).unwrap();
        let bufs = enc.push_frame(&frame).unwrap();
        assert_eq!(bufs.len(), 1);
    }

    #[test]
    fn identical_second_frame_is_coded_as_a_p_frame() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let frame = solid_frame(32, 32, 128);
        let _ = enc.push_frame(&frame).unwrap();
        let bufs = enc.push_frame(&frame).unwrap();

        let mut br = BitReader::new(&bufs[0]);
        let pkt_type = decode_packet_hdr(&mut br).unwrap();
        assert!(crate::params::pt_has_ref(pkt_type));
    }

    #[test]
    fn end_of_stream_packet_has_zero_next_link() {
        let mut enc = Encoder::new(meta(16, 16), EncoderConfig::default()).unwrap();
        let eos = enc.end_of_stream();
        assert_eq!(
            &eos[crate::params::PACKET_NEXT_OFFSET..crate::params::PACKET_NEXT_OFFSET + 4],
            &[0, 0, 0, 0]
        );
    }

    #[test]
    fn rejects_frame_with_mismatched_dimensions() {
        let mut enc = Encoder::new(meta(32, 32), EncoderConfig::default()).unwrap();
        let frame = solid_frame(16, 16, 0);
        assert!(enc.push_frame(&frame).is_err());
    }
}

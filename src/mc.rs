//! Block motion compensation: half-pel luma (4-tap) and chroma (bilinear)
//! interpolation for inter blocks, average-fill or verbatim copy for intra
//! blocks, plus the frame-level add/subtract used to form and undo
//! prediction residuals.
//!
//! Grounded in `bmc.c`. The luma diagonal half-pel case there keeps one
//! static scratch buffer sized to the largest possible block; each call here
//! allocates its own, sized to the block it's filtering.

use crate::frame::{Frame, Plane};
use crate::motion::MotionVector;
use crate::params::{FrameParams, HP_COEF, MASK_ALL_INTRA, MASK_INTRA00, MASK_INTRA01, MASK_INTRA10, MASK_INTRA11};

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Adds a residual plane onto a prediction in place, re-centering the
/// residual's implicit +128 bias (`addf`). `w`/`h` bound the loop and must
/// be the *destination* plane's own dimensions, not the source's -- the
/// two can differ by a sample per axis when one plane is raw-sized and the
/// other is rounded to the even "xf" size (see `DESIGN.md`).
fn addf(out: &mut Plane, dif: &Plane, w: i32, h: i32) {
    for y in 0..h {
        for x in 0..w {
            let v = clamp_u8(out.get(x, y) as i32 + dif.get(x, y) as i32 - 128);
            out.set(x, y, v);
        }
    }
}

/// Subtracts a prediction from the input in place, producing a residual
/// centered on 128 (`subf`). `w`/`h` must be the *dif* plane's own
/// dimensions (see [`addf`]).
fn subf(inp: &mut Plane, dif: &Plane, w: i32, h: i32) {
    for y in 0..h {
        for x in 0..w {
            let v = clamp_u8(inp.get(x, y) as i32 - dif.get(x, y) as i32 + 128);
            inp.set(x, y, v);
        }
    }
}

/// Bilinear half-pel chroma filter; dispatches on which of the horizontal
/// and vertical half-pel offsets are active (`hpel`).
fn hpel(dec: &mut Plane, dx0: i32, dy0: i32, ref_p: &Plane, rx0: i32, ry0: i32, xh: bool, yh: bool, w: i32, h: i32) {
    match (xh, yh) {
        (false, false) => {
            for y in 0..h {
                for x in 0..w {
                    dec.set(dx0 + x, dy0 + y, ref_p.get(rx0 + x, ry0 + y));
                }
            }
        }
        (false, true) => {
            for y in 0..h {
                for x in 0..w {
                    let a = ref_p.get(rx0 + x, ry0 + y) as i32;
                    let b = ref_p.get(rx0 + x, ry0 + y + 1) as i32;
                    dec.set(dx0 + x, dy0 + y, ((a + b + 1) >> 1) as u8);
                }
            }
        }
        (true, false) => {
            for y in 0..h {
                for x in 0..w {
                    let a = ref_p.get(rx0 + x, ry0 + y) as i32;
                    let b = ref_p.get(rx0 + x + 1, ry0 + y) as i32;
                    dec.set(dx0 + x, dy0 + y, ((a + b + 1) >> 1) as u8);
                }
            }
        }
        (true, true) => {
            for y in 0..h {
                for x in 0..w {
                    let a = ref_p.get(rx0 + x, ry0 + y) as i32;
                    let b = ref_p.get(rx0 + x + 1, ry0 + y) as i32;
                    let c = ref_p.get(rx0 + x, ry0 + y + 1) as i32;
                    let d = ref_p.get(rx0 + x + 1, ry0 + y + 1) as i32;
                    dec.set(dx0 + x, dy0 + y, ((a + b + c + d + 2) >> 2) as u8);
                }
            }
        }
    }
}

/// 4-tap horizontal luma half-pel filter tap (`hpfh`).
fn hpfh(p: &Plane, x: i32, y: i32) -> i32 {
    HP_COEF * (p.get(x, y) as i32 + p.get(x + 1, y) as i32) - (p.get(x - 1, y) as i32 + p.get(x + 2, y) as i32)
}

/// 4-tap vertical luma half-pel filter tap (`hpfv`).
fn hpfv(p: &Plane, x: i32, y: i32) -> i32 {
    HP_COEF * (p.get(x, y) as i32 + p.get(x, y + 1) as i32) - (p.get(x, y - 1) as i32 + p.get(x, y + 2) as i32)
}

/// Luma half-pel filter, sharper than chroma's bilinear one; the diagonal
/// case runs the horizontal tap first into a scratch buffer, then the
/// vertical tap over that (`hpelL`).
fn hpel_luma(dec: &mut Plane, dx0: i32, dy0: i32, ref_p: &Plane, rx0: i32, ry0: i32, xh: bool, yh: bool, w: i32, h: i32) {
    match (xh, yh) {
        (false, false) => {
            for y in 0..h {
                for x in 0..w {
                    dec.set(dx0 + x, dy0 + y, ref_p.get(rx0 + x, ry0 + y));
                }
            }
        }
        (false, true) => {
            for y in 0..h {
                for x in 0..w {
                    let v = clamp_u8((hpfv(ref_p, rx0 + x, ry0 + y) + 8) >> 4);
                    dec.set(dx0 + x, dy0 + y, v);
                }
            }
        }
        (true, false) => {
            for y in 0..h {
                for x in 0..w {
                    let v = clamp_u8((hpfh(ref_p, rx0 + x, ry0 + y) + 8) >> 4);
                    dec.set(dx0 + x, dy0 + y, v);
                }
            }
        }
        (true, true) => {
            let w_u = w as usize;
            let mut buf = vec![0i32; w_u * (h as usize + 4)];
            for y in 0..h + 4 {
                for x in 0..w {
                    buf[(y * w) as usize + x as usize] = hpfh(ref_p, rx0 + x, ry0 + y - 1);
                }
            }
            for y in 0..h {
                for x in 0..w {
                    let i = (y * w + x) as usize;
                    let c = HP_COEF * (buf[i + w_u] + buf[i + 2 * w_u]) - (buf[i] + buf[i + 3 * w_u]);
                    dec.set(dx0 + x, dy0 + y, clamp_u8((c + 128) >> 8));
                }
            }
        }
    }
}

fn avgval(p: &Plane, x0: i32, y0: i32, w: i32, h: i32) -> u8 {
    let mut sum: i64 = 0;
    for y in 0..h {
        for x in 0..w {
            sum += p.get(x0 + x, y0 + y) as i64;
        }
    }
    (sum / (w as i64 * h as i64)) as u8
}

fn fill(p: &mut Plane, x0: i32, y0: i32, w: i32, h: i32, v: u8) {
    for y in 0..h {
        for x in 0..w {
            p.set(x0 + x, y0 + y, v);
        }
    }
}

fn cpyzero(dst: &mut Plane, dx0: i32, dy0: i32, src: &Plane, sx0: i32, sy0: i32, w: i32, h: i32) {
    for y in 0..h {
        for x in 0..w {
            dst.set(dx0 + x, dy0 + y, src.get(sx0 + x, sy0 + y));
        }
    }
}

/// Fills `dp` plane-by-plane with the motion-compensated or intra-filled
/// prediction for every block (`compensate`).
fn compensate(vecs: &[MotionVector], p: &FrameParams, c: usize, refr: &Frame, dp: &mut Plane) {
    let (sh, sv) = if c == 0 { (0, 0) } else { (p.subsamp.h_shift(), p.subsamp.v_shift()) };
    let bw = p.blk_w >> sh;
    let bh = p.blk_h >> sv;

    let limx = (dp.width() - bw) + crate::params::FRAME_BORDER - 1;
    let limy = (dp.height() - bh) + crate::params::FRAME_BORDER - 1;

    let rp = refr.plane(c);

    for j in 0..p.nblocks_v {
        let y = j * bh;
        let ch = if y + bh >= dp.height() { dp.height() - y } else { bh };
        for i in 0..p.nblocks_h {
            let x = i * bw;
            let cw = if x + bw >= dp.width() { dp.width() - x } else { bw };

            let mv = vecs[(i + j * p.nblocks_h) as usize];

            if mv.is_inter() {
                let dx = (mv.x as i32) >> sh;
                let dy = (mv.y as i32) >> sv;

                let px = (x + (dx >> 1)).clamp(-crate::params::FRAME_BORDER, limx);
                let py = (y + (dy >> 1)).clamp(-crate::params::FRAME_BORDER, limy);

                if c == 0 {
                    hpel_luma(dp, x, y, rp, px, py, dx & 1 != 0, dy & 1 != 0, cw, ch);
                } else {
                    hpel(dp, x, y, rp, px, py, dx & 1 != 0, dy & 1 != 0, cw, ch);
                }
            } else if mv.submask == MASK_ALL_INTRA {
                let avgc = avgval(rp, x, y, cw, ch);
                fill(dp, x, y, cw, ch, avgc);
            } else {
                let sbw = cw / 2;
                let sbh = ch / 2;
                let masks = [MASK_INTRA00, MASK_INTRA01, MASK_INTRA10, MASK_INTRA11];
                let mut mask_index = 0;
                let mut g = 0;
                while g <= sbh {
                    let mut f = 0;
                    while f <= sbw {
                        let sbx = x + f;
                        let sby = y + g;
                        if mv.submask & masks[mask_index] != 0 {
                            let avgc = avgval(rp, sbx, sby, sbw, sbh);
                            fill(dp, sbx, sby, sbw, sbh, avgc);
                        } else {
                            cpyzero(dp, sbx, sby, rp, sbx, sby, sbw, sbh);
                        }
                        mask_index += 1;
                        f += sbw;
                    }
                    g += sbh;
                }
            }
        }
    }
}

/// Adds a second frame's samples onto the first in place, bias-adjusted the
/// same way a residual would be (`dsv_frame_add`). Iterates `dst`'s own
/// dimensions, matching the original rather than asserting `src` is the
/// same size.
pub fn frame_add(dst: &mut Frame, src: &Frame) {
    for c in 0..3 {
        let w = dst.plane(c).width();
        let h = dst.plane(c).height();
        let s = src.plane(c).clone();
        addf(dst.plane_mut(c), &s, w, h);
    }
}

/// Builds a prediction residual: `dif = inp - compensate(ref)` per plane
/// (`dsv_sub_pred`). The subtraction loop iterates `dif`'s own dimensions
/// (not `inp`'s) -- `dif` (e.g. the encoder's raw-sized residual buffer)
/// can be one sample narrower/shorter per axis than `inp` (e.g. an xf_frame
/// rounded up to even size).
pub fn sub_pred(vecs: &[MotionVector], p: &FrameParams, dif: &mut Frame, inp: &mut Frame, refr: &Frame) {
    for c in 0..3 {
        compensate(vecs, p, c, refr, dif.plane_mut(c));
        let w = dif.plane(c).width();
        let h = dif.plane(c).height();
        let d = dif.plane(c).clone();
        subf(inp.plane_mut(c), &d, w, h);
    }
}

/// Reconstructs a picture: `out = compensate(ref) + dif` per plane
/// (`dsv_add_pred`). The addition loop iterates `out`'s own dimensions (not
/// `dif`'s), mirroring [`sub_pred`]'s asymmetry in the other direction.
pub fn add_pred(vecs: &[MotionVector], p: &FrameParams, dif: &Frame, out: &mut Frame, refr: &Frame) {
    for c in 0..3 {
        compensate(vecs, p, c, refr, out.plane_mut(c));
        let w = out.plane(c).width();
        let h = out.plane(c).height();
        let d = dif.plane(c).clone();
        addf(out.plane_mut(c), &d, w, h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsamp::Subsamp;

    #[test]
    fn zero_vector_inter_block_copies_reference_verbatim() {
        let mut refr = Frame::new(Subsamp::Yuv444, 32, 32, true);
        for y in 0..32 {
            for x in 0..32 {
                refr.plane_mut(0).set(x, y, ((x + y) % 251) as u8);
            }
        }
        refr.extend();

        let params = FrameParams::new(Subsamp::Yuv444, 32, 32, true, true);
        let vecs = vec![MotionVector::inter(0, 0); (params.nblocks_h * params.nblocks_v) as usize];

        let mut dst_frame = Frame::new(Subsamp::Yuv444, 32, 32, true);
        compensate(&vecs, &params, 0, &refr, dst_frame.plane_mut(0));

        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(dst_frame.plane(0).get(x, y), refr.plane(0).get(x, y));
            }
        }
    }

    #[test]
    fn all_intra_block_is_filled_with_reference_average() {
        let mut refr = Frame::new(Subsamp::Yuv444, 16, 16, true);
        for y in 0..16 {
            for x in 0..16 {
                refr.plane_mut(0).set(x, y, 42);
            }
        }
        refr.extend();

        let params = FrameParams::new(Subsamp::Yuv444, 16, 16, false, false);
        let vecs = vec![MotionVector::intra(MASK_ALL_INTRA); (params.nblocks_h * params.nblocks_v) as usize];

        let mut dst_frame = Frame::new(Subsamp::Yuv444, 16, 16, true);
        compensate(&vecs, &params, 0, &refr, dst_frame.plane_mut(0));
        assert_eq!(dst_frame.plane(0).get(0, 0), 42);
    }
}

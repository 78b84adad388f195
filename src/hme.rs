//! Hierarchical motion estimation: a coarse-to-fine pyramid search that
//! inherits candidate vectors from the level above, refines them with a
//! full-pel diamond search and a half-pel pass at the base level, and
//! decides per-block whether inter prediction or intra fill will serve the
//! block better.
//!
//! Grounded in `hme.c`. The original dispatches SAD to width-specialized
//! loops (`sad_16xh`, `sad_32xh`, ...) purely for speed; here every SAD call
//! goes through one generic function since nothing here is ever benchmarked.
//! The base-level half-pel search here tests all 8 of the original's
//! directions (the four forward offsets `compensate`'s filters express
//! directly, plus the four with a negative horizontal and/or vertical
//! component, sampled by stepping the base pixel back one and reusing the
//! same forward filter) rather than the original's dedicated interleaved
//! scratch buffer precomputing all of them at once.

use crate::frame::{Frame, Plane};
use crate::motion::MotionVector;
use crate::params::{FrameParams, MASK_ALL_INTRA, MASK_INTRA00, MASK_INTRA01, MASK_INTRA10, MASK_INTRA11, MODE_INTER, MODE_INTRA};

const HP_SAD_SZ: i32 = 14;

fn clamp_u8(v: i32) -> i32 {
    v.clamp(0, 255)
}

fn sad(a: &Plane, ax: i32, ay: i32, b: &Plane, bx: i32, by: i32, w: i32, h: i32) -> i64 {
    let mut acc: i64 = 0;
    for j in 0..h {
        for i in 0..w {
            acc += (a.get(ax + i, ay + j) as i32 - b.get(bx + i, by + j) as i32).unsigned_abs() as i64;
        }
    }
    acc
}

/// "Proves" that the zero-motion reference block does more good than evil
/// relative to intra: high local texture favors inter, since intra fill
/// throws away high-frequency detail (`intra_metric`).
fn intra_metric(a: &Plane, ax: i32, ay: i32, b: &Plane, bx: i32, by: i32, w: i32, h: i32) -> bool {
    let mut ngood: i64 = 0;
    let mut nevil: i64 = 0;
    for j in 0..h {
        let mut prev_a = a.get(ax, ay + j) as i32;
        let mut prev_b = b.get(bx, by + j) as i32;
        for i in 0..w {
            let pa = a.get(ax + i, ay + j) as i32;
            let pb = b.get(bx + i, by + j) as i32;
            let dif = (pa - pb).abs();
            ngood += (pa - prev_a).unsigned_abs() as i64;
            ngood += (pa - a.get(ax + i, ay + j.max(1) - 1)) as i64 .abs(); // prevptrA[i]
            ngood += (pb - prev_b).unsigned_abs() as i64;
            ngood += (pb - b.get(bx + i, by + j.max(1) - 1)) as i64 .abs(); // prevptrB[i]
            match dif {
                0 => ngood += 192,
                1 => ngood += 128,
                2 => ngood += 96,
                _ => nevil += dif as i64,
            }
            prev_a = pa;
            prev_b = pb;
        }
    }
    ngood >= (((w + h) >> 1) as i64) * nevil
}

fn invalid_block(frame: &Frame, border: i32, x: i32, y: i32, sx: i32, sy: i32) -> bool {
    x < -border || y < -border || x + sx > frame.width + border || y + sy > frame.height + border
}

/// D.3's caveat: simulate reduced-range intra compensation to check it would
/// round-trip the block cleanly before committing to intra
/// (`block_intra_test`).
fn block_intra_test(dec: &Plane, dx: i32, dy: i32, refp: &Plane, rx: i32, ry: i32, w: i32, h: i32) -> bool {
    let mut ravg: i64 = 0;
    for j in 0..h {
        for i in 0..w {
            ravg += refp.get(rx + i, ry + j) as i64;
        }
    }
    let ravg = (ravg / (w as i64 * h as i64)) as i32;

    for j in 0..h {
        let mut nb = 0;
        for i in 0..w {
            let d = dec.get(dx + i, dy + j) as i32;
            let dif = clamp_u8((ravg + clamp_u8((d - ravg) + 128)) - 128);
            if (dif - d).abs() != 0 {
                nb += 1;
            }
        }
        if nb > 0 {
            return true;
        }
    }
    false
}

/// Variance, texture, and mean of a `HP_SAD_SZ x HP_SAD_SZ` window
/// (`block_texture`).
fn block_texture(p: &Plane, x0: i32, y0: i32) -> (i64, i32, i64) {
    let n = HP_SAD_SZ;
    let mut sh: i64 = 0;
    let mut sv: i64 = 0;
    let mut av: i64 = 0;
    let mut avs: i64 = 0;
    for j in 0..n {
        let mut prev = p.get(x0 + n - 1, y0 + j) as i32;
        for i in 0..n {
            let px = p.get(x0 + i, y0 + j) as i32;
            sh += (px - prev).unsigned_abs() as i64;
            let above = if j > 0 { p.get(x0 + i, y0 + j - 1) as i32 } else { p.get(x0 + i, y0) as i32 };
            sv += (px - above).unsigned_abs() as i64;
            av += px as i64;
            avs += (px * px) as i64;
            prev = px;
        }
    }
    let tex = (sh + sv) / 2 / (n * n) as i64;
    let avg = (av / (n * n) as i64) as i32;
    let var = avs - (av * av) / (n * n) as i64;
    (tex, avg, var)
}

/// Variance and texture over an arbitrary `w x h` window (`block_analysis`).
fn block_analysis(p: &Plane, x0: i32, y0: i32, w: i32, h: i32) -> (i64, i64) {
    let mut sh: i64 = 0;
    let mut sv: i64 = 0;
    let mut s: i64 = 0;
    let mut ss: i64 = 0;
    for j in 0..h {
        let mut prev = p.get(x0 + w - 1, y0 + j) as i32;
        for i in 0..w {
            let px = p.get(x0 + i, y0 + j) as i32;
            sh += (px - prev).unsigned_abs() as i64;
            let above = if j > 0 { p.get(x0 + i, y0 + j - 1) as i32 } else { p.get(x0 + i, y0) as i32 };
            sv += (px - above).unsigned_abs() as i64;
            s += px as i64;
            ss += (px * px) as i64;
            prev = px;
        }
    }
    let texture = (sh + sv) / 2 / (w * h) as i64;
    let var = ss - (s * s) / (w * h) as i64;
    (var, texture)
}

fn y_sqrvar(p: &Plane, x0: i32, y0: i32, w: i32, h: i32) -> i64 {
    let mut s: i64 = 0;
    let mut ss: i64 = 0;
    for j in 0..h {
        for i in 0..w {
            let px = p.get(x0 + i, y0 + j) as i64;
            s += px;
            ss += px * px;
        }
    }
    ss - (s * s) / (w * h) as i64
}

/// Max of U/V plane variance over a chroma-scaled window (`c_maxvar`).
fn c_maxvar(frame: &Frame, x: i32, y: i32, w: i32, h: i32) -> i64 {
    let vu = y_sqrvar(frame.plane(1), x, y, w, h);
    let vv = y_sqrvar(frame.plane(2), x, y, w, h);
    vu.max(vv)
}

/// Interpolated luma sample at a half-pel offset, reusing the same 4-tap
/// filters `compensate` uses for motion compensation.
fn half_pel_sample(p: &Plane, x: i32, y: i32, xh: bool, yh: bool) -> i32 {
    match (xh, yh) {
        (false, false) => p.get(x, y) as i32,
        (true, false) => {
            clamp_u8((crate::params::HP_COEF * (p.get(x, y) as i32 + p.get(x + 1, y) as i32)
                - (p.get(x - 1, y) as i32 + p.get(x + 2, y) as i32)
                + 8)
                >> 4)
        }
        (false, true) => {
            clamp_u8((crate::params::HP_COEF * (p.get(x, y) as i32 + p.get(x, y + 1) as i32)
                - (p.get(x, y - 1) as i32 + p.get(x, y + 2) as i32)
                + 8)
                >> 4)
        }
        (true, true) => {
            let h0 = half_pel_sample(p, x, y, true, false);
            let h1 = half_pel_sample(p, x, y + 1, true, false);
            (h0 + h1 + 1) >> 1
        }
    }
}

/// Samples at `(x + dxh/2, y + dyh/2)` for `dxh`/`dyh` in `{-1, 0, 1}`, the
/// full set of half-pel offsets around a full-pel position (`hme.c`'s
/// `xh`/`yh` search tables). A negative direction reduces to the same
/// forward-looking [`half_pel_sample`] one full pixel back.
fn half_pel_at(p: &Plane, x: i32, y: i32, dxh: i32, dyh: i32) -> i32 {
    let bx = if dxh < 0 { x - 1 } else { x };
    let by = if dyh < 0 { y - 1 } else { y };
    half_pel_sample(p, bx, by, dxh != 0, dyh != 0)
}

fn hpel_block_sad(src: &Plane, sx: i32, sy: i32, refp: &Plane, rx: i32, ry: i32, dxh: i32, dyh: i32, w: i32, h: i32) -> i64 {
    let mut acc: i64 = 0;
    for j in 0..h {
        for i in 0..w {
            let s = src.get(sx + i, sy + j) as i32;
            let r = half_pel_at(refp, rx + i, ry + j, dxh, dyh);
            acc += (s - r).unsigned_abs() as i64;
        }
    }
    acc
}

/// Pyramid of progressively half-resolution luma frames plus the
/// per-level motion field the diamond search fills in (`DSV_HME`).
pub struct Hme {
    pub params: FrameParams,
    pub src: Vec<Frame>,
    pub refr: Vec<Frame>,
    pub levels: usize,
    pub mvf: Vec<Vec<MotionVector>>,
}

fn build_pyramid(frame: &Frame, levels: usize) -> Vec<Frame> {
    let mut pyr = vec![frame.clone()];
    for _ in 0..levels {
        let down = pyr.last().unwrap().downsample_2x_luma();
        pyr.push(down);
    }
    pyr
}

impl Hme {
    pub fn new(params: FrameParams, src: &Frame, refr: &Frame, levels: usize) -> Self {
        Hme {
            params,
            src: build_pyramid(src, levels),
            refr: build_pyramid(refr, levels),
            levels,
            mvf: vec![Vec::new(); levels + 1],
        }
    }

    fn border_px(frame: &Frame) -> i32 {
        if frame.is_bordered() { crate::params::FRAME_BORDER } else { 0 }
    }

    fn refine_level(&mut self, level: usize) -> i32 {
        const FPEL_DX: [i32; 9] = [0, 1, -1, 0, 0, -1, 1, -1, 1];
        const FPEL_DY: [i32; 9] = [0, 0, 0, 1, -1, -1, -1, 1, 1];

        let p = self.params;
        let y_w = p.blk_w;
        let y_h = p.blk_h;
        let hpel_thresh = (y_w * y_h) as i64;
        let nxb = p.nblocks_h;
        let nyb = p.nblocks_v;

        let src = &self.src[level];
        let refr = &self.refr[level];
        let sp = src.plane(0);
        let rp = refr.plane(0);
        let src_border = Self::border_px(src);
        let ref_border = Self::border_px(refr);

        let mut mf = vec![MotionVector::default(); (nxb * nyb) as usize];
        let parent: Vec<MotionVector> = if level < self.levels { self.mvf[level + 1].clone() } else { Vec::new() };

        let step = 1i32 << level;
        let parent_mask = !((step << 1) - 1);
        let mut nintra = 0;

        let mut j = 0;
        while j < nyb {
            let mut i = 0;
            while i < nxb {
                let bx = (i * y_w) >> level;
                let by = (j * y_h) >> level;

                if bx >= sp.width() || by >= sp.height() {
                    i += step;
                    continue;
                }

                let bw = sp.width().min(y_w.max(1)).min(y_w);
                let bh = sp.height().min(y_h);
                let bw = bw.min(sp.width() - bx).max(1).min(y_w);
                let bh = bh.min(sp.height() - by).max(1).min(y_h);

                let mut inherited: Vec<(i32, i32)> = vec![(0, 0)];
                if !parent.is_empty() {
                    const PT: [(i32, i32); 5] = [(0, 0), (-2, 0), (2, 0), (0, -2), (0, 2)];
                    let pi = i & parent_mask;
                    let pj = j & parent_mask;
                    for (dxp, dyp) in PT {
                        let x = pi + dxp * step;
                        let y = pj + dyp * step;
                        if x >= 0 && x < nxb && y >= 0 && y < nyb {
                            let mv = parent[(x + y * nxb) as usize];
                            if mv.x != 0 || mv.y != 0 {
                                let cand = (mv.x as i32, mv.y as i32);
                                if !inherited.contains(&cand) {
                                    inherited.push(cand);
                                }
                            }
                        }
                    }
                }

                let mut best_idx = inherited.len() - 1;
                if inherited.len() > 1 {
                    let mut best_score = i64::MAX;
                    for (k, &(cx, cy)) in inherited.iter().enumerate() {
                        if invalid_block(src, src_border, bx, by, bw, bh) {
                            continue;
                        }
                        let dx = cx >> level;
                        let dy = cy >> level;
                        if invalid_block(refr, ref_border, bx + dx, by + dy, bw, bh) {
                            continue;
                        }
                        let score = sad(sp, bx, by, rp, bx + dx, by + dy, bw, bh);
                        if score < best_score {
                            best_score = score;
                            best_idx = k;
                        }
                    }
                }
                let (bestdx, bestdy) = inherited[best_idx];

                let mut dx = bestdx >> level;
                let mut dy = bestdy >> level;
                dx = dx.clamp(-bw - bx, refr.width - bx);
                dy = dy.clamp(-bh - by, refr.height - by);

                let xx = bx + dx;
                let yy = by + dy;
                let mut best: i64 = i64::MAX;
                let mut m = 0;
                for k in 0..9 {
                    let score = sad(sp, bx, by, rp, xx + FPEL_DX[k], yy + FPEL_DY[k], bw, bh);
                    if score < best {
                        best = score;
                        m = k;
                    }
                }
                dx += FPEL_DX[m];
                dy += FPEL_DY[m];

                let mut mv = MotionVector { x: (dx << level) as i16, y: (dy << level) as i16, mode: MODE_INTER, ..Default::default() };

                if level == 0 {
                    const HPEL_DX: [i32; 8] = [1, -1, 0, 0, -1, 1, -1, 1];
                    const HPEL_DY: [i32; 8] = [0, 0, 1, -1, -1, -1, 1, 1];
                    let yarea = (bw * bh) as i64;

                    let hx = bx + (bw >> 1) - HP_SAD_SZ / 2;
                    let hy = by + (bh >> 1) - HP_SAD_SZ / 2;
                    let mut best_full = best;
                    mv.x <<= 1;
                    mv.y <<= 1;
                    if best > hpel_thresh {
                        let mut best_hp = best * (HP_SAD_SZ * HP_SAD_SZ) as i64 / yarea.max(1);
                        let mut chosen: Option<usize> = None;
                        for k in 0..8 {
                            let rx = hx + (mv.x as i32 >> 1);
                            let ry = hy + (mv.y as i32 >> 1);
                            let score = hpel_block_sad(sp, hx, hy, rp, rx, ry, HPEL_DX[k], HPEL_DY[k], HP_SAD_SZ, HP_SAD_SZ);
                            if score < best_hp {
                                best_hp = score;
                                chosen = Some(k);
                            }
                        }
                        if let Some(k) = chosen {
                            mv.x += HPEL_DX[k] as i16;
                            mv.y += HPEL_DY[k] as i16;
                            best_full = best_hp * yarea / (HP_SAD_SZ * HP_SAD_SZ) as i64;
                        }
                    }
                    best = best_full;

                    let (luma_var, luma_tex) = block_analysis(sp, bx, by, bw, bh);
                    mv.lo_tex = luma_tex <= 2;
                    mv.lo_var = luma_var < yarea * yarea;

                    let (src_tex, src_avg, src_var) = block_texture(sp, hx, hy);
                    let rx = hx + (mv.x as i32 >> 1);
                    let ry = hy + (mv.y as i32 >> 1);
                    let (ref_tex, ref_avg, ref_var) = block_texture(rp, rx, ry);

                    let mut thresh_var = (HP_SAD_SZ * HP_SAD_SZ) as i64;
                    let mut thresh_tex: i64 = 1;
                    if i > 0 {
                        let pmv = mf[(j * nxb + (i - 1)) as usize];
                        if pmv.mode == MODE_INTER && !pmv.lo_tex && !pmv.lo_var {
                            thresh_var *= HP_SAD_SZ as i64;
                            thresh_tex += 1;
                        }
                    }
                    if j > 0 {
                        let pmv = mf[((j - 1) * nxb + i) as usize];
                        if pmv.mode == MODE_INTER && !pmv.lo_tex && !pmv.lo_var {
                            thresh_var *= HP_SAD_SZ as i64;
                            thresh_tex += 1;
                        }
                    }
                    if i > 0 && j > 0 {
                        let pmv = mf[((j - 1) * nxb + (i - 1)) as usize];
                        if pmv.mode == MODE_INTER && !pmv.lo_tex && !pmv.lo_var {
                            thresh_var *= (HP_SAD_SZ / 4) as i64;
                            thresh_tex += 1;
                        }
                    }
                    mv.high_detail = luma_tex > thresh_tex && src_var > thresh_var;

                    let zero_ref_var = y_sqrvar(rp, bx, by, bw, bh);
                    let mut want_intra = false;
                    if src_tex < 2 && zero_ref_var > luma_var * 2 {
                        want_intra = true;
                    } else if ref_var > src_var * 2 {
                        want_intra = true;
                    } else if src_tex == 0 && ref_tex != 0 {
                        want_intra = true;
                    } else if (src_avg - ref_avg).abs() > 8 {
                        want_intra = true;
                    } else if luma_tex <= 10 && best > (yarea * yarea) / 16 {
                        want_intra = true;
                    } else {
                        let sh = p.subsamp.h_shift();
                        let sv = p.subsamp.v_shift();
                        let cbx = i * (y_w >> sh);
                        let cby = j * (y_h >> sv);
                        let cbw = (bw >> sh).max(1);
                        let cbh = (bh >> sv).max(1);
                        let cvar_s = c_maxvar(src, cbx, cby, cbw, cbh);
                        let cvar_r = c_maxvar(refr, cbx, cby, cbw, cbh);
                        if cvar_r > 4 * cvar_s {
                            want_intra = true;
                        }
                    }

                    if want_intra && !block_intra_test(sp, bx, by, rp, bx, by, bw, bh) {
                        mv.submask = MASK_ALL_INTRA;
                        if src_tex > 1 {
                            let sbw = bw / 2;
                            let sbh = bh / 2;
                            let masks = [MASK_INTRA00, MASK_INTRA01, MASK_INTRA10, MASK_INTRA11];
                            let mut mask_index = 0;
                            let mut g = 0;
                            while g <= sbh {
                                let mut f = 0;
                                while f <= sbw {
                                    if intra_metric(sp, bx + f, by + g, rp, bx + f, by + g, sbw, sbh) {
                                        mv.submask &= !masks[mask_index];
                                    }
                                    mask_index += 1;
                                    f += sbw;
                                }
                                g += sbh;
                            }
                        }
                        if mv.submask != 0 {
                            mv.mode = MODE_INTRA;
                            nintra += 1;
                        }
                    }
                }

                mf[(i + j * nxb) as usize] = mv;
                i += step;
            }
            j += step;
        }

        self.mvf[level] = mf;
        nintra
    }

    /// Runs the full coarse-to-fine search and returns the percentage of
    /// blocks decided intra at the base level (`dsv_hme`).
    pub fn run(&mut self) -> i32 {
        let mut nintra = 0;
        let mut i = self.levels as i32;
        while i >= 0 {
            nintra = self.refine_level(i as usize);
            i -= 1;
        }
        (nintra * 100) / (self.params.nblocks_h * self.params.nblocks_v).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsamp::Subsamp;

    #[test]
    fn identical_frames_produce_mostly_zero_vectors() {
        let mut src = Frame::new(Subsamp::Yuv420, 64, 64, true);
        for y in 0..64 {
            for x in 0..64 {
                src.plane_mut(0).set(x, y, ((x * 5 + y * 7) % 256) as u8);
            }
        }
        src.extend();
        let refr = src.clone();

        let params = FrameParams::new(Subsamp::Yuv420, 64, 64, true, true);
        let mut hme = Hme::new(params, &src, &refr, 1);
        let pct_intra = hme.run();

        assert!(pct_intra <= 100);
        let mvf = &hme.mvf[0];
        let zero_count = mvf.iter().filter(|mv| mv.is_inter() && mv.x == 0 && mv.y == 0).count();
        assert!(zero_count > 0);
    }
}

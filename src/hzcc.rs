//! Hierarchical Zero Coefficient Coding: quantizes subband coefficients and
//! packs them with a run-length-prefixed exp-Golomb scheme, one coefficient
//! value "looking ahead" of its run so a trailing run of zeros never needs
//! its own terminator.
//!
//! Grounded in `hzcc.c`.

use crate::bitstream::{BitReader, BitWriter};
use crate::params::{EOP_SYMBOL, MAXLVL, QP_I, QP_P};

const CHROMA_LIMIT: i32 = 512;
const NSUBBAND: i32 = 4;
const MINQUANT: i32 = 16;
const BLOCK_P: i32 = 14;

/// Per-block grid dimensions, shared with the motion estimation and encoder
/// modules (`DSV_PARAMS::nblocks_h/v`).
#[derive(Debug, Clone, Copy)]
pub struct BlockGrid {
    pub nblocks_h: i32,
    pub nblocks_v: i32,
}

/// Everything the coefficient coder needs to know about block stability and
/// frame type (`DSV_STABILITY`). `stable_blocks` is a byte-per-block map,
/// nonzero where the block has stayed still long enough to deserve near-
/// lossless quantization.
pub struct Stability<'a> {
    pub grid: BlockGrid,
    pub stable_blocks: &'a [u8],
    pub cur_plane: usize,
    pub is_p: bool,
}

fn subband(level: i32, sub: i32, w: i32, h: i32) -> i32 {
    let mut offset = 0;
    if sub & 1 != 0 {
        offset += crate::params::round_shift(w, MAXLVL - level);
    }
    if sub & 2 != 0 {
        offset += crate::params::round_shift(h, MAXLVL - level) * w;
    }
    offset
}

fn dimat(level: i32, v: i32) -> i32 {
    crate::params::round_shift(v, MAXLVL - level)
}

fn fix_quant(q: i32, stab: &Stability) -> i32 {
    if stab.cur_plane > 0 && q > CHROMA_LIMIT {
        CHROMA_LIMIT
    } else {
        q
    }
}

pub(crate) const IS_STABLE: u8 = 1;
pub(crate) const IS_INTRA: u8 = 2;

fn tmq4pos(q: i32, stable: u8) -> i32 {
    if stable & IS_INTRA != 0 {
        q >> 2
    } else if stable != 0 {
        q >> 1
    } else {
        q
    }
}

/// Derives the quantizer for a given subband level from the frame's base
/// quantizer, compensating for the LL energy B4T produces on P-frames
/// (`dsv_get_quant`).
pub fn dsv_get_quant(q: i32, is_p: bool, level: i32) -> i32 {
    let mut q = if is_p { q * 3 / 2 } else { q };
    if level == 1 {
        q = q * 2 / 3;
    } else if level == 2 {
        q = q * 3 / 2;
    }
    q.max(MINQUANT)
}

fn quant(v: i32, q: i32) -> i32 {
    if v == 0 {
        return 0;
    }
    if v < 0 {
        let v = (-v) << 1;
        if v <= q {
            return 0;
        }
        return -((v + 1) / (q << 1));
    }
    let v = v << 1;
    if v <= q {
        return 0;
    }
    (v + 1) / (q << 1)
}

fn quant_h(v: i32, q: u32) -> i32 {
    if v < 0 {
        -((-v) >> q)
    } else {
        v >> q
    }
}

fn dequant(v: i32, q: i32) -> i32 {
    if v < 0 {
        -((-v * (q << 1) + q) >> 1)
    } else {
        (v * (q << 1) + q) >> 1
    }
}

fn dequant_h(v: i32, q: u32) -> i32 {
    v << q
}

/// Integer ceiling log2 of `n` (`dsv_lb2`).
pub fn dsv_lb2(n: u32) -> i32 {
    let mut i: u32 = 1;
    let mut log2 = 0;
    while i < n {
        i <<= 1;
        log2 += 1;
    }
    log2
}

/// Quantizes and entropy-codes every subband of a transformed plane except
/// its unquantized LL value, which the caller writes separately
/// (`hzcc_enc`).
fn hzcc_enc(bw: &mut BitWriter, src: &mut [i32], w: i32, h: i32, q: i32, stab: &Stability) {
    bw.align();
    let startp = bw.byte_pos();
    bw.put_bits(32, 0);
    bw.align();

    let q = fix_quant(q, stab);

    let mut run: i32 = 0;
    let mut nruns: i32 = 0;
    let mut stored_v: i32 = 0;

    let l = 0;
    let sw = dimat(l, w);
    let sh = dimat(l, h);
    let qp = dsv_get_quant(q, stab.is_p, l);

    let o = subband(l, 0, w, h) as usize;
    src[0] = 0;
    for y in 0..sh {
        for x in 0..sw {
            let idx = o + (y * w + x) as usize;
            let v = quant(src[idx], qp);
            if v != 0 {
                src[idx] = dequant(v, qp);
                bw.put_ueg(run as u32);
                if stored_v != 0 {
                    bw.put_neg(stored_v);
                }
                run = -1;
                nruns += 1;
                stored_v = v;
            } else {
                src[idx] = 0;
            }
            run += 1;
        }
    }

    for l in 0..MAXLVL {
        let sw = dimat(l, w);
        let sh = dimat(l, h);
        let dbx = (stab.grid.nblocks_h << BLOCK_P) / sw.max(1);
        let dby = (stab.grid.nblocks_v << BLOCK_P) / sh.max(1);
        let qp = dsv_get_quant(q, stab.is_p, l);

        if l == MAXLVL - 1 {
            let qp = dsv_lb2(qp as u32);
            let qp_h = if !stab.is_p { (qp - QP_I).clamp(1, 24) } else { (qp - QP_P).clamp(1, 24) };

            for s in 1..NSUBBAND {
                let o = subband(l, s, w, h) as usize;
                let mut by = 0;
                for y in 0..sh {
                    let blockrow = &stab.stable_blocks
                        [((by >> BLOCK_P) * stab.grid.nblocks_h) as usize..];
                    let mut bx = 0;
                    for x in 0..sw {
                        let idx = o + (y * w + x) as usize;
                        let tmq = if blockrow[(bx >> BLOCK_P) as usize] != 0 { qp_h } else { qp };
                        let v = quant_h(src[idx], tmq as u32);
                        if v != 0 {
                            src[idx] = dequant_h(v, tmq as u32);
                            bw.put_ueg(run as u32);
                            if stored_v != 0 {
                                bw.put_neg(stored_v);
                            }
                            run = -1;
                            nruns += 1;
                            stored_v = v;
                        } else {
                            src[idx] = 0;
                        }
                        run += 1;
                        bx += dbx;
                    }
                    by += dby;
                }
            }
        } else {
            for s in 1..NSUBBAND {
                let o = subband(l, s, w, h) as usize;
                let mut by = 0;
                for y in 0..sh {
                    let blockrow = &stab.stable_blocks
                        [((by >> BLOCK_P) * stab.grid.nblocks_h) as usize..];
                    let mut bx = 0;
                    for x in 0..sw {
                        let idx = o + (y * w + x) as usize;
                        let mut tmq = tmq4pos(qp, blockrow[(bx >> BLOCK_P) as usize]);
                        if tmq < MINQUANT {
                            tmq = MINQUANT;
                        }
                        let v = quant(src[idx], tmq);
                        if v != 0 {
                            src[idx] = dequant(v, tmq);
                            bw.put_ueg(run as u32);
                            if stored_v != 0 {
                                bw.put_neg(stored_v);
                            }
                            run = -1;
                            nruns += 1;
                            stored_v = v;
                        } else {
                            src[idx] = 0;
                        }
                        run += 1;
                        bx += dbx;
                    }
                    by += dby;
                }
            }
        }
    }

    if stored_v != 0 {
        bw.put_neg(stored_v);
    }

    bw.align();
    let endp = bw.byte_pos();
    bw.patch_u32(startp, nruns as u32);
}

/// Inverse of [`hzcc_enc`]: dequantizes straight into `dst`, bounded by
/// `bufsz` bytes of available input (`hzcc_dec`).
fn hzcc_dec(br: &mut BitReader, bufsz: usize, dst: &mut [i32], w: i32, h: i32, q: i32, stab: &Stability) {
    br.align();
    let mut runs = br.get_bits(32) as i32;
    br.align();
    let mut run = if runs > 0 {
        runs -= 1;
        br.get_ueg() as i32
    } else {
        i32::MAX
    };

    let q = fix_quant(q, stab);
    let l = 0;
    let sw = dimat(l, w);
    let sh = dimat(l, h);
    let qp = dsv_get_quant(q, stab.is_p, l);
    let o = subband(l, 0, w, h) as usize;

    for y in 0..sh {
        for x in 0..sw {
            let idx = o + (y * w + x) as usize;
            if run == 0 {
                run = if runs > 0 {
                    runs -= 1;
                    br.get_ueg() as i32
                } else {
                    i32::MAX
                };
                let v = br.get_neg();
                if br.byte_pos() >= bufsz {
                    return;
                }
                dst[idx] = dequant(v, qp);
            } else {
                run -= 1;
            }
        }
    }

    for l in 0..MAXLVL {
        let sw = dimat(l, w);
        let sh = dimat(l, h);
        let dbx = (stab.grid.nblocks_h << BLOCK_P) / sw.max(1);
        let dby = (stab.grid.nblocks_v << BLOCK_P) / sh.max(1);
        let qp = dsv_get_quant(q, stab.is_p, l);

        if l == MAXLVL - 1 {
            let qp = dsv_lb2(qp as u32);
            let qp_h = if !stab.is_p { (qp - QP_I).clamp(1, 24) } else { (qp - QP_P).clamp(1, 24) };

            for s in 1..NSUBBAND {
                let o = subband(l, s, w, h) as usize;
                let mut by = 0;
                for y in 0..sh {
                    let blockrow = &stab.stable_blocks
                        [((by >> BLOCK_P) * stab.grid.nblocks_h) as usize..];
                    let mut bx = 0;
                    for x in 0..sw {
                        let idx = o + (y * w + x) as usize;
                        if run == 0 {
                            run = if runs > 0 {
                                runs -= 1;
                                br.get_ueg() as i32
                            } else {
                                i32::MAX
                            };
                            let v = br.get_neg();
                            if br.byte_pos() >= bufsz {
                                return;
                            }
                            let tmq = if blockrow[(bx >> BLOCK_P) as usize] != 0 { qp_h } else { qp };
                            dst[idx] = dequant_h(v, tmq as u32);
                        } else {
                            run -= 1;
                        }
                        bx += dbx;
                    }
                    by += dby;
                }
            }
        } else {
            for s in 1..NSUBBAND {
                let o = subband(l, s, w, h) as usize;
                let mut by = 0;
                for y in 0..sh {
                    let blockrow = &stab.stable_blocks
                        [((by >> BLOCK_P) * stab.grid.nblocks_h) as usize..];
                    let mut bx = 0;
                    for x in 0..sw {
                        let idx = o + (y * w + x) as usize;
                        if run == 0 {
                            run = if runs > 0 {
                                runs -= 1;
                                br.get_ueg() as i32
                            } else {
                                i32::MAX
                            };
                            let v = br.get_neg();
                            if br.byte_pos() >= bufsz {
                                return;
                            }
                            let mut tmq = tmq4pos(qp, blockrow[(bx >> BLOCK_P) as usize]);
                            if tmq < MINQUANT {
                                tmq = MINQUANT;
                            }
                            dst[idx] = dequant(v, tmq);
                        } else {
                            run -= 1;
                        }
                        bx += dbx;
                    }
                    by += dby;
                }
            }
        }
    }

    br.align();
}

/// Entropy-codes a whole transformed plane: the unquantized LL value as a
/// signed exp-Golomb code, then every other subband via [`hzcc_enc`], closed
/// off with an end-of-plane sentinel byte so the decoder can detect
/// desynchronization (`dsv_encode_plane`).
pub fn encode_plane(bw: &mut BitWriter, src: &mut crate::frame::Coefs, q: i32, stab: &Stability) {
    let w = src.width;
    let h = src.height;

    bw.align();
    let startp = bw.byte_pos();
    bw.put_bits(32, 0);

    let ll = src.as_slice()[0];
    bw.put_seg(ll);
    hzcc_enc(bw, src.as_mut_slice(), w, h, q, stab);
    src.as_mut_slice()[0] = ll;

    bw.put_bits(8, EOP_SYMBOL as u32);
    bw.align();

    let endp = bw.byte_pos();
    bw.patch_u32(startp, (endp - startp) as u32 - 4);
}

/// Inverse of [`encode_plane`]: `buf` must be exactly the plane's declared
/// byte length so the internal `bufsz` guard matches `dsv_decode_plane`'s
/// corrupt-stream bailout.
pub fn decode_plane(buf: &[u8], dst: &mut crate::frame::Coefs, q: i32, stab: &Stability) {
    let mut br = BitReader::new(buf);
    let ll = br.get_seg();
    let w = dst.width;
    let h = dst.height;
    hzcc_dec(&mut br, buf.len(), dst.as_mut_slice(), w, h, q, stab);

    if br.get_bits(8) != EOP_SYMBOL as u32 {
        log::error!("bad eop, frame data incomplete and/or corrupt");
    }
    br.align();

    dst.as_mut_slice()[0] = ll;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::make_coefs;
    use crate::subsamp::Subsamp;

    fn grid_for(w: i32, h: i32) -> (BlockGrid, Vec<u8>) {
        let nb_h = (w + 15) / 16;
        let nb_v = (h + 15) / 16;
        (BlockGrid { nblocks_h: nb_h, nblocks_v: nb_v }, vec![0u8; (nb_h * nb_v) as usize])
    }

    #[test]
    fn dsv_lb2_matches_ceiling_log2() {
        assert_eq!(dsv_lb2(1), 0);
        assert_eq!(dsv_lb2(2), 1);
        assert_eq!(dsv_lb2(3), 2);
        assert_eq!(dsv_lb2(16), 4);
        assert_eq!(dsv_lb2(17), 5);
    }

    #[test]
    fn dsv_get_quant_floors_at_minquant() {
        assert_eq!(dsv_get_quant(1, false, 0), MINQUANT);
        assert_eq!(dsv_get_quant(1000, false, 1), 1000 * 2 / 3);
    }

    #[test]
    fn quant_dequant_round_trip_is_idempotent_on_zero() {
        assert_eq!(quant(0, 64), 0);
        assert_eq!(dequant(quant(0, 64), 64), 0);
    }

    #[test]
    fn encode_then_decode_plane_preserves_ll_and_terminates_cleanly() {
        let (grid, stable_blocks) = grid_for(32, 32);
        let stab = Stability { grid, stable_blocks: &stable_blocks, cur_plane: 0, is_p: false };
        let mut coefs = make_coefs(Subsamp::Yuv444, 32, 32).into_iter().next().unwrap();
        for y in 0..32 {
            for x in 0..32 {
                coefs.set(x, y, ((x * 3 - y * 5) % 17) - 8);
            }
        }
        let ll_before = coefs.get(0, 0);

        let mut bw = BitWriter::new();
        encode_plane(&mut bw, &mut coefs, 64, &stab);
        let bytes = bw.finish();

        let mut decoded = make_coefs(Subsamp::Yuv444, 32, 32).into_iter().next().unwrap();
        decode_plane(&bytes, &mut decoded, 64, &stab);
        assert_eq!(decoded.get(0, 0), ll_before);
    }
}

//! Plane and frame storage, grounded in `frame.c` and the `DSV_PLANE` /
//! `DSV_FRAME` / `DSV_COEFS` layouts in `dsv.h`.
//!
//! The original keeps all three planes of a frame in one allocation and
//! slices pointers into it (`dsv_mk_frame`); here each plane owns its own
//! buffer. Reference counting is likewise not carried as a field on the
//! struct (`DSV_FRAME::refcount` / `dsv_frame_ref_inc` / `_dec`) -- callers
//! that need to share a frame wrap it in `Rc`.

use crate::params::{round_pow2, round_shift, FRAME_BORDER};
use crate::subsamp::Subsamp;

/// One 8-bit sample plane, optionally padded with a replicated border used
/// by motion compensation and hierarchical motion estimation to read past
/// the visible edges without bounds checks at every access.
#[derive(Clone, Debug)]
pub struct Plane {
    data: Box<[u8]>,
    stride: i32,
    w: i32,
    h: i32,
    hs: i32,
    vs: i32,
    /// Border width baked into `data`'s layout; 0 when unbordered.
    border: i32,
}

impl Plane {
    fn new(w: i32, h: i32, hs: i32, vs: i32, bordered: bool) -> Self {
        let border = if bordered { FRAME_BORDER } else { 0 };
        let stride = if bordered {
            round_pow2(w + border * 2, 4)
        } else {
            w
        };
        let len = (stride * (h + border * 2)) as usize;
        Plane {
            data: vec![0u8; len].into_boxed_slice(),
            stride,
            w,
            h,
            hs,
            vs,
            border,
        }
    }

    pub fn width(&self) -> i32 {
        self.w
    }

    pub fn height(&self) -> i32 {
        self.h
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn h_shift(&self) -> i32 {
        self.hs
    }

    pub fn v_shift(&self) -> i32 {
        self.vs
    }

    #[inline]
    fn offset(&self, x: i32, y: i32) -> usize {
        ((y + self.border) as isize * self.stride as isize + (x + self.border) as isize) as usize
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> u8 {
        self.data[self.offset(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: i32, y: i32, v: u8) {
        let o = self.offset(x, y);
        self.data[o] = v;
    }

    /// Visible-row slice starting at `(0, y)`, `w` samples wide. Mirrors
    /// `DSV_GET_LINE`.
    pub fn line(&self, y: i32) -> &[u8] {
        let start = self.offset(0, y);
        &self.data[start..start + self.w as usize]
    }

    pub fn line_mut(&mut self, y: i32) -> &mut [u8] {
        let start = self.offset(0, y);
        &mut self.data[start..start + self.w as usize]
    }

    /// Raw slice anchored at `(x, y)`, with no length bound -- used where
    /// the original indexes `DSV_GET_XY` and reads/writes a run of bytes
    /// relative to it.
    pub fn slice_from(&self, x: i32, y: i32) -> &[u8] {
        &self.data[self.offset(x, y)..]
    }

    pub fn slice_from_mut(&mut self, x: i32, y: i32) -> &mut [u8] {
        let o = self.offset(x, y);
        &mut self.data[o..]
    }

    /// Replicates edge pixels into the border region (`dsv_extend_frame`'s
    /// per-plane body).
    fn extend(&mut self) {
        if self.border == 0 {
            return;
        }
        let border = self.border;
        let width = self.w;
        let height = self.h;
        for j in 0..height {
            let left = self.get(0, j);
            let right = self.get(width - 1, j);
            for k in 1..=border {
                self.set(-k, j, left);
            }
            for k in 0..border {
                self.set(width + k, j, right);
            }
        }
        let total_w = width + border * 2;
        for j in 0..border {
            let (src_start, dst_start) = (self.offset(-border, 0), self.offset(-border, -j - 1));
            copy_within(&mut self.data, src_start, dst_start, total_w as usize);
            let (src_start, dst_start) = (
                self.offset(-border, height - 1),
                self.offset(-border, height + j),
            );
            copy_within(&mut self.data, src_start, dst_start, total_w as usize);
        }
    }

    /// A derived view shrunk to start at `(x, y)`, per `dsv_plane_xy`. Only
    /// the dimensions and base offset change; the underlying buffer and
    /// stride are shared.
    pub fn view_from(&self, x: i32, y: i32) -> PlaneView<'_> {
        PlaneView {
            plane: self,
            x0: x,
            y0: y,
            w: (self.w - x).max(0),
            h: (self.h - y).max(0),
        }
    }
}

fn copy_within(buf: &mut [u8], src: usize, dst: usize, len: usize) {
    if src == dst {
        return;
    }
    let (lo, hi) = if src < dst { (src, dst) } else { (dst, src) };
    if hi < lo + len {
        // Overlapping ranges: original bytes need to survive the copy.
        let tmp = buf[src..src + len].to_vec();
        buf[dst..dst + len].copy_from_slice(&tmp);
    } else {
        buf.copy_within(src..src + len, dst);
    }
}

/// A read-only sub-rectangle of a `Plane` anchored away from the origin,
/// equivalent to what `dsv_plane_xy` hands back.
pub struct PlaneView<'a> {
    plane: &'a Plane,
    x0: i32,
    y0: i32,
    w: i32,
    h: i32,
}

impl<'a> PlaneView<'a> {
    pub fn width(&self) -> i32 {
        self.w
    }

    pub fn height(&self) -> i32 {
        self.h
    }

    pub fn get(&self, x: i32, y: i32) -> u8 {
        self.plane.get(self.x0 + x, self.y0 + y)
    }
}

/// A planar 8-bit YUV frame: luma plus two (possibly subsampled) chroma
/// planes, per `DSV_FRAME`.
#[derive(Clone, Debug)]
pub struct Frame {
    pub subsamp: Subsamp,
    pub width: i32,
    pub height: i32,
    bordered: bool,
    planes: [Plane; 3],
}

impl Frame {
    /// `dsv_mk_frame`: allocates a bordered (or not) frame of the given
    /// visible dimensions.
    pub fn new(subsamp: Subsamp, width: i32, height: i32, bordered: bool) -> Self {
        let (cw, ch) = subsamp.chroma_dims(width, height);
        Frame {
            subsamp,
            width,
            height,
            bordered,
            planes: [
                Plane::new(width, height, 0, 0, bordered),
                Plane::new(cw, ch, subsamp.h_shift(), subsamp.v_shift(), bordered),
                Plane::new(cw, ch, subsamp.h_shift(), subsamp.v_shift(), bordered),
            ],
        }
    }

    /// `dsv_load_planar_frame`: wraps a tightly packed planar buffer (no
    /// border) with no subsampling rounding beyond integer shift division.
    pub fn from_planar(subsamp: Subsamp, data: &[u8], width: i32, height: i32) -> Self {
        let hs = subsamp.h_shift();
        let vs = subsamp.v_shift();
        let cw = round_shift(width, hs);
        let ch = round_shift(height, vs);

        let y_len = (width * height) as usize;
        let c_len = (cw * ch) as usize;
        assert!(data.len() >= y_len + 2 * c_len, "planar buffer too short");

        let mut f = Frame {
            subsamp,
            width,
            height,
            bordered: false,
            planes: [
                Plane::new(width, height, 0, 0, false),
                Plane::new(cw, ch, hs, vs, false),
                Plane::new(cw, ch, hs, vs, false),
            ],
        };
        f.planes[0].data.copy_from_slice(&data[..y_len]);
        f.planes[1].data.copy_from_slice(&data[y_len..y_len + c_len]);
        f.planes[2]
            .data
            .copy_from_slice(&data[y_len + c_len..y_len + 2 * c_len]);
        f
    }

    pub fn plane(&self, c: usize) -> &Plane {
        &self.planes[c]
    }

    pub fn plane_mut(&mut self, c: usize) -> &mut Plane {
        &mut self.planes[c]
    }

    pub fn planes(&self) -> &[Plane; 3] {
        &self.planes
    }

    pub fn is_bordered(&self) -> bool {
        self.bordered
    }

    /// `dsv_frame_copy`: copies visible samples plane-by-plane, then
    /// extends the border if `dst` has one.
    ///
    /// Iterates `dst`'s row count and `src`'s column count, matching the
    /// original rather than asserting equal dimensions -- the `xf_frame`
    /// this feeds the subband transform from is rounded up to even size
    /// and can be one sample taller/wider than `src`, in which case the
    /// extra row/column is read out of `src`'s mirrored border.
    pub fn copy_from(&mut self, src: &Frame) {
        for c in 0..3 {
            let h = self.planes[c].h;
            let w = src.planes[c].w;
            for j in 0..h {
                for x in 0..w {
                    let v = src.planes[c].get(x, j);
                    self.planes[c].set(x, j, v);
                }
            }
        }
        if self.bordered {
            self.extend();
        }
    }

    /// `dsv_clone_frame`: a bordered copy of `src`, extended.
    pub fn clone_bordered(&self, bordered: bool) -> Frame {
        let mut d = Frame::new(self.subsamp, self.width, self.height, bordered);
        d.copy_from(self);
        d
    }

    pub fn extend(&mut self) {
        if !self.bordered {
            return;
        }
        for p in &mut self.planes {
            p.extend();
        }
    }

    pub fn extend_luma(&mut self) {
        if !self.bordered {
            return;
        }
        self.planes[0].extend();
    }

    /// `dsv_frame_avg_luma`.
    pub fn avg_luma(&self) -> i32 {
        let p = &self.planes[0];
        let mut acc: i64 = 0;
        for j in 0..p.h {
            for &s in p.line(j) {
                acc += s as i64;
            }
        }
        (acc / (p.w as i64 * p.h as i64)) as i32
    }

    /// `dsv_ds2x_frame_luma`: builds a half-resolution luma-only frame via
    /// a rounded box filter. The returned frame's chroma planes are left
    /// at default (zeroed) size-1 placeholders since only luma feeds the
    /// motion-estimation pyramid.
    pub fn downsample_2x_luma(&self) -> Frame {
        let dw = (self.width + 1) / 2;
        let dh = (self.height + 1) / 2;
        let mut dst = Frame::new(self.subsamp, dw, dh, self.bordered);
        let src = &self.planes[0];
        for j in 0..dh {
            for i in 0..dw {
                let p1 = src.get(i * 2, j * 2) as i32;
                let p2 = src.get(i * 2 + 1, j * 2) as i32;
                let p3 = src.get(i * 2, j * 2 + 1) as i32;
                let p4 = src.get(i * 2 + 1, j * 2 + 1) as i32;
                dst.planes[0].set(i, j, ((p1 + p2 + p3 + p4 + 2) >> 2) as u8);
            }
        }
        if dst.bordered {
            dst.extend_luma();
        }
        dst
    }

    pub fn plane_view(&self, c: usize, x: i32, y: i32) -> PlaneView<'_> {
        self.planes[c].view_from(x, y)
    }
}

/// Subband-transform coefficient storage for one plane, `DSV_COEFS`.
#[derive(Clone, Debug)]
pub struct Coefs {
    data: Box<[i32]>,
    pub width: i32,
    pub height: i32,
}

impl Coefs {
    fn zeroed(width: i32, height: i32) -> Self {
        Coefs {
            data: vec![0i32; (width * height) as usize].into_boxed_slice(),
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> i32 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: i32, y: i32, v: i32) {
        let idx = (y * self.width + x) as usize;
        self.data[idx] = v;
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [i32] {
        &mut self.data
    }
}

/// The coefficient-plane dimensions for a picture of the given visible
/// size: both luma axes rounded up to even (`dsv_get_xf_dims`). Chroma
/// dimensions are then derived from these, not from the raw visible size,
/// so an odd visible width still yields evenly-sized chroma coefficient
/// planes too.
pub fn xf_dims(width: i32, height: i32) -> (i32, i32) {
    (round_pow2(width, 1), round_pow2(height, 1))
}

/// Three planes' worth of coefficient storage, `dsv_mk_coefs`. `width`/
/// `height` should already be the rounded-even xf dimensions from
/// [`xf_dims`].
pub fn make_coefs(subsamp: Subsamp, width: i32, height: i32) -> [Coefs; 3] {
    let (cw, ch) = subsamp.coef_chroma_dims(width, height);
    [
        Coefs::zeroed(width, height),
        Coefs::zeroed(cw, ch),
        Coefs::zeroed(cw, ch),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_mirrors_edge_pixels() {
        let mut f = Frame::new(Subsamp::Yuv420, 32, 32, true);
        for j in 0..32 {
            for i in 0..32 {
                f.plane_mut(0).set(i, j, (i + j) as u8);
            }
        }
        f.extend_luma();
        let p = f.plane(0);
        // left/right edges replicated horizontally
        assert_eq!(p.get(-5, 10), p.get(0, 10));
        assert_eq!(p.get(36, 10), p.get(31, 10));
        // top/bottom edges replicated vertically, including corners
        assert_eq!(p.get(-5, -5), p.get(0, 0));
        assert_eq!(p.get(36, 36), p.get(31, 31));
    }

    #[test]
    fn planar_round_trip_444() {
        let w = 8;
        let h = 4;
        let mut raw = vec![0u8; (w * h * 3) as usize];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let f = Frame::from_planar(Subsamp::Yuv444, &raw, w, h);
        assert_eq!(f.plane(0).get(0, 0), raw[0]);
        assert_eq!(f.plane(1).width(), w);
        assert_eq!(f.plane(2).height(), h);
    }

    #[test]
    fn downsample_halves_dimensions_with_box_filter() {
        let mut f = Frame::new(Subsamp::Yuv420, 16, 16, true);
        for j in 0..16 {
            for i in 0..16 {
                f.plane_mut(0).set(i, j, 100);
            }
        }
        f.extend_luma();
        let half = f.downsample_2x_luma();
        assert_eq!(half.plane(0).width(), 8);
        assert_eq!(half.plane(0).height(), 8);
        assert_eq!(half.plane(0).get(0, 0), 100);
    }
}

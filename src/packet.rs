//! Packet framing: header, metadata, and end-of-stream bodies, plus the
//! doubly-linked byte-offset bookkeeping every packet carries.
//!
//! Grounded in `dsv_encoder.c`'s `encode_packet_hdr`/`set_link_offsets`/
//! `encode_metadata` and `dsv_decoder.c`'s `decode_packet_hdr`/`decode_meta`.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::{DsvError, DsvResult};
use crate::params::{
    FOURCC, PACKET_HDR_SIZE, PACKET_NEXT_OFFSET, PACKET_PREV_OFFSET, PT_EOS, PT_META,
    VERSION_MINOR,
};
use crate::subsamp::Subsamp;

/// Stream-wide video parameters, `DSV_META`.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub width: i32,
    pub height: i32,
    pub subsamp: Subsamp,
    pub fps_num: i32,
    pub fps_den: i32,
    pub aspect_num: i32,
    pub aspect_den: i32,
}

/// Writes the common 14-byte header with zeroed link-offset placeholders
/// (`encode_packet_hdr`). The caller patches the links in afterwards via
/// [`set_link_offsets`].
pub fn encode_packet_hdr(bw: &mut BitWriter, pkt_type: u8) {
    for &b in &FOURCC {
        bw.put_bits(8, b as u32);
    }
    bw.put_bits(8, VERSION_MINOR as u32);
    bw.put_bits(8, pkt_type as u32);
    bw.put_bits(32, 0);
    bw.put_bits(32, 0);
}

/// Parses and validates the header, returning the packet type byte
/// (`decode_packet_hdr`). The link-offset fields are consumed but not
/// interpreted here; a decoder walking a stored stream reads them directly
/// off the buffer instead.
pub fn decode_packet_hdr(br: &mut BitReader) -> DsvResult<u8> {
    for &want in &FOURCC {
        if br.get_bits(8) as u8 != want {
            return Err(DsvError::MalformedPacket { reason: "bad fourcc" });
        }
    }
    let _ver_minor = br.get_bits(8);
    let pkt_type = br.get_bits(8) as u8;
    br.get_bits(32);
    br.get_bits(32);
    Ok(pkt_type)
}

/// Patches the `prev_link`/`next_link` fields of an already-serialized
/// packet in place (`set_link_offsets`). `next_link` is `0` for an EOS
/// packet (or any packet whose successor isn't known yet).
pub fn set_link_offsets(buf: &mut [u8], prev_link: u32, next_link: u32) {
    buf[PACKET_PREV_OFFSET..PACKET_PREV_OFFSET + 4].copy_from_slice(&prev_link.to_be_bytes());
    buf[PACKET_NEXT_OFFSET..PACKET_NEXT_OFFSET + 4].copy_from_slice(&next_link.to_be_bytes());
}

/// Builds a metadata packet, `next_link` set to the packet's own byte
/// length (`encode_metadata`). `prev_link` is left at 0; the caller patches
/// it via [`set_link_offsets`] once the previous packet's length is known.
pub fn encode_metadata(meta: &Meta) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(64);
    encode_packet_hdr(&mut bw, PT_META);

    bw.put_ueg(meta.width as u32);
    bw.put_ueg(meta.height as u32);
    bw.put_ueg(meta.subsamp.to_code() as u32);
    bw.put_ueg(meta.fps_num as u32);
    bw.put_ueg(meta.fps_den as u32);
    bw.put_ueg(meta.aspect_num as u32);
    bw.put_ueg(meta.aspect_den as u32);
    bw.align();

    let mut buf = bw.finish();
    let len = buf.len() as u32;
    set_link_offsets(&mut buf, 0, len);
    buf
}

/// Parses a metadata packet body, `decode_meta`. Caller has already
/// consumed the packet header.
pub fn decode_meta(br: &mut BitReader) -> DsvResult<Meta> {
    let width = br.get_ueg() as i32;
    let height = br.get_ueg() as i32;
    let subsamp = Subsamp::from_code(br.get_ueg() as u8)?;
    let fps_num = br.get_ueg() as i32;
    let fps_den = br.get_ueg() as i32;
    let aspect_num = br.get_ueg() as i32;
    let aspect_den = br.get_ueg() as i32;

    if width < 16 || height < 16 {
        return Err(DsvError::Config(format!(
            "invalid dimensions {width}x{height}"
        )));
    }

    Ok(Meta {
        width,
        height,
        subsamp,
        fps_num,
        fps_den,
        aspect_num,
        aspect_den,
    })
}

/// Builds an end-of-stream packet: header only, `next_link = 0`
/// (`dsv_enc_end_of_stream`).
pub fn encode_eos() -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(PACKET_HDR_SIZE);
    encode_packet_hdr(&mut bw, PT_EOS);
    bw.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta444(w: i32, h: i32) -> Meta {
        Meta {
            width: w,
            height: h,
            subsamp: Subsamp::Yuv444,
            fps_num: 30,
            fps_den: 1,
            aspect_num: 1,
            aspect_den: 1,
        }
    }

    #[test]
    fn metadata_round_trips_through_header_and_body() {
        let meta = meta444(64, 48);
        let buf = encode_metadata(&meta);

        let mut br = BitReader::new(&buf);
        let pkt_type = decode_packet_hdr(&mut br).unwrap();
        assert_eq!(pkt_type, PT_META);
        let decoded = decode_meta(&mut br).unwrap();
        assert_eq!(decoded.width, 64);
        assert_eq!(decoded.height, 48);
        assert_eq!(decoded.subsamp, Subsamp::Yuv444);
    }

    #[test]
    fn bad_fourcc_is_a_malformed_packet_error() {
        let mut buf = encode_metadata(&meta444(16, 16));
        buf[0] = b'X';
        let mut br = BitReader::new(&buf);
        assert!(matches!(
            decode_packet_hdr(&mut br),
            Err(DsvError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn eos_packet_is_header_sized_with_zero_links() {
        let buf = encode_eos();
        assert_eq!(buf.len(), PACKET_HDR_SIZE);
        assert_eq!(&buf[PACKET_NEXT_OFFSET..PACKET_NEXT_OFFSET + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn link_offsets_patch_in_place() {
        let mut buf = encode_eos();
        set_link_offsets(&mut buf, 123, 0);
        assert_eq!(
            u32::from_be_bytes(buf[PACKET_PREV_OFFSET..PACKET_PREV_OFFSET + 4].try_into().unwrap()),
            123
        );
    }
}

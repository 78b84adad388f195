//! Command-line driver: reads/writes raw planar YUV and drives the
//! encoder/decoder library end to end, the Rust counterpart of
//! `dsv_main.c`. Argument parsing, file I/O and the raw-YUV framing here
//! are explicitly outside the codec's own behavioral contract -- this
//! binary is a thin harness over the library, not part of it.

mod bitstream;
mod decoder;
mod encoder;
mod error;
mod frame;
mod hme;
mod hzcc;
mod mc;
mod motion;
mod packet;
mod params;
mod sbt;
mod subsamp;

use std::convert::TryInto;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use decoder::{DecodeEvent, Decoder};
use encoder::{Encoder, EncoderConfig};
use error::DsvError;
use frame::Frame;
use packet::Meta;
use params::{
    quality_percent, round_shift, PACKET_HDR_SIZE, PACKET_NEXT_OFFSET, PACKET_TYPE_OFFSET,
    PT_EOS, RATE_CONTROL_ABR,
};
use subsamp::Subsamp;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Dsv(#[from] DsvError),
}

#[derive(Parser)]
#[command(name = "dsv1", version, about = "Digital Subband Video encoder/decoder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress a raw planar YUV file into a DSV-1 packet stream.
    Encode(EncodeArgs),
    /// Decompress a DSV-1 packet stream into a raw planar YUV file.
    Decode(DecodeArgs),
}

#[derive(Copy, Clone, ValueEnum)]
enum InputFmt {
    Yuv444,
    Yuv422,
    Yuv420,
    Yuv411,
}

impl From<InputFmt> for Subsamp {
    fn from(fmt: InputFmt) -> Subsamp {
        match fmt {
            InputFmt::Yuv444 => Subsamp::Yuv444,
            InputFmt::Yuv422 => Subsamp::Yuv422,
            InputFmt::Yuv420 => Subsamp::Yuv420,
            InputFmt::Yuv411 => Subsamp::Yuv411,
        }
    }
}

#[derive(Args)]
struct EncodeArgs {
    input: String,
    output: String,

    #[arg(long)]
    width: i32,
    #[arg(long)]
    height: i32,
    #[arg(long, value_enum, default_value_t = InputFmt::Yuv420)]
    fmt: InputFmt,

    /// Quality percent, 0-100. 85 = default, matching `dsv_main.c`'s `qp`.
    #[arg(long, default_value_t = 85)]
    quality: i32,
    /// Group-of-pictures length; 0 = intra-only.
    #[arg(long, default_value_t = 24)]
    gop: i32,
    #[arg(long, default_value_t = 30)]
    fps_num: i32,
    #[arg(long, default_value_t = 1)]
    fps_den: i32,
    #[arg(long, default_value_t = 1)]
    aspect_num: i32,
    #[arg(long, default_value_t = 1)]
    aspect_den: i32,
    /// Switches to ABR rate control at this target bitrate (bits/sec).
    #[arg(long)]
    abr_bitrate: Option<i64>,
    /// Number of frames to compress; unset means until EOF.
    #[arg(long)]
    nframes: Option<u32>,
}

#[derive(Args)]
struct DecodeArgs {
    input: String,
    output: String,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Encode(args) => run_encode(args),
        Command::Decode(args) => run_decode(args),
    };

    if let Err(e) = result {
        eprintln!("dsv1: {e}");
        std::process::exit(1);
    }
}

fn frame_byte_size(subsamp: Subsamp, width: i32, height: i32) -> usize {
    let cw = round_shift(width, subsamp.h_shift());
    let ch = round_shift(height, subsamp.v_shift());
    (width * height + 2 * cw * ch) as usize
}

fn run_encode(args: EncodeArgs) -> Result<(), CliError> {
    let subsamp: Subsamp = args.fmt.into();
    let meta = Meta {
        width: args.width,
        height: args.height,
        subsamp,
        fps_num: args.fps_num,
        fps_den: args.fps_den,
        aspect_num: args.aspect_num,
        aspect_den: args.aspect_den,
    };

    let mut config = EncoderConfig {
        quality: quality_percent(args.quality.clamp(0, 100)),
        gop: args.gop,
        ..EncoderConfig::default()
    };
    if let Some(bitrate) = args.abr_bitrate {
        config.rc_mode = RATE_CONTROL_ABR;
        config.bitrate = bitrate;
    }

    let mut enc = Encoder::new(meta, config)?;
    let mut input = File::open(&args.input)?;
    let mut output = BufWriter::new(File::create(&args.output)?);

    let frame_bytes = frame_byte_size(subsamp, args.width, args.height);
    let mut buf = vec![0u8; frame_bytes];
    let mut coded = 0u32;

    loop {
        if args.nframes.is_some_and(|n| coded >= n) {
            break;
        }
        match input.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let frame = Frame::from_planar(subsamp, &buf, args.width, args.height);
        for packet in enc.push_frame(&frame)? {
            output.write_all(&packet)?;
        }
        coded += 1;
    }

    output.write_all(&enc.end_of_stream())?;
    output.flush()?;
    log::info!("encoded {coded} frames to {}", args.output);
    Ok(())
}

/// Splits a stored packet stream into individual packet slices by walking
/// each header's `next_link` field, which our encoder always sets to the
/// packet's own byte length (`dsv_dec`'s caller is expected to do this --
/// the library decodes one packet at a time and doesn't own the stream).
fn split_packets(buf: &[u8]) -> Vec<&[u8]> {
    let mut packets = Vec::new();
    let mut pos = 0usize;
    while pos + PACKET_HDR_SIZE <= buf.len() {
        let pkt_type = buf[pos + PACKET_TYPE_OFFSET];
        let len = if pkt_type == PT_EOS {
            PACKET_HDR_SIZE
        } else {
            let next = u32::from_be_bytes(
                buf[pos + PACKET_NEXT_OFFSET..pos + PACKET_NEXT_OFFSET + 4]
                    .try_into()
                    .unwrap(),
            ) as usize;
            if next == 0 {
                break;
            }
            next
        };
        if pos + len > buf.len() {
            break;
        }
        packets.push(&buf[pos..pos + len]);
        pos += len;
        if pkt_type == PT_EOS {
            break;
        }
    }
    packets
}

fn write_planar_frame<W: Write>(w: &mut W, frame: &Frame) -> io::Result<()> {
    let hs = frame.subsamp.h_shift();
    let vs = frame.subsamp.v_shift();
    let mut row = Vec::new();
    for c in 0..3 {
        let (cw, ch) = if c == 0 {
            (frame.width, frame.height)
        } else {
            (round_shift(frame.width, hs), round_shift(frame.height, vs))
        };
        let plane = frame.plane(c);
        row.resize(cw as usize, 0);
        for j in 0..ch {
            for i in 0..cw {
                row[i as usize] = plane.get(i, j);
            }
            w.write_all(&row)?;
        }
    }
    Ok(())
}

fn run_decode(args: DecodeArgs) -> Result<(), CliError> {
    let data = std::fs::read(&args.input)?;
    let mut dec = Decoder::new();
    let mut output = BufWriter::new(File::create(&args.output)?);
    let mut decoded = 0u32;

    for pkt in split_packets(&data) {
        match dec.decode(pkt) {
            Ok(DecodeEvent::Metadata(m)) => {
                log::info!("stream metadata: {}x{} {:?}", m.width, m.height, m.subsamp);
            }
            Ok(DecodeEvent::Frame { fnum, frame }) => {
                write_planar_frame(&mut output, &frame)?;
                decoded += 1;
                log::debug!("decoded frame {fnum}");
            }
            Ok(DecodeEvent::EndOfStream) => break,
            Ok(DecodeEvent::Skipped) => {}
            Err(e) => log::warn!("dropping packet: {e}"),
        }
    }

    output.flush()?;
    log::info!("decoded {decoded} frames to {}", args.output);
    Ok(())
}

//! RIFF/WAVE container codec
//!
//! Only what the tester needs: a canonical 44-byte PCM header on write, and a
//! tolerant chunk scanner on read that skips oversized `fmt ` chunks and
//! unknown chunk types by their declared length.
//!
//! Capture files are written without knowing their final size. The header is
//! reserved up front with a zero byte count and rewritten in place by
//! [`update_header`] once the data is complete, so nothing is buffered in
//! memory.

use crate::error::{BatError, Result};
use crate::session::TestSession;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const RIFF_MAGIC: &[u8; 4] = b"RIFF";
const WAVE_MAGIC: &[u8; 4] = b"WAVE";
const FMT_CHUNK: &[u8; 4] = b"fmt ";
const DATA_CHUNK: &[u8; 4] = b"data";

/// Size of the header written by [`write_header`]
pub const WAV_HEADER_LEN: u64 = 44;

/// Length of the PCM `fmt ` chunk body
const FMT_BODY_LEN: u32 = 16;

pub const WAV_FORMAT_PCM: u16 = 1;
pub const WAV_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// The RIFF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    /// Bytes following the 8-byte RIFF preamble
    pub length: u32,
}

/// Contents of the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bytes_per_second: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// PCM format description
    pub fn pcm(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        let block_align = channels * bits_per_sample.div_ceil(8);
        Self {
            format_tag: WAV_FORMAT_PCM,
            channels,
            sample_rate,
            bytes_per_second: sample_rate * u32::from(block_align),
            block_align,
            bits_per_sample,
        }
    }

    /// PCM format description for a session's stream
    pub fn from_session(session: &TestSession) -> Self {
        Self::pcm(
            session.channels(),
            session.sample_rate(),
            session.format().bits(),
        )
    }

    fn parse(body: &[u8; FMT_BODY_LEN as usize]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        Self {
            format_tag: u16_at(0),
            channels: u16_at(2),
            sample_rate: u32_at(4),
            bytes_per_second: u32_at(8),
            block_align: u16_at(12),
            bits_per_sample: u16_at(14),
        }
    }
}

/// Header, format and data chunk of one WAV file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavContainer {
    pub header: WavHeader,
    pub format: WavFormat,
    /// Length of the `data` chunk body in bytes
    pub data_length: u32,
}

impl WavContainer {
    /// Derive every length field from the number of data bytes
    pub fn new(format: WavFormat, data_bytes: u64) -> Self {
        let max_data = u64::from(u32::MAX) - (WAV_HEADER_LEN - 8);
        let data_length = data_bytes.min(max_data) as u32;
        Self {
            header: WavHeader {
                length: data_length + (WAV_HEADER_LEN - 8) as u32,
            },
            format,
            data_length,
        }
    }

    /// Serialize as a canonical 44-byte header
    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN as usize] {
        let mut out = [0u8; WAV_HEADER_LEN as usize];
        let f = &self.format;
        out[0..4].copy_from_slice(RIFF_MAGIC);
        out[4..8].copy_from_slice(&self.header.length.to_le_bytes());
        out[8..12].copy_from_slice(WAVE_MAGIC);
        out[12..16].copy_from_slice(FMT_CHUNK);
        out[16..20].copy_from_slice(&FMT_BODY_LEN.to_le_bytes());
        out[20..22].copy_from_slice(&f.format_tag.to_le_bytes());
        out[22..24].copy_from_slice(&f.channels.to_le_bytes());
        out[24..28].copy_from_slice(&f.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&f.bytes_per_second.to_le_bytes());
        out[32..34].copy_from_slice(&f.block_align.to_le_bytes());
        out[34..36].copy_from_slice(&f.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(DATA_CHUNK);
        out[40..44].copy_from_slice(&self.data_length.to_le_bytes());
        out
    }
}

/// What [`read_header`] learned about a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub format: WavFormat,
    /// Offset of the first data byte
    pub data_offset: u64,
    /// Declared length of the data chunk
    pub data_length: u32,
    /// Frames to analyze
    pub frames: u64,
}

/// Write a header for `byte_count` data bytes at the current position
pub fn write_header<W: Write>(writer: &mut W, format: WavFormat, byte_count: u64) -> Result<()> {
    writer.write_all(&WavContainer::new(format, byte_count).to_bytes())?;
    Ok(())
}

/// Rewrite the header at the start of the stream, then return to its end
pub fn update_header<W: Write + Seek>(
    writer: &mut W,
    format: WavFormat,
    byte_count: u64,
) -> Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    write_header(writer, format, byte_count)?;
    writer.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Scan a WAV stream up to the start of its data
///
/// The frame count covers the whole data chunk when `local` is set. For a
/// capture from real hardware only the first half is kept, which stays clear
/// of the tail recorded after playback stopped.
pub fn read_header<R: Read + Seek>(reader: &mut R, local: bool) -> Result<WavInfo> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff)?;
    if &riff[0..4] != RIFF_MAGIC || &riff[8..12] != WAVE_MAGIC {
        return Err(BatError::Format("missing RIFF/WAVE magic".into()));
    }

    let mut format: Option<WavFormat> = None;
    loop {
        let mut chunk = [0u8; 8];
        reader.read_exact(&mut chunk)?;
        let length = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        let id = &chunk[0..4];

        if id == FMT_CHUNK {
            if length < FMT_BODY_LEN {
                return Err(BatError::Format(format!("fmt chunk too short: {length} bytes")));
            }
            let mut body = [0u8; FMT_BODY_LEN as usize];
            reader.read_exact(&mut body)?;
            let parsed = WavFormat::parse(&body);
            if parsed.format_tag != WAV_FORMAT_PCM && parsed.format_tag != WAV_FORMAT_EXTENSIBLE {
                return Err(BatError::Format(format!(
                    "unsupported format tag {:#06x}",
                    parsed.format_tag
                )));
            }
            if parsed.channels == 0 || parsed.block_align == 0 {
                return Err(BatError::Format("fmt chunk describes empty frames".into()));
            }
            reader.seek(SeekFrom::Current(i64::from(length - FMT_BODY_LEN)))?;
            format = Some(parsed);
        } else if id == DATA_CHUNK {
            let format = format.ok_or_else(|| {
                BatError::Format("data chunk before fmt chunk".into())
            })?;
            let mut frames = u64::from(length) / u64::from(format.block_align);
            if !local {
                frames /= 2;
            }
            let data_offset = reader.stream_position()?;
            tracing::debug!(
                channels = format.channels,
                rate = format.sample_rate,
                bits = format.bits_per_sample,
                frames,
                "WAV header read"
            );
            return Ok(WavInfo {
                format,
                data_offset,
                data_length: length,
                frames,
            });
        } else {
            tracing::trace!(chunk = %String::from_utf8_lossy(id), length, "Skipping WAV chunk");
            reader.seek(SeekFrom::Current(i64::from(length)))?;
        }
    }
}

/// Read a header and apply its format onto the session
pub fn read_header_into<R: Read + Seek>(
    reader: &mut R,
    session: &mut TestSession,
) -> Result<WavInfo> {
    let info = read_header(reader, session.is_local())?;
    session.apply_wav_format(
        info.format.channels,
        info.format.sample_rate,
        info.format.bits_per_sample,
    )?;
    Ok(info)
}

/// Open a WAV file and scan it to the start of its data
pub fn open(path: &Path, local: bool) -> Result<(File, WavInfo)> {
    let mut file = File::open(path).map_err(|e| BatError::file(path, e))?;
    let info = read_header(&mut file, local).map_err(|e| with_path(e, path))?;
    Ok((file, info))
}

fn with_path(err: BatError, path: &Path) -> BatError {
    match err {
        BatError::Io(source) => BatError::file(path, source),
        other => other,
    }
}

/// WAV file being written whose header is finalized on [`Self::finish`]
pub struct WavFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    format: WavFormat,
    bytes_written: u64,
}

impl WavFileWriter {
    /// Create (or truncate) a file and reserve its header
    pub fn create(path: &Path, format: WavFormat) -> Result<Self> {
        let file = File::create(path).map_err(|e| BatError::file(path, e))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, format, 0).map_err(|e| with_path(e, path))?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            format,
            bytes_written: 0,
        })
    }

    /// Append interleaved PCM bytes
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| BatError::file(&self.path, e))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the final lengths into the header and flush
    pub fn finish(mut self) -> Result<u64> {
        update_header(&mut self.writer, self.format, self.bytes_written)
            .map_err(|e| with_path(e, &self.path))?;
        self.writer
            .flush()
            .map_err(|e| BatError::file(&self.path, e))?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            "WAV file finalized"
        );
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_round_trip() {
        let format = WavFormat::pcm(2, 48000, 24);
        let mut buf = Cursor::new(Vec::new());
        write_header(&mut buf, format, 6 * 1000).unwrap();
        buf.write_all(&vec![0u8; 6000]).unwrap();
        buf.set_position(0);

        let info = read_header(&mut buf, true).unwrap();
        assert_eq!(info.format, format);
        assert_eq!(info.frames, 1000);
        assert_eq!(info.data_offset, WAV_HEADER_LEN);
    }

    #[test]
    fn test_frames_halved_for_hardware_capture() {
        let mut buf = Cursor::new(Vec::new());
        write_header(&mut buf, WavFormat::pcm(1, 44100, 16), 2 * 1000).unwrap();
        buf.set_position(0);
        assert_eq!(read_header(&mut buf, false).unwrap().frames, 500);
    }

    #[test]
    fn test_update_header_in_place() {
        let format = WavFormat::pcm(1, 8000, 8);
        let mut buf = Cursor::new(Vec::new());
        write_header(&mut buf, format, 0).unwrap();
        buf.write_all(&[128u8; 80]).unwrap();
        update_header(&mut buf, format, 80).unwrap();
        assert_eq!(buf.position(), WAV_HEADER_LEN + 80);

        buf.set_position(0);
        let info = read_header(&mut buf, true).unwrap();
        assert_eq!(info.data_length, 80);
        assert_eq!(info.frames, 80);
        assert_eq!(buf.get_ref().len() as u64, WAV_HEADER_LEN + 80);
    }

    #[test]
    fn test_skips_unknown_and_oversized_chunks() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF\0\0\0\0WAVE");
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&6u32.to_le_bytes());
        bytes.extend_from_slice(b"abcdef");
        // 18-byte fmt chunk with cbSize
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&18u32.to_le_bytes());
        let fmt = WavContainer::new(WavFormat::pcm(1, 44100, 16), 0).to_bytes();
        bytes.extend_from_slice(&fmt[20..36]);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);

        let mut cursor = Cursor::new(bytes);
        let info = read_header(&mut cursor, true).unwrap();
        assert_eq!(info.format.sample_rate, 44100);
        assert_eq!(info.frames, 4);
        let mut first = [0u8; 2];
        cursor.read_exact(&mut first).unwrap();
        assert_eq!(first, [1, 0]);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut cursor = Cursor::new(b"RIFX\0\0\0\0WAVEfmt ".to_vec());
        assert!(matches!(read_header(&mut cursor, true), Err(BatError::Format(_))));
    }

    #[test]
    fn test_truncated_file_is_file_error() {
        let mut cursor = Cursor::new(b"RIFF\0\0\0\0WAVEfm".to_vec());
        let err = read_header(&mut cursor, true).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_file_writer_finalizes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let format = WavFormat::pcm(1, 16000, 16);
        let mut writer = WavFileWriter::create(&path, format).unwrap();
        writer.write_data(&[0u8; 320]).unwrap();
        writer.write_data(&[0u8; 320]).unwrap();
        assert_eq!(writer.finish().unwrap(), 640);

        let (_, info) = open(&path, true).unwrap();
        assert_eq!(info.frames, 320);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), WAV_HEADER_LEN + 640);
    }

    #[test]
    fn test_open_missing_file_names_path() {
        let err = open(Path::new("/nonexistent/in.wav"), true).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/in.wav"));
    }
}

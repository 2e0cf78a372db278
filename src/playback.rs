//! Recording and playback of computed frames. A recording is a sequence of frames appended
//! to one file; each frame is a fixed-size header, then the particle records, then the
//! surface vertices, all tightly packed in native layout.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::{cube_march::SurfaceVertex, particle::ParticleRecord};

pub const MAGIC: [u8; 4] = *b"SPH\0";
pub const VERSION: u32 = 3;

pub const IDENTITY: [[f32; 4]; 4] = [
    [1., 0., 0., 0.],
    [0., 1., 0., 0.],
    [0., 0., 1., 0.],
    [0., 0., 0., 1.],
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Not a frame: bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("Truncated {section}: expected {expected} bytes, found {found}")]
    Truncated {
        section: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Particle count mismatch: expected {expected}, found {found}")]
    ParticleCountMismatch { expected: usize, found: usize },
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Simulation time.
    pub timestamp: f64,
    pub particle_count: u32,
    pub triangle_count: u32,
    /// Smoothing radius.
    pub h: f32,
    pub dt: f32,
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub gravity: [f32; 3],
    pub damping: f32,
    /// x, y, z half-extents; w is the particle sprite size.
    pub box_limits: [f32; 4],
    pub len_cube: f32,
    pub iso_value: f32,
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            timestamp: 0.,
            particle_count: 0,
            triangle_count: 0,
            h: 0.,
            dt: 0.,
            view: IDENTITY,
            projection: IDENTITY,
            gravity: [0.; 3],
            damping: 0.,
            box_limits: [0.; 4],
            len_cube: 0.,
            iso_value: 0.,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub particles: Vec<ParticleRecord>,
    /// Three per triangle.
    pub vertices: Vec<SurfaceVertex>,
}

impl Frame {
    /// Sets the header's counts from the arrays.
    pub fn new(
        mut header: FrameHeader,
        particles: Vec<ParticleRecord>,
        vertices: Vec<SurfaceVertex>,
    ) -> Self {
        header.magic = MAGIC;
        header.version = VERSION;
        header.particle_count = particles.len() as u32;
        header.triangle_count = (vertices.len() / 3) as u32;

        Self {
            header,
            particles,
            vertices,
        }
    }

    pub fn num_triangles(&self) -> usize {
        self.vertices.len() / 3
    }
}

pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<(), FrameError> {
    w.write_all(bytemuck::bytes_of(&frame.header))?;
    w.write_all(bytemuck::cast_slice(&frame.particles))?;
    w.write_all(bytemuck::cast_slice(&frame.vertices))?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly, before a header.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut header = FrameHeader::zeroed();
    let buf = bytemuck::bytes_of_mut(&mut header);
    let expected = buf.len();

    match read_full(r, buf)? {
        0 => return Ok(None),
        n if n < expected => {
            return Err(FrameError::Truncated {
                section: "header",
                expected,
                found: n,
            })
        }
        _ => (),
    }

    if header.magic != MAGIC {
        return Err(FrameError::BadMagic(header.magic));
    }
    if header.version != VERSION {
        return Err(FrameError::VersionMismatch {
            expected: VERSION,
            found: header.version,
        });
    }

    let particles = read_section(r, header.particle_count as usize, "particles")?;
    let num_vertices = (header.triangle_count as usize).saturating_mul(3);
    let vertices = read_section(r, num_vertices, "vertices")?;

    Ok(Some(Frame {
        header,
        particles,
        vertices,
    }))
}

/// Read `count` records. The counts come from an untrusted header, so memory is only
/// committed for bytes actually present in the stream.
fn read_section<R: Read, T: Pod>(
    r: &mut R,
    count: usize,
    section: &'static str,
) -> Result<Vec<T>, FrameError> {
    let Some(expected) = count.checked_mul(std::mem::size_of::<T>()) else {
        return Err(FrameError::Truncated {
            section,
            expected: usize::MAX,
            found: 0,
        });
    };

    let mut bytes = Vec::new();
    r.by_ref().take(expected as u64).read_to_end(&mut bytes)?;

    if bytes.len() < expected {
        return Err(FrameError::Truncated {
            section,
            expected,
            found: bytes.len(),
        });
    }

    let mut result = vec![T::zeroed(); count];
    bytemuck::cast_slice_mut::<T, u8>(&mut result).copy_from_slice(&bytes);
    Ok(result)
}

/// Like `read_exact`, but reports how much was read when the stream ends early.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Appends frames to a recording.
pub struct FrameWriter<W: Write> {
    inner: W,
    frames_written: usize,
}

impl FrameWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames_written: 0,
        }
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.inner, frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn finish(mut self) -> Result<W, FrameError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads frames from a recording, in order. After any error the stream position is
/// unknown, so iteration stops.
pub struct FrameReader<R: Read> {
    inner: R,
    done: bool,
}

impl FrameReader<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match read_frame(&mut self.inner) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_frame(n_particles: usize, n_tris: usize) -> Frame {
        let particles = (0..n_particles)
            .map(|i| {
                let f = i as f32;
                ParticleRecord {
                    position: [f, -f, 0.5 * f],
                    color: [0.2, 0.6, 0.9, 0.8],
                    density: 1_000. + f,
                    velocity: [0.1 * f, 0., -0.1],
                    pressure: f - 3.,
                }
            })
            .collect();

        let vertices = (0..n_tris * 3)
            .map(|i| SurfaceVertex {
                position: [i as f32, 1., 2.],
                normal: [0., 1., 0.],
            })
            .collect();

        let header = FrameHeader {
            timestamp: 1.25,
            h: 0.06,
            dt: 0.016,
            gravity: [0., -9.81, 0.],
            damping: 0.3,
            box_limits: [0.5, 0.25, 0.5, 0.0625],
            len_cube: 0.015,
            iso_value: 0.6,
            ..Default::default()
        };

        Frame::new(header, particles, vertices)
    }

    #[test]
    fn header_has_no_padding() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), 200);
    }

    #[test]
    fn frame_round_trip() {
        let frame = sample_frame(17, 5);
        assert_eq!(frame.header.particle_count, 17);
        assert_eq!(frame.header.triangle_count, 5);

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(buf.len(), 200 + 17 * 48 + 15 * 24);

        let loaded = read_frame(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(loaded, frame);
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&loaded.particles),
            bytemuck::cast_slice::<_, u8>(&frame.particles)
        );
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&loaded.vertices),
            bytemuck::cast_slice::<_, u8>(&frame.vertices)
        );
    }

    #[test]
    fn empty_stream_has_no_frames() {
        assert!(read_frame(&mut Cursor::new(Vec::<u8>::new())).unwrap().is_none());
        assert_eq!(FrameReader::new(Cursor::new(Vec::<u8>::new())).count(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_frame(2, 1)).unwrap();
        buf[0] = b'X';

        assert!(matches!(
            read_frame(&mut Cursor::new(&buf)),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let mut frame = sample_frame(2, 1);
        frame.header.version = 2;
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();

        assert!(matches!(
            read_frame(&mut Cursor::new(&buf)),
            Err(FrameError::VersionMismatch {
                expected: VERSION,
                found: 2
            })
        ));
    }

    #[test]
    fn truncation_is_reported_by_section() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_frame(4, 2)).unwrap();

        let cut = |len: usize| read_frame(&mut Cursor::new(&buf[..len]));

        assert!(matches!(cut(100), Err(FrameError::Truncated { section: "header", .. })));
        assert!(matches!(cut(210), Err(FrameError::Truncated { section: "particles", .. })));
        assert!(matches!(
            cut(buf.len() - 1),
            Err(FrameError::Truncated { section: "vertices", .. })
        ));
    }

    #[test]
    fn huge_counts_without_data_are_truncated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_frame(0, 0)).unwrap();
        buf[16..20].copy_from_slice(&u32::MAX.to_ne_bytes());

        match read_frame(&mut Cursor::new(&buf)) {
            Err(FrameError::Truncated {
                section: "particles",
                expected,
                found: 0,
            }) => assert_eq!(expected, u32::MAX as usize * 48),
            other => panic!("unexpected: {other:?}"),
        }

        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_frame(1, 0)).unwrap();
        buf[20..24].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(&buf)),
            Err(FrameError::Truncated { section: "vertices", found: 0, .. })
        ));
    }

    #[test]
    fn reader_stops_after_error() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write(&sample_frame(3, 1)).unwrap();
        writer.write(&sample_frame(3, 2)).unwrap();
        assert_eq!(writer.frames_written(), 2);
        writer.finish().unwrap();

        // Chop the second frame short.
        buf.truncate(buf.len() - 10);

        let results: Vec<_> = FrameReader::new(Cursor::new(buf)).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::sys::memfd::{memfd_create, MFdFlags};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::fourcc_to_string;
use crate::capture::{CaptureDevice, PixelFormat, StreamRole, V4l2Camera};
use crate::display::{ConnectorId, DisplayDevice, KmsCard, PipeId};
use crate::error::{Error, Result};

const MAX_VIDEO_NODES: u32 = 64;

/// Anonymous shared memory of `len` bytes, closed on exec.
pub fn create_memfd(name: &str, len: usize) -> io::Result<File> {
    let name = CString::new(name).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let file = File::from(memfd_create(name.as_c_str(), MFdFlags::MFD_CLOEXEC)?);
    file.set_len(len as u64)?;
    Ok(file)
}

fn video_nodes() -> impl Iterator<Item = PathBuf> {
    (0..MAX_VIDEO_NODES)
        .map(|i| PathBuf::from(format!("/dev/video{i}")))
        .filter(|path| path.exists())
}

fn is_streaming_capture(dev: &Device) -> Option<v4l::capability::Capabilities> {
    let caps = dev.query_caps().ok()?;
    caps.capabilities
        .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        .then_some(caps)
}

/// Finds a capture node, preferring one that offers `format`.
pub fn auto_detect_device(format: PixelFormat) -> Result<PathBuf> {
    info!("Auto-detecting capture devices...");

    let wanted = FourCC::new(&format.v4l2_fourcc());
    let mut fallback = None;
    for path in video_nodes() {
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Some(caps) = is_streaming_capture(&dev) else {
            continue;
        };
        let offers = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|f| f.fourcc == wanted))
            .unwrap_or(false);
        if offers {
            info!(path = %path.display(), card = %caps.card, ?format, "found capture device");
            return Ok(path);
        }
        debug!(path = %path.display(), card = %caps.card, "capture device lacks format");
        fallback.get_or_insert(path);
    }

    fallback.ok_or_else(|| Error::Configuration("no suitable capture device found".into()))
}

/// Requested stream for the viewfinder proposal printed by [`list_cameras`].
#[derive(Debug, Clone, Copy)]
pub struct Proposal {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

/// Prints every video capture node with its formats, sizes, frame intervals
/// and the configuration it proposes for the viewfinder role.
pub fn list_cameras(out: &mut impl Write, proposal: Proposal) -> io::Result<()> {
    let mut found = 0;
    for path in video_nodes() {
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Some(caps) = is_streaming_capture(&dev) else {
            continue;
        };
        found += 1;

        writeln!(out, "{}: {}", path.display(), caps.card)?;
        writeln!(out, "  driver: {} {}", caps.driver, version(caps.version))?;
        writeln!(out, "  bus: {}", caps.bus)?;
        writeln!(out, "  capabilities: {}", caps.capabilities)?;

        for desc in dev.enum_formats().unwrap_or_default() {
            let fourcc = desc.fourcc;
            writeln!(out, "  format {} ({})", fourcc, desc.description)?;
            for size in dev.enum_framesizes(fourcc).unwrap_or_default() {
                match size.size {
                    FrameSizeEnum::Discrete(d) => {
                        let intervals = frame_intervals(&dev, fourcc, d.width, d.height);
                        writeln!(out, "    {}x{} {}", d.width, d.height, intervals)?;
                    }
                    FrameSizeEnum::Stepwise(s) => writeln!(
                        out,
                        "    {}x{} - {}x{} step {}x{}",
                        s.min_width, s.min_height, s.max_width, s.max_height, s.step_width,
                        s.step_height
                    )?,
                }
            }
        }
        drop(dev);

        match V4l2Camera::open(&path, proposal.width, proposal.height, proposal.format, proposal.fps)
            .and_then(|mut camera| camera.configure(StreamRole::Viewfinder))
        {
            Ok((config, status)) => writeln!(out, "  viewfinder: {config} [{status:?}]")?,
            Err(err) => writeln!(out, "  viewfinder: unavailable ({err})")?,
        }
    }

    if found == 0 {
        writeln!(out, "no video capture devices found")?;
    }
    Ok(())
}

fn version(raw: (u8, u8, u8)) -> String {
    format!("{}.{}.{}", raw.0, raw.1, raw.2)
}

fn frame_intervals(dev: &Device, fourcc: FourCC, width: u32, height: u32) -> String {
    let rates: Vec<_> = dev
        .enum_frameintervals(fourcc, width, height)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|interval| match interval.interval {
            FrameIntervalEnum::Discrete(f) if f.numerator != 0 => {
                Some(format!("{:.1}", f64::from(f.denominator) / f64::from(f.numerator)))
            }
            _ => None,
        })
        .collect();
    if rates.is_empty() {
        String::new()
    } else {
        format!("@ {} fps", rates.join(", "))
    }
}

/// Prints card capabilities then the generic display topology.
pub fn list_kms(out: &mut impl Write, path: &Path) -> Result<()> {
    let card = KmsCard::open(path)?;
    let io_err = |err: io::Error| Error::device("write listing", err);

    let driver = card.driver().unwrap_or_else(|err| format!("unknown ({err})"));
    writeln!(out, "{}: {driver}", path.display()).map_err(io_err)?;
    for cap in card.capabilities() {
        match cap.value {
            Some(value) => writeln!(out, "  cap {}: {value}", cap.name),
            None => writeln!(out, "  cap {}: unsupported", cap.name),
        }
        .map_err(io_err)?;
    }
    if let Ok(((min_w, min_h), (max_w, max_h))) = card.size_limits() {
        writeln!(out, "  framebuffer size {min_w}x{min_h} - {max_w}x{max_h}").map_err(io_err)?;
    }

    list_displays(out, &card)
}

/// Connectors, their pipes and modes, then every plane with its formats.
pub fn list_displays<D: DisplayDevice + ?Sized>(out: &mut impl Write, device: &D) -> Result<()> {
    let io_err = |err: io::Error| Error::device("write listing", err);
    let connectors = device
        .connectors()
        .map_err(|err| Error::device("list connectors", err))?;

    for conn in &connectors {
        writeln!(
            out,
            "connector {} {}: {} {}x{}mm subpixel {}",
            conn.id,
            conn.name,
            if conn.connected { "connected" } else { "disconnected" },
            conn.mm_width,
            conn.mm_height,
            conn.subpixel,
        )
        .map_err(io_err)?;

        if let Some(pipe) = conn.pipe.and_then(|id| device.pipe(id).ok()) {
            let mode = pipe
                .mode
                .as_ref()
                .map(|m| format!("{} {}x{}@{}", m.name, m.width, m.height, m.refresh))
                .unwrap_or_else(|| "no mode".into());
            writeln!(
                out,
                "  pipe {} {}: {mode} at {},{}",
                pipe.id,
                if pipe.active { "active" } else { "inactive" },
                pipe.x,
                pipe.y,
            )
            .map_err(io_err)?;
        }
        for mode in &conn.modes {
            writeln!(out, "  mode {} {}x{}@{}", mode.name, mode.width, mode.height, mode.refresh)
                .map_err(io_err)?;
        }
    }

    let planes = device.planes().map_err(|err| Error::device("list planes", err))?;
    for plane in planes {
        let pipe = plane.pipe.map_or_else(|| "-".into(), |p| p.to_string());
        let fb = plane.framebuffer.map_or_else(|| "-".into(), |f| f.to_string());
        let formats: Vec<_> = plane.formats.iter().map(|&f| fourcc_to_string(f)).collect();
        write!(out, "plane {} {:?} pipe {pipe} fb {fb}", plane.id, plane.kind).map_err(io_err)?;
        if let Some((x, y, w, h)) = plane.position {
            write!(out, " at {x},{y} {w}x{h}").map_err(io_err)?;
        }
        writeln!(out, "\n  formats: {}", formats.join(" ")).map_err(io_err)?;
    }
    Ok(())
}

/// Picks the configured connector, else the first connected one whose pipe
/// is lit.
pub fn select_output<D: DisplayDevice + ?Sized>(
    device: &D,
    wanted: Option<ConnectorId>,
) -> Result<(ConnectorId, PipeId)> {
    let connectors = device
        .connectors()
        .map_err(|err| Error::device("list connectors", err))?;

    if let Some(wanted) = wanted {
        let conn = connectors
            .iter()
            .find(|c| c.id == wanted)
            .ok_or_else(|| Error::Configuration(format!("connector {wanted} not found")))?;
        let pipe = conn
            .pipe
            .ok_or_else(|| Error::Configuration(format!("connector {wanted} has no pipe")))?;
        return Ok((conn.id, pipe));
    }

    connectors
        .iter()
        .filter(|c| c.connected)
        .find_map(|c| {
            let pipe = c.pipe?;
            device
                .pipe(pipe)
                .ok()
                .filter(|info| info.active)
                .map(|_| (c.id, pipe))
        })
        .ok_or_else(|| Error::Configuration("no connected output with an active pipe".into()))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom};

    use super::*;
    use crate::display::VirtualCard;

    #[test]
    fn memfd_has_requested_size() {
        let mut file = create_memfd("twincam-test", 4096).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);

        file.write_all(b"frame").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut back = [0u8; 5];
        file.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"frame");
    }

    #[test]
    fn memfd_is_closed_on_exec() {
        use std::os::fd::AsFd;

        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let file = create_memfd("twincam-cloexec", 64).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(file.as_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn memfd_rejects_interior_nul() {
        let err = create_memfd("bad\0name", 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn first_lit_connector_is_selected() {
        let card = VirtualCard::manual(1280, 720);
        let (connector, pipe) = select_output(&card, None).unwrap();
        assert_eq!(connector, card.connector_id());
        assert_eq!(pipe, card.pipe_id());
    }

    #[test]
    fn unknown_connector_is_a_configuration_error() {
        let card = VirtualCard::manual(1280, 720);
        let err = select_output(&card, Some(ConnectorId(999))).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn listing_shows_connector_and_plane_formats() {
        let card = VirtualCard::manual(1280, 720);
        let mut out = Vec::new();
        list_displays(&mut out, &card).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains(&format!("connector {}", card.connector_id())));
        assert!(text.contains("connected"));
        assert!(text.contains("1280x720"));
        assert!(text.contains("XR24"));
        assert!(text.contains("NV12"));
    }
}

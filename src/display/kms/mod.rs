//! Atomic KMS backend for `/dev/dri/cardN`

mod ffi;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::frame::fourcc_to_string;
use crate::display::{
    AtomicCommitRequest, CommitError, CommitEvent, CommitHandle, CommitHandler, CommitTracker,
    ConnectorId, ConnectorInfo, DisplayDevice, FramebufferId, Mode, PipeId, PipeInfo, PlaneId,
    PlaneInfo, PlaneKind, PlaneProperty,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{Buffer, MemoryKind};

use ffi::*;

/// Card-wide capability as reported by `DRM_IOCTL_GET_CAP`.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub name: &'static str,
    pub value: Option<u64>,
}

#[derive(Debug, Default)]
struct Resources {
    crtcs: Vec<u32>,
    connectors: Vec<u32>,
    min_size: (u32, u32),
    max_size: (u32, u32),
}

pub struct KmsCard {
    name: String,
    file: Arc<File>,
    plane_props: HashMap<PlaneId, HashMap<String, u32>>,
    tracker: Arc<CommitTracker>,
    next_commit: u64,
    reader: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl KmsCard {
    /// Opens the card and enables the universal planes and atomic client caps.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::device("open card", err))?;

        for capability in [DRM_CLIENT_CAP_UNIVERSAL_PLANES, DRM_CLIENT_CAP_ATOMIC] {
            let cap = drm_set_client_cap {
                capability,
                value: 1,
            };
            // SAFETY: cap is a valid drm_set_client_cap for the duration of the call
            unsafe { drm_ioctl_set_client_cap(file.as_raw_fd(), &cap) }
                .map_err(|err| Error::device("set client cap", err))?;
        }

        let file = Arc::new(file);
        let tracker = Arc::new(CommitTracker::default());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let (file, tracker, stop) = (file.clone(), tracker.clone(), stop.clone());
            thread::Builder::new()
                .name("kms-events".into())
                .spawn(move || read_events(&file, &tracker, &stop))
                .map_err(|err| Error::device("spawn event thread", err))?
        };

        let card = Self {
            name: path.display().to_string(),
            file,
            plane_props: HashMap::new(),
            tracker,
            next_commit: 1,
            reader: Some((stop, reader)),
        };
        info!(driver = %card.driver().unwrap_or_default(), "card opened");
        Ok(card)
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Driver name, version and description.
    pub fn driver(&self) -> std::result::Result<String, DeviceError> {
        let (mut name, mut date, mut desc) = ([0u8; 64], [0u8; 64], [0u8; 128]);
        let mut version = drm_version {
            name_len: name.len(),
            name: name.as_mut_ptr().cast(),
            date_len: date.len(),
            date: date.as_mut_ptr().cast(),
            desc_len: desc.len(),
            desc: desc.as_mut_ptr().cast(),
            ..Default::default()
        };
        // SAFETY: every pointer references a live buffer of the advertised length
        unsafe { drm_ioctl_version(self.fd(), &mut version) }?;
        let take = |raw: &[u8], len: usize| cstr(&raw[..len.min(raw.len())]);
        Ok(format!(
            "{} {}.{}.{} ({})",
            take(&name, version.name_len),
            version.version_major,
            version.version_minor,
            version.version_patchlevel,
            take(&desc, version.desc_len),
        ))
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        [
            ("DUMB_BUFFER", DRM_CAP_DUMB_BUFFER),
            ("PRIME", DRM_CAP_PRIME),
            ("TIMESTAMP_MONOTONIC", DRM_CAP_TIMESTAMP_MONOTONIC),
            ("ASYNC_PAGE_FLIP", DRM_CAP_ASYNC_PAGE_FLIP),
            ("CURSOR_WIDTH", DRM_CAP_CURSOR_WIDTH),
            ("CURSOR_HEIGHT", DRM_CAP_CURSOR_HEIGHT),
            ("ADDFB2_MODIFIERS", DRM_CAP_ADDFB2_MODIFIERS),
            ("CRTC_IN_VBLANK_EVENT", DRM_CAP_CRTC_IN_VBLANK_EVENT),
        ]
        .into_iter()
        .map(|(name, capability)| {
            let mut cap = drm_get_cap {
                capability,
                value: 0,
            };
            // SAFETY: cap is a valid drm_get_cap for the duration of the call
            let value = unsafe { drm_ioctl_get_cap(self.fd(), &mut cap) }
                .ok()
                .map(|_| cap.value);
            Capability { name, value }
        })
        .collect()
    }

    fn resources(&self) -> std::result::Result<Resources, DeviceError> {
        let mut res = drm_mode_card_res::default();
        // SAFETY: counting call, no arrays attached
        unsafe { drm_ioctl_mode_getresources(self.fd(), &mut res) }?;

        let mut fbs = vec![0u32; res.count_fbs as usize];
        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut encoders = vec![0u32; res.count_encoders as usize];
        let mut fill = drm_mode_card_res {
            fb_id_ptr: user_ptr(&mut fbs),
            crtc_id_ptr: user_ptr(&mut crtcs),
            connector_id_ptr: user_ptr(&mut connectors),
            encoder_id_ptr: user_ptr(&mut encoders),
            count_fbs: res.count_fbs,
            count_crtcs: res.count_crtcs,
            count_connectors: res.count_connectors,
            count_encoders: res.count_encoders,
            ..Default::default()
        };
        // SAFETY: arrays are sized to the counts passed in
        unsafe { drm_ioctl_mode_getresources(self.fd(), &mut fill) }?;

        crtcs.truncate(fill.count_crtcs as usize);
        connectors.truncate(fill.count_connectors as usize);
        Ok(Resources {
            crtcs,
            connectors,
            min_size: (fill.min_width, fill.min_height),
            max_size: (fill.max_width, fill.max_height),
        })
    }

    /// Smallest and largest framebuffer the card accepts.
    pub fn size_limits(&self) -> std::result::Result<((u32, u32), (u32, u32)), DeviceError> {
        let res = self.resources()?;
        Ok((res.min_size, res.max_size))
    }

    fn connector(&self, id: u32) -> std::result::Result<ConnectorInfo, DeviceError> {
        let mut conn = drm_mode_get_connector {
            connector_id: id,
            ..Default::default()
        };
        // SAFETY: counting call, no arrays attached
        unsafe { drm_ioctl_mode_getconnector(self.fd(), &mut conn) }?;

        let mut modes = vec![drm_mode_modeinfo::default(); conn.count_modes as usize];
        let mut encoders = vec![0u32; conn.count_encoders as usize];
        let mut props = vec![0u32; conn.count_props as usize];
        let mut values = vec![0u64; conn.count_props as usize];
        let mut fill = drm_mode_get_connector {
            connector_id: id,
            modes_ptr: user_ptr(&mut modes),
            count_modes: conn.count_modes,
            encoders_ptr: user_ptr(&mut encoders),
            count_encoders: conn.count_encoders,
            props_ptr: user_ptr(&mut props),
            prop_values_ptr: user_ptr(&mut values),
            count_props: conn.count_props,
            ..Default::default()
        };
        // SAFETY: arrays are sized to the counts passed in
        unsafe { drm_ioctl_mode_getconnector(self.fd(), &mut fill) }?;
        modes.truncate(fill.count_modes.min(conn.count_modes) as usize);

        let pipe = match fill.encoder_id {
            0 => None,
            encoder_id => {
                let mut encoder = drm_mode_get_encoder {
                    encoder_id,
                    ..Default::default()
                };
                // SAFETY: encoder is a valid drm_mode_get_encoder
                unsafe { drm_ioctl_mode_getencoder(self.fd(), &mut encoder) }?;
                (encoder.crtc_id != 0).then_some(PipeId(encoder.crtc_id))
            }
        };

        Ok(ConnectorInfo {
            id: ConnectorId(id),
            name: format!(
                "{}-{}",
                connector_type_name(fill.connector_type),
                fill.connector_type_id
            ),
            connected: fill.connection == DRM_MODE_CONNECTED,
            pipe,
            mm_width: fill.mm_width,
            mm_height: fill.mm_height,
            subpixel: subpixel_name(fill.subpixel),
            modes: modes.iter().map(mode).collect(),
        })
    }

    /// Property name to (id, current value) for one object.
    fn properties(
        &self,
        obj_id: u32,
        obj_type: u32,
    ) -> std::result::Result<HashMap<String, (u32, u64)>, DeviceError> {
        let mut count = drm_mode_obj_get_properties {
            obj_id,
            obj_type,
            ..Default::default()
        };
        // SAFETY: counting call, no arrays attached
        unsafe { drm_ioctl_mode_obj_getproperties(self.fd(), &mut count) }?;

        let mut ids = vec![0u32; count.count_props as usize];
        let mut values = vec![0u64; count.count_props as usize];
        let mut fill = drm_mode_obj_get_properties {
            obj_id,
            obj_type,
            props_ptr: user_ptr(&mut ids),
            prop_values_ptr: user_ptr(&mut values),
            count_props: count.count_props,
        };
        // SAFETY: arrays are sized to the count passed in
        unsafe { drm_ioctl_mode_obj_getproperties(self.fd(), &mut fill) }?;

        let mut properties = HashMap::with_capacity(ids.len());
        for (&prop_id, &value) in ids.iter().zip(&values).take(fill.count_props as usize) {
            let mut prop = drm_mode_get_property {
                prop_id,
                ..Default::default()
            };
            // SAFETY: no value or enum arrays attached
            unsafe { drm_ioctl_mode_getproperty(self.fd(), &mut prop) }?;
            properties.insert(cstr(&prop.name), (prop_id, value));
        }
        Ok(properties)
    }

    fn plane_property_ids(
        &mut self,
        plane: PlaneId,
    ) -> std::result::Result<&HashMap<String, u32>, DeviceError> {
        if !self.plane_props.contains_key(&plane) {
            let ids = self
                .properties(plane.0, DRM_MODE_OBJECT_PLANE)?
                .into_iter()
                .map(|(name, (id, _))| (name, id))
                .collect();
            self.plane_props.insert(plane, ids);
        }
        self.plane_props
            .get(&plane)
            .ok_or_else(|| DeviceError::new(libc::ENOENT, format!("plane {plane}")))
    }
}

impl DisplayDevice for KmsCard {
    fn name(&self) -> &str {
        &self.name
    }

    fn connectors(&self) -> std::result::Result<Vec<ConnectorInfo>, DeviceError> {
        self.resources()?
            .connectors
            .iter()
            .map(|&id| self.connector(id))
            .collect()
    }

    fn pipe(&self, pipe: PipeId) -> std::result::Result<PipeInfo, DeviceError> {
        let mut crtc = drm_mode_crtc {
            crtc_id: pipe.0,
            ..Default::default()
        };
        // SAFETY: crtc is a valid drm_mode_crtc, no connector array attached
        unsafe { drm_ioctl_mode_getcrtc(self.fd(), &mut crtc) }?;

        let active = crtc.mode_valid != 0;
        Ok(PipeInfo {
            id: pipe,
            active,
            x: crtc.x,
            y: crtc.y,
            width: if active { u32::from(crtc.mode.hdisplay) } else { 0 },
            height: if active { u32::from(crtc.mode.vdisplay) } else { 0 },
            mode: active.then(|| mode(&crtc.mode)),
        })
    }

    fn planes(&self) -> std::result::Result<Vec<PlaneInfo>, DeviceError> {
        let crtcs = self.resources()?.crtcs;

        let mut res = drm_mode_get_plane_res::default();
        // SAFETY: counting call, no array attached
        unsafe { drm_ioctl_mode_getplaneresources(self.fd(), &mut res) }?;
        let mut ids = vec![0u32; res.count_planes as usize];
        let mut fill = drm_mode_get_plane_res {
            plane_id_ptr: user_ptr(&mut ids),
            count_planes: res.count_planes,
        };
        // SAFETY: array is sized to the count passed in
        unsafe { drm_ioctl_mode_getplaneresources(self.fd(), &mut fill) }?;
        ids.truncate(fill.count_planes as usize);

        let mut planes = Vec::with_capacity(ids.len());
        for plane_id in ids {
            let mut plane = drm_mode_get_plane {
                plane_id,
                ..Default::default()
            };
            // SAFETY: counting call, no format array attached
            unsafe { drm_ioctl_mode_getplane(self.fd(), &mut plane) }?;
            let mut formats = vec![0u32; plane.count_format_types as usize];
            let mut fill = drm_mode_get_plane {
                plane_id,
                count_format_types: plane.count_format_types,
                format_type_ptr: user_ptr(&mut formats),
                ..Default::default()
            };
            // SAFETY: array is sized to the count passed in
            unsafe { drm_ioctl_mode_getplane(self.fd(), &mut fill) }?;

            let props = self.properties(plane_id, DRM_MODE_OBJECT_PLANE)?;
            let value = |name: &str| props.get(name).map(|&(_, v)| v);
            let kind = match value("type") {
                Some(1) => PlaneKind::Primary,
                Some(2) => PlaneKind::Cursor,
                _ => PlaneKind::Overlay,
            };
            let position = match (
                value("CRTC_X"),
                value("CRTC_Y"),
                value("CRTC_W"),
                value("CRTC_H"),
            ) {
                (Some(x), Some(y), Some(w), Some(h)) => {
                    Some((x as i64 as i32, y as i64 as i32, w as u32, h as u32))
                }
                _ => None,
            };

            planes.push(PlaneInfo {
                id: PlaneId(plane_id),
                pipe: (fill.crtc_id != 0).then_some(PipeId(fill.crtc_id)),
                possible_pipes: crtcs
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| fill.possible_crtcs & (1 << index) != 0)
                    .map(|(_, &id)| PipeId(id))
                    .collect(),
                framebuffer: (fill.fb_id != 0).then_some(FramebufferId(fill.fb_id)),
                position,
                kind,
                formats,
            });
        }
        Ok(planes)
    }

    fn import_buffer(&mut self, buffer: &Buffer) -> Result<FramebufferId> {
        if buffer.kind() == MemoryKind::Memfd {
            return Err(Error::Configuration(format!(
                "buffer {} is plain shared memory, KMS needs a DMA-BUF",
                buffer.id()
            )));
        }
        let pixel_format = buffer.format().drm_fourcc().ok_or_else(|| {
            Error::Configuration(format!("{:?} has no scanout format", buffer.format()))
        })?;

        let mut prime = drm_prime_handle {
            fd: buffer.fd().as_raw_fd(),
            ..Default::default()
        };
        // SAFETY: prime is a valid drm_prime_handle and the fd is open
        unsafe { drm_ioctl_prime_fd_to_handle(self.fd(), &mut prime) }
            .map_err(|err| Error::device("prime import", err))?;

        let mut cmd = drm_mode_fb_cmd2 {
            width: buffer.width(),
            height: buffer.height(),
            pixel_format,
            ..Default::default()
        };
        for (index, plane) in buffer.planes().iter().enumerate().take(4) {
            cmd.handles[index] = prime.handle;
            cmd.pitches[index] = plane.stride;
            cmd.offsets[index] = plane.offset;
        }
        // SAFETY: cmd is a valid drm_mode_fb_cmd2
        let added = unsafe { drm_ioctl_mode_addfb2(self.fd(), &mut cmd) };

        // The framebuffer keeps its own reference to the GEM object.
        let close = drm_gem_close {
            handle: prime.handle,
            pad: 0,
        };
        // SAFETY: close is a valid drm_gem_close
        if let Err(err) = unsafe { drm_ioctl_gem_close(self.fd(), &close) } {
            warn!(handle = prime.handle, %err, "GEM close failed");
        }

        added.map_err(|err| Error::device("add framebuffer", err))?;
        debug!(
            buffer = %buffer.id(),
            fb = cmd.fb_id,
            format = %fourcc_to_string(pixel_format),
            "framebuffer added"
        );
        Ok(FramebufferId(cmd.fb_id))
    }

    fn release_framebuffer(&mut self, fb: FramebufferId) -> std::result::Result<(), DeviceError> {
        let mut id = fb.0;
        // SAFETY: id is a plain u32
        unsafe { drm_ioctl_mode_rmfb(self.fd(), &mut id) }?;
        Ok(())
    }

    fn atomic_commit(
        &mut self,
        request: &AtomicCommitRequest,
    ) -> std::result::Result<CommitHandle, CommitError> {
        let ids = self
            .plane_property_ids(request.plane)
            .map_err(CommitError::Device)?;

        let mut props = Vec::with_capacity(request.writes().len());
        let mut values = Vec::with_capacity(request.writes().len());
        for &(property, value) in request.writes() {
            let id = ids.get(property.name()).ok_or_else(|| {
                CommitError::Rejected(DeviceError::new(
                    libc::EINVAL,
                    format!("plane {} has no {} property", request.plane, property.name()),
                ))
            })?;
            props.push(*id);
            values.push(value);
        }

        let handle = CommitHandle(self.next_commit);
        let mut objs = [request.plane.0];
        let mut count_props = [props.len() as u32];
        let mut atomic = drm_mode_atomic {
            flags: DRM_MODE_ATOMIC_NONBLOCK | DRM_MODE_PAGE_FLIP_EVENT,
            count_objs: 1,
            objs_ptr: user_ptr(&mut objs),
            count_props_ptr: user_ptr(&mut count_props),
            props_ptr: user_ptr(&mut props),
            prop_values_ptr: user_ptr(&mut values),
            reserved: 0,
            user_data: handle.0,
        };
        // SAFETY: all arrays outlive the call and match the counts
        unsafe { drm_ioctl_mode_atomic(self.fd(), &mut atomic) }.map_err(classify)?;

        self.next_commit += 1;
        trace!(handle = handle.0, plane = %request.plane, "atomic commit queued");
        Ok(handle)
    }

    fn set_commit_handler(&mut self, handler: CommitHandler) {
        self.tracker.set_handler(handler);
    }

    fn wait_commit_done(
        &mut self,
        handle: CommitHandle,
        timeout: Duration,
    ) -> std::result::Result<CommitEvent, DeviceError> {
        self.tracker.wait(handle, timeout)
    }
}

impl Drop for KmsCard {
    fn drop(&mut self) {
        if let Some((stop, reader)) = self.reader.take() {
            stop.store(true, Ordering::Release);
            let _ = reader.join();
        }
    }
}

/// Errnos the kernel uses for configurations the hardware can't apply.
fn classify(errno: Errno) -> CommitError {
    match errno {
        Errno::EINVAL | Errno::ERANGE | Errno::ENOSPC | Errno::EBUSY => {
            CommitError::Rejected(errno.into())
        }
        other => CommitError::Device(other.into()),
    }
}

fn mode(info: &drm_mode_modeinfo) -> Mode {
    Mode {
        name: info.name(),
        width: u32::from(info.hdisplay),
        height: u32::from(info.vdisplay),
        refresh: info.vrefresh,
    }
}

fn read_events(file: &File, tracker: &CommitTracker, stop: &AtomicBool) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(100u16)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "polling card failed, commit events stop");
                return;
            }
        }

        let read = match (&*file).read(&mut buf) {
            Ok(read) => read,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                continue
            }
            Err(err) => {
                warn!(%err, "reading card events failed, commit events stop");
                return;
            }
        };
        for event in parse_events(&buf[..read]) {
            tracker.complete(event);
        }
    }
}

/// Flip-complete events in one read from the card; anything else is skipped.
fn parse_events(mut bytes: &[u8]) -> Vec<CommitEvent> {
    let u32_at = |b: &[u8], at: usize| u32::from_ne_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);

    let mut events = Vec::new();
    while bytes.len() >= 8 {
        let kind = u32_at(bytes, 0);
        let length = u32_at(bytes, 4) as usize;
        if length < 8 || length > bytes.len() {
            break;
        }
        if kind == DRM_EVENT_FLIP_COMPLETE && length >= DRM_EVENT_VBLANK_SIZE {
            let mut user_data = [0u8; 8];
            user_data.copy_from_slice(&bytes[8..16]);
            let user_data = u64::from_ne_bytes(user_data);
            let (sec, usec) = (u32_at(bytes, 16), u32_at(bytes, 20));
            events.push(CommitEvent {
                handle: CommitHandle(user_data),
                sequence: u32_at(bytes, 24),
                timestamp: Duration::new(u64::from(sec), usec.saturating_mul(1000)),
            });
        }
        bytes = &bytes[length..];
    }
    events
}

fn connector_type_name(kind: u32) -> &'static str {
    match kind {
        1 => "VGA",
        2 => "DVI-I",
        3 => "DVI-D",
        4 => "DVI-A",
        5 => "Composite",
        6 => "SVIDEO",
        7 => "LVDS",
        8 => "Component",
        9 => "DIN",
        10 => "DP",
        11 => "HDMI-A",
        12 => "HDMI-B",
        13 => "TV",
        14 => "eDP",
        15 => "Virtual",
        16 => "DSI",
        17 => "DPI",
        18 => "Writeback",
        19 => "SPI",
        20 => "USB",
        _ => "Unknown",
    }
}

fn subpixel_name(subpixel: u32) -> &'static str {
    match subpixel {
        2 => "horizontal RGB",
        3 => "horizontal BGR",
        4 => "vertical RGB",
        5 => "vertical BGR",
        6 => "none",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_event(user_data: u64, sequence: u32, sec: u32, usec: u32) -> Vec<u8> {
        let mut raw = Vec::with_capacity(DRM_EVENT_VBLANK_SIZE);
        raw.extend_from_slice(&DRM_EVENT_FLIP_COMPLETE.to_ne_bytes());
        raw.extend_from_slice(&(DRM_EVENT_VBLANK_SIZE as u32).to_ne_bytes());
        raw.extend_from_slice(&user_data.to_ne_bytes());
        raw.extend_from_slice(&sec.to_ne_bytes());
        raw.extend_from_slice(&usec.to_ne_bytes());
        raw.extend_from_slice(&sequence.to_ne_bytes());
        raw.extend_from_slice(&42u32.to_ne_bytes());
        raw
    }

    #[test]
    fn flip_events_carry_commit_handle() {
        let mut raw = flip_event(7, 100, 3, 250);
        raw.extend(flip_event(8, 101, 3, 16_917));

        let events = parse_events(&raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].handle, CommitHandle(7));
        assert_eq!(events[0].sequence, 100);
        assert_eq!(events[0].timestamp, Duration::new(3, 250_000));
        assert_eq!(events[1].handle, CommitHandle(8));
    }

    #[test]
    fn other_event_types_are_skipped() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_ne_bytes());
        raw.extend_from_slice(&(DRM_EVENT_VBLANK_SIZE as u32).to_ne_bytes());
        raw.extend_from_slice(&[0u8; DRM_EVENT_VBLANK_SIZE - 8]);
        raw.extend(flip_event(9, 1, 0, 0));

        let events = parse_events(&raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle, CommitHandle(9));
    }

    #[test]
    fn truncated_event_stops_parsing() {
        let raw = flip_event(1, 1, 0, 0);
        assert!(parse_events(&raw[..20]).is_empty());
    }

    #[test]
    fn hardware_limits_are_rejections() {
        assert!(matches!(classify(Errno::EINVAL), CommitError::Rejected(_)));
        assert!(matches!(classify(Errno::EBUSY), CommitError::Rejected(_)));
        assert!(matches!(classify(Errno::ENODEV), CommitError::Device(_)));
    }

    #[test]
    fn connector_names_follow_kernel_table() {
        assert_eq!(connector_type_name(11), "HDMI-A");
        assert_eq!(connector_type_name(14), "eDP");
        assert_eq!(connector_type_name(99), "Unknown");
    }
}

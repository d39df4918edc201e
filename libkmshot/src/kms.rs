//! KMS plane/framebuffer discovery.
//!
//! `KmsSource` is the seam between the real DRM device (`DrmKmsSource`,
//! backed by the `drm` crate) and a fake source used by the orchestrator's
//! unit tests, so the "pick the largest active framebuffer" and fallback
//! logic can be exercised without a `/dev/dri/*` node.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use drm::control::{Device as ControlDevice, ClientCapability};
use drm::Device as BasicDevice;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::shim;

/// A single plane of a framebuffer: the opaque driver-side handle plus its
/// row pitch and byte offset within the underlying buffer object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FbPlane {
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

/// Immutable metadata for the currently-bound scanout buffer of a plane.
///
/// Invariant: `planes[0]` is `Some` with a non-zero handle, and `width`,
/// `height` are positive — both are validated when a descriptor is built
/// by [`KmsSource::framebuffer_metadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferDescriptor {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub modifier: u64,
    pub planes: [Option<FbPlane>; 4],
}

impl FramebufferDescriptor {
    pub fn plane0(&self) -> FbPlane {
        self.planes[0].expect("invariant: plane 0 is always populated")
    }

    pub fn is_tiled(&self) -> bool {
        self.modifier != 0 && self.modifier != drm_fourcc::DrmModifier::Linear.into()
    }
}

/// A row in the `--list` output: a plane and whatever we could learn about
/// its bound framebuffer, even via the legacy FB1 query.
#[derive(Debug, Clone)]
pub struct PlaneListing {
    pub plane_id: u32,
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub legacy_only: bool,
}

/// Everything the discovery and orchestration logic needs from a DRM
/// device. Implemented for real hardware by [`DrmKmsSource`]; tests
/// implement a fake in-memory version.
pub trait KmsSource {
    fn driver_name(&self) -> Result<String>;

    /// Best-effort; the caller treats failure as non-fatal.
    fn enable_universal_planes(&self) -> Result<()>;

    /// `(plane_id, bound_fb_id)` pairs; `bound_fb_id` is 0 for an unbound
    /// plane.
    fn plane_framebuffers(&self) -> Result<Vec<(u32, u32)>>;

    /// Full FB2 metadata. Returns [`Error::LegacyFramebufferOnly`] if the
    /// driver only exposes the legacy FB1 query for this framebuffer.
    fn framebuffer_metadata(&self, fb_id: u32) -> Result<FramebufferDescriptor>;

    /// Like [`Self::framebuffer_metadata`] but falls back to the legacy
    /// FB1 query (no modifier, single plane, approximate format) rather
    /// than failing; used only for `--list`.
    fn framebuffer_metadata_lenient(&self, fb_id: u32) -> Result<PlaneListing>;
}

/// Enumerate every plane with a bound framebuffer and pick the one with
/// the largest `width * height`, ties broken by first-seen order.
pub fn discover_primary_framebuffer<S: KmsSource>(source: &S) -> Result<FramebufferDescriptor> {
    if let Err(err) = source.enable_universal_planes() {
        debug!("\tSET_CLIENT_CAP(UNIVERSAL_PLANES) failed, continuing anyway: {err}");
    }

    let planes = source.plane_framebuffers()?;
    let mut best: Option<FramebufferDescriptor> = None;
    for (plane_id, fb_id) in planes {
        if fb_id == 0 {
            continue;
        }
        let desc = match source.framebuffer_metadata(fb_id) {
            Ok(desc) => desc,
            Err(err) => {
                shim::warn_detail(format!("plane {plane_id} fb {fb_id}: {err}"));
                continue;
            }
        };
        let area = u64::from(desc.width) * u64::from(desc.height);
        let best_area = best
            .as_ref()
            .map(|d| u64::from(d.width) * u64::from(d.height))
            .unwrap_or(0);
        if area > best_area {
            best = Some(desc);
        }
    }
    best.ok_or(Error::NoActiveFramebuffer)
}

/// List every plane for `--list`, tolerating legacy-only framebuffers.
pub fn list_planes<S: KmsSource>(source: &S) -> Result<Vec<PlaneListing>> {
    let _ = source.enable_universal_planes();
    let planes = source.plane_framebuffers()?;
    let mut out = Vec::with_capacity(planes.len());
    for (plane_id, fb_id) in planes {
        if fb_id == 0 {
            out.push(PlaneListing {
                plane_id,
                fb_id: 0,
                width: 0,
                height: 0,
                format: PixelFormat::Unknown(0),
                legacy_only: false,
            });
            continue;
        }
        out.push(source.framebuffer_metadata_lenient(fb_id)?);
    }
    Ok(out)
}

/// `KmsSource` backed by a real, opened DRM character device.
pub struct DrmKmsSource {
    path: PathBuf,
    file: std::fs::File,
}

impl AsFd for DrmKmsSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for DrmKmsSource {}
impl ControlDevice for DrmKmsSource {}

impl DrmKmsSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Export the FB's plane-0 GEM handle as a dmabuf FD (`DRM_IOCTL_PRIME_HANDLE_TO_FD`).
    pub fn export_plane_fd(&self, gem_handle: u32) -> Result<OwnedFd> {
        self.prime_handle_to_fd(drm::buffer::Handle::from(gem_handle))
            .map_err(|source| Error::DeviceOpen {
                path: self.path.clone(),
                source,
            })
    }
}

impl KmsSource for DrmKmsSource {
    fn driver_name(&self) -> Result<String> {
        let version = self.get_driver().map_err(|source| Error::DeviceOpen {
            path: self.path.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(version.name()).into_owned())
    }

    fn enable_universal_planes(&self) -> Result<()> {
        self.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|_| Error::CapabilityUnavailable("UNIVERSAL_PLANES"))
    }

    fn plane_framebuffers(&self) -> Result<Vec<(u32, u32)>> {
        let handles = self.plane_handles().map_err(|source| Error::DeviceOpen {
            path: self.path.clone(),
            source,
        })?;
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let info = self.get_plane(handle).map_err(|source| Error::DeviceOpen {
                path: self.path.clone(),
                source,
            })?;
            let fb_id: u32 = info.framebuffer().map(Into::into).unwrap_or(0);
            out.push((handle.into(), fb_id));
        }
        Ok(out)
    }

    fn framebuffer_metadata(&self, fb_id: u32) -> Result<FramebufferDescriptor> {
        let handle = drm::control::framebuffer::Handle::from(fb_id);
        let planar = self
            .get_planar_framebuffer(handle)
            .map_err(|_| Error::LegacyFramebufferOnly(fb_id))?;

        let (width, height) = planar.size();
        if width == 0 || height == 0 {
            return Err(Error::FramebufferNotFound(fb_id));
        }

        let mut planes: [Option<FbPlane>; 4] = [None; 4];
        for i in 0..4 {
            if let Some(h) = planar.handles()[i] {
                planes[i] = Some(FbPlane {
                    handle: h.into(),
                    pitch: planar.pitches()[i],
                    offset: planar.offsets()[i],
                });
            }
        }
        if planes[0].map(|p| p.handle).unwrap_or(0) == 0 {
            return Err(Error::FramebufferNotFound(fb_id));
        }

        Ok(FramebufferDescriptor {
            id: fb_id,
            width,
            height,
            format: PixelFormat::from_drm_fourcc(planar.format() as u32),
            modifier: planar.modifier().map(Into::into).unwrap_or(0),
            planes,
        })
    }

    fn framebuffer_metadata_lenient(&self, fb_id: u32) -> Result<PlaneListing> {
        match self.framebuffer_metadata(fb_id) {
            Ok(desc) => Ok(PlaneListing {
                plane_id: 0,
                fb_id,
                width: desc.width,
                height: desc.height,
                format: desc.format,
                legacy_only: false,
            }),
            Err(Error::LegacyFramebufferOnly(_)) => {
                let handle = drm::control::framebuffer::Handle::from(fb_id);
                let info = self
                    .get_framebuffer(handle)
                    .map_err(|_| Error::FramebufferNotFound(fb_id))?;
                let (width, height) = info.size();
                let format = match info.bpp() {
                    Some(16) => PixelFormat::Rgb565,
                    Some(32) => PixelFormat::Xrgb8888,
                    _ => PixelFormat::Unknown(0),
                };
                Ok(PlaneListing {
                    plane_id: 0,
                    fb_id,
                    width,
                    height,
                    format,
                    legacy_only: true,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    /// In-memory `KmsSource` for exercising discovery/orchestration logic
    /// without a real DRM device.
    pub struct FakeKmsSource {
        pub driver: String,
        pub planes: Vec<(u32, u32)>,
        pub framebuffers: HashMap<u32, FramebufferDescriptor>,
        pub legacy_only: Vec<u32>,
    }

    impl KmsSource for FakeKmsSource {
        fn driver_name(&self) -> Result<String> {
            Ok(self.driver.clone())
        }

        fn enable_universal_planes(&self) -> Result<()> {
            Ok(())
        }

        fn plane_framebuffers(&self) -> Result<Vec<(u32, u32)>> {
            Ok(self.planes.clone())
        }

        fn framebuffer_metadata(&self, fb_id: u32) -> Result<FramebufferDescriptor> {
            if self.legacy_only.contains(&fb_id) {
                return Err(Error::LegacyFramebufferOnly(fb_id));
            }
            self.framebuffers
                .get(&fb_id)
                .cloned()
                .ok_or(Error::FramebufferNotFound(fb_id))
        }

        fn framebuffer_metadata_lenient(&self, fb_id: u32) -> Result<PlaneListing> {
            match self.framebuffer_metadata(fb_id) {
                Ok(desc) => Ok(PlaneListing {
                    plane_id: 0,
                    fb_id,
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    legacy_only: false,
                }),
                Err(Error::LegacyFramebufferOnly(_)) => Ok(PlaneListing {
                    plane_id: 0,
                    fb_id,
                    width: 0,
                    height: 0,
                    format: PixelFormat::Unknown(0),
                    legacy_only: true,
                }),
                Err(err) => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeKmsSource;
    use super::*;
    use std::collections::HashMap;

    fn desc(id: u32, w: u32, h: u32) -> FramebufferDescriptor {
        FramebufferDescriptor {
            id,
            width: w,
            height: h,
            format: PixelFormat::Xrgb8888,
            modifier: 0,
            planes: [Some(FbPlane { handle: 1, pitch: w * 4, offset: 0 }), None, None, None],
        }
    }

    #[test]
    fn picks_largest_framebuffer_by_area() {
        let mut framebuffers = HashMap::new();
        framebuffers.insert(40, desc(40, 1920, 1080));
        framebuffers.insert(41, desc(41, 256, 256));
        let source = FakeKmsSource {
            driver: "amdgpu".into(),
            planes: vec![(10, 40), (11, 41)],
            framebuffers,
            legacy_only: vec![],
        };
        let picked = discover_primary_framebuffer(&source).unwrap();
        assert_eq!(picked.id, 40);
    }

    #[test]
    fn ties_broken_by_first_seen() {
        let mut framebuffers = HashMap::new();
        framebuffers.insert(1, desc(1, 100, 100));
        framebuffers.insert(2, desc(2, 100, 100));
        let source = FakeKmsSource {
            driver: "i915".into(),
            planes: vec![(0, 1), (1, 2)],
            framebuffers,
            legacy_only: vec![],
        };
        let picked = discover_primary_framebuffer(&source).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn unbound_planes_are_skipped() {
        let mut framebuffers = HashMap::new();
        framebuffers.insert(5, desc(5, 64, 64));
        let source = FakeKmsSource {
            driver: "amdgpu".into(),
            planes: vec![(0, 0), (1, 5)],
            framebuffers,
            legacy_only: vec![],
        };
        let picked = discover_primary_framebuffer(&source).unwrap();
        assert_eq!(picked.id, 5);
    }

    #[test]
    fn no_active_framebuffer_is_an_error() {
        let source = FakeKmsSource {
            driver: "amdgpu".into(),
            planes: vec![(0, 0), (1, 0)],
            framebuffers: HashMap::new(),
            legacy_only: vec![],
        };
        assert!(matches!(
            discover_primary_framebuffer(&source),
            Err(Error::NoActiveFramebuffer)
        ));
    }

    #[test]
    fn list_planes_tolerates_legacy_only_framebuffers() {
        let mut framebuffers = HashMap::new();
        framebuffers.insert(7, desc(7, 640, 480));
        let source = FakeKmsSource {
            driver: "vkms".into(),
            planes: vec![(0, 7), (1, 9)],
            framebuffers,
            legacy_only: vec![9],
        };
        let listing = list_planes(&source).unwrap();
        assert_eq!(listing.len(), 2);
        assert!(!listing[0].legacy_only);
        assert!(listing[1].legacy_only);
    }
}

use super::mesh::{MeshDecodeError, TriangleMesh};
use super::Aabb;
use glam::Vec3;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PagedMeshError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("submesh decode failed: {0}")]
    Decode(#[from] MeshDecodeError),
    #[error("submesh {0} is not loaded")]
    NotLoaded(usize),
}

/// Where submesh pages live on disk.
#[derive(Debug, Clone)]
enum PageStorage {
    /// All submeshes in one file, located by per-submesh byte offsets.
    Embedded { path: PathBuf, offsets: Vec<u64> },
    /// One file per submesh, sibling-named by integer index.
    External { index_path: PathBuf },
}

struct Page {
    bounds: Aabb,
    mesh: RwLock<Option<Arc<TriangleMesh>>>,
}

/// A triangle mesh split into independently-loaded submeshes. Queries that
/// touch an unloaded page treat the area as empty and schedule a load; a
/// page-loaded event is published once the load succeeds.
pub struct PagedTriangleMesh {
    pages: Vec<Page>,
    storage: PageStorage,
    bounds: Aabb,
    pending_loads: Mutex<Vec<usize>>,
    loaded_events: Mutex<Vec<usize>>,
}

impl std::fmt::Debug for PagedTriangleMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedTriangleMesh")
            .field("pages", &self.pages.len())
            .field("bounds", &self.bounds)
            .finish()
    }
}

impl PagedTriangleMesh {
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn page_bounds(&self, page: usize) -> Aabb {
        self.pages[page].bounds
    }

    pub fn is_loaded(&self, page: usize) -> bool {
        self.pages[page].mesh.read().is_some()
    }

    pub fn submesh(&self, page: usize) -> Option<Arc<TriangleMesh>> {
        self.pages[page].mesh.read().clone()
    }

    /// Visits loaded triangles overlapping `aabb`. Pages that overlap but are
    /// not resident are queued for loading and contribute nothing this call.
    pub fn visit_triangles(&self, aabb: &Aabb, mut f: impl FnMut(usize, &TriangleMesh, usize)) {
        for (page_index, page) in self.pages.iter().enumerate() {
            if !page.bounds.overlaps(aabb) {
                continue;
            }
            let guard = page.mesh.read();
            match guard.as_ref() {
                Some(mesh) => mesh.visit_triangles(aabb, |tri| f(page_index, mesh, tri)),
                None => self.request_load(page_index),
            }
        }
    }

    pub fn visit_triangles_segment(
        &self,
        p0: Vec3,
        p1: Vec3,
        mut f: impl FnMut(usize, &TriangleMesh, usize),
    ) {
        for (page_index, page) in self.pages.iter().enumerate() {
            if page.bounds.intersect_segment(p0, p1).is_none() {
                continue;
            }
            let guard = page.mesh.read();
            match guard.as_ref() {
                Some(mesh) => {
                    mesh.visit_triangles_segment(p0, p1, |tri| f(page_index, mesh, tri))
                }
                None => self.request_load(page_index),
            }
        }
    }

    fn request_load(&self, page: usize) {
        let mut pending = self.pending_loads.lock();
        if !pending.contains(&page) {
            pending.push(page);
        }
    }

    /// Performs the queued page loads. Failures leave the page unloaded and
    /// it will be retried the next time a query touches it.
    pub fn load_pending(&self) {
        let pending: Vec<usize> = std::mem::take(&mut *self.pending_loads.lock());
        for page in pending {
            match self.load_page(page) {
                Ok(()) => self.loaded_events.lock().push(page),
                Err(err) => warn!("paged mesh page {page} load failed: {err}"),
            }
        }
    }

    /// Drains the indices of pages that finished loading since the last call.
    pub fn drain_loaded_events(&self) -> Vec<usize> {
        std::mem::take(&mut *self.loaded_events.lock())
    }

    fn load_page(&self, page: usize) -> Result<(), PagedMeshError> {
        let mesh = match &self.storage {
            PageStorage::Embedded { path, offsets } => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offsets[page]))?;
                TriangleMesh::read_from(&mut file)?
            }
            PageStorage::External { index_path } => {
                let mut file = File::open(external_page_path(index_path, page))?;
                TriangleMesh::read_from(&mut file)?
            }
        };
        *self.pages[page].mesh.write() = Some(Arc::new(mesh));
        Ok(())
    }

    /// Writes submeshes into one embedded file: a header of per-page bounds
    /// and byte offsets followed by the serialized meshes.
    pub fn write_embedded(meshes: &[TriangleMesh], path: &Path) -> Result<(), PagedMeshError> {
        let mut blobs = Vec::with_capacity(meshes.len());
        for mesh in meshes {
            let mut bytes = Vec::new();
            mesh.write_to(&mut bytes)?;
            blobs.push(bytes);
        }

        // Header entry: six f32 bounds plus a u64 offset.
        let header_len = 8 + meshes.len() as u64 * 32;
        let mut file = File::create(path)?;
        file.write_all(&(meshes.len() as u64).to_le_bytes())?;
        let mut offset = header_len;
        for (mesh, blob) in meshes.iter().zip(&blobs) {
            write_bounds(&mut file, mesh.bounds())?;
            file.write_all(&offset.to_le_bytes())?;
            offset += blob.len() as u64;
        }
        for blob in &blobs {
            file.write_all(blob)?;
        }
        Ok(())
    }

    /// Writes an external layout: an index file plus one sibling file per
    /// submesh named by integer index.
    pub fn write_external(meshes: &[TriangleMesh], index_path: &Path) -> Result<(), PagedMeshError> {
        let mut index = File::create(index_path)?;
        index.write_all(&(meshes.len() as u64).to_le_bytes())?;
        for mesh in meshes {
            write_bounds(&mut index, mesh.bounds())?;
        }
        for (page, mesh) in meshes.iter().enumerate() {
            let mut file = File::create(external_page_path(index_path, page))?;
            mesh.write_to(&mut file)?;
        }
        Ok(())
    }

    pub fn open_embedded(path: &Path) -> Result<Self, PagedMeshError> {
        let mut file = File::open(path)?;
        let count = read_u64(&mut file)? as usize;
        let mut pages = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        let mut bounds = Aabb::empty();
        for _ in 0..count {
            let page_bounds = read_bounds(&mut file)?;
            offsets.push(read_u64(&mut file)?);
            bounds = bounds.union(&page_bounds);
            pages.push(Page {
                bounds: page_bounds,
                mesh: RwLock::new(None),
            });
        }
        Ok(Self {
            pages,
            storage: PageStorage::Embedded {
                path: path.to_path_buf(),
                offsets,
            },
            bounds,
            pending_loads: Mutex::new(Vec::new()),
            loaded_events: Mutex::new(Vec::new()),
        })
    }

    pub fn open_external(index_path: &Path) -> Result<Self, PagedMeshError> {
        let mut file = File::open(index_path)?;
        let count = read_u64(&mut file)? as usize;
        let mut pages = Vec::with_capacity(count);
        let mut bounds = Aabb::empty();
        for _ in 0..count {
            let page_bounds = read_bounds(&mut file)?;
            bounds = bounds.union(&page_bounds);
            pages.push(Page {
                bounds: page_bounds,
                mesh: RwLock::new(None),
            });
        }
        Ok(Self {
            pages,
            storage: PageStorage::External {
                index_path: index_path.to_path_buf(),
            },
            bounds,
            pending_loads: Mutex::new(Vec::new()),
            loaded_events: Mutex::new(Vec::new()),
        })
    }
}

fn external_page_path(index_path: &Path, page: usize) -> PathBuf {
    let stem = index_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("paged");
    index_path.with_file_name(format!("{stem}.{page}"))
}

fn write_bounds(w: &mut impl Write, bounds: Aabb) -> io::Result<()> {
    for v in [bounds.min, bounds.max] {
        w.write_all(&v.x.to_le_bytes())?;
        w.write_all(&v.y.to_le_bytes())?;
        w.write_all(&v.z.to_le_bytes())?;
    }
    Ok(())
}

fn read_bounds(r: &mut impl Read) -> io::Result<Aabb> {
    let mut read_f32 = |r: &mut dyn Read| -> io::Result<f32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    };
    let min = Vec3::new(read_f32(r)?, read_f32(r)?, read_f32(r)?);
    let max = Vec3::new(read_f32(r)?, read_f32(r)?, read_f32(r)?);
    Ok(Aabb::new(min, max))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

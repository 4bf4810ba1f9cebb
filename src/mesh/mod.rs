//! Triangle mesh cleanup and print preparation.
//!
//! Meshes come in as binary glTF from the 3D generator and go out as binary
//! STL. Coordinates are millimetres once scaled, Z up.

pub mod glb;
pub mod stl;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("invalid glTF: {0}")]
    Gltf(String),
    #[error("invalid STL: {0}")]
    Stl(String),
    #[error("mesh has no triangles")]
    Empty,
    #[error("mesh has zero height")]
    ZeroHeight,
    #[error("face {face} references vertex {index} but only {count} vertices exist")]
    BadIndex { face: usize, index: u32, count: usize },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Bounds {
    pub fn dimensions(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn max_extent(&self) -> f32 {
        let d = self.dimensions();
        d[0].max(d[1]).max(d[2])
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeshStats {
    pub vertex_count: usize,
    pub face_count: usize,
    pub is_watertight: bool,
    /// Enclosed volume in cubic units; only meaningful for closed meshes.
    pub volume: Option<f64>,
    pub dimensions: [f32; 3],
    pub bounds: Bounds,
}

#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub target_height: f32,
    pub max_faces: usize,
    pub repair: bool,
    pub simplify: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
}

fn edge_key(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn directed_edges(face: [u32; 3]) -> [(u32, u32); 3] {
    [(face[0], face[1]), (face[1], face[2]), (face[2], face[0])]
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f64; 3] {
    [
        a[0] as f64 - b[0] as f64,
        a[1] as f64 - b[1] as f64,
        a[2] as f64 - b[2] as f64,
    ]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

impl Mesh {
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Result<Self, MeshError> {
        let count = vertices.len();
        for (face, tri) in faces.iter().enumerate() {
            if let Some(&index) = tri.iter().find(|&&i| i as usize >= count) {
                return Err(MeshError::BadIndex { face, index, count });
            }
        }
        Ok(Self { vertices, faces })
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Bounds of the vertices actually used by faces.
    pub fn bounds(&self) -> Option<Bounds> {
        let mut used = self.faces.iter().flatten().map(|&i| self.vertices[i as usize]);
        let first = used.next()?;
        let mut bounds = Bounds {
            min: first,
            max: first,
        };
        for v in used {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(v[axis]);
                bounds.max[axis] = bounds.max[axis].max(v[axis]);
            }
        }
        Some(bounds)
    }

    fn edge_counts(&self) -> HashMap<(u32, u32), u32> {
        let mut counts = HashMap::with_capacity(self.faces.len() * 3 / 2);
        for face in &self.faces {
            for (a, b) in directed_edges(*face) {
                *counts.entry(edge_key(a, b)).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Closed two-manifold: every edge is shared by exactly two faces.
    pub fn is_watertight(&self) -> bool {
        !self.faces.is_empty() && self.edge_counts().values().all(|&c| c == 2)
    }

    fn face_signed_volume(&self, face: [u32; 3]) -> f64 {
        let origin = [0.0f32; 3];
        let a = sub(self.vertices[face[0] as usize], origin);
        let b = sub(self.vertices[face[1] as usize], origin);
        let c = sub(self.vertices[face[2] as usize], origin);
        let bc = cross(b, c);
        (a[0] * bc[0] + a[1] * bc[1] + a[2] * bc[2]) / 6.0
    }

    pub fn signed_volume(&self) -> f64 {
        self.faces.iter().map(|f| self.face_signed_volume(*f)).sum()
    }

    /// Weld vertices closer than `tolerance` (grid snapped). Returns how
    /// many vertices were removed.
    pub fn merge_vertices(&mut self, tolerance: f32) -> usize {
        let before = self.vertices.len();
        let inv = 1.0 / tolerance.max(f32::EPSILON) as f64;
        let mut index_of: HashMap<(i64, i64, i64), u32> = HashMap::with_capacity(before);
        let mut merged: Vec<[f32; 3]> = Vec::with_capacity(before);
        let mut remap: Vec<u32> = Vec::with_capacity(before);

        for v in &self.vertices {
            let key = (
                (v[0] as f64 * inv).round() as i64,
                (v[1] as f64 * inv).round() as i64,
                (v[2] as f64 * inv).round() as i64,
            );
            let idx = *index_of.entry(key).or_insert_with(|| {
                merged.push(*v);
                (merged.len() - 1) as u32
            });
            remap.push(idx);
        }

        for face in &mut self.faces {
            for i in face.iter_mut() {
                *i = remap[*i as usize];
            }
        }
        self.vertices = merged;
        before - self.vertices.len()
    }

    /// Drop faces that repeat a vertex or have (near) zero area.
    pub fn remove_degenerate_faces(&mut self) -> usize {
        let before = self.faces.len();
        let vertices = &self.vertices;
        self.faces.retain(|f| {
            if f[0] == f[1] || f[1] == f[2] || f[0] == f[2] {
                return false;
            }
            let n = cross(
                sub(vertices[f[1] as usize], vertices[f[0] as usize]),
                sub(vertices[f[2] as usize], vertices[f[0] as usize]),
            );
            n[0] * n[0] + n[1] * n[1] + n[2] * n[2] > 1e-24
        });
        before - self.faces.len()
    }

    /// Drop faces using the same three vertices as an earlier face.
    pub fn remove_duplicate_faces(&mut self) -> usize {
        let before = self.faces.len();
        let mut seen = HashSet::with_capacity(before);
        self.faces.retain(|f| {
            let mut key = *f;
            key.sort_unstable();
            seen.insert(key)
        });
        before - self.faces.len()
    }

    pub fn remove_unreferenced_vertices(&mut self) -> usize {
        let before = self.vertices.len();
        let mut remap: Vec<Option<u32>> = vec![None; before];
        let mut kept = Vec::new();
        for face in &mut self.faces {
            for i in face.iter_mut() {
                let old = *i as usize;
                let new = match remap[old] {
                    Some(n) => n,
                    None => {
                        kept.push(self.vertices[old]);
                        let n = (kept.len() - 1) as u32;
                        remap[old] = Some(n);
                        n
                    }
                };
                *i = new;
            }
        }
        self.vertices = kept;
        before - self.vertices.len()
    }

    /// Close boundary loops by fan triangulation. Loops through
    /// non-manifold vertices are left open. Returns the number of holes
    /// filled.
    pub fn fill_holes(&mut self) -> usize {
        let counts = self.edge_counts();
        // Hole traversal runs opposite to the boundary half-edge.
        let mut next: HashMap<u32, u32> = HashMap::new();
        let mut branching: HashSet<u32> = HashSet::new();
        for face in &self.faces {
            for (a, b) in directed_edges(*face) {
                if counts.get(&edge_key(a, b)) == Some(&1) && next.insert(b, a).is_some() {
                    branching.insert(b);
                }
            }
        }

        let mut filled = 0;
        let mut new_faces = Vec::new();
        let mut starts: Vec<u32> = next.keys().copied().collect();
        starts.sort_unstable();
        let mut visited: HashSet<u32> = HashSet::new();

        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut cycle = vec![start];
            let mut current = start;
            let mut closed = false;
            while let Some(&n) = next.get(&current) {
                if n == start {
                    closed = true;
                    break;
                }
                if visited.contains(&n) || cycle.contains(&n) || cycle.len() > next.len() {
                    break;
                }
                cycle.push(n);
                current = n;
            }
            visited.extend(cycle.iter().copied());

            if !closed || cycle.len() < 3 || cycle.iter().any(|v| branching.contains(v)) {
                continue;
            }
            for i in 1..cycle.len() - 1 {
                new_faces.push([cycle[0], cycle[i], cycle[i + 1]]);
            }
            filled += 1;
        }

        self.faces.extend(new_faces);
        filled
    }

    /// Make winding consistent across each connected patch, then orient
    /// every closed patch so its normals point outward.
    pub fn fix_normals(&mut self) {
        let mut edge_faces: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (fi, face) in self.faces.iter().enumerate() {
            for (a, b) in directed_edges(*face) {
                edge_faces.entry(edge_key(a, b)).or_default().push(fi);
            }
        }

        let mut visited = vec![false; self.faces.len()];
        for seed in 0..self.faces.len() {
            if visited[seed] {
                continue;
            }
            visited[seed] = true;
            let mut component = vec![seed];
            let mut queue = VecDeque::from([seed]);

            while let Some(f) = queue.pop_front() {
                for (a, b) in directed_edges(self.faces[f]) {
                    let Some(neighbours) = edge_faces.get(&edge_key(a, b)) else {
                        continue;
                    };
                    for &g in neighbours {
                        if g == f || visited[g] {
                            continue;
                        }
                        // A consistently wound neighbour walks the shared edge b -> a.
                        if directed_edges(self.faces[g]).contains(&(a, b)) {
                            self.faces[g].swap(1, 2);
                        }
                        visited[g] = true;
                        component.push(g);
                        queue.push_back(g);
                    }
                }
            }

            let volume: f64 = component
                .iter()
                .map(|&f| self.face_signed_volume(self.faces[f]))
                .sum();
            if volume < 0.0 {
                for &f in &component {
                    self.faces[f].swap(1, 2);
                }
            }
        }
    }

    /// Vertex-clustering decimation. The grid is coarsened by 20% per
    /// attempt until the face count fits.
    pub fn decimate(&mut self, max_faces: usize) -> usize {
        let before = self.faces.len();
        if before <= max_faces || max_faces == 0 {
            return 0;
        }
        let Some(bounds) = self.bounds() else {
            return 0;
        };
        let extent = bounds.max_extent().max(f32::EPSILON);
        let mut resolution = ((max_faces as f64 / 2.0).sqrt().ceil() as usize).max(2);

        loop {
            let candidate = self.cluster(bounds.min, extent / resolution as f32);
            if candidate.faces.len() <= max_faces || resolution <= 2 {
                *self = candidate;
                return before - self.faces.len();
            }
            resolution = (((resolution as f32) * 0.8) as usize).max(2);
        }
    }

    fn cluster(&self, origin: [f32; 3], cell: f32) -> Mesh {
        let mut cell_index: HashMap<(i64, i64, i64), usize> = HashMap::new();
        let mut sums: Vec<([f64; 3], u32)> = Vec::new();
        let mut remap = Vec::with_capacity(self.vertices.len());

        for v in &self.vertices {
            let key = (
                ((v[0] - origin[0]) / cell).floor() as i64,
                ((v[1] - origin[1]) / cell).floor() as i64,
                ((v[2] - origin[2]) / cell).floor() as i64,
            );
            let idx = *cell_index.entry(key).or_insert_with(|| {
                sums.push(([0.0; 3], 0));
                sums.len() - 1
            });
            let entry = &mut sums[idx];
            for axis in 0..3 {
                entry.0[axis] += v[axis] as f64;
            }
            entry.1 += 1;
            remap.push(idx as u32);
        }

        let vertices = sums
            .iter()
            .map(|(sum, n)| {
                let n = *n as f64;
                [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32]
            })
            .collect();
        let faces = self
            .faces
            .iter()
            .map(|f| [remap[f[0] as usize], remap[f[1] as usize], remap[f[2] as usize]])
            .collect();

        let mut out = Mesh { vertices, faces };
        out.remove_degenerate_faces();
        out.remove_duplicate_faces();
        out.remove_unreferenced_vertices();
        out
    }

    /// Uniformly scale so the Z extent equals `target`. Returns the factor.
    pub fn scale_to_height(&mut self, target: f32) -> Result<f32, MeshError> {
        let bounds = self.bounds().ok_or(MeshError::Empty)?;
        let height = bounds.dimensions()[2];
        if height <= f32::EPSILON {
            return Err(MeshError::ZeroHeight);
        }
        let factor = target / height;
        for v in &mut self.vertices {
            for c in v.iter_mut() {
                *c *= factor;
            }
        }
        Ok(factor)
    }

    /// Centre the footprint on the XY origin and rest the base on z = 0.
    pub fn center_on_plate(&mut self) {
        let Some(bounds) = self.bounds() else {
            return;
        };
        let offset = [
            -(bounds.min[0] + bounds.max[0]) / 2.0,
            -(bounds.min[1] + bounds.max[1]) / 2.0,
            -bounds.min[2],
        ];
        for v in &mut self.vertices {
            for axis in 0..3 {
                v[axis] += offset[axis];
            }
        }
    }

    pub fn stats(&self) -> Option<MeshStats> {
        let bounds = self.bounds()?;
        let watertight = self.is_watertight();
        Some(MeshStats {
            vertex_count: self.vertices.len(),
            face_count: self.faces.len(),
            is_watertight: watertight,
            volume: watertight.then(|| self.signed_volume().abs()),
            dimensions: bounds.dimensions(),
            bounds,
        })
    }

    /// Weld, clean and repair without changing scale.
    pub fn clean(&mut self, repair: bool) {
        let tolerance = self
            .bounds()
            .map(|b| b.max_extent() * 1e-6)
            .unwrap_or(1e-6)
            .max(1e-9);
        self.merge_vertices(tolerance);
        self.remove_degenerate_faces();
        self.remove_duplicate_faces();
        self.remove_unreferenced_vertices();

        if repair && !self.is_watertight() {
            let holes = self.fill_holes();
            tracing::debug!("Filled {} holes", holes);
            if !self.is_watertight() {
                tracing::warn!("Mesh is still open after repair; continuing");
            }
        }
    }
}

/// Full print preparation: clean, repair, simplify, scale, place, orient.
pub fn prepare_for_print(mut mesh: Mesh, options: &MeshOptions) -> Result<(Mesh, MeshStats), MeshError> {
    if mesh.is_empty() {
        return Err(MeshError::Empty);
    }

    mesh.clean(options.repair);
    if mesh.is_empty() {
        return Err(MeshError::Empty);
    }

    if options.simplify && mesh.faces.len() > options.max_faces {
        let removed = mesh.decimate(options.max_faces);
        tracing::info!(
            "Simplified mesh by {} faces to {}",
            removed,
            mesh.faces.len()
        );
    }

    mesh.scale_to_height(options.target_height)?;
    mesh.center_on_plate();
    mesh.fix_normals();

    let stats = mesh.stats().ok_or(MeshError::Empty)?;
    Ok((mesh, stats))
}

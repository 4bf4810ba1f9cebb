//! Binary STL encoding.

use super::{cross, sub, Mesh, MeshError};

const HEADER_LEN: usize = 80;
const TRIANGLE_LEN: usize = 50;

/// Encode as binary STL with per-facet normals.
pub fn write_binary_stl(mesh: &Mesh) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 4 + mesh.faces.len() * TRIANGLE_LEN);
    let mut header = [0u8; HEADER_LEN];
    let label = b"avatar-forge binary STL";
    header[..label.len()].copy_from_slice(label);
    out.extend_from_slice(&header);
    out.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());

    for face in &mesh.faces {
        let [a, b, c] = face.map(|i| mesh.vertices[i as usize]);
        let n = cross(sub(b, a), sub(c, a));
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        let normal = if len > 0.0 {
            [(n[0] / len) as f32, (n[1] / len) as f32, (n[2] / len) as f32]
        } else {
            [0.0; 3]
        };
        for v in [normal, a, b, c] {
            for component in v {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    out
}

/// Decode a binary STL. Vertices come back unwelded, three per facet.
pub fn read_binary_stl(bytes: &[u8]) -> Result<Mesh, MeshError> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(MeshError::Stl("file shorter than header".to_string()));
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = HEADER_LEN + 4 + count * TRIANGLE_LEN;
    if bytes.len() < expected {
        return Err(MeshError::Stl(format!(
            "expected {} triangles ({} bytes), got {} bytes",
            count,
            expected,
            bytes.len()
        )));
    }

    let f = |at: usize| f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let mut mesh = Mesh {
        vertices: Vec::with_capacity(count * 3),
        faces: Vec::with_capacity(count),
    };
    for t in 0..count {
        // Skip the stored normal.
        let at = HEADER_LEN + 4 + t * TRIANGLE_LEN + 12;
        let base = mesh.vertices.len() as u32;
        for corner in 0..3 {
            let p = at + corner * 12;
            mesh.vertices.push([f(p), f(p + 4), f(p + 8)]);
        }
        mesh.faces.push([base, base + 1, base + 2]);
    }
    Ok(mesh)
}

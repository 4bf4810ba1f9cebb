//! Minimal binary glTF 2.0 (GLB) reader and writer.
//!
//! Only what the generator produces is supported: triangle primitives with a
//! float `POSITION` attribute, optional indices, one embedded BIN buffer.
//! Node transforms are ignored. glTF is Y-up; meshes come out Z-up.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Mesh, MeshError};

const MAGIC: &[u8; 4] = b"glTF";
const VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const COMPONENT_U8: u32 = 5121;
const COMPONENT_U16: u32 = 5123;
const COMPONENT_U32: u32 = 5125;
const COMPONENT_F32: u32 = 5126;

const MODE_TRIANGLES: u32 = 4;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    asset: Asset,
    #[serde(default)]
    buffers: Vec<Buffer>,
    #[serde(default)]
    buffer_views: Vec<BufferView>,
    #[serde(default)]
    accessors: Vec<Accessor>,
    #[serde(default)]
    meshes: Vec<GltfMesh>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Asset {
    version: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    byte_stride: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct GltfMesh {
    primitives: Vec<Primitive>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Primitive {
    attributes: HashMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    indices: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, MeshError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| MeshError::Gltf(format!("truncated at byte {}", at)))
}

fn gltf_err(msg: impl Into<String>) -> MeshError {
    MeshError::Gltf(msg.into())
}

/// Parse a GLB container into a single Z-up mesh.
pub fn read_glb(bytes: &[u8]) -> Result<Mesh, MeshError> {
    if bytes.len() < 12 || &bytes[0..4] != MAGIC {
        return Err(gltf_err("not a GLB file"));
    }
    let version = read_u32(bytes, 4)?;
    if version != VERSION {
        return Err(gltf_err(format!("unsupported GLB version {}", version)));
    }
    let total = (read_u32(bytes, 8)? as usize).min(bytes.len());

    let mut json: Option<&[u8]> = None;
    let mut bin: Option<&[u8]> = None;
    let mut offset = 12;
    while offset + 8 <= total {
        let length = read_u32(bytes, offset)? as usize;
        let kind = read_u32(bytes, offset + 4)?;
        let start = offset + 8;
        let data = bytes
            .get(start..start + length)
            .ok_or_else(|| gltf_err("chunk runs past end of file"))?;
        match kind {
            CHUNK_JSON if json.is_none() => json = Some(data),
            CHUNK_BIN if bin.is_none() => bin = Some(data),
            _ => {}
        }
        offset = start + length;
    }

    let json = json.ok_or_else(|| gltf_err("missing JSON chunk"))?;
    let doc: Document =
        serde_json::from_slice(json).map_err(|e| gltf_err(format!("bad JSON chunk: {}", e)))?;
    let bin = bin.unwrap_or(&[]);

    let mut mesh = Mesh::default();
    for gltf_mesh in &doc.meshes {
        for primitive in &gltf_mesh.primitives {
            let mode = primitive.mode.unwrap_or(MODE_TRIANGLES);
            if mode != MODE_TRIANGLES {
                tracing::debug!("Skipping primitive with mode {}", mode);
                continue;
            }
            let position = *primitive
                .attributes
                .get("POSITION")
                .ok_or_else(|| gltf_err("primitive without POSITION"))?;
            let positions = read_positions(&doc, bin, position)?;
            let base = mesh.vertices.len() as u32;
            let count = positions.len();

            let indices = match primitive.indices {
                Some(accessor) => read_indices(&doc, bin, accessor)?,
                None => (0..count as u32).collect(),
            };
            if indices.len() % 3 != 0 {
                return Err(gltf_err("index count is not a multiple of 3"));
            }
            if let Some(bad) = indices.iter().find(|&&i| i as usize >= count) {
                return Err(gltf_err(format!("index {} out of range", bad)));
            }

            mesh.vertices
                .extend(positions.into_iter().map(|[x, y, z]| [x, -z, y]));
            mesh.faces.extend(
                indices
                    .chunks_exact(3)
                    .map(|t| [base + t[0], base + t[1], base + t[2]]),
            );
        }
    }

    if mesh.faces.is_empty() {
        return Err(MeshError::Empty);
    }
    Ok(mesh)
}

fn accessor_bytes<'a>(
    doc: &Document,
    bin: &'a [u8],
    index: usize,
    element_size: usize,
) -> Result<(&'a [u8], usize, usize), MeshError> {
    let accessor = doc
        .accessors
        .get(index)
        .ok_or_else(|| gltf_err(format!("accessor {} missing", index)))?;
    let view_index = accessor
        .buffer_view
        .ok_or_else(|| gltf_err("sparse accessors are not supported"))?;
    let view = doc
        .buffer_views
        .get(view_index)
        .ok_or_else(|| gltf_err(format!("bufferView {} missing", view_index)))?;
    if view.buffer != 0 || doc.buffers.first().is_some_and(|b| b.uri.is_some()) {
        return Err(gltf_err("external buffers are not supported"));
    }
    let stride = view.byte_stride.unwrap_or(element_size);
    let start = view.byte_offset + accessor.byte_offset;
    let needed = if accessor.count == 0 {
        0
    } else {
        stride * (accessor.count - 1) + element_size
    };
    let end = view.byte_offset + view.byte_length;
    if start + needed > end {
        return Err(gltf_err(format!("accessor {} overruns its bufferView", index)));
    }
    let data = bin
        .get(start..end)
        .ok_or_else(|| gltf_err("bufferView overruns BIN chunk"))?;
    Ok((data, stride, accessor.count))
}

fn read_positions(doc: &Document, bin: &[u8], index: usize) -> Result<Vec<[f32; 3]>, MeshError> {
    let accessor = doc
        .accessors
        .get(index)
        .ok_or_else(|| gltf_err(format!("accessor {} missing", index)))?;
    if accessor.component_type != COMPONENT_F32 || accessor.kind != "VEC3" {
        return Err(gltf_err("POSITION must be float VEC3"));
    }
    let (data, stride, count) = accessor_bytes(doc, bin, index, 12)?;
    let f = |at: usize| f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    Ok((0..count)
        .map(|i| {
            let at = i * stride;
            [f(at), f(at + 4), f(at + 8)]
        })
        .collect())
}

fn read_indices(doc: &Document, bin: &[u8], index: usize) -> Result<Vec<u32>, MeshError> {
    let accessor = doc
        .accessors
        .get(index)
        .ok_or_else(|| gltf_err(format!("accessor {} missing", index)))?;
    if accessor.kind != "SCALAR" {
        return Err(gltf_err("indices must be SCALAR"));
    }
    let size = match accessor.component_type {
        COMPONENT_U8 => 1,
        COMPONENT_U16 => 2,
        COMPONENT_U32 => 4,
        other => return Err(gltf_err(format!("unsupported index component type {}", other))),
    };
    let (data, stride, count) = accessor_bytes(doc, bin, index, size)?;
    Ok((0..count)
        .map(|i| {
            let at = i * stride;
            match size {
                1 => data[at] as u32,
                2 => u16::from_le_bytes([data[at], data[at + 1]]) as u32,
                _ => u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]),
            }
        })
        .collect())
}

/// Encode a Z-up mesh as a single-primitive GLB (converted back to Y-up).
pub fn write_glb(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    let mut bin = Vec::with_capacity(mesh.vertices.len() * 12 + mesh.faces.len() * 12);
    for [x, y, z] in &mesh.vertices {
        for c in [*x, *z, -*y] {
            bin.extend_from_slice(&c.to_le_bytes());
        }
    }
    let positions_len = bin.len();
    for face in &mesh.faces {
        for i in face {
            bin.extend_from_slice(&i.to_le_bytes());
        }
    }
    let indices_len = bin.len() - positions_len;

    let doc = Document {
        asset: Asset {
            version: "2.0".to_string(),
        },
        buffers: vec![Buffer {
            byte_length: bin.len(),
            uri: None,
        }],
        buffer_views: vec![
            BufferView {
                buffer: 0,
                byte_offset: 0,
                byte_length: positions_len,
                byte_stride: None,
            },
            BufferView {
                buffer: 0,
                byte_offset: positions_len,
                byte_length: indices_len,
                byte_stride: None,
            },
        ],
        accessors: vec![
            Accessor {
                buffer_view: Some(0),
                byte_offset: 0,
                component_type: COMPONENT_F32,
                count: mesh.vertices.len(),
                kind: "VEC3".to_string(),
            },
            Accessor {
                buffer_view: Some(1),
                byte_offset: 0,
                component_type: COMPONENT_U32,
                count: mesh.faces.len() * 3,
                kind: "SCALAR".to_string(),
            },
        ],
        meshes: vec![GltfMesh {
            primitives: vec![Primitive {
                attributes: HashMap::from([("POSITION".to_string(), 0)]),
                indices: Some(1),
                mode: Some(MODE_TRIANGLES),
            }],
        }],
    };

    let mut json = serde_json::to_vec(&doc).map_err(|e| gltf_err(e.to_string()))?;
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    Ok(out)
}

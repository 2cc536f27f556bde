//! Scene Loader Module
//!
//! Reads the subset of Wavefront OBJ the viewer needs (`v`, `vt`, and
//! triangular `f v/vt` faces) and flattens it into a triangle list.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;
use tracing::{debug, info};

/// Colour given to every loaded vertex
pub const VERTEX_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// Vertex layout shared with the input assembler
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub texcoord: [f32; 2],
}

/// Byte stride of [`Vertex`]
pub const VERTEX_STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

const _: () = assert!(VERTEX_STRIDE == 36);

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("failed to read scene: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid number {token:?}")]
    InvalidNumber { line: usize, token: String },

    #[error("line {line}: '{directive}' expects {expected} values")]
    MissingValue {
        line: usize,
        directive: &'static str,
        expected: usize,
    },

    #[error("line {line}: faces must be triangles, found {count} vertices")]
    NotTriangle { line: usize, count: usize },

    #[error("line {line}: face vertex {token:?} has no texcoord index")]
    MissingTexcoord { line: usize, token: String },

    #[error("line {line}: index {index} outside 1..={count}")]
    IndexOutOfRange { line: usize, index: i64, count: usize },
}

/// Flattened triangle list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    vertices: Vec<Vertex>,
}

impl Scene {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SceneError> {
        let path = path.as_ref();
        let scene = parse_obj(BufReader::new(File::open(path)?))?;
        info!(
            "Loaded scene {} ({} triangles)",
            path.display(),
            scene.triangle_count()
        );
        Ok(scene)
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }
}

fn parse_floats<const N: usize>(
    line: usize,
    directive: &'static str,
    tokens: &mut std::str::SplitWhitespace<'_>,
) -> Result<[f32; N], SceneError> {
    let mut values = [0.0; N];
    for value in values.iter_mut() {
        let token = tokens.next().ok_or(SceneError::MissingValue {
            line,
            directive,
            expected: N,
        })?;
        *value = token.parse().map_err(|_| SceneError::InvalidNumber {
            line,
            token: token.to_string(),
        })?;
    }
    Ok(values)
}

fn resolve<T: Copy>(line: usize, token: &str, items: &[T]) -> Result<T, SceneError> {
    let index: i64 = token.parse().map_err(|_| SceneError::InvalidNumber {
        line,
        token: token.to_string(),
    })?;
    if index < 1 || index as usize > items.len() {
        return Err(SceneError::IndexOutOfRange {
            line,
            index,
            count: items.len(),
        });
    }
    Ok(items[index as usize - 1])
}

/// Parse OBJ text; faces may only reference data defined above them.
pub fn parse_obj<R: BufRead>(reader: R) -> Result<Scene, SceneError> {
    let mut positions: Vec<[f32; 3]> = Vec::new();
    let mut texcoords: Vec<[f32; 2]> = Vec::new();
    let mut vertices = Vec::new();

    for (number, text) in reader.lines().enumerate() {
        let text = text?;
        let line = number + 1;
        let mut tokens = text.split_whitespace();

        match tokens.next() {
            Some("v") => positions.push(parse_floats::<3>(line, "v", &mut tokens)?),
            Some("vt") => texcoords.push(parse_floats::<2>(line, "vt", &mut tokens)?),
            Some("f") => {
                let corners: Vec<&str> = tokens.collect();
                if corners.len() != 3 {
                    return Err(SceneError::NotTriangle {
                        line,
                        count: corners.len(),
                    });
                }
                for corner in corners {
                    let mut indices = corner.split('/');
                    let position = resolve(line, indices.next().unwrap_or(""), &positions)?;
                    let texcoord = match indices.next() {
                        Some(index) if !index.is_empty() => resolve(line, index, &texcoords)?,
                        _ => {
                            return Err(SceneError::MissingTexcoord {
                                line,
                                token: corner.to_string(),
                            })
                        }
                    };
                    vertices.push(Vertex {
                        position,
                        color: VERTEX_COLOR,
                        texcoord,
                    });
                }
            }
            Some(other) if !other.starts_with('#') => {
                debug!("Ignoring OBJ directive '{}' on line {}", other, line);
            }
            _ => {}
        }
    }

    Ok(Scene { vertices })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Scene, SceneError> {
        parse_obj(text.as_bytes())
    }

    #[test]
    fn test_single_face() {
        let scene = parse(
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nvt 1 0\nvt 0 1\nf 1/1 2/2 3/3\n",
        )
        .unwrap();
        assert_eq!(scene.triangle_count(), 1);
        assert_eq!(
            scene.vertices(),
            &[
                Vertex {
                    position: [0.0, 0.0, 0.0],
                    color: VERTEX_COLOR,
                    texcoord: [0.0, 0.0],
                },
                Vertex {
                    position: [1.0, 0.0, 0.0],
                    color: VERTEX_COLOR,
                    texcoord: [1.0, 0.0],
                },
                Vertex {
                    position: [0.0, 1.0, 0.0],
                    color: VERTEX_COLOR,
                    texcoord: [0.0, 1.0],
                },
            ]
        );
    }

    #[test]
    fn test_face_order_and_shared_indices() {
        let scene = parse(
            "# quad\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nvt 1 1\n\
             s off\nusemtl stone\nf 3/2 2/1 1/1\nf 1/1 4/2 3/2\n",
        )
        .unwrap();
        assert_eq!(scene.triangle_count(), 2);
        let v = scene.vertices();
        assert_eq!(v[0].position, [1.0, 1.0, 0.0]);
        assert_eq!(v[0].texcoord, [1.0, 1.0]);
        assert_eq!(v[5].position, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_scene() {
        let scene = parse("# nothing here\n\nmtllib scene.mtl\n").unwrap();
        assert_eq!(scene.triangle_count(), 0);
        assert!(scene.vertices().is_empty());
    }

    #[test]
    fn test_vertex_normal_index_is_ignored() {
        let scene = parse("v 0 0 0\nvt 0.5 0.5\nf 1/1/1 1/1/1 1/1/1\n").unwrap();
        assert_eq!(scene.vertices()[2].texcoord, [0.5, 0.5]);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        assert!(matches!(
            parse("v 0 x 0\n"),
            Err(SceneError::InvalidNumber { line: 1, .. })
        ));
        assert!(matches!(
            parse("v 0 0 0\nvt 0\n"),
            Err(SceneError::MissingValue { line: 2, .. })
        ));
        assert!(matches!(
            parse("v 0 0 0\nvt 0 0\nf 1/1 1/1 1/1 1/1\n"),
            Err(SceneError::NotTriangle { line: 3, count: 4 })
        ));
        assert!(matches!(
            parse("v 0 0 0\nf 1 1 1\n"),
            Err(SceneError::MissingTexcoord { line: 2, .. })
        ));
        assert!(matches!(
            parse("v 0 0 0\nvt 0 0\nf 1/1 2/1 1/1\n"),
            Err(SceneError::IndexOutOfRange {
                line: 3,
                index: 2,
                count: 1
            })
        ));
        assert!(matches!(
            parse("v 0 0 0\nvt 0 0\nf 0/1 1/1 1/1\n"),
            Err(SceneError::IndexOutOfRange { index: 0, .. })
        ));
    }
}

use crate::store::StoreType;
use bytemuck::{Pod, Zeroable};
use glamx::{Vec2, Vec3, Vec4};
use itertools::Itertools;
use snafu::{Snafu, ensure};
use static_assertions::const_assert_eq;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum MeshError {
    #[snafu(display("Mesh {mesh} has no vertices"))]
    Empty { mesh: usize },
    #[snafu(display("Mesh {mesh} has {count} indices, which is not a triangle list"))]
    NonTriangulated { mesh: usize, count: usize },
    #[snafu(display("Mesh {mesh} references vertex {index} but only has {vertices}"))]
    IndexOutOfRange {
        mesh: usize,
        index: u32,
        vertices: usize,
    },
    #[snafu(display("Mesh {mesh} has {weights} skin weights for {vertices} vertices"))]
    SkinLength {
        mesh: usize,
        weights: usize,
        vertices: usize,
    },
    #[snafu(display("Mesh {mesh} contains non-finite skin weights"))]
    SkinWeightsInvalid { mesh: usize },
    #[snafu(display("Model mixes skinned and unskinned meshes"))]
    MixedSkinning,
    #[snafu(display("Model has no meshes"))]
    NoMeshes,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex3D {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
}

const_assert_eq!(size_of::<Vertex3D>(), 48);

impl Vertex3D {
    pub const STRIDE: u64 = size_of::<Vertex3D>() as u64;

    pub fn new(position: Vec3, normal: Vec3, tangent: Vec4, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            tangent: tangent.to_array(),
            uv: uv.to_array(),
        }
    }

    pub fn basic(position: Vec3, uv: Vec2, normal: Vec3) -> Self {
        Self::new(position, normal, Vec4::new(1.0, 0.0, 0.0, 1.0), uv)
    }
}

/// Four joint influences of a single vertex.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct SkinWeights {
    pub joints: [u32; 4],
    pub weights: [f32; 4],
}

const_assert_eq!(size_of::<SkinWeights>(), 32);

impl SkinWeights {
    pub const STRIDE: u64 = size_of::<SkinWeights>() as u64;

    pub const fn single(joint: u32) -> Self {
        Self {
            joints: [joint, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex3D>,
    pub indices: Vec<u32>,
    pub skin: Option<Vec<SkinWeights>>,
    /// Content address of the material this mesh is drawn with.
    pub material: String,
}

impl MeshData {
    pub fn new(vertices: Vec<Vertex3D>, indices: Vec<u32>, material: impl Into<String>) -> Self {
        Self {
            vertices,
            indices,
            skin: None,
            material: material.into(),
        }
    }

    pub fn with_skin(mut self, skin: Vec<SkinWeights>) -> Self {
        self.skin = Some(skin);
        self
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_skinned(&self) -> bool {
        self.skin.is_some()
    }

    fn validate(&self, mesh: usize) -> Result<(), MeshError> {
        ensure!(!self.vertices.is_empty(), EmptyErr { mesh });
        ensure!(
            self.indices.len() % 3 == 0 && !self.indices.is_empty(),
            NonTriangulatedErr {
                mesh,
                count: self.indices.len()
            }
        );

        if let Some(index) = self
            .indices
            .iter()
            .copied()
            .find(|&i| i as usize >= self.vertices.len())
        {
            return IndexOutOfRangeErr {
                mesh,
                index,
                vertices: self.vertices.len(),
            }
            .fail();
        }

        if let Some(skin) = &self.skin {
            ensure!(
                skin.len() == self.vertices.len(),
                SkinLengthErr {
                    mesh,
                    weights: skin.len(),
                    vertices: self.vertices.len()
                }
            );
            ensure!(
                skin.iter()
                    .flat_map(|s| s.weights)
                    .all(f32::is_finite),
                SkinWeightsInvalidErr { mesh }
            );
        }

        Ok(())
    }
}

/// An ordered list of meshes as produced by the importer.
#[derive(Debug, Clone)]
pub struct ModelData {
    pub name: String,
    pub meshes: Vec<MeshData>,
}

impl ModelData {
    pub fn new(name: impl Into<String>, meshes: Vec<MeshData>) -> Self {
        Self {
            name: name.into(),
            meshes,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(MeshData::vertex_count).sum()
    }

    pub fn index_count(&self) -> usize {
        self.meshes.iter().map(MeshData::index_count).sum()
    }

    pub fn is_skinned(&self) -> bool {
        self.meshes.iter().any(MeshData::is_skinned)
    }

    /// Checks that the model can be uploaded and drawn as one contiguous range.
    pub fn validate(&self) -> Result<(), MeshError> {
        ensure!(!self.meshes.is_empty(), NoMeshesErr);
        ensure!(
            self.meshes.iter().map(MeshData::is_skinned).all_equal(),
            MixedSkinningErr
        );

        for (i, mesh) in self.meshes.iter().enumerate() {
            mesh.validate(i)?;
        }
        Ok(())
    }

    /// A quad facing +Z, useful for tests and debug geometry.
    pub fn unit_quad(name: impl Into<String>, material: impl Into<String>) -> Self {
        let n = Vec3::Z;
        let vertices = vec![
            Vertex3D::basic(Vec3::new(-0.5, -0.5, 0.0), Vec2::new(0.0, 1.0), n),
            Vertex3D::basic(Vec3::new(0.5, -0.5, 0.0), Vec2::new(1.0, 1.0), n),
            Vertex3D::basic(Vec3::new(0.5, 0.5, 0.0), Vec2::new(1.0, 0.0), n),
            Vertex3D::basic(Vec3::new(-0.5, 0.5, 0.0), Vec2::new(0.0, 0.0), n),
        ];
        let indices = vec![0, 1, 2, 2, 3, 0];
        Self::new(name, vec![MeshData::new(vertices, indices, material)])
    }
}

impl StoreType for ModelData {
    const KIND: &'static str = "Model";

    fn name(&self) -> &str {
        &self.name
    }
}

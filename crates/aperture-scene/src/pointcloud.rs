/// A point cloud with optional per-point colors and normals.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    points: Vec<[f64; 3]>,
    colors: Option<Vec<[u8; 3]>>,
    normals: Option<Vec<[f64; 3]>>,
}

impl PointCloud {
    /// Creates a point cloud; color and normal lists, when given, must match
    /// the point count.
    pub fn new(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        normals: Option<Vec<[f64; 3]>>,
    ) -> Self {
        if let Some(colors) = &colors {
            assert_eq!(colors.len(), points.len(), "color count mismatch");
        }
        if let Some(normals) = &normals {
            assert_eq!(normals.len(), points.len(), "normal count mismatch");
        }
        Self {
            points,
            colors,
            normals,
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the cloud has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Point positions.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Per-point colors, when present.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Per-point normals, when present.
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// Axis-aligned bounding box as (min, max), `None` for an empty cloud.
    pub fn bounding_box(&self) -> Option<([f64; 3], [f64; 3])> {
        if self.points.is_empty() {
            return None;
        }
        let mut min = self.points[0];
        let mut max = self.points[0];
        for p in &self.points {
            for d in 0..3 {
                min[d] = min[d].min(p[d]);
                max[d] = max[d].max(p[d]);
            }
        }
        Some((min, max))
    }
}

/// A triangle mesh with per-vertex colors.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    /// Vertex positions.
    pub vertices: Vec<[f64; 3]>,
    /// Per-vertex colors.
    pub colors: Vec<[u8; 3]>,
    /// Triangles as vertex index triples.
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    /// Creates an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }
}

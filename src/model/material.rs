//! Material description.

use trace_kernel::GpuMaterial;

use crate::util::srgb_to_linear;

/// Surface material in the MTL model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub ambient: [f32; 3],
    pub diffuse: [f32; 3],
    pub specular: [f32; 3],
    pub transmittance: [f32; 3],
    pub emission: [f32; 3],
    pub shininess: f32,
    /// Index of refraction.
    pub ior: f32,
    /// 1 == opaque, 0 == fully transparent.
    pub dissolve: f32,
    /// Illumination model (see MTL `illum`).
    pub illum: i32,
    /// Index into the owning mesh's texture table.
    pub texture: Option<u32>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: [0.1, 0.1, 0.1],
            diffuse: [0.7, 0.7, 0.7],
            specular: [1.0, 1.0, 1.0],
            transmittance: [0.0, 0.0, 0.0],
            emission: [0.0, 0.0, 0.1],
            shininess: 0.0,
            ior: 1.0,
            dissolve: 1.0,
            illum: 0,
            texture: None,
        }
    }
}

impl Material {
    /// Flat-colored material with the remaining fields at their defaults.
    pub fn with_diffuse(diffuse: [f32; 3]) -> Self {
        Self {
            diffuse,
            ..Default::default()
        }
    }

    /// Texture id as stored on the device (-1 == no texture).
    #[inline]
    pub fn texture_id(&self) -> i32 {
        self.texture.map_or(-1, |t| t as i32)
    }

    /// Convert the color terms authored in sRGB to linear.
    pub fn linearize(&mut self) {
        self.ambient = srgb_to_linear(self.ambient);
        self.diffuse = srgb_to_linear(self.diffuse);
        self.specular = srgb_to_linear(self.specular);
    }

    pub fn to_gpu(&self) -> GpuMaterial {
        let [dr, dg, db] = self.diffuse;
        let [er, eg, eb] = self.emission;
        GpuMaterial {
            diffuse_dissolve: [dr, dg, db, self.dissolve],
            emission_ior: [er, eg, eb, self.ior],
        }
    }
}

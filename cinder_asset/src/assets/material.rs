use crate::store::StoreType;
use bon::Builder;
use glamx::Vec4;

/// Material parameters as authored, with textures referenced by content address.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct MaterialDesc {
    #[builder(into)]
    pub name: String,
    #[builder(default = Vec4::ONE)]
    pub base_color: Vec4,
    #[builder(default = 0.5)]
    pub roughness: f32,
    #[builder(default = 0.0)]
    pub metallic: f32,
    #[builder(into)]
    pub albedo_texture: Option<String>,
    #[builder(into)]
    pub normal_texture: Option<String>,
    #[builder(into)]
    pub metallic_roughness_texture: Option<String>,
}

impl MaterialDesc {
    pub fn textures(&self) -> impl Iterator<Item = &str> {
        [
            self.albedo_texture.as_deref(),
            self.normal_texture.as_deref(),
            self.metallic_roughness_texture.as_deref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn has_translucent_base_color(&self) -> bool {
        self.base_color.w < 1.0
    }
}

impl StoreType for MaterialDesc {
    const KIND: &'static str = "Material";

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let material = MaterialDesc::builder().name("plain").build();

        assert_eq!(material.base_color, Vec4::ONE);
        assert_eq!(material.textures().count(), 0);
        assert!(!material.has_translucent_base_color());
    }

    #[test]
    fn lists_referenced_textures() {
        let material = MaterialDesc::builder()
            .name("glass")
            .base_color(Vec4::new(1.0, 1.0, 1.0, 0.4))
            .albedo_texture("glass_albedo")
            .normal_texture("glass_normal")
            .build();

        assert_eq!(
            material.textures().collect::<Vec<_>>(),
            vec!["glass_albedo", "glass_normal"]
        );
        assert!(material.has_translucent_base_color());
    }
}

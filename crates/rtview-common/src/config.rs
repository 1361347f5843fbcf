// config.rs: typed view over the viewer cvars

use std::path::PathBuf;

use crate::cvar::{CvarContext, CvarFlags};

/// Default shader directory, set by the renderer build script when it compiled
/// the shader library. Falls back to `shaders` next to the working directory.
pub const DEFAULT_SHADER_DIR: &str = "shaders";

/// Texture slots of the viewed model, in descriptor order.
pub const TEXTURE_CVARS: [&str; 4] = ["r_tex_diffuse", "r_tex_normal", "r_tex_specular", "r_tex_emissive"];

/// Register every viewer cvar with its default value.
pub fn register_cvars(ctx: &mut CvarContext, shader_dir: &str) {
    ctx.get("vid_width", "800", CvarFlags::empty());
    ctx.get("vid_height", "600", CvarFlags::empty());
    ctx.get("r_validation", if cfg!(debug_assertions) { "1" } else { "0" }, CvarFlags::LATCH);
    ctx.get("r_vsync", "1", CvarFlags::LATCH);
    ctx.get("r_shaderdir", shader_dir, CvarFlags::LATCH);
    ctx.get("r_assetdir", "assets", CvarFlags::LATCH);
    ctx.get("r_mesh", "SnowmanOBJ.obj", CvarFlags::LATCH);
    ctx.get("r_tex_diffuse", "Snowman_C.png", CvarFlags::LATCH);
    ctx.get("r_tex_normal", "Snowman_NM.png", CvarFlags::LATCH);
    ctx.get("r_tex_specular", "Snowman_S.png", CvarFlags::LATCH);
    ctx.get("r_tex_emissive", "Snowman_Emessive.png", CvarFlags::LATCH);
    ctx.get("r_strict_textures", "1", CvarFlags::LATCH);
    ctx.get("m_sensitivity", "0.005", CvarFlags::empty());
    ctx.get("developer", "0", CvarFlags::empty());
}

/// Viewer configuration read from the cvar table.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerConfig {
    pub width: u32,
    pub height: u32,
    pub validation: bool,
    pub vsync: bool,
    pub shader_dir: PathBuf,
    pub mesh_path: PathBuf,
    /// Diffuse, normal, specular, emissive.
    pub texture_paths: [PathBuf; 4],
    pub strict_textures: bool,
    /// Radians of orbit per pixel of pointer motion.
    pub sensitivity: f32,
    pub developer: bool,
}

impl ViewerConfig {
    /// Build the configuration from registered cvars.
    pub fn from_cvars(ctx: &CvarContext) -> Self {
        let asset_dir = PathBuf::from(ctx.variable_string("r_assetdir"));
        let texture_paths = TEXTURE_CVARS.map(|name| asset_dir.join(ctx.variable_string(name)));

        Self {
            width: ctx.variable_value("vid_width").max(1.0) as u32,
            height: ctx.variable_value("vid_height").max(1.0) as u32,
            validation: ctx.variable_value("r_validation") != 0.0,
            vsync: ctx.variable_value("r_vsync") != 0.0,
            shader_dir: PathBuf::from(ctx.variable_string("r_shaderdir")),
            mesh_path: asset_dir.join(ctx.variable_string("r_mesh")),
            texture_paths,
            strict_textures: ctx.variable_value("r_strict_textures") != 0.0,
            sensitivity: ctx.variable_value("m_sensitivity"),
            developer: ctx.variable_value("developer") != 0.0,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let mut ctx = CvarContext::new();
        register_cvars(&mut ctx, DEFAULT_SHADER_DIR);
        Self::from_cvars(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let config = ViewerConfig::default();
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.mesh_path, Path::new("assets").join("SnowmanOBJ.obj"));
        assert_eq!(config.texture_paths[3], Path::new("assets").join("Snowman_Emessive.png"));
        assert!(config.strict_textures);
        assert!(config.vsync);
    }

    #[test]
    fn test_command_line_overrides() {
        let mut ctx = CvarContext::new();
        register_cvars(&mut ctx, "out/spirv");
        ctx.apply_command_line([
            "+set", "vid_width", "1920",
            "+set", "r_assetdir", "/data",
            "+set", "r_strict_textures", "0",
        ])
        .unwrap();

        let config = ViewerConfig::from_cvars(&ctx);
        assert_eq!(config.width, 1920);
        assert_eq!(config.shader_dir, Path::new("out/spirv"));
        assert_eq!(config.texture_paths[0], Path::new("/data").join("Snowman_C.png"));
        assert!(!config.strict_textures);
    }

    #[test]
    fn test_zero_size_clamped() {
        let mut ctx = CvarContext::new();
        register_cvars(&mut ctx, DEFAULT_SHADER_DIR);
        ctx.set("vid_width", "0").unwrap();
        assert_eq!(ViewerConfig::from_cvars(&ctx).width, 1);
    }
}

use serde::Serialize;

use crate::errors::ForgeError;

/// Usable fraction of the bed in X and Y, leaving room for the skirt.
const USABLE_BED_FRACTION: f32 = 0.9;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrinterProfile {
    pub key: &'static str,
    pub name: &'static str,
    /// Build volume in mm (x, y, z).
    pub bed_size: [f32; 3],
    pub nozzle_diameter: f32,
    pub layer_height: f32,
    pub max_model_height: f32,
    pub center_offset: [f32; 3],
    pub supports_needed: bool,
    pub base_thickness: f32,
}

pub static PROFILES: &[PrinterProfile] = &[
    PrinterProfile {
        key: "ender3v2",
        name: "Creality Ender 3 V2",
        bed_size: [220.0, 220.0, 250.0],
        nozzle_diameter: 0.4,
        layer_height: 0.2,
        max_model_height: 100.0,
        center_offset: [110.0, 110.0, 0.0],
        supports_needed: true,
        base_thickness: 2.0,
    },
    PrinterProfile {
        key: "biqu_b1",
        name: "BIQU B1",
        bed_size: [235.0, 235.0, 270.0],
        nozzle_diameter: 0.4,
        layer_height: 0.2,
        max_model_height: 120.0,
        center_offset: [117.5, 117.5, 0.0],
        supports_needed: true,
        base_thickness: 2.0,
    },
];

pub fn get_profile(key: &str) -> Result<&'static PrinterProfile, ForgeError> {
    PROFILES.iter().find(|p| p.key == key).ok_or_else(|| {
        let known: Vec<&str> = PROFILES.iter().map(|p| p.key).collect();
        ForgeError::InvalidInput(format!(
            "Unknown printer profile: {}. Available: {}",
            key,
            known.join(", ")
        ))
    })
}

pub fn list() -> &'static [PrinterProfile] {
    PROFILES
}

impl PrinterProfile {
    /// Largest printable model (x, y, z) in mm.
    pub fn max_dimensions(&self) -> [f32; 3] {
        [
            self.bed_size[0] * USABLE_BED_FRACTION,
            self.bed_size[1] * USABLE_BED_FRACTION,
            self.max_model_height,
        ]
    }

    pub fn validate_model_size(&self, dimensions: [f32; 3]) -> Result<(), String> {
        let max = self.max_dimensions();
        if dimensions.iter().zip(max.iter()).any(|(d, m)| d > m) {
            return Err(format!(
                "Model dimensions ({:.1}x{:.1}x{:.1}mm) exceed printer capacity ({:.1}x{:.1}x{:.1}mm)",
                dimensions[0], dimensions[1], dimensions[2], max[0], max[1], max[2]
            ));
        }
        Ok(())
    }
}

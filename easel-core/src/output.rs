use std::path::{Path, PathBuf};

use chrono::{Datelike, Local, NaiveDateTime};
use image::DynamicImage;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// Persist a generated image plus its prompt sidecar under the output root.
///
/// Layout: `<root>/<year>/week_<NN>/image_<YYYYMMDD_HHMMSS>_<8-hex>.png`,
/// with a sibling `.txt` holding the exact prompt. The sidecar is the only
/// durable record tying an image back to its literal prompt, so it is not
/// optional.
pub fn save_image(image: &DynamicImage, output_root: &Path, prompt: &str) -> Result<PathBuf> {
    save_image_at(image, output_root, prompt, Local::now().naive_local())
}

/// Timestamp-injectable variant of [`save_image`].
pub fn save_image_at(
    image: &DynamicImage,
    output_root: &Path,
    prompt: &str,
    now: NaiveDateTime,
) -> Result<PathBuf> {
    let week_dir = output_root
        .join(now.year().to_string())
        .join(format!("week_{:02}", now.iso_week().week()));
    std::fs::create_dir_all(&week_dir)?;

    let timestamp = now.format("%Y%m%d_%H%M%S");
    let output_path = week_dir.join(format!("image_{timestamp}_{}.png", prompt_hash(prompt)));
    image.save(&output_path)?;

    let prompt_file = output_path.with_extension("txt");
    std::fs::write(&prompt_file, prompt)?;

    debug!(path = %output_path.display(), "saved image and prompt sidecar");
    Ok(output_path)
}

/// First 8 hex characters of the prompt's SHA-256; collision-resistant enough
/// to keep filenames human-scannable.
fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in &digest[..4] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([x as u8, y as u8, 0])
        }))
    }

    #[test]
    fn path_uses_year_and_iso_week() {
        let dir = tempfile::tempdir().unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 10, 1)
            .unwrap()
            .and_hms_opt(12, 30, 15)
            .unwrap();
        let path = save_image_at(&test_image(), dir.path(), "a red cube", now).unwrap();
        let rendered = path.to_string_lossy().replace('\\', "/");
        assert!(rendered.contains("2025/week_40/"), "got {rendered}");
        assert!(rendered.contains("image_20251001_123015_"));
        assert!(path.exists());
    }

    #[test]
    fn sidecar_round_trips_the_exact_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = "castle at dusk, oil painting";
        let path = save_image(&test_image(), dir.path(), prompt).unwrap();
        let sidecar = path.with_extension("txt");
        assert_eq!(std::fs::read_to_string(sidecar).unwrap(), prompt);
    }

    #[test]
    fn hash_is_stable_and_8_chars() {
        let a = prompt_hash("a red cube");
        assert_eq!(a.len(), 8);
        assert_eq!(a, prompt_hash("a red cube"));
        assert_ne!(a, prompt_hash("a blue cube"));
    }
}

#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod bitmap;
mod gray;

pub use bitmap::{Bitmap, BitmapError};
pub use gray::GrayBuffer;

/// File extensions recognized as images when scanning a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

/// True if the path has a recognized image extension (case-insensitive).
pub fn is_image_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Lists image files directly under `dir`, sorted by file name.
pub fn list_image_files(dir: &std::path::Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    files.sort();
    Ok(files)
}

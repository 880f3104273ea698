use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::OutputFormat;
use crate::error::FileOpError;

/// Turns the raw bytes the service hands back (usually WebP) into the
/// canonical staging format.
#[derive(Debug, Clone)]
pub struct ResultConverter {
    format: OutputFormat,
    quality: u8,
}

impl ResultConverter {
    pub fn new(format: OutputFormat, quality: u8) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Decode `bytes`, write them to `output_path`, return the bytes written.
    pub fn convert(&self, bytes: &[u8], output_path: &Path) -> Result<u64, FileOpError> {
        let img = image::load_from_memory(bytes).map_err(|e| FileOpError::Decode(e.to_string()))?;

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FileOpError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match self.format {
            OutputFormat::Jpeg => self.save_jpeg(&img, output_path)?,
            OutputFormat::Png => self.save_png(&img, output_path)?,
        }

        std::fs::metadata(output_path)
            .map(|meta| meta.len())
            .map_err(|source| FileOpError::Write {
                path: output_path.to_path_buf(),
                source,
            })
    }

    fn save_jpeg(&self, img: &DynamicImage, output_path: &Path) -> Result<(), FileOpError> {
        // JPEG has no alpha channel
        let rgb = img.to_rgb8();
        let file = File::create(output_path).map_err(|source| FileOpError::Write {
            path: output_path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, self.quality);
        rgb.write_with_encoder(encoder).map_err(|e| FileOpError::Encode {
            path: output_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        writer.flush().map_err(|source| FileOpError::Write {
            path: output_path.to_path_buf(),
            source,
        })
    }

    fn save_png(&self, img: &DynamicImage, output_path: &Path) -> Result<(), FileOpError> {
        img.save_with_format(output_path, ImageFormat::Png)
            .map_err(|e| FileOpError::Encode {
                path: output_path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

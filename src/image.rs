//! Images submitted for analysis, and the limits we place on them.

use std::io;

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::{language::OutputLanguage, prelude::*};

/// What we call files whose type we can't identify.
pub const UNKNOWN_MIME_TYPE: &str = "application/octet-stream";

/// Default maximum image size, in bytes.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// MIME types accepted by default.
pub const DEFAULT_SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// An image to analyze.
#[derive(Clone)]
pub struct ImageInput {
    /// The raw image data.
    data: Vec<u8>,

    /// The MIME type declared by whoever gave us the image.
    mime_type: String,

    /// The size of the image, in bytes.
    size: u64,
}

impl ImageInput {
    /// Wrap raw bytes with their declared MIME type.
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let size = data.len() as u64;
        Self {
            data,
            mime_type: mime_type.into(),
            size,
        }
    }

    /// Read an image from disk.
    ///
    /// If `mime_type` is not given, we guess it from the file extension, and
    /// then from the file contents. Files we can't identify are labelled
    /// [`UNKNOWN_MIME_TYPE`], which validation will reject.
    pub async fn from_path(path: &Path, mime_type: Option<&str>) -> io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let mime_type = match mime_type {
            Some(mime_type) => mime_type.to_owned(),
            None => guess_mime_type(path, &data),
        };
        Ok(Self::new(data, mime_type))
    }

    /// The raw image data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The declared MIME type.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The size of the image, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The image data as standard Base64, which is what the model APIs want.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }
}

impl std::fmt::Debug for ImageInput {
    // Don't dump megabytes of image data into our logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageInput")
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Guess the MIME type of an image file.
fn guess_mime_type(path: &Path, data: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(path).first() {
        return mime.essence_str().to_owned();
    }
    match infer::get(data) {
        Some(kind) => kind.mime_type().to_owned(),
        None => {
            debug!(path = %path.display(), "Could not identify file type");
            UNKNOWN_MIME_TYPE.to_owned()
        }
    }
}

/// An image was rejected before we tried to analyze it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The image is bigger than we allow.
    #[error("File size too large ({size} bytes). Maximum size is {}MB.", .max_size / (1024 * 1024))]
    FileTooLarge { size: u64, max_size: u64 },

    /// We can't send this kind of file to the model.
    #[error("Invalid file type {mime_type:?}. Supported types: {}", .supported.join(", "))]
    UnsupportedMimeType {
        mime_type: String,
        supported: Vec<String>,
    },
}

impl ValidationError {
    /// A message for the user, in their language.
    pub fn localized_message(&self, language: OutputLanguage) -> String {
        match (self, language) {
            (ValidationError::FileTooLarge { max_size, .. }, OutputLanguage::Ja) => {
                format!(
                    "ファイルサイズが大きすぎます。最大サイズは{}MBです。",
                    max_size / (1024 * 1024)
                )
            }
            (ValidationError::UnsupportedMimeType { supported, .. }, OutputLanguage::Ja) => {
                format!(
                    "無効なファイル形式です。サポートされている形式: {}",
                    supported.join(", ")
                )
            }
            (_, OutputLanguage::En) => self.to_string(),
        }
    }
}

/// Which images we're willing to analyze.
#[derive(Clone, Debug)]
pub struct ImageLimits {
    /// Maximum image size, in bytes.
    pub max_file_size: u64,

    /// Allowed MIME types.
    pub supported_mime_types: Vec<String>,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            supported_mime_types: DEFAULT_SUPPORTED_MIME_TYPES
                .iter()
                .map(|&s| s.to_owned())
                .collect(),
        }
    }
}

impl ImageLimits {
    /// Check `image` against our limits.
    pub fn validate(&self, image: &ImageInput) -> Result<(), ValidationError> {
        self.check_size(image.size())?;
        if !self
            .supported_mime_types
            .iter()
            .any(|supported| supported == image.mime_type())
        {
            return Err(ValidationError::UnsupportedMimeType {
                mime_type: image.mime_type().to_owned(),
                supported: self.supported_mime_types.clone(),
            });
        }
        Ok(())
    }

    /// Check an image size alone. Lets us reject huge files before reading
    /// them.
    pub fn check_size(&self, size: u64) -> Result<(), ValidationError> {
        if size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                size,
                max_size: self.max_file_size,
            });
        }
        Ok(())
    }
}

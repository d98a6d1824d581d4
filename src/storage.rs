use crate::types::{Picture, StoredImage};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Utc};
use failure::Fail;
use image::ImageFormat;
use log::debug;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Cameras are inconsistent about padding and sometimes wrap lines, so
/// decoding ignores whitespace and accepts any padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const MAX_NAME_BYTES: usize = 200;
const MAX_SUFFIX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Fail)]
pub enum PersistError {
    #[fail(display = "invalid base64 image content: {}", _0)]
    InvalidEncoding(#[cause] base64::DecodeError),
    #[fail(display = "{} is not a directory", _0)]
    InvalidDirectory(String),
    #[fail(display = "I/O error on {}: {}", path, cause)]
    Io {
        path: String,
        #[cause]
        cause: io::Error,
    },
    #[fail(display = "no free file name left for {}", _0)]
    Exhausted(String),
    #[fail(display = "storage worker failed: {}", _0)]
    Worker(String),
}

impl PersistError {
    fn io(path: &Path, cause: io::Error) -> Self {
        PersistError::Io {
            path: path.display().to_string(),
            cause,
        }
    }
}

/// Writes received images flat into a single directory, never overwriting:
/// taken names get a numeric suffix (`plate.jpg`, `plate_1.jpg`, ...).
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;
        if !dir.is_dir() {
            return Err(PersistError::InvalidDirectory(dir.display().to_string()));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decodes and saves the picture. Blocking; callers on the async runtime
    /// should run it via `spawn_blocking`.
    pub fn store(&self, picture: &Picture) -> Result<StoredImage, PersistError> {
        let bytes = decode_content(&picture.content)?;
        let name = picture
            .file_name_hint
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| synthesize_file_name(&bytes, Utc::now()));

        let temp = self.write_temp(&bytes)?;
        let placed = self.place(&temp, &name);
        if temp.exists() {
            if let Err(e) = fs::remove_file(&temp) {
                debug!("Could not remove temporary file {:?}: {}", temp, e);
            }
        }
        let path = placed?;

        Ok(StoredImage {
            path,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        })
    }

    fn write_temp(&self, bytes: &[u8]) -> Result<PathBuf, PersistError> {
        let temp = self
            .dir
            .join(format!(".{}.part", Uuid::new_v4().simple()));
        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(PersistError::io(&temp, e));
        }
        Ok(temp)
    }

    // hard_link fails if the target exists; rename is the fallback where
    // links are unsupported and is not race free.
    fn place(&self, temp: &Path, name: &str) -> Result<PathBuf, PersistError> {
        for attempt in 0..MAX_SUFFIX_ATTEMPTS {
            let candidate = self.dir.join(numbered_name(name, attempt));
            match fs::hard_link(temp, &candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    debug!("Hard link to {:?} failed ({}), renaming instead", candidate, e);
                    if fs::symlink_metadata(&candidate).is_ok() {
                        continue;
                    }
                    fs::rename(temp, &candidate).map_err(|e| PersistError::io(&candidate, e))?;
                    return Ok(candidate);
                }
            }
        }
        Err(PersistError::Exhausted(name.to_string()))
    }
}

fn decode_content(content: &str) -> Result<Vec<u8>, PersistError> {
    let compact: Vec<u8> = content
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    LENIENT_BASE64
        .decode(compact)
        .map_err(PersistError::InvalidEncoding)
}

/// Reduces a camera-supplied name to a bare file name, or `None` if nothing
/// usable is left.
pub fn sanitize_file_name(hint: &str) -> Option<String> {
    let last = hint.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." || cleaned.len() > MAX_NAME_BYTES {
        return None;
    }
    Some(cleaned.to_string())
}

/// `image_<UTC yyyymmdd_hhmmss>.<ext>`, with the extension sniffed from the
/// image bytes and `jpg` when the format is not recognized.
pub fn synthesize_file_name(bytes: &[u8], now: DateTime<Utc>) -> String {
    let extension = match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Gif) => "gif",
        Ok(ImageFormat::Bmp) => "bmp",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Tiff) => "tif",
        _ => "jpg",
    };
    format!("image_{}.{}", now.format("%Y%m%d_%H%M%S"), extension)
}

fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    }
}

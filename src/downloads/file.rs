use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Bytes of a finished download, tagged with the requested name and MIME
/// type. Cloning shares the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl DownloadedFile {
    /// Join received chunks in arrival order.
    pub(crate) fn assemble(name: &str, mime: &str, chunks: Vec<Bytes>) -> Self {
        let bytes = match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.into_iter().next().unwrap_or_default(),
            _ => Bytes::from(chunks.concat()),
        };
        Self {
            name: name.to_string(),
            mime: mime.to_string(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write the blob to `dest`, creating missing parent directories.
    pub async fn write_to(&self, dest: &Path) -> std::io::Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(dest, &self.bytes).await?;
        tracing::info!("[Downloader] 已寫入 {} bytes -> {:?}", self.len(), dest);
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_keeps_order() {
        let chunks = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de"), Bytes::from_static(b"f")];
        let file = DownloadedFile::assemble("data.txt", "text/plain", chunks);
        assert_eq!(&file.bytes[..], b"abcdef");
        assert_eq!(file.len(), 6);
        assert_eq!(file.mime, "text/plain");
    }

    #[test]
    fn test_assemble_empty() {
        let file = DownloadedFile::assemble("empty.bin", "application/octet-stream", vec![]);
        assert!(file.is_empty());
    }

    #[tokio::test]
    async fn test_write_to_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("models").join("tiny").join("model.zip");
        let file = DownloadedFile::assemble("model.zip", "application/zip", vec![Bytes::from_static(b"PK")]);

        let written = file.write_to(&dest).await.unwrap();
        assert_eq!(written, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK");
    }
}

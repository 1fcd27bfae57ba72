//! Uploaded file storage: bytes land under the uploads directory with a
//! uuid-based name, the original extension preserved.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use huddle_core::FileAttachment;

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub async fn save(
        &self,
        original_name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> anyhow::Result<FileAttachment> {
        let stored_name = match original_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => format!("{}.{ext}", Uuid::new_v4()),
            _ => Uuid::new_v4().to_string(),
        };
        tokio::fs::write(self.dir.join(&stored_name), data).await?;
        Ok(FileAttachment::new(
            &stored_name,
            original_name,
            mime_type,
            data.len() as u64,
            &format!("uploads/{stored_name}"),
        ))
    }

    pub async fn read(&self, attachment: &FileAttachment) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(&attachment.file_name)).await
    }

    pub async fn delete(&self, attachment: &FileAttachment) {
        let _ = tokio::fs::remove_file(self.dir.join(&attachment.file_name)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_read_back() {
        let dir = std::env::temp_dir().join(format!("huddle-files-{}", Uuid::new_v4()));
        let store = FileStore::open(&dir).await.unwrap();

        let data = vec![0u8, 1, 2, 253, 254, 255];
        let att = store.save("photo.png", "image/png", &data).await.unwrap();
        assert!(att.file_name.ends_with(".png"));
        assert_ne!(att.file_name, "photo.png");
        assert_eq!(att.original_file_name, "photo.png");
        assert_eq!(att.file_size, data.len() as u64);
        assert!(att.is_image);

        assert_eq!(store.read(&att).await.unwrap(), data);
        store.delete(&att).await;
        assert!(store.read(&att).await.is_err());
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}
